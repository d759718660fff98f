//! Durable aggregate state in SQLite.
//!
//! Append-only event tables are keyed by `(tx_hash, log_index)`. Derived
//! aggregates (`user_balances`, `vault_metrics`) are keyed by address. All
//! addresses are stored as lowercase `0x` hex and all on-chain integers as
//! base-10 strings, since they routinely exceed what SQLite's INTEGER holds.

use alloy::primitives::{Address, I256, U256};
use serde::{Deserialize, Serialize, Serializer};
use sqlx::SqlitePool;
use std::fmt::Display;
use std::num::TryFromIntError;

use crate::event::{UnknownStrategyEventType, address_key};

pub(crate) mod balances;
pub(crate) mod claims;
pub(crate) mod cursor;
pub(crate) mod decisions;
pub(crate) mod logs;
pub(crate) mod metrics;

pub use balances::UserBalance;
pub use decisions::{AgentDecision, NewAgentDecision};
pub use logs::{FlowKind, FlowRecord, HarvestRecord, RebalanceRecord, StrategyEventRecord, UnknownFlowKind};
pub use metrics::VaultMetrics;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("JSON column error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("integer conversion error: {0}")]
    IntConversion(#[from] TryFromIntError),
    #[error("invalid address {value:?} in column {column}")]
    InvalidAddress { column: &'static str, value: String },
    #[error("invalid integer {value:?} in column {column}")]
    InvalidInteger { column: &'static str, value: String },
    #[error("invalid timestamp {value:?} in column {column}")]
    InvalidTimestamp { column: &'static str, value: String },
    #[error(transparent)]
    UnknownStrategyEventType(#[from] UnknownStrategyEventType),
    #[error("share balance overflow for {user} in {vault}")]
    BalanceOverflow { user: Address, vault: Address },
}

/// Result of inserting into an append-only table. A duplicate key is an
/// idempotent no-op, not an error: the source delivers at least once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Duplicate,
}

impl InsertOutcome {
    pub(crate) const fn from_rows_affected(rows: u64) -> Self {
        if rows == 0 {
            Self::Duplicate
        } else {
            Self::Inserted
        }
    }
}

/// Offset pagination for newest-first listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Page {
    pub limit: u32,
    pub offset: u32,
}

impl Page {
    pub const DEFAULT_LIMIT: u32 = 20;
    pub const MAX_LIMIT: u32 = 100;

    /// Missing limit defaults to 20; anything above 100 is clamped. A zero
    /// limit is treated as missing.
    pub fn new(limit: Option<u32>, offset: Option<u32>) -> Self {
        let limit = match limit {
            None | Some(0) => Self::DEFAULT_LIMIT,
            Some(limit) => limit.min(Self::MAX_LIMIT),
        };

        Self {
            limit,
            offset: offset.unwrap_or(0),
        }
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(None, None)
    }
}

pub(crate) async fn configure_sqlite_pool(database_url: &str) -> Result<SqlitePool, sqlx::Error> {
    let pool = SqlitePool::connect(database_url).await?;

    // WAL allows concurrent readers (the service's read path) alongside the
    // single writer (the indexer). Writers still serialize.
    sqlx::query("PRAGMA journal_mode = WAL")
        .execute(&pool)
        .await?;

    // A CLI process writing decisions while the server indexes will block
    // rather than fail immediately with "database is locked".
    sqlx::query("PRAGMA busy_timeout = 10000")
        .execute(&pool)
        .await?;

    Ok(pool)
}

pub(crate) fn parse_address(column: &'static str, value: &str) -> Result<Address, StoreError> {
    value.parse().map_err(|_| StoreError::InvalidAddress {
        column,
        value: value.to_string(),
    })
}

pub(crate) fn parse_u256(column: &'static str, value: &str) -> Result<U256, StoreError> {
    U256::from_str_radix(value, 10).map_err(|_| StoreError::InvalidInteger {
        column,
        value: value.to_string(),
    })
}

pub(crate) fn parse_i256(column: &'static str, value: &str) -> Result<I256, StoreError> {
    I256::from_dec_str(value).map_err(|_| StoreError::InvalidInteger {
        column,
        value: value.to_string(),
    })
}

/// Serializes any integer as its base-10 string, so amounts above 2^53
/// survive JSON consumers that parse numbers as doubles.
pub(crate) fn as_decimal<T: Display, S: Serializer>(
    value: &T,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_str(value)
}

pub(crate) fn as_address_key<S: Serializer>(
    address: &Address,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&address_key(address))
}

/// Newest-first listing entry shared by every append-only table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventPosition {
    pub tx_hash: String,
    pub log_index: u64,
    pub block_number: u64,
    pub block_timestamp: u64,
}
