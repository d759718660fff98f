//! Point-in-time vault snapshot, overwritten on every refresh.

use alloy::primitives::{Address, U256};
use serde::Serialize;
use sqlx::SqlitePool;

use super::{StoreError, as_address_key, as_decimal, parse_address, parse_u256};
use crate::event::address_key;

/// 10^18, the fixed-point scale of `share_price`.
const SHARE_PRICE_SCALE: U256 = U256::from_limbs([1_000_000_000_000_000_000, 0, 0, 0]);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VaultMetrics {
    #[serde(serialize_with = "as_address_key")]
    pub vault: Address,
    #[serde(serialize_with = "as_decimal")]
    pub total_assets: U256,
    #[serde(serialize_with = "as_decimal")]
    pub total_supply: U256,
    #[serde(serialize_with = "as_decimal")]
    pub share_price: U256,
    pub updated_at_timestamp: u64,
    pub updated_at_block: u64,
}

/// `total_assets * 10^18 / total_supply`, or zero for an empty vault.
///
/// When the scaled numerator overflows 256 bits the division happens first,
/// trading the low 18 digits of precision for a defined result.
pub fn share_price(total_assets: U256, total_supply: U256) -> U256 {
    if total_supply.is_zero() {
        return U256::ZERO;
    }

    total_assets.checked_mul(SHARE_PRICE_SCALE).map_or_else(
        || (total_assets / total_supply).saturating_mul(SHARE_PRICE_SCALE),
        |scaled| scaled / total_supply,
    )
}

#[derive(sqlx::FromRow)]
struct VaultMetricsRow {
    vault_address: String,
    total_assets: String,
    total_supply: String,
    share_price: String,
    updated_at_timestamp: i64,
    updated_at_block: i64,
}

impl TryFrom<VaultMetricsRow> for VaultMetrics {
    type Error = StoreError;

    fn try_from(row: VaultMetricsRow) -> Result<Self, Self::Error> {
        Ok(Self {
            vault: parse_address("vault_address", &row.vault_address)?,
            total_assets: parse_u256("total_assets", &row.total_assets)?,
            total_supply: parse_u256("total_supply", &row.total_supply)?,
            share_price: parse_u256("share_price", &row.share_price)?,
            updated_at_timestamp: u64::try_from(row.updated_at_timestamp)?,
            updated_at_block: u64::try_from(row.updated_at_block)?,
        })
    }
}

/// Writes `metrics` as the vault's snapshot. Every column is replaced:
/// totals are point-in-time reads, so the last write wins.
pub(crate) async fn upsert(pool: &SqlitePool, metrics: &VaultMetrics) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO vault_metrics (
            vault_address, total_assets, total_supply, share_price,
            updated_at_timestamp, updated_at_block
        )
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(vault_address) DO UPDATE SET
            total_assets = excluded.total_assets,
            total_supply = excluded.total_supply,
            share_price = excluded.share_price,
            updated_at_timestamp = excluded.updated_at_timestamp,
            updated_at_block = excluded.updated_at_block
        "#,
    )
    .bind(address_key(&metrics.vault))
    .bind(metrics.total_assets.to_string())
    .bind(metrics.total_supply.to_string())
    .bind(metrics.share_price.to_string())
    .bind(i64::try_from(metrics.updated_at_timestamp)?)
    .bind(i64::try_from(metrics.updated_at_block)?)
    .execute(pool)
    .await?;

    Ok(())
}

pub(crate) async fn get(
    pool: &SqlitePool,
    vault: &Address,
) -> Result<Option<VaultMetrics>, StoreError> {
    let row: Option<VaultMetricsRow> = sqlx::query_as(
        r#"
        SELECT
            vault_address, total_assets, total_supply, share_price,
            updated_at_timestamp, updated_at_block
        FROM vault_metrics
        WHERE vault_address = ?
        "#,
    )
    .bind(address_key(vault))
    .fetch_optional(pool)
    .await?;

    row.map(VaultMetrics::try_from).transpose()
}
