//! Append-only event tables: deposits, withdrawals, strategy events,
//! rebalances and yield harvests.

use alloy::primitives::{Address, I256};
use serde::{Deserialize, Serialize};
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::fmt;
use std::str::FromStr;

use super::{EventPosition, InsertOutcome, Page, StoreError, parse_address, parse_i256};
use crate::event::{EventId, StrategyEventType, VaultEvent, VaultEventKind, address_key};

/// Which side of a user flow a row records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowKind {
    Deposit,
    Withdrawal,
}

impl FlowKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Deposit => "deposit",
            Self::Withdrawal => "withdrawal",
        }
    }
}

impl fmt::Display for FlowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown flow kind: {0}")]
pub struct UnknownFlowKind(String);

impl FromStr for FlowKind {
    type Err = UnknownFlowKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deposit" => Ok(Self::Deposit),
            "withdrawal" => Ok(Self::Withdrawal),
            other => Err(UnknownFlowKind(other.to_string())),
        }
    }
}

/// What a retraction removed, and the balance correction it implies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum DeletedRow {
    /// A deposit or withdrawal. `shares_delta` undoes the original merge.
    Flow {
        owner: Address,
        shares_delta: I256,
    },
    Other,
}

struct CommonColumns {
    tx_hash: String,
    log_index: i64,
    vault: String,
    block_number: i64,
    block_timestamp: i64,
}

impl CommonColumns {
    fn of(event: &VaultEvent) -> Result<Self, StoreError> {
        Ok(Self {
            tx_hash: format!("{:#x}", event.id.tx_hash),
            log_index: i64::try_from(event.id.log_index)?,
            vault: address_key(&event.vault),
            block_number: i64::try_from(event.block_number)?,
            block_timestamp: i64::try_from(event.block_timestamp)?,
        })
    }
}

/// Inserts the row for `event` into its table. A row already present under
/// the same `(tx_hash, log_index)` is left untouched.
pub(crate) async fn insert_event(
    sql_tx: &mut Transaction<'_, Sqlite>,
    event: &VaultEvent,
) -> Result<InsertOutcome, StoreError> {
    let common = CommonColumns::of(event)?;

    let result = match &event.kind {
        VaultEventKind::Deposit {
            sender,
            owner,
            assets,
            shares,
        } => {
            sqlx::query(
                r#"
                INSERT INTO deposits (
                    tx_hash, log_index, vault_address, sender, owner,
                    assets, shares, block_number, block_timestamp
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(tx_hash, log_index) DO NOTHING
                "#,
            )
            .bind(&common.tx_hash)
            .bind(common.log_index)
            .bind(&common.vault)
            .bind(address_key(sender))
            .bind(address_key(owner))
            .bind(assets.to_string())
            .bind(shares.to_string())
            .bind(common.block_number)
            .bind(common.block_timestamp)
            .execute(sql_tx.as_mut())
            .await?
        }
        VaultEventKind::Withdraw {
            sender,
            receiver,
            owner,
            assets,
            shares,
        } => {
            sqlx::query(
                r#"
                INSERT INTO withdrawals (
                    tx_hash, log_index, vault_address, sender, receiver, owner,
                    assets, shares, block_number, block_timestamp
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(tx_hash, log_index) DO NOTHING
                "#,
            )
            .bind(&common.tx_hash)
            .bind(common.log_index)
            .bind(&common.vault)
            .bind(address_key(sender))
            .bind(address_key(receiver))
            .bind(address_key(owner))
            .bind(assets.to_string())
            .bind(shares.to_string())
            .bind(common.block_number)
            .bind(common.block_timestamp)
            .execute(sql_tx.as_mut())
            .await?
        }
        VaultEventKind::StrategyDeposit { strategy, assets } => {
            insert_strategy_event(
                sql_tx,
                &common,
                strategy,
                StrategyEventType::Deposit,
                Some(assets.to_string()),
                None,
            )
            .await?
        }
        VaultEventKind::StrategyWithdrawal { strategy, assets } => {
            insert_strategy_event(
                sql_tx,
                &common,
                strategy,
                StrategyEventType::Withdrawal,
                Some(assets.to_string()),
                None,
            )
            .await?
        }
        VaultEventKind::StrategyAllocationUpdated {
            strategy,
            allocation_bp,
        } => {
            insert_strategy_event(
                sql_tx,
                &common,
                strategy,
                StrategyEventType::AllocationUpdated,
                None,
                Some(allocation_bp.to_string()),
            )
            .await?
        }
        VaultEventKind::RebalanceExecuted {
            strategies,
            allocations,
        } => {
            let strategies_json =
                serde_json::to_string(&strategies.iter().map(address_key).collect::<Vec<_>>())?;
            let allocations_json = serde_json::to_string(
                &allocations
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>(),
            )?;

            sqlx::query(
                r#"
                INSERT INTO rebalances (
                    tx_hash, log_index, vault_address, strategies, allocations,
                    block_number, block_timestamp
                )
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(tx_hash, log_index) DO NOTHING
                "#,
            )
            .bind(&common.tx_hash)
            .bind(common.log_index)
            .bind(&common.vault)
            .bind(strategies_json)
            .bind(allocations_json)
            .bind(common.block_number)
            .bind(common.block_timestamp)
            .execute(sql_tx.as_mut())
            .await?
        }
        VaultEventKind::YieldHarvested { total_yield } => {
            sqlx::query(
                r#"
                INSERT INTO yield_harvests (
                    tx_hash, log_index, vault_address, total_yield,
                    block_number, block_timestamp
                )
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT(tx_hash, log_index) DO NOTHING
                "#,
            )
            .bind(&common.tx_hash)
            .bind(common.log_index)
            .bind(&common.vault)
            .bind(total_yield.to_string())
            .bind(common.block_number)
            .bind(common.block_timestamp)
            .execute(sql_tx.as_mut())
            .await?
        }
    };

    Ok(InsertOutcome::from_rows_affected(result.rows_affected()))
}

async fn insert_strategy_event(
    sql_tx: &mut Transaction<'_, Sqlite>,
    common: &CommonColumns,
    strategy: &Address,
    event_type: StrategyEventType,
    amount: Option<String>,
    allocation: Option<String>,
) -> Result<sqlx::sqlite::SqliteQueryResult, StoreError> {
    Ok(sqlx::query(
        r#"
        INSERT INTO strategy_events (
            tx_hash, log_index, vault_address, strategy_address, event_type,
            amount, allocation, block_number, block_timestamp
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(tx_hash, log_index) DO NOTHING
        "#,
    )
    .bind(&common.tx_hash)
    .bind(common.log_index)
    .bind(&common.vault)
    .bind(address_key(strategy))
    .bind(event_type.as_str())
    .bind(amount)
    .bind(allocation)
    .bind(common.block_number)
    .bind(common.block_timestamp)
    .execute(sql_tx.as_mut())
    .await?)
}

/// Deletes the row stored for `id` from the table `kind` lives in.
///
/// Returns `None` when no row exists, i.e. the event was never applied.
pub(crate) async fn delete_event(
    sql_tx: &mut Transaction<'_, Sqlite>,
    id: &EventId,
    kind: &VaultEventKind,
) -> Result<Option<DeletedRow>, StoreError> {
    let tx_hash = format!("{:#x}", id.tx_hash);
    let log_index = i64::try_from(id.log_index)?;

    let table = match kind {
        VaultEventKind::Deposit { .. } => {
            return delete_flow(sql_tx, "deposits", &tx_hash, log_index, false).await;
        }
        VaultEventKind::Withdraw { .. } => {
            return delete_flow(sql_tx, "withdrawals", &tx_hash, log_index, true).await;
        }
        VaultEventKind::StrategyDeposit { .. }
        | VaultEventKind::StrategyWithdrawal { .. }
        | VaultEventKind::StrategyAllocationUpdated { .. } => "strategy_events",
        VaultEventKind::RebalanceExecuted { .. } => "rebalances",
        VaultEventKind::YieldHarvested { .. } => "yield_harvests",
    };

    let result = sqlx::query(&format!(
        "DELETE FROM {table} WHERE tx_hash = ? AND log_index = ?"
    ))
    .bind(&tx_hash)
    .bind(log_index)
    .execute(sql_tx.as_mut())
    .await?;

    Ok((result.rows_affected() > 0).then_some(DeletedRow::Other))
}

#[derive(sqlx::FromRow)]
struct DeletedFlowRow {
    owner: String,
    shares: String,
}

async fn delete_flow(
    sql_tx: &mut Transaction<'_, Sqlite>,
    table: &'static str,
    tx_hash: &str,
    log_index: i64,
    was_withdrawal: bool,
) -> Result<Option<DeletedRow>, StoreError> {
    let row: Option<DeletedFlowRow> = sqlx::query_as(&format!(
        "DELETE FROM {table} WHERE tx_hash = ? AND log_index = ? RETURNING owner, shares"
    ))
    .bind(tx_hash)
    .bind(log_index)
    .fetch_optional(sql_tx.as_mut())
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let owner = parse_address("owner", &row.owner)?;
    let shares = parse_i256("shares", &row.shares)?;

    Ok(Some(DeletedRow::Flow {
        owner,
        shares_delta: if was_withdrawal { shares } else { -shares },
    }))
}

/// Whether any deposit or withdrawal row remains for `(owner, vault)`.
pub(crate) async fn has_flows(
    sql_tx: &mut Transaction<'_, Sqlite>,
    owner: &Address,
    vault: &Address,
) -> Result<bool, StoreError> {
    let exists: bool = sqlx::query_scalar(
        r#"
        SELECT
            EXISTS (SELECT 1 FROM deposits WHERE owner = ?1 AND vault_address = ?2)
            OR EXISTS (SELECT 1 FROM withdrawals WHERE owner = ?1 AND vault_address = ?2)
        "#,
    )
    .bind(address_key(owner))
    .bind(address_key(vault))
    .fetch_one(sql_tx.as_mut())
    .await?;

    Ok(exists)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlowRecord {
    pub kind: FlowKind,
    #[serde(flatten)]
    pub position: EventPosition,
    pub vault: String,
    pub sender: String,
    pub receiver: Option<String>,
    pub owner: String,
    pub assets: String,
    pub shares: String,
}

#[derive(sqlx::FromRow)]
struct FlowRow {
    kind: String,
    tx_hash: String,
    log_index: i64,
    vault_address: String,
    sender: String,
    receiver: Option<String>,
    owner: String,
    assets: String,
    shares: String,
    block_number: i64,
    block_timestamp: i64,
}

fn position(
    tx_hash: String,
    log_index: i64,
    block_number: i64,
    block_timestamp: i64,
) -> Result<EventPosition, StoreError> {
    Ok(EventPosition {
        tx_hash,
        log_index: u64::try_from(log_index)?,
        block_number: u64::try_from(block_number)?,
        block_timestamp: u64::try_from(block_timestamp)?,
    })
}

impl TryFrom<FlowRow> for FlowRecord {
    type Error = StoreError;

    fn try_from(row: FlowRow) -> Result<Self, Self::Error> {
        let kind = if row.kind == FlowKind::Withdrawal.as_str() {
            FlowKind::Withdrawal
        } else {
            FlowKind::Deposit
        };

        Ok(Self {
            kind,
            position: position(row.tx_hash, row.log_index, row.block_number, row.block_timestamp)?,
            vault: row.vault_address,
            sender: row.sender,
            receiver: row.receiver,
            owner: row.owner,
            assets: row.assets,
            shares: row.shares,
        })
    }
}

/// Deposits and withdrawals for `vault`, newest first, optionally one kind
/// only.
#[tracing::instrument(skip(pool), level = tracing::Level::DEBUG)]
pub(crate) async fn list_flows(
    pool: &SqlitePool,
    vault: &Address,
    kind: Option<FlowKind>,
    page: Page,
) -> Result<Vec<FlowRecord>, StoreError> {
    let rows: Vec<FlowRow> = sqlx::query_as(
        r#"
        SELECT * FROM (
            SELECT
                'deposit' AS kind, tx_hash, log_index, vault_address, sender,
                NULL AS receiver, owner, assets, shares, block_number, block_timestamp
            FROM deposits
            WHERE vault_address = ?1
            UNION ALL
            SELECT
                'withdrawal' AS kind, tx_hash, log_index, vault_address, sender,
                receiver, owner, assets, shares, block_number, block_timestamp
            FROM withdrawals
            WHERE vault_address = ?1
        )
        WHERE ?2 IS NULL OR kind = ?2
        ORDER BY block_number DESC, log_index DESC
        LIMIT ?3 OFFSET ?4
        "#,
    )
    .bind(address_key(vault))
    .bind(kind.map(FlowKind::as_str))
    .bind(page.limit)
    .bind(page.offset)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(FlowRecord::try_from).collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StrategyEventRecord {
    #[serde(flatten)]
    pub position: EventPosition,
    pub vault: String,
    pub strategy: String,
    pub event_type: StrategyEventType,
    pub amount: Option<String>,
    pub allocation: Option<String>,
}

#[derive(sqlx::FromRow)]
struct StrategyEventRow {
    tx_hash: String,
    log_index: i64,
    vault_address: String,
    strategy_address: String,
    event_type: String,
    amount: Option<String>,
    allocation: Option<String>,
    block_number: i64,
    block_timestamp: i64,
}

impl TryFrom<StrategyEventRow> for StrategyEventRecord {
    type Error = StoreError;

    fn try_from(row: StrategyEventRow) -> Result<Self, Self::Error> {
        Ok(Self {
            position: position(row.tx_hash, row.log_index, row.block_number, row.block_timestamp)?,
            vault: row.vault_address,
            strategy: row.strategy_address,
            event_type: row.event_type.parse()?,
            amount: row.amount,
            allocation: row.allocation,
        })
    }
}

#[tracing::instrument(skip(pool), level = tracing::Level::DEBUG)]
pub(crate) async fn list_strategy_events(
    pool: &SqlitePool,
    vault: &Address,
    event_type: Option<StrategyEventType>,
    page: Page,
) -> Result<Vec<StrategyEventRecord>, StoreError> {
    let rows: Vec<StrategyEventRow> = sqlx::query_as(
        r#"
        SELECT
            tx_hash, log_index, vault_address, strategy_address, event_type,
            amount, allocation, block_number, block_timestamp
        FROM strategy_events
        WHERE vault_address = ?1 AND (?2 IS NULL OR event_type = ?2)
        ORDER BY block_number DESC, log_index DESC
        LIMIT ?3 OFFSET ?4
        "#,
    )
    .bind(address_key(vault))
    .bind(event_type.map(StrategyEventType::as_str))
    .bind(page.limit)
    .bind(page.offset)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(StrategyEventRecord::try_from).collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RebalanceRecord {
    #[serde(flatten)]
    pub position: EventPosition,
    pub vault: String,
    pub strategies: Vec<String>,
    pub allocations: Vec<String>,
}

#[derive(sqlx::FromRow)]
struct RebalanceRow {
    tx_hash: String,
    log_index: i64,
    vault_address: String,
    strategies: String,
    allocations: String,
    block_number: i64,
    block_timestamp: i64,
}

impl TryFrom<RebalanceRow> for RebalanceRecord {
    type Error = StoreError;

    fn try_from(row: RebalanceRow) -> Result<Self, Self::Error> {
        Ok(Self {
            position: position(row.tx_hash, row.log_index, row.block_number, row.block_timestamp)?,
            vault: row.vault_address,
            strategies: serde_json::from_str(&row.strategies)?,
            allocations: serde_json::from_str(&row.allocations)?,
        })
    }
}

#[tracing::instrument(skip(pool), level = tracing::Level::DEBUG)]
pub(crate) async fn list_rebalances(
    pool: &SqlitePool,
    vault: &Address,
    page: Page,
) -> Result<Vec<RebalanceRecord>, StoreError> {
    let rows: Vec<RebalanceRow> = sqlx::query_as(
        r#"
        SELECT
            tx_hash, log_index, vault_address, strategies, allocations,
            block_number, block_timestamp
        FROM rebalances
        WHERE vault_address = ?
        ORDER BY block_number DESC, log_index DESC
        LIMIT ? OFFSET ?
        "#,
    )
    .bind(address_key(vault))
    .bind(page.limit)
    .bind(page.offset)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(RebalanceRecord::try_from).collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HarvestRecord {
    #[serde(flatten)]
    pub position: EventPosition,
    pub vault: String,
    pub total_yield: String,
}

#[derive(sqlx::FromRow)]
struct HarvestRow {
    tx_hash: String,
    log_index: i64,
    vault_address: String,
    total_yield: String,
    block_number: i64,
    block_timestamp: i64,
}

#[tracing::instrument(skip(pool), level = tracing::Level::DEBUG)]
pub(crate) async fn list_harvests(
    pool: &SqlitePool,
    vault: &Address,
    page: Page,
) -> Result<Vec<HarvestRecord>, StoreError> {
    let rows: Vec<HarvestRow> = sqlx::query_as(
        r#"
        SELECT tx_hash, log_index, vault_address, total_yield, block_number, block_timestamp
        FROM yield_harvests
        WHERE vault_address = ?
        ORDER BY block_number DESC, log_index DESC
        LIMIT ? OFFSET ?
        "#,
    )
    .bind(address_key(vault))
    .bind(page.limit)
    .bind(page.offset)
    .fetch_all(pool)
    .await?;

    rows.into_iter()
        .map(|row| {
            Ok(HarvestRecord {
                position: position(
                    row.tx_hash,
                    row.log_index,
                    row.block_number,
                    row.block_timestamp,
                )?,
                vault: row.vault_address,
                total_yield: row.total_yield,
            })
        })
        .collect()
}
