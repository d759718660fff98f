//! Folds decoded vault events into the aggregate tables.

use alloy::primitives::{Address, I256, U256};
use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::event::{EventId, VaultEvent, VaultEventKind};
use crate::onchain::ChainError;
use crate::onchain::vault::VaultReader;
use crate::store::metrics::{self, VaultMetrics, share_price};
use crate::store::{InsertOutcome, StoreError, balances, cursor, logs};

#[derive(Debug, thiserror::Error)]
pub enum FoldError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("metrics refresh failed: {0}")]
    MetricsRefresh(#[from] ChainError),
    #[error("metrics snapshot write failed: {0}")]
    MetricsWrite(#[source] StoreError),
    #[error("share amount {shares} of event {event} does not fit a signed 256-bit delta")]
    SharesOutOfRange { event: EventId, shares: U256 },
}

impl FoldError {
    /// The event's transaction rolled back and nothing was written. Skipping
    /// the event would lose it once a later event advances the cursor.
    pub(crate) const fn is_store_failure(&self) -> bool {
        matches!(self, Self::Store(_))
    }
}

impl From<sqlx::Error> for FoldError {
    fn from(error: sqlx::Error) -> Self {
        Self::Store(error.into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FoldOutcome {
    Applied,
    /// The event's key was already stored; nothing changed.
    Duplicate,
}

/// Sole writer of the log and aggregate tables.
///
/// Events must be applied one at a time in the order the source delivers
/// them: balance merges and metrics overwrites are order-dependent.
#[derive(Clone)]
pub struct EventFolder {
    pub(super) pool: SqlitePool,
    pub(super) vaults: VaultReader,
}

impl EventFolder {
    pub fn new(pool: SqlitePool, vaults: VaultReader) -> Self {
        Self { pool, vaults }
    }

    /// Inserts the event's log row, merges its share delta and advances the
    /// cursor in one transaction, then refreshes vault metrics when the
    /// variant calls for it.
    ///
    /// The refresh runs after commit. If it fails the log row and balance
    /// stay written and the snapshot stays stale until the next refresh.
    #[tracing::instrument(
        skip(self, event),
        fields(vault = %event.vault, event_id = %event.id, kind = event.kind.name()),
        level = tracing::Level::DEBUG
    )]
    pub async fn apply(&self, event: &VaultEvent) -> Result<FoldOutcome, FoldError> {
        let mut sql_tx = self.pool.begin().await?;

        if logs::insert_event(&mut sql_tx, event).await? == InsertOutcome::Duplicate {
            sql_tx.rollback().await?;
            debug!("Event already folded, skipping");
            return Ok(FoldOutcome::Duplicate);
        }

        if let Some((owner, delta)) = share_delta(event)? {
            balances::upsert_merge(&mut sql_tx, &owner, &event.vault, delta).await?;
        }

        cursor::advance(&mut sql_tx, event.block_number).await?;
        sql_tx.commit().await?;

        if event.kind.triggers_metrics_refresh() {
            self.refresh_metrics(event.vault).await?;
        }

        Ok(FoldOutcome::Applied)
    }

    /// Re-reads `totalAssets`/`totalSupply` at the current chain head and
    /// overwrites the vault's snapshot.
    ///
    /// The head may already be ahead of the event that triggered the
    /// refresh; the snapshot reflects the head, not the event's block.
    pub async fn refresh_metrics(&self, vault: Address) -> Result<VaultMetrics, FoldError> {
        let totals = self.vaults.totals(vault).await?;
        let head = self.vaults.latest_block().await?;

        let snapshot = VaultMetrics {
            vault,
            total_assets: totals.total_assets,
            total_supply: totals.total_supply,
            share_price: share_price(totals.total_assets, totals.total_supply),
            updated_at_timestamp: head.timestamp,
            updated_at_block: head.number,
        };

        metrics::upsert(&self.pool, &snapshot)
            .await
            .map_err(FoldError::MetricsWrite)?;

        info!(
            %vault,
            block = head.number,
            total_assets = %snapshot.total_assets,
            total_supply = %snapshot.total_supply,
            "Refreshed vault metrics"
        );

        Ok(snapshot)
    }
}

/// Owner and signed share delta for deposits (+) and withdrawals (-).
fn share_delta(event: &VaultEvent) -> Result<Option<(Address, I256)>, FoldError> {
    let (owner, shares, negate) = match &event.kind {
        VaultEventKind::Deposit { owner, shares, .. } => (*owner, *shares, false),
        VaultEventKind::Withdraw { owner, shares, .. } => (*owner, *shares, true),
        _ => return Ok(None),
    };

    let delta = I256::try_from(shares).map_err(|_| FoldError::SharesOutOfRange {
        event: event.id,
        shares,
    })?;

    Ok(Some((owner, if negate { -delta } else { delta })))
}
