//! Reversal of events the source reports as no longer canonical.

use alloy::primitives::I256;
use tracing::{debug, info};

use super::folder::{EventFolder, FoldError};
use crate::event::VaultEvent;
use crate::store::logs::DeletedRow;
use crate::store::{balances, cursor, logs};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetractOutcome {
    Retracted,
    /// No row existed for the event's key, so there was nothing to undo.
    NotApplied,
}

impl EventFolder {
    /// Undoes exactly what [`EventFolder::apply`] did for `event`.
    ///
    /// The log row is deleted and, for deposits and withdrawals, the inverse
    /// share delta is merged. A balance that returns to zero with no flow
    /// rows left for its `(owner, vault)` pair is removed, so the store
    /// matches one that never saw the event. The cursor is rewound to the
    /// block before the event so that a restart re-reads the replacement.
    ///
    /// Metrics are overwritten rather than merged and cannot be reversed;
    /// retracting a refresh-triggering event re-reads them at the now
    /// canonical head instead.
    #[tracing::instrument(
        skip(self, event),
        fields(vault = %event.vault, event_id = %event.id, kind = event.kind.name()),
        level = tracing::Level::DEBUG
    )]
    pub async fn retract(&self, event: &VaultEvent) -> Result<RetractOutcome, FoldError> {
        let mut sql_tx = self.pool.begin().await?;

        let Some(deleted) = logs::delete_event(&mut sql_tx, &event.id, &event.kind).await? else {
            sql_tx.rollback().await?;
            debug!("Retracted event was never folded");
            return Ok(RetractOutcome::NotApplied);
        };

        if let DeletedRow::Flow {
            owner,
            shares_delta,
        } = deleted
        {
            let merged =
                balances::upsert_merge(&mut sql_tx, &owner, &event.vault, shares_delta).await?;

            if merged == I256::ZERO && !logs::has_flows(&mut sql_tx, &owner, &event.vault).await? {
                balances::delete(&mut sql_tx, &owner, &event.vault).await?;
            }
        }

        cursor::rewind(&mut sql_tx, event.block_number.saturating_sub(1)).await?;
        sql_tx.commit().await?;

        info!(block = event.block_number, "Retracted event");

        if event.kind.triggers_metrics_refresh() {
            self.refresh_metrics(event.vault).await?;
        }

        Ok(RetractOutcome::Retracted)
    }
}
