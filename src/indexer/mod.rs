//! Ingestion: decodes logs from the source queue and folds them into the
//! aggregate store, one at a time in arrival order.

use alloy::providers::Provider;
use alloy::rpc::types::Log;
use backon::{BackoffBuilder, ExponentialBuilder, Retryable};
use sqlx::SqlitePool;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::event::VaultEvent;
use crate::onchain::ChainError;
use crate::onchain::decode_log;
use crate::onchain::source::{LogSource, SourceItem};
use crate::store::{StoreError, cursor};

mod folder;
mod reorg;

pub use folder::{EventFolder, FoldError, FoldOutcome};
pub use reorg::RetractOutcome;

const LOG_QUEUE_CAPACITY: usize = 1_024;

fn get_fold_retry_strat() -> ExponentialBuilder {
    const FOLD_MAX_RETRIES: usize = 5;
    const FOLD_INITIAL_DELAY: Duration = Duration::from_millis(200);
    const FOLD_MAX_DELAY: Duration = Duration::from_secs(5);

    ExponentialBuilder::default()
        .with_max_times(FOLD_MAX_RETRIES)
        .with_min_delay(FOLD_INITIAL_DELAY)
        .with_max_delay(FOLD_MAX_DELAY)
        .with_jitter()
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum IndexerError {
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error("failed to {action} vault log {tx_hash}:{log_index} at block {block_number}: {source}")]
    Fold {
        action: &'static str,
        tx_hash: alloy::primitives::TxHash,
        log_index: u64,
        block_number: u64,
        #[source]
        source: FoldError,
    },
}

impl IndexerError {
    fn fold(action: &'static str, event: &VaultEvent, source: FoldError) -> Self {
        Self::Fold {
            action,
            tx_hash: event.id.tx_hash,
            log_index: event.id.log_index,
            block_number: event.block_number,
            source,
        }
    }
}

/// Block the source should resume from: the last folded block, whose
/// already-stored logs fold as duplicates, or `start_block` on first run.
pub(crate) async fn resume_block(pool: &SqlitePool, start_block: u64) -> Result<u64, StoreError> {
    Ok(cursor::get(pool).await?.unwrap_or(start_block))
}

/// Runs the log source and the ingestion loop together until the source
/// stops and every log it delivered has been folded, or until a log cannot
/// be written to the store. In the latter case the caller restarts from the
/// cursor, which has not moved past the failed log.
pub(crate) async fn run<P: Provider + Clone>(
    source: LogSource<P>,
    folder: EventFolder,
    from_block: u64,
) -> Result<(), IndexerError> {
    let (items_tx, items_rx) = mpsc::channel(LOG_QUEUE_CAPACITY);

    info!(from_block, "Starting vault indexer");

    let ingestion = ingest(&folder, items_rx, get_fold_retry_strat());
    tokio::pin!(ingestion);

    let stop = tokio::select! {
        stop = source.run(from_block, items_tx) => stop,
        result = &mut ingestion => {
            // The source holds the sender, so ingestion only ends early when
            // a log could not be folded.
            result?;
            return Ok(());
        }
    };

    ingestion.await?;

    let stop = stop?;
    info!(?stop, "Vault indexer stopped");
    Ok(())
}

/// Folds queued logs in arrival order until the queue is closed and drained.
///
/// Undecodable logs and fold failures that leave the store consistent are
/// logged and skipped. Store failures are retried, then returned; every log
/// after the failed one stays unfolded so the cursor cannot pass it.
pub(crate) async fn ingest<B: BackoffBuilder + Clone>(
    folder: &EventFolder,
    mut items: mpsc::Receiver<SourceItem>,
    retry: B,
) -> Result<(), IndexerError> {
    while let Some(item) = items.recv().await {
        match item {
            SourceItem::Apply(log) => apply_log(folder, &log, &retry).await?,
            SourceItem::Retract(log) => retract_log(folder, &log, &retry).await?,
        }
    }

    info!("Log queue closed, ingestion finished");
    Ok(())
}

fn decode_or_skip(log: &Log, what: &str) -> Option<VaultEvent> {
    match decode_log(log) {
        Ok(event) => Some(event),
        Err(e) => {
            warn!(
                vault = %log.address(),
                tx_hash = ?log.transaction_hash,
                log_index = ?log.log_index,
                "Skipping undecodable {what} log: {e}"
            );
            None
        }
    }
}

async fn apply_log<B: BackoffBuilder + Clone>(
    folder: &EventFolder,
    log: &Log,
    retry: &B,
) -> Result<(), IndexerError> {
    let Some(event) = decode_or_skip(log, "vault") else {
        return Ok(());
    };

    let result = (|| folder.apply(&event))
        .retry(retry.clone().build())
        .when(FoldError::is_store_failure)
        .notify(|err, dur| {
            warn!(event_id = %event.id, "Retrying fold after store error: {err} (waiting {dur:?})");
        })
        .await;

    match result {
        Ok(FoldOutcome::Applied) => debug!(
            vault = %event.vault,
            event_id = %event.id,
            kind = event.kind.name(),
            "Folded vault event"
        ),
        Ok(FoldOutcome::Duplicate) => {}
        Err(e) if e.is_store_failure() => return Err(IndexerError::fold("apply", &event, e)),
        Err(e) => error!(
            vault = %event.vault,
            tx_hash = %event.id.tx_hash,
            log_index = event.id.log_index,
            kind = event.kind.name(),
            "Failed to fold vault event: {e}"
        ),
    }

    Ok(())
}

async fn retract_log<B: BackoffBuilder + Clone>(
    folder: &EventFolder,
    log: &Log,
    retry: &B,
) -> Result<(), IndexerError> {
    let Some(event) = decode_or_skip(log, "removed") else {
        return Ok(());
    };

    let result = (|| folder.retract(&event))
        .retry(retry.clone().build())
        .when(FoldError::is_store_failure)
        .notify(|err, dur| {
            warn!(event_id = %event.id, "Retrying retraction after store error: {err} (waiting {dur:?})");
        })
        .await;

    match result {
        Ok(_) => {}
        Err(e) if e.is_store_failure() => return Err(IndexerError::fold("retract", &event, e)),
        Err(e) => error!(
            vault = %event.vault,
            tx_hash = %event.id.tx_hash,
            log_index = event.id.log_index,
            kind = event.kind.name(),
            "Failed to retract vault event: {e}"
        ),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use alloy::primitives::{Address, B256, I256, LogData, U256};
    use alloy::sol_types::SolEvent;
    use std::sync::Arc;

    use super::*;
    use crate::bindings::IYieldVault;
    use crate::onchain::mock::MockChainReader;
    use crate::onchain::vault::VaultReader;
    use crate::store::{balances, metrics};
    use crate::test_utils::{ALICE, TEST_VAULT, fast_retry_policy, log_with_data, setup_test_db};

    fn deposit_log(owner: Address, shares: U256, block_number: u64, log_index: u64) -> Log {
        log_with_data(
            IYieldVault::Deposit {
                sender: owner,
                owner,
                assets: shares,
                shares,
            }
            .encode_log_data(),
            block_number,
            log_index,
        )
    }

    fn removed(mut log: Log) -> Log {
        log.removed = true;
        log
    }

    fn test_retry_strategy() -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_max_times(2)
            .with_min_delay(Duration::from_millis(1))
            .with_max_delay(Duration::from_millis(5))
    }

    async fn folder_with_chain() -> (EventFolder, Arc<MockChainReader>) {
        let chain = Arc::new(MockChainReader::new());
        chain.set_totals(
            TEST_VAULT,
            U256::from(1_000_000_000_000_000_000_u128),
            U256::from(1_000_000_000_000_000_000_u128),
        );
        let vaults = VaultReader::new(chain.clone(), fast_retry_policy());
        (EventFolder::new(setup_test_db().await, vaults), chain)
    }

    async fn ingest_all(folder: &EventFolder, items: Vec<SourceItem>) -> Result<(), IndexerError> {
        let (items_tx, items_rx) = mpsc::channel(16);

        for item in items {
            items_tx.send(item).await.unwrap();
        }
        drop(items_tx);

        ingest(folder, items_rx, test_retry_strategy()).await
    }

    async fn shares_of(folder: &EventFolder, user: &Address) -> Option<I256> {
        balances::get(&folder.pool, user, &TEST_VAULT)
            .await
            .unwrap()
            .map(|balance| balance.shares)
    }

    #[tokio::test]
    async fn deposit_log_flows_through_to_balance_and_metrics() {
        let (folder, chain) = folder_with_chain().await;
        let one_token = U256::from(1_000_000_000_000_000_000_u128);

        ingest_all(&folder, vec![SourceItem::Apply(deposit_log(ALICE, one_token, 10, 0))])
            .await
            .unwrap();

        let balance = balances::get(&folder.pool, &ALICE, &TEST_VAULT)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(balance.shares.to_string(), "1000000000000000000");

        assert_eq!(chain.calls_to::<IYieldVault::totalAssetsCall>(TEST_VAULT), 1);
        assert_eq!(chain.calls_to::<IYieldVault::totalSupplyCall>(TEST_VAULT), 1);
        let snapshot = metrics::get(&folder.pool, &TEST_VAULT).await.unwrap().unwrap();
        assert_eq!(snapshot.vault, TEST_VAULT);
        assert_eq!(snapshot.share_price, one_token);
    }

    #[tokio::test]
    async fn undecodable_log_is_skipped() {
        let (folder, _chain) = folder_with_chain().await;
        let unknown = log_with_data(
            LogData::new_unchecked(vec![B256::repeat_byte(0x42)], Default::default()),
            10,
            0,
        );

        ingest_all(
            &folder,
            vec![
                SourceItem::Apply(unknown),
                SourceItem::Apply(deposit_log(ALICE, U256::from(100), 10, 1)),
            ],
        )
        .await
        .unwrap();

        assert_eq!(shares_of(&folder, &ALICE).await, Some(I256::try_from(100).unwrap()));
    }

    #[tokio::test]
    async fn retraction_is_folded_before_queued_replacement() {
        let (folder, _chain) = folder_with_chain().await;
        let orphaned = deposit_log(ALICE, U256::from(100), 11, 0);
        ingest_all(&folder, vec![SourceItem::Apply(orphaned.clone())])
            .await
            .unwrap();

        // The replacement reuses the orphaned log's key with a new payload.
        let replacement = deposit_log(ALICE, U256::from(5), 11, 0);
        ingest_all(
            &folder,
            vec![
                SourceItem::Retract(removed(orphaned)),
                SourceItem::Apply(replacement),
            ],
        )
        .await
        .unwrap();

        assert_eq!(shares_of(&folder, &ALICE).await, Some(I256::try_from(5).unwrap()));
        assert_eq!(cursor::get(&folder.pool).await.unwrap(), Some(11));
    }

    #[tokio::test]
    async fn retraction_queued_behind_its_apply_undoes_it() {
        let (folder, _chain) = folder_with_chain().await;
        let orphaned = deposit_log(ALICE, U256::from(100), 11, 0);

        ingest_all(
            &folder,
            vec![
                SourceItem::Apply(orphaned.clone()),
                SourceItem::Retract(removed(orphaned)),
            ],
        )
        .await
        .unwrap();

        assert_eq!(shares_of(&folder, &ALICE).await, None);
        assert_eq!(cursor::get(&folder.pool).await.unwrap(), Some(10));
    }

    #[tokio::test]
    async fn store_failure_stops_ingestion_and_restart_refolds_the_log() {
        let (folder, _chain) = folder_with_chain().await;
        ingest_all(
            &folder,
            vec![SourceItem::Apply(deposit_log(ALICE, U256::from(1), 10, 0))],
        )
        .await
        .unwrap();

        let failing = deposit_log(ALICE, U256::from(100), 11, 0);
        let later = deposit_log(ALICE, U256::from(7), 12, 0);

        sqlx::query("ALTER TABLE deposits RENAME TO deposits_offline")
            .execute(&folder.pool)
            .await
            .unwrap();

        let error = ingest_all(
            &folder,
            vec![
                SourceItem::Apply(failing.clone()),
                SourceItem::Apply(later.clone()),
            ],
        )
        .await
        .unwrap_err();

        assert!(matches!(
            error,
            IndexerError::Fold { block_number: 11, ref source, .. } if source.is_store_failure()
        ));
        assert_eq!(cursor::get(&folder.pool).await.unwrap(), Some(10));

        sqlx::query("ALTER TABLE deposits_offline RENAME TO deposits")
            .execute(&folder.pool)
            .await
            .unwrap();

        // A restart re-reads from the cursor, so the failed log is delivered again.
        assert_eq!(resume_block(&folder.pool, 0).await.unwrap(), 10);
        ingest_all(
            &folder,
            vec![
                SourceItem::Apply(deposit_log(ALICE, U256::from(1), 10, 0)),
                SourceItem::Apply(failing),
                SourceItem::Apply(later),
            ],
        )
        .await
        .unwrap();

        assert_eq!(shares_of(&folder, &ALICE).await, Some(I256::try_from(108).unwrap()));
        assert_eq!(cursor::get(&folder.pool).await.unwrap(), Some(12));
    }

    #[tokio::test]
    async fn resume_block_prefers_cursor() {
        let (folder, _chain) = folder_with_chain().await;
        assert_eq!(resume_block(&folder.pool, 7).await.unwrap(), 7);

        ingest_all(
            &folder,
            vec![SourceItem::Apply(deposit_log(ALICE, U256::from(1), 42, 0))],
        )
        .await
        .unwrap();

        assert_eq!(resume_block(&folder.pool, 7).await.unwrap(), 42);
    }
}
