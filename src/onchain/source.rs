//! Raw vault log delivery: `eth_getLogs` backfill from the cursor to the
//! chain head, then `eth_newFilter` polling. Logs are delivered in
//! `(block_number, log_index)` order on one queue, tagged as applies or as
//! retractions of logs the node reports as `removed`.

use alloy::primitives::Address;
use alloy::providers::Provider;
use alloy::rpc::types::{BlockNumberOrTag, Filter, Log};
use backon::{BackoffBuilder, ExponentialBuilder, Retryable};
use futures_util::StreamExt;
use itertools::Itertools;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use super::ChainError;

/// Timestamps of recently seen blocks. Cleared wholesale once it grows past
/// this many entries.
const TIMESTAMP_CACHE_LIMIT: usize = 4_096;

fn get_source_retry_strat() -> ExponentialBuilder {
    const SOURCE_MAX_RETRIES: usize = 15;
    const SOURCE_INITIAL_DELAY: Duration = Duration::from_millis(100);
    const SOURCE_MAX_DELAY: Duration = Duration::from_secs(120);

    ExponentialBuilder::default()
        .with_max_times(SOURCE_MAX_RETRIES)
        .with_min_delay(SOURCE_INITIAL_DELAY)
        .with_max_delay(SOURCE_MAX_DELAY)
        .with_jitter()
}

/// One delivery from the source. Applies and retractions share a queue so
/// the ingester folds them in the order the source produced them.
#[derive(Debug)]
pub(crate) enum SourceItem {
    Apply(Log),
    Retract(Log),
}

/// Why the source stopped delivering.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum SourceStop {
    /// The receiving side of the queue was dropped.
    ChannelClosed,
    /// The node's filter stream ended.
    StreamEnded,
}

pub(crate) struct LogSource<P, B = ExponentialBuilder> {
    provider: P,
    vaults: Vec<Address>,
    batch_size: u64,
    poll_interval: Duration,
    retry: B,
    timestamps: HashMap<u64, u64>,
}

impl<P: Provider + Clone> LogSource<P> {
    pub(crate) fn new(
        provider: P,
        vaults: Vec<Address>,
        batch_size: u64,
        poll_interval: Duration,
    ) -> Self {
        Self::with_retry_strat(
            provider,
            vaults,
            batch_size,
            poll_interval,
            get_source_retry_strat(),
        )
    }
}

impl<P: Provider + Clone, B: BackoffBuilder + Clone> LogSource<P, B> {
    pub(crate) fn with_retry_strat(
        provider: P,
        vaults: Vec<Address>,
        batch_size: u64,
        poll_interval: Duration,
        retry: B,
    ) -> Self {
        Self {
            provider,
            vaults,
            batch_size: batch_size.max(1),
            poll_interval,
            retry,
            timestamps: HashMap::new(),
        }
    }

    /// Installs the live filter, backfills `from_block..=head`, then streams
    /// filter changes until the queue closes or the stream ends.
    ///
    /// The filter is installed before the head is read so no block falls
    /// between the backfill and the first poll. Logs seen by both are
    /// delivered twice; the store treats the second delivery as a duplicate.
    #[tracing::instrument(skip(self, items), fields(from_block), level = tracing::Level::INFO)]
    pub(crate) async fn run(
        mut self,
        from_block: u64,
        items: mpsc::Sender<SourceItem>,
    ) -> Result<SourceStop, ChainError> {
        let filter = Filter::new().address(self.vaults.clone());
        let watcher = self
            .provider
            .watch_logs(&filter)
            .await?
            .with_poll_interval(self.poll_interval);

        let head = self.provider.get_block_number().await?;

        if let Some(stop) = self.backfill(from_block, head, &items).await? {
            return Ok(stop);
        }

        info!(head, "Backfill complete, watching for new vault logs");

        let mut stream = std::pin::pin!(watcher.into_stream());

        while let Some(logs) = stream.next().await {
            if let Some(stop) = self.dispatch(logs, &items).await? {
                return Ok(stop);
            }
        }

        warn!("Vault log stream ended");
        Ok(SourceStop::StreamEnded)
    }

    /// Delivers every vault log in `from_block..=to_block` as an apply,
    /// batch by batch in chain order.
    #[tracing::instrument(skip(self, items), level = tracing::Level::INFO)]
    pub(crate) async fn backfill(
        &mut self,
        from_block: u64,
        to_block: u64,
        items: &mpsc::Sender<SourceItem>,
    ) -> Result<Option<SourceStop>, ChainError> {
        if from_block > to_block {
            info!(to_block, "Already caught up, skipping backfill");
            return Ok(None);
        }

        info!(
            "Backfilling from block {from_block} to {to_block} ({} blocks)",
            to_block - from_block + 1
        );

        let mut delivered = 0_usize;

        for (batch_start, batch_end) in generate_batch_ranges(from_block, to_block, self.batch_size)
        {
            let logs = self.fetch_batch(batch_start, batch_end).await?;
            let logs = self.fill_timestamps(logs).await?;

            debug!(batch_start, batch_end, count = logs.len(), "Fetched vault logs");

            for log in logs
                .into_iter()
                .sorted_by_key(|log| (log.block_number, log.log_index))
            {
                if items.send(SourceItem::Apply(log)).await.is_err() {
                    return Ok(Some(SourceStop::ChannelClosed));
                }
                delivered += 1;
            }
        }

        info!("Backfill delivered {delivered} vault logs");

        Ok(None)
    }

    async fn fetch_batch(&self, batch_start: u64, batch_end: u64) -> Result<Vec<Log>, ChainError> {
        let filter = Filter::new()
            .address(self.vaults.clone())
            .from_block(batch_start)
            .to_block(batch_end);

        let provider = self.provider.clone();
        let get_logs = move || {
            let provider = provider.clone();
            let filter = filter.clone();
            async move { provider.get_logs(&filter).await }
        };

        Ok(get_logs
            .retry(self.retry.clone().build())
            .notify(|err, dur| {
                trace!("Retrying getLogs for blocks {batch_start}-{batch_end} after error: {err} (waiting {dur:?})");
            })
            .await?)
    }

    /// Queues one poll's worth of logs. Retractions go ahead of the poll's
    /// applies, newest first, so a replacement never precedes the retraction
    /// of the log it replaces.
    async fn dispatch(
        &mut self,
        logs: Vec<Log>,
        items: &mpsc::Sender<SourceItem>,
    ) -> Result<Option<SourceStop>, ChainError> {
        let logs = self.fill_timestamps(logs).await?;

        let (removed, added): (Vec<Log>, Vec<Log>) = logs
            .into_iter()
            .sorted_by_key(|log| (log.block_number, log.log_index))
            .partition(|log| log.removed);

        for log in removed.into_iter().rev() {
            warn!(
                tx_hash = ?log.transaction_hash,
                log_index = ?log.log_index,
                block_number = ?log.block_number,
                "Vault log removed by reorg"
            );
            if items.send(SourceItem::Retract(log)).await.is_err() {
                return Ok(Some(SourceStop::ChannelClosed));
            }
        }

        for log in added {
            if items.send(SourceItem::Apply(log)).await.is_err() {
                return Ok(Some(SourceStop::ChannelClosed));
            }
        }

        Ok(None)
    }

    /// Some nodes omit `blockTimestamp` on logs. Fills it from the block
    /// header, one lookup per block.
    async fn fill_timestamps(&mut self, mut logs: Vec<Log>) -> Result<Vec<Log>, ChainError> {
        for log in &mut logs {
            if log.block_timestamp.is_some() {
                continue;
            }

            // The block of a removed log may no longer exist. Retraction only
            // reads the log's identity and payload.
            if log.removed {
                log.block_timestamp = Some(0);
                continue;
            }

            let Some(block_number) = log.block_number else {
                continue;
            };

            log.block_timestamp = Some(self.block_timestamp(block_number).await?);
        }

        Ok(logs)
    }

    async fn block_timestamp(&mut self, block_number: u64) -> Result<u64, ChainError> {
        if let Some(timestamp) = self.timestamps.get(&block_number) {
            return Ok(*timestamp);
        }

        let provider = self.provider.clone();
        let get_block = move || {
            let provider = provider.clone();
            async move {
                provider
                    .get_block_by_number(BlockNumberOrTag::Number(block_number))
                    .await
            }
        };

        let timestamp = get_block
            .retry(self.retry.clone().build())
            .notify(|err, dur| {
                trace!("Retrying block {block_number} lookup after error: {err} (waiting {dur:?})");
            })
            .await?
            .ok_or(ChainError::MissingBlock(block_number))?
            .header
            .timestamp;

        if self.timestamps.len() >= TIMESTAMP_CACHE_LIMIT {
            self.timestamps.clear();
        }
        self.timestamps.insert(block_number, timestamp);

        Ok(timestamp)
    }
}

fn generate_batch_ranges(start_block: u64, end_block: u64, batch_size: u64) -> Vec<(u64, u64)> {
    let step = usize::try_from(batch_size).unwrap_or(usize::MAX);

    (start_block..=end_block)
        .step_by(step)
        .map(|batch_start| {
            let batch_end = batch_start
                .saturating_add(batch_size - 1)
                .min(end_block);
            (batch_start, batch_end)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use alloy::primitives::U256;
    use alloy::providers::{ProviderBuilder, mock::Asserter};
    use alloy::sol_types::SolEvent;

    use super::*;
    use crate::bindings::IYieldVault;
    use crate::test_utils::{TEST_VAULT, log_with_data};

    fn test_retry_strategy() -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_max_times(2)
            .with_min_delay(Duration::from_millis(1))
            .with_max_delay(Duration::from_millis(10))
    }

    fn harvest_log(block_number: u64, log_index: u64) -> Log {
        log_with_data(
            IYieldVault::YieldHarvested {
                totalYield: U256::from(block_number),
            }
            .encode_log_data(),
            block_number,
            log_index,
        )
    }

    fn test_source(asserter: Asserter) -> LogSource<impl Provider + Clone, ExponentialBuilder> {
        let provider = ProviderBuilder::new().connect_mocked_client(asserter);
        LogSource::with_retry_strat(
            provider,
            vec![TEST_VAULT],
            1_000,
            Duration::from_millis(10),
            test_retry_strategy(),
        )
    }

    fn applied(item: SourceItem) -> Log {
        let SourceItem::Apply(log) = item else {
            panic!("expected an apply, got {item:?}");
        };
        log
    }

    #[test]
    fn batch_ranges_split_on_batch_size() {
        assert_eq!(generate_batch_ranges(100, 500, 1_000), vec![(100, 500)]);
        assert_eq!(generate_batch_ranges(100, 1_099, 1_000), vec![(100, 1_099)]);
        assert_eq!(
            generate_batch_ranges(100, 2_500, 1_000),
            vec![(100, 1_099), (1_100, 2_099), (2_100, 2_500)]
        );
        assert_eq!(generate_batch_ranges(42, 42, 10), vec![(42, 42)]);
        assert!(generate_batch_ranges(100, 99, 10).is_empty());
    }

    #[tokio::test]
    async fn backfill_delivers_logs_in_chain_order() {
        let asserter = Asserter::new();
        asserter.push_success(&vec![harvest_log(12, 0), harvest_log(10, 2), harvest_log(10, 1)]);

        let mut source = test_source(asserter);
        let (items, mut items_rx) = mpsc::channel(16);

        let stop = source.backfill(1, 20, &items).await.unwrap();
        drop(items);

        assert_eq!(stop, None);

        let mut order = Vec::new();
        while let Some(item) = items_rx.recv().await {
            let log = applied(item);
            order.push((log.block_number.unwrap(), log.log_index.unwrap()));
        }
        assert_eq!(order, vec![(10, 1), (10, 2), (12, 0)]);
    }

    #[tokio::test]
    async fn backfill_retries_transient_get_logs_failure() {
        let asserter = Asserter::new();
        asserter.push_failure_msg("rate limited");
        asserter.push_success(&vec![harvest_log(5, 0)]);

        let mut source = test_source(asserter);
        let (items, mut items_rx) = mpsc::channel(16);

        source.backfill(1, 10, &items).await.unwrap();

        assert_eq!(applied(items_rx.recv().await.unwrap()).block_number, Some(5));
    }

    #[tokio::test]
    async fn backfill_surfaces_exhausted_retries() {
        let asserter = Asserter::new();
        for _ in 0..3 {
            asserter.push_failure_msg("node down");
        }

        let mut source = test_source(asserter);
        let (items, _items_rx) = mpsc::channel(16);

        let error = source.backfill(1, 10, &items).await.unwrap_err();

        assert!(matches!(error, ChainError::Transport(_)));
    }

    #[tokio::test]
    async fn backfill_skips_when_caught_up() {
        let mut source = test_source(Asserter::new());
        let (items, _items_rx) = mpsc::channel(1);

        let stop = source.backfill(11, 10, &items).await.unwrap();

        assert_eq!(stop, None);
    }

    #[tokio::test]
    async fn dispatch_queues_retractions_ahead_of_applies() {
        let mut source = test_source(Asserter::new());
        let (items, mut items_rx) = mpsc::channel(16);

        let mut removed_a = harvest_log(10, 0);
        removed_a.removed = true;
        let mut removed_b = harvest_log(10, 1);
        removed_b.removed = true;
        let replacement = harvest_log(10, 0);

        source
            .dispatch(vec![removed_a, replacement, removed_b], &items)
            .await
            .unwrap();
        drop(items);

        let mut queued = Vec::new();
        while let Some(item) = items_rx.recv().await {
            queued.push(match item {
                SourceItem::Retract(log) => ("retract", log.log_index.unwrap()),
                SourceItem::Apply(log) => ("apply", log.log_index.unwrap()),
            });
        }
        assert_eq!(queued, vec![("retract", 1), ("retract", 0), ("apply", 0)]);
    }

    #[tokio::test]
    async fn dispatch_reports_closed_queue() {
        let mut source = test_source(Asserter::new());
        let (items, items_rx) = mpsc::channel(1);
        drop(items_rx);

        let stop = source.dispatch(vec![harvest_log(1, 0)], &items).await.unwrap();

        assert_eq!(stop, Some(SourceStop::ChannelClosed));
    }

    #[tokio::test]
    async fn cached_timestamps_skip_block_lookup() {
        let mut source = test_source(Asserter::new());
        source.timestamps.insert(7, 1_234);

        let mut log = harvest_log(7, 0);
        log.block_timestamp = None;

        let filled = source.fill_timestamps(vec![log]).await.unwrap();

        assert_eq!(filled[0].block_timestamp, Some(1_234));
    }
}
