use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use anyhow::Context;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{AbortHandle, JoinError, JoinHandle};
use tracing::{Instrument, error, info, info_span, warn};

pub mod agent;
mod bindings;
pub mod cli;
pub mod config;
pub mod event;
mod indexer;
mod onchain;
pub mod rebalancing;
pub mod scheduler;
pub mod service;
pub mod store;

#[cfg(test)]
pub(crate) mod test_utils;

pub use config::{Ctx, Env, LogLevel, setup_tracing};

use crate::agent::{DecisionEngine, OpenAiReasoningClient};
use crate::indexer::EventFolder;
use crate::onchain::source::LogSource;
use crate::onchain::vault::VaultReader;
use crate::onchain::wallet::connect_local_wallet;
use crate::onchain::{AlloyChainReader, ChainReader, RpcRetryPolicy, Wallet, http_client_with_retry};
use crate::rebalancing::Rebalancer;
use crate::scheduler::{Scheduler, SchedulerHandle};
use crate::service::VaultService;

/// Everything the server and CLI share: the database, chain clients, the
/// Decision Engine and the Rebalancer.
pub(crate) struct Keeper {
    pool: SqlitePool,
    provider: DynProvider,
    folder: EventFolder,
    engine: DecisionEngine,
    rebalancer: Rebalancer,
}

impl Keeper {
    /// Opens the database, applies migrations, and connects to the RPC,
    /// refusing to continue if it serves a different chain than configured.
    #[tracing::instrument(skip_all, level = tracing::Level::INFO)]
    pub(crate) async fn connect(ctx: &Ctx) -> anyhow::Result<Self> {
        let pool = ctx.get_sqlite_pool().await?;
        sqlx::migrate!().run(&pool).await?;

        let provider = ProviderBuilder::new()
            .connect_client(http_client_with_retry(ctx.evm.rpc_url.clone()))
            .erased();

        let chain: Arc<dyn ChainReader> = Arc::new(AlloyChainReader::new(provider.clone()));
        let rpc_chain_id = chain
            .chain_id()
            .await
            .context("failed to read chain id from RPC")?;
        anyhow::ensure!(
            rpc_chain_id == ctx.evm.chain_id,
            "RPC serves chain {rpc_chain_id} but chain {} is configured",
            ctx.evm.chain_id
        );

        let reader = VaultReader::new(chain, RpcRetryPolicy::default());

        let wallet: Option<Arc<dyn Wallet>> = match &ctx.evm.private_key {
            Some(private_key) => {
                let wallet = connect_local_wallet(ctx.evm.rpc_url.clone(), private_key)?;
                info!(address = %wallet.address(), "Rebalance signer configured");
                Some(Arc::new(wallet))
            }
            None => {
                warn!("No evm.private_key configured, rebalances will not be executed");
                None
            }
        };

        let reasoning = OpenAiReasoningClient::new(
            &ctx.agent.base_url,
            ctx.agent.api_key.clone(),
            ctx.agent.model.clone(),
            ctx.agent.temperature,
        )?;

        let engine = DecisionEngine::new(
            pool.clone(),
            reader.clone(),
            Arc::new(reasoning),
            ctx.evm.chain_id,
            ctx.agent.max_retries,
        );
        let rebalancer = Rebalancer::new(pool.clone(), reader.clone(), wallet, ctx.rebalancing);
        let folder = EventFolder::new(pool.clone(), reader);

        Ok(Self {
            pool,
            provider,
            folder,
            engine,
            rebalancer,
        })
    }

    pub(crate) fn service(&self, ctx: &Ctx, scheduler: Option<SchedulerHandle>) -> VaultService {
        VaultService::new(
            self.pool.clone(),
            ctx.evm.vaults.iter().copied(),
            self.engine.clone(),
            self.rebalancer.clone(),
            scheduler,
            ctx.operator_api_key.clone(),
        )
    }
}

#[tracing::instrument(skip_all, level = tracing::Level::INFO)]
pub async fn launch(ctx: Ctx) -> anyhow::Result<()> {
    let keeper = Keeper::connect(&ctx).await?;

    let (scheduler, scheduler_handle) = Scheduler::new(
        ctx.evm.vaults.clone(),
        keeper.engine.clone(),
        keeper.rebalancer.clone(),
        ctx.scheduler,
    );
    let scheduler_task = tokio::spawn(scheduler.run().instrument(info_span!("scheduler_task")));
    let indexer_task = spawn_indexer_task(&ctx, &keeper);

    await_shutdown(indexer_task, scheduler_task).await;

    // Keeps the scheduler's command channel open until shutdown.
    drop(scheduler_handle);

    info!("Shutdown complete");
    Ok(())
}

fn spawn_indexer_task(ctx: &Ctx, keeper: &Keeper) -> JoinHandle<()> {
    let evm = ctx.evm.clone();
    let pool = keeper.pool.clone();
    let provider = keeper.provider.clone();
    let folder = keeper.folder.clone();

    tokio::spawn(
        async move {
            if let Err(e) = run_indexer(evm, pool, provider, folder).await {
                error!("Indexer failed: {e}");
            }
        }
        .instrument(info_span!("indexer_task")),
    )
}

/// Restarts the log source and ingestion from the stored cursor whenever
/// either stops.
#[tracing::instrument(skip_all, level = tracing::Level::INFO)]
async fn run_indexer(
    evm: onchain::EvmCtx,
    pool: SqlitePool,
    provider: DynProvider,
    folder: EventFolder,
) -> anyhow::Result<()> {
    const RERUN_DELAY: Duration = Duration::from_secs(10);

    loop {
        let from_block = indexer::resume_block(&pool, evm.start_block).await?;
        let source = LogSource::new(
            provider.clone(),
            evm.vaults.clone(),
            evm.backfill_batch_size,
            evm.poll_interval,
        );

        match indexer::run(source, folder.clone(), from_block).await {
            Ok(()) => warn!("Log source stopped, restarting in {RERUN_DELAY:?}"),
            Err(e) => error!("Indexer failed: {e}, restarting from cursor in {RERUN_DELAY:?}"),
        }

        tokio::time::sleep(RERUN_DELAY).await;
    }
}

async fn await_shutdown(indexer_task: JoinHandle<()>, scheduler_task: JoinHandle<()>) {
    let indexer_abort = indexer_task.abort_handle();
    let scheduler_abort = scheduler_task.abort_handle();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal, shutting down gracefully...");
            abort_task("indexer", &indexer_abort);
            abort_task("scheduler", &scheduler_abort);
        }
        result = indexer_task => {
            log_task_result("indexer", result);
            abort_task("scheduler", &scheduler_abort);
        }
        result = scheduler_task => {
            log_task_result("scheduler", result);
            abort_task("indexer", &indexer_abort);
        }
    }
}

fn abort_task(name: &str, handle: &AbortHandle) {
    info!("Aborting {name} task");
    handle.abort();
}

fn log_task_result(name: &str, result: Result<(), JoinError>) {
    match result {
        Ok(()) => info!("{name} task completed"),
        Err(e) => error!("{name} task panicked: {e}"),
    }
}
