//! Evaluates the latest recommendation against on-chain allocations and,
//! when warranted, submits a `rebalance` transaction.

use alloy::primitives::{Address, TxHash};
use chrono::Utc;
use serde::{Serialize, Serializer};
use sqlx::SqlitePool;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::guard::InProgressGuard;
use crate::event::address_key;
use crate::onchain::vault::{VaultReader, rebalance_calldata};
use crate::onchain::{ChainError, Wallet, WalletError};
use crate::store::claims;
use crate::store::decisions::{self, AgentDecision};
use crate::store::{StoreError, as_address_key};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RebalanceConfig {
    pub threshold_bp: u64,
    pub min_confidence: f64,
    pub gas_limit: u64,
    pub max_decision_age: Duration,
}

impl Default for RebalanceConfig {
    fn default() -> Self {
        Self {
            threshold_bp: 500,
            min_confidence: 0.7,
            gas_limit: 3_000_000,
            max_decision_age: Duration::from_secs(86_400),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RebalanceError {
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("rebalance transaction failed: {0}")]
    Wallet(#[from] WalletError),
}

/// Why a rebalance did or did not happen. Only `Executed` sent a
/// transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RebalanceReason {
    NoRecommendation,
    StaleRecommendation,
    NoRebalanceNeeded,
    InsufficientConfidence,
    NoSigner,
    AlreadyInProgress,
    /// Preview only: every gate passed and `execute` would send.
    ReadyToExecute,
    Executed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RebalanceOutcome {
    #[serde(serialize_with = "as_address_key")]
    pub vault: Address,
    pub reason: RebalanceReason,
    pub executed: bool,
    pub tx_hash: Option<TxHash>,
    pub decision_id: Option<i64>,
    pub confidence: Option<f64>,
    /// On-chain allocation per strategy when it was read.
    #[serde(serialize_with = "bp_by_address_key")]
    pub current: BTreeMap<Address, u64>,
    /// Target allocation per vault strategy; strategies the recommendation
    /// omits are 0.
    #[serde(serialize_with = "bp_by_address_key")]
    pub target: BTreeMap<Address, u64>,
}

impl RebalanceOutcome {
    fn skipped(vault: Address, reason: RebalanceReason) -> Self {
        Self {
            vault,
            reason,
            executed: false,
            tx_hash: None,
            decision_id: None,
            confidence: None,
            current: BTreeMap::new(),
            target: BTreeMap::new(),
        }
    }
}

fn bp_by_address_key<S: Serializer>(
    allocations: &BTreeMap<Address, u64>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_map(
        allocations
            .iter()
            .map(|(strategy, bp)| (address_key(strategy), bp)),
    )
}

/// True when some strategy's target differs from its current allocation by
/// strictly more than `threshold_bp`. A strategy missing from either side
/// counts as 0 there.
pub fn needs_rebalance(
    current: &BTreeMap<Address, u64>,
    target: &BTreeMap<Address, u64>,
    threshold_bp: u64,
) -> bool {
    current
        .keys()
        .chain(target.keys())
        .any(|strategy| {
            let current_bp = current.get(strategy).copied().unwrap_or(0);
            let target_bp = target.get(strategy).copied().unwrap_or(0);
            current_bp.abs_diff(target_bp) > threshold_bp
        })
}

/// Outcome of the read-only evaluation step.
enum Evaluation {
    Skip(RebalanceOutcome),
    Ready {
        outcome: RebalanceOutcome,
        /// Vault strategies in index order with their target allocations.
        strategies: Vec<Address>,
        allocations: Vec<u64>,
    },
}

/// A claim held longer than this belongs to a process that died mid-send.
const CLAIM_TTL: Duration = Duration::from_secs(15 * 60);

static NEXT_CLAIM_HOLDER: AtomicU64 = AtomicU64::new(0);

/// Turns the latest recommendation into at most one in-flight rebalance
/// per vault.
///
/// Calls within one `Rebalancer` are serialized in memory. Separate
/// instances, including ones in other processes on the same database, are
/// serialized through a claim row in the store.
#[derive(Clone)]
pub struct Rebalancer {
    pool: SqlitePool,
    vaults: VaultReader,
    wallet: Option<Arc<dyn Wallet>>,
    config: RebalanceConfig,
    in_progress: Arc<RwLock<HashSet<Address>>>,
    claim_holder: Arc<str>,
}

impl Rebalancer {
    pub fn new(
        pool: SqlitePool,
        vaults: VaultReader,
        wallet: Option<Arc<dyn Wallet>>,
        config: RebalanceConfig,
    ) -> Self {
        Self {
            pool,
            vaults,
            wallet,
            config,
            in_progress: Arc::new(RwLock::new(HashSet::new())),
            claim_holder: format!(
                "{}:{}",
                std::process::id(),
                NEXT_CLAIM_HOLDER.fetch_add(1, Ordering::Relaxed)
            )
            .into(),
        }
    }

    /// Evaluates `vault` without claiming the in-progress slot or sending
    /// anything.
    pub async fn preview(&self, vault: Address) -> Result<RebalanceOutcome, RebalanceError> {
        Ok(match self.evaluate(vault).await? {
            Evaluation::Skip(outcome) => outcome,
            Evaluation::Ready { mut outcome, .. } => {
                outcome.reason = RebalanceReason::ReadyToExecute;
                outcome
            }
        })
    }

    /// Evaluates `vault` and sends the rebalance when every gate passes.
    ///
    /// Returns `AlreadyInProgress` without reading anything when another
    /// call for the same vault is still running, here or in another process.
    /// Both claims are released on every exit path.
    #[tracing::instrument(skip(self), fields(%vault), level = tracing::Level::INFO)]
    pub async fn execute(&self, vault: Address) -> Result<RebalanceOutcome, RebalanceError> {
        let Some(_claim) = InProgressGuard::try_claim(vault, Arc::clone(&self.in_progress)) else {
            info!(%vault, "Rebalance already in progress, skipping");
            return Ok(RebalanceOutcome::skipped(
                vault,
                RebalanceReason::AlreadyInProgress,
            ));
        };

        let claimed =
            claims::try_claim(&self.pool, &vault, &self.claim_holder, Utc::now(), CLAIM_TTL)
                .await?;
        if !claimed {
            info!(%vault, "Rebalance claimed by another process, skipping");
            return Ok(RebalanceOutcome::skipped(
                vault,
                RebalanceReason::AlreadyInProgress,
            ));
        }

        let result = self.evaluate_and_send(vault).await;

        if let Err(e) = claims::release(&self.pool, &vault, &self.claim_holder).await {
            warn!(%vault, "Failed to release rebalance claim, it expires in {CLAIM_TTL:?}: {e}");
        }

        result
    }

    async fn evaluate_and_send(&self, vault: Address) -> Result<RebalanceOutcome, RebalanceError> {
        let (mut outcome, strategies, allocations) = match self.evaluate(vault).await? {
            Evaluation::Skip(outcome) => {
                debug!(%vault, reason = ?outcome.reason, "No rebalance executed");
                return Ok(outcome);
            }
            Evaluation::Ready {
                outcome,
                strategies,
                allocations,
            } => (outcome, strategies, allocations),
        };

        let Some(wallet) = &self.wallet else {
            outcome.reason = RebalanceReason::NoSigner;
            return Ok(outcome);
        };

        info!(
            %vault,
            decision_id = ?outcome.decision_id,
            ?strategies,
            ?allocations,
            "Submitting rebalance"
        );

        let tx_hash = wallet
            .send(
                vault,
                rebalance_calldata(strategies, &allocations),
                self.config.gas_limit,
                "rebalance vault",
            )
            .await?;

        info!(%vault, %tx_hash, "Rebalance executed");

        outcome.reason = RebalanceReason::Executed;
        outcome.executed = true;
        outcome.tx_hash = Some(tx_hash);
        Ok(outcome)
    }

    async fn evaluate(&self, vault: Address) -> Result<Evaluation, RebalanceError> {
        let Some(decision) = decisions::latest(&self.pool, &vault).await? else {
            return Ok(Evaluation::Skip(RebalanceOutcome::skipped(
                vault,
                RebalanceReason::NoRecommendation,
            )));
        };

        if self.is_stale(&decision) {
            warn!(
                %vault,
                decision_id = decision.id,
                created_at = %decision.created_at,
                "Latest recommendation is stale"
            );
            let mut outcome =
                RebalanceOutcome::skipped(vault, RebalanceReason::StaleRecommendation);
            outcome.decision_id = Some(decision.id);
            outcome.confidence = Some(decision.confidence);
            return Ok(Evaluation::Skip(outcome));
        }

        let strategies = self.vaults.strategies(vault).await?;
        let current: BTreeMap<Address, u64> = self
            .vaults
            .allocations(vault, &strategies)
            .await?
            .into_iter()
            .collect();

        for strategy in decision.allocations.keys() {
            if !strategies.contains(strategy) {
                warn!(%vault, %strategy, "Recommended strategy is not on the vault, dropping");
            }
        }

        let allocations: Vec<u64> = strategies
            .iter()
            .map(|strategy| decision.allocations.get(strategy).copied().unwrap_or(0))
            .collect();
        let target: BTreeMap<Address, u64> = strategies
            .iter()
            .copied()
            .zip(allocations.iter().copied())
            .collect();

        let outcome = RebalanceOutcome {
            vault,
            reason: RebalanceReason::NoRebalanceNeeded,
            executed: false,
            tx_hash: None,
            decision_id: Some(decision.id),
            confidence: Some(decision.confidence),
            current,
            target,
        };

        if !needs_rebalance(&outcome.current, &outcome.target, self.config.threshold_bp) {
            return Ok(Evaluation::Skip(outcome));
        }

        if decision.confidence <= self.config.min_confidence {
            info!(
                %vault,
                confidence = decision.confidence,
                min_confidence = self.config.min_confidence,
                "Recommendation confidence too low to execute"
            );
            return Ok(Evaluation::Skip(RebalanceOutcome {
                reason: RebalanceReason::InsufficientConfidence,
                ..outcome
            }));
        }

        if self.wallet.is_none() {
            return Ok(Evaluation::Skip(RebalanceOutcome {
                reason: RebalanceReason::NoSigner,
                ..outcome
            }));
        }

        Ok(Evaluation::Ready {
            outcome,
            strategies,
            allocations,
        })
    }

    fn is_stale(&self, decision: &AgentDecision) -> bool {
        Utc::now()
            .signed_duration_since(decision.created_at)
            .to_std()
            .is_ok_and(|age| age > self.config.max_decision_age)
    }
}

#[cfg(test)]
mod tests {
    use alloy::primitives::{U256, address};
    use alloy::sol_types::SolCall;
    use chrono::{DateTime, TimeDelta};
    use proptest::prelude::*;

    use super::*;
    use crate::bindings::IYieldVault;
    use crate::onchain::mock::{MockChainReader, MockWallet};
    use crate::store::decisions::NewAgentDecision;
    use crate::test_utils::{TEST_VAULT, fast_retry_policy, setup_test_db};

    const S1: Address = address!("0x1111111111111111111111111111111111111111");
    const S2: Address = address!("0x2222222222222222222222222222222222222222");
    const S3: Address = address!("0x3333333333333333333333333333333333333333");

    fn bp(entries: &[(Address, u64)]) -> BTreeMap<Address, u64> {
        entries.iter().copied().collect()
    }

    fn chain_at_50_50() -> Arc<MockChainReader> {
        let chain = Arc::new(MockChainReader::new());
        chain.set_strategies(TEST_VAULT, &[S1, S2]);
        chain.set_allocation(TEST_VAULT, S1, 5_000);
        chain.set_allocation(TEST_VAULT, S2, 5_000);
        chain
    }

    async fn record(
        pool: &SqlitePool,
        allocations: &[(Address, u64)],
        confidence: f64,
        created_at: DateTime<Utc>,
    ) -> AgentDecision {
        decisions::insert(
            pool,
            &NewAgentDecision {
                vault: TEST_VAULT,
                chain_id: 146,
                allocations: bp(allocations),
                expected_apy_bp: 800,
                risk_score: 0.3,
                confidence,
                reasoning: "rotate".to_string(),
                market_context: "calm".to_string(),
            },
            created_at,
        )
        .await
        .unwrap()
    }

    async fn rebalancer(
        chain: Arc<MockChainReader>,
        wallet: Option<Arc<MockWallet>>,
    ) -> Rebalancer {
        Rebalancer::new(
            setup_test_db().await,
            VaultReader::new(chain, fast_retry_policy()),
            wallet.map(|wallet| wallet as Arc<dyn Wallet>),
            RebalanceConfig::default(),
        )
    }

    #[test]
    fn threshold_is_exclusive() {
        let current = bp(&[(S1, 5_000), (S2, 5_000)]);

        assert!(!needs_rebalance(&current, &bp(&[(S1, 5_500), (S2, 4_500)]), 500));
        assert!(needs_rebalance(&current, &bp(&[(S1, 5_501), (S2, 4_499)]), 500));
    }

    #[test]
    fn missing_current_allocation_counts_as_zero() {
        let current = bp(&[(S1, 10_000)]);

        assert!(needs_rebalance(&current, &bp(&[(S1, 9_000), (S2, 1_000)]), 500));
        assert!(!needs_rebalance(&current, &bp(&[(S1, 9_600), (S2, 400)]), 500));
    }

    proptest! {
        #[test]
        fn identical_allocations_never_need_rebalance(
            a in 0_u64..=10_000, b in 0_u64..=10_000, threshold in 0_u64..=10_000
        ) {
            let allocations = bp(&[(S1, a), (S2, b)]);
            prop_assert!(!needs_rebalance(&allocations, &allocations, threshold));
        }

        #[test]
        fn any_deviation_above_threshold_triggers(
            current in 0_u64..=10_000, delta in 1_u64..=5_000, threshold in 0_u64..5_000
        ) {
            let target = current.saturating_add(delta);
            let triggered = needs_rebalance(&bp(&[(S1, current)]), &bp(&[(S1, target)]), threshold);
            prop_assert_eq!(triggered, delta > threshold);
        }
    }

    #[tokio::test]
    async fn no_decision_means_no_recommendation() {
        let wallet = Arc::new(MockWallet::new());
        let rebalancer = rebalancer(chain_at_50_50(), Some(wallet.clone())).await;

        let outcome = rebalancer.execute(TEST_VAULT).await.unwrap();

        assert_eq!(outcome.reason, RebalanceReason::NoRecommendation);
        assert!(!outcome.executed);
        assert_eq!(wallet.send_count(), 0);
    }

    #[tokio::test]
    async fn stale_decision_is_ignored() {
        let wallet = Arc::new(MockWallet::new());
        let rebalancer = rebalancer(chain_at_50_50(), Some(wallet.clone())).await;
        let two_days_ago = Utc::now() - TimeDelta::days(2);
        record(&rebalancer.pool, &[(S1, 9_000), (S2, 1_000)], 0.95, two_days_ago).await;

        let outcome = rebalancer.execute(TEST_VAULT).await.unwrap();

        assert_eq!(outcome.reason, RebalanceReason::StaleRecommendation);
        assert_eq!(wallet.send_count(), 0);
    }

    #[tokio::test]
    async fn within_threshold_is_a_no_op() {
        let wallet = Arc::new(MockWallet::new());
        let rebalancer = rebalancer(chain_at_50_50(), Some(wallet.clone())).await;
        record(&rebalancer.pool, &[(S1, 5_500), (S2, 4_500)], 0.95, Utc::now()).await;

        let outcome = rebalancer.execute(TEST_VAULT).await.unwrap();

        assert_eq!(outcome.reason, RebalanceReason::NoRebalanceNeeded);
        assert_eq!(outcome.current, bp(&[(S1, 5_000), (S2, 5_000)]));
        assert_eq!(wallet.send_count(), 0);
    }

    #[tokio::test]
    async fn low_confidence_never_sends() {
        let wallet = Arc::new(MockWallet::new());
        let rebalancer = rebalancer(chain_at_50_50(), Some(wallet.clone())).await;
        record(&rebalancer.pool, &[(S1, 9_000), (S2, 1_000)], 0.69, Utc::now()).await;

        let outcome = rebalancer.execute(TEST_VAULT).await.unwrap();

        assert_eq!(outcome.reason, RebalanceReason::InsufficientConfidence);
        assert_eq!(outcome.target, bp(&[(S1, 9_000), (S2, 1_000)]));
        assert_eq!(wallet.send_count(), 0);
    }

    #[tokio::test]
    async fn confidence_equal_to_minimum_is_insufficient() {
        let wallet = Arc::new(MockWallet::new());
        let rebalancer = rebalancer(chain_at_50_50(), Some(wallet.clone())).await;
        record(&rebalancer.pool, &[(S1, 9_000), (S2, 1_000)], 0.7, Utc::now()).await;

        let outcome = rebalancer.execute(TEST_VAULT).await.unwrap();

        assert_eq!(outcome.reason, RebalanceReason::InsufficientConfidence);
        assert_eq!(wallet.send_count(), 0);
    }

    #[tokio::test]
    async fn missing_signer_surfaces_recommendation_unexecuted() {
        let rebalancer = rebalancer(chain_at_50_50(), None).await;
        let decision =
            record(&rebalancer.pool, &[(S1, 9_000), (S2, 1_000)], 0.9, Utc::now()).await;

        let outcome = rebalancer.execute(TEST_VAULT).await.unwrap();

        assert_eq!(outcome.reason, RebalanceReason::NoSigner);
        assert!(!outcome.executed);
        assert_eq!(outcome.decision_id, Some(decision.id));
    }

    #[tokio::test]
    async fn executes_in_vault_strategy_order() {
        let chain = chain_at_50_50();
        chain.set_strategies(TEST_VAULT, &[S2, S1, S3]);
        let wallet = Arc::new(MockWallet::new());
        let rebalancer = rebalancer(chain, Some(wallet.clone())).await;
        let unknown = address!("0x9999999999999999999999999999999999999999");
        record(
            &rebalancer.pool,
            &[(S1, 8_000), (S2, 1_000), (unknown, 1_000)],
            0.9,
            Utc::now(),
        )
        .await;

        let outcome = rebalancer.execute(TEST_VAULT).await.unwrap();

        assert_eq!(outcome.reason, RebalanceReason::Executed);
        assert!(outcome.executed);
        assert!(outcome.tx_hash.is_some());

        let sent = wallet.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].contract, TEST_VAULT);
        assert_eq!(sent[0].gas_limit, 3_000_000);

        let call = IYieldVault::rebalanceCall::abi_decode(&sent[0].calldata).unwrap();
        assert_eq!(call.strategies, vec![S2, S1, S3]);
        assert_eq!(
            call.allocations,
            vec![U256::from(1_000), U256::from(8_000), U256::ZERO]
        );
    }

    #[tokio::test]
    async fn concurrent_executions_are_single_flight() {
        let wallet = Arc::new(MockWallet::slow(Duration::from_millis(200)));
        let rebalancer = rebalancer(chain_at_50_50(), Some(wallet.clone())).await;
        record(&rebalancer.pool, &[(S1, 9_000), (S2, 1_000)], 0.9, Utc::now()).await;

        let (first, second) = tokio::join!(
            rebalancer.execute(TEST_VAULT),
            rebalancer.execute(TEST_VAULT)
        );

        let mut reasons = [first.unwrap().reason, second.unwrap().reason];
        reasons.sort_by_key(|reason| *reason == RebalanceReason::Executed);
        assert_eq!(
            reasons,
            [RebalanceReason::AlreadyInProgress, RebalanceReason::Executed]
        );
        assert_eq!(wallet.send_count(), 1);

        let third = rebalancer.execute(TEST_VAULT).await.unwrap();
        assert_eq!(third.reason, RebalanceReason::Executed);
    }

    #[tokio::test]
    async fn separate_rebalancers_on_one_database_do_not_race() {
        let wallet = Arc::new(MockWallet::slow(Duration::from_millis(200)));
        let scheduled = rebalancer(chain_at_50_50(), Some(wallet.clone())).await;
        let manual = Rebalancer::new(
            scheduled.pool.clone(),
            VaultReader::new(chain_at_50_50(), fast_retry_policy()),
            Some(wallet.clone() as Arc<dyn Wallet>),
            RebalanceConfig::default(),
        );
        record(&scheduled.pool, &[(S1, 9_000), (S2, 1_000)], 0.9, Utc::now()).await;

        let (first, second) =
            tokio::join!(scheduled.execute(TEST_VAULT), manual.execute(TEST_VAULT));

        let mut reasons = [first.unwrap().reason, second.unwrap().reason];
        reasons.sort_by_key(|reason| *reason == RebalanceReason::Executed);
        assert_eq!(
            reasons,
            [RebalanceReason::AlreadyInProgress, RebalanceReason::Executed]
        );
        assert_eq!(wallet.send_count(), 1);

        let after = manual.execute(TEST_VAULT).await.unwrap();
        assert_eq!(after.reason, RebalanceReason::Executed);
    }

    #[tokio::test]
    async fn failed_send_releases_the_claim() {
        let wallet = Arc::new(MockWallet::failing());
        let rebalancer = rebalancer(chain_at_50_50(), Some(wallet.clone())).await;
        record(&rebalancer.pool, &[(S1, 9_000), (S2, 1_000)], 0.9, Utc::now()).await;

        let error = rebalancer.execute(TEST_VAULT).await.unwrap_err();
        assert!(matches!(error, RebalanceError::Wallet(WalletError::Reverted { .. })));

        let retry = rebalancer.execute(TEST_VAULT).await.unwrap_err();
        assert!(matches!(retry, RebalanceError::Wallet(_)));
        assert_eq!(wallet.send_count(), 2);
    }

    #[tokio::test]
    async fn preview_never_sends() {
        let wallet = Arc::new(MockWallet::new());
        let rebalancer = rebalancer(chain_at_50_50(), Some(wallet.clone())).await;
        record(&rebalancer.pool, &[(S1, 9_000), (S2, 1_000)], 0.9, Utc::now()).await;

        let outcome = rebalancer.preview(TEST_VAULT).await.unwrap();

        assert_eq!(outcome.reason, RebalanceReason::ReadyToExecute);
        assert!(!outcome.executed);
        assert_eq!(wallet.send_count(), 0);
    }
}
