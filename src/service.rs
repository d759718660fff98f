//! Read and write operations exposed to the API and CLI layers.
//!
//! Every operation returns an [`ApiResponse`] envelope. Errors are reduced to
//! a fixed public message; the underlying error is logged, never returned.

use alloy::primitives::Address;
use serde::Serialize;
use sqlx::SqlitePool;
use std::collections::HashSet;
use std::fmt::Debug;
use tracing::{error, info, warn};

use crate::agent::{DecisionEngine, DecisionError, VaultAnalysis};
use crate::event::StrategyEventType;
use crate::onchain::ChainError;
use crate::rebalancing::{RebalanceError, RebalanceOutcome, Rebalancer};
use crate::scheduler::{SchedulerError, SchedulerHandle, SchedulerStatus};
use crate::store::{
    AgentDecision, FlowKind, FlowRecord, HarvestRecord, Page, RebalanceRecord, StoreError,
    StrategyEventRecord, VaultMetrics, decisions, logs, metrics,
};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(error: &ServiceError) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.public_message().to_string()),
        }
    }
}

impl<T> From<Result<T, ServiceError>> for ApiResponse<T> {
    fn from(result: Result<T, ServiceError>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(service_error) => {
                if service_error.is_internal() {
                    error!(error = %service_error, "Service operation failed");
                } else {
                    warn!(error = %service_error, "Service request rejected");
                }
                Self::err(&service_error)
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("missing or invalid operator credential")]
    Unauthorized,
    #[error("invalid vault address {0:?}")]
    InvalidVault(String),
    #[error("vault {0} is not configured")]
    UnknownVault(Address),
    #[error("invalid type filter {0:?}")]
    InvalidFilter(String),
    #[error("vault {0} has no strategies")]
    NoStrategies(Address),
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("decision failed: {0}")]
    Decision(#[source] DecisionError),
    #[error("rebalance transaction failed: {0}")]
    Transaction(#[source] RebalanceError),
    #[error("scheduler is not configured")]
    SchedulerDisabled,
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

impl ServiceError {
    /// Message safe to hand to external callers.
    pub const fn public_message(&self) -> &'static str {
        match self {
            Self::Unauthorized => "Unauthorized",
            Self::InvalidVault(_) => "Invalid vault address",
            Self::UnknownVault(_) => "Vault not found",
            Self::InvalidFilter(_) => "Invalid type filter",
            Self::NoStrategies(_) => "Vault has no strategies",
            Self::Chain(_) => "Chain data temporarily unavailable",
            Self::Decision(_) => "Decision unavailable",
            Self::Transaction(_) => "Rebalance transaction failed",
            Self::SchedulerDisabled | Self::Scheduler(_) => "Scheduler unavailable",
            Self::Store(_) => "Internal error",
        }
    }

    const fn is_internal(&self) -> bool {
        matches!(
            self,
            Self::Chain(_) | Self::Store(_) | Self::Decision(_) | Self::Transaction(_)
        )
    }
}

impl From<DecisionError> for ServiceError {
    fn from(error: DecisionError) -> Self {
        match error {
            DecisionError::Chain(error) => Self::Chain(error),
            DecisionError::Store(error) => Self::Store(error),
            DecisionError::NoStrategies(vault) => Self::NoStrategies(vault),
            other => Self::Decision(other),
        }
    }
}

impl From<RebalanceError> for ServiceError {
    fn from(error: RebalanceError) -> Self {
        match error {
            RebalanceError::Chain(error) => Self::Chain(error),
            RebalanceError::Store(error) => Self::Store(error),
            other @ RebalanceError::Wallet(_) => Self::Transaction(other),
        }
    }
}

/// Compares without short-circuiting on the first differing byte. Length
/// differences still return early; the key length is not secret.
fn credentials_match(expected: &str, provided: &str) -> bool {
    let expected = expected.as_bytes();
    let provided = provided.as_bytes();

    if expected.len() != provided.len() {
        return false;
    }

    expected
        .iter()
        .zip(provided)
        .fold(0_u8, |diff, (a, b)| diff | (a ^ b))
        == 0
}

#[derive(Clone)]
pub struct VaultService {
    pool: SqlitePool,
    vaults: HashSet<Address>,
    engine: DecisionEngine,
    rebalancer: Rebalancer,
    scheduler: Option<SchedulerHandle>,
    operator_api_key: String,
}

impl Debug for VaultService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultService")
            .field("vaults", &self.vaults)
            .field("scheduler", &self.scheduler.is_some())
            .field("operator_api_key", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

impl VaultService {
    pub fn new(
        pool: SqlitePool,
        vaults: impl IntoIterator<Item = Address>,
        engine: DecisionEngine,
        rebalancer: Rebalancer,
        scheduler: Option<SchedulerHandle>,
        operator_api_key: String,
    ) -> Self {
        Self {
            pool,
            vaults: vaults.into_iter().collect(),
            engine,
            rebalancer,
            scheduler,
            operator_api_key,
        }
    }

    fn vault(&self, raw: &str) -> Result<Address, ServiceError> {
        let vault: Address = raw
            .trim()
            .parse()
            .map_err(|_| ServiceError::InvalidVault(raw.to_string()))?;

        if !self.vaults.contains(&vault) {
            return Err(ServiceError::UnknownVault(vault));
        }

        Ok(vault)
    }

    fn authorize(&self, credential: Option<&str>) -> Result<(), ServiceError> {
        match credential {
            Some(provided) if credentials_match(&self.operator_api_key, provided) => Ok(()),
            _ => Err(ServiceError::Unauthorized),
        }
    }

    fn scheduler(&self) -> Result<&SchedulerHandle, ServiceError> {
        self.scheduler.as_ref().ok_or(ServiceError::SchedulerDisabled)
    }

    /// Latest stored snapshot; `None` until the indexer has refreshed it once.
    pub async fn metrics(&self, vault: &str) -> ApiResponse<Option<VaultMetrics>> {
        async {
            let vault = self.vault(vault)?;
            Ok::<_, ServiceError>(metrics::get(&self.pool, &vault).await?)
        }
        .await
        .into()
    }

    pub async fn latest_decision(&self, vault: &str) -> ApiResponse<Option<AgentDecision>> {
        async {
            let vault = self.vault(vault)?;
            Ok::<_, ServiceError>(decisions::latest(&self.pool, &vault).await?)
        }
        .await
        .into()
    }

    /// What a rebalance would do right now, without sending anything.
    pub async fn rebalance_recommendation(&self, vault: &str) -> ApiResponse<RebalanceOutcome> {
        async {
            let vault = self.vault(vault)?;
            Ok::<_, ServiceError>(self.rebalancer.preview(vault).await?)
        }
        .await
        .into()
    }

    pub async fn strategy_analysis(&self, vault: &str) -> ApiResponse<VaultAnalysis> {
        async {
            let vault = self.vault(vault)?;
            Ok::<_, ServiceError>(self.engine.analyze(vault).await?)
        }
        .await
        .into()
    }

    pub async fn list_decisions(&self, vault: &str, page: Page) -> ApiResponse<Vec<AgentDecision>> {
        async {
            let vault = self.vault(vault)?;
            Ok::<_, ServiceError>(decisions::list(&self.pool, &vault, page).await?)
        }
        .await
        .into()
    }

    /// `kind` is `deposit` or `withdrawal`.
    pub async fn list_flows(
        &self,
        vault: &str,
        kind: Option<&str>,
        page: Page,
    ) -> ApiResponse<Vec<FlowRecord>> {
        async {
            let vault = self.vault(vault)?;
            let kind = kind
                .map(|kind| kind.parse::<FlowKind>())
                .transpose()
                .map_err(|_| ServiceError::InvalidFilter(kind.unwrap_or_default().to_string()))?;

            Ok::<_, ServiceError>(logs::list_flows(&self.pool, &vault, kind, page).await?)
        }
        .await
        .into()
    }

    pub async fn list_rebalances(
        &self,
        vault: &str,
        page: Page,
    ) -> ApiResponse<Vec<RebalanceRecord>> {
        async {
            let vault = self.vault(vault)?;
            Ok::<_, ServiceError>(logs::list_rebalances(&self.pool, &vault, page).await?)
        }
        .await
        .into()
    }

    pub async fn list_harvests(&self, vault: &str, page: Page) -> ApiResponse<Vec<HarvestRecord>> {
        async {
            let vault = self.vault(vault)?;
            Ok::<_, ServiceError>(logs::list_harvests(&self.pool, &vault, page).await?)
        }
        .await
        .into()
    }

    /// `event_type` is `deposit`, `withdrawal` or `allocation_updated`.
    pub async fn list_strategy_events(
        &self,
        vault: &str,
        event_type: Option<&str>,
        page: Page,
    ) -> ApiResponse<Vec<StrategyEventRecord>> {
        async {
            let vault = self.vault(vault)?;
            let event_type = event_type
                .map(|event_type| event_type.parse::<StrategyEventType>())
                .transpose()
                .map_err(|_| {
                    ServiceError::InvalidFilter(event_type.unwrap_or_default().to_string())
                })?;

            let events = logs::list_strategy_events(&self.pool, &vault, event_type, page).await?;
            Ok::<_, ServiceError>(events)
        }
        .await
        .into()
    }

    /// Asks the Decision Engine for a fresh recommendation. Operator only,
    /// since every call spends a reasoning request.
    pub async fn request_decision(
        &self,
        credential: Option<&str>,
        vault: &str,
    ) -> ApiResponse<AgentDecision> {
        async {
            self.authorize(credential)?;
            let vault = self.vault(vault)?;
            Ok::<_, ServiceError>(self.engine.decide(vault).await?)
        }
        .await
        .into()
    }

    /// Safe to call when nothing needs doing: the outcome carries the reason
    /// no transaction was sent.
    pub async fn execute_rebalance(
        &self,
        credential: Option<&str>,
        vault: &str,
    ) -> ApiResponse<RebalanceOutcome> {
        async {
            self.authorize(credential)?;
            let vault = self.vault(vault)?;
            let outcome = self.rebalancer.execute(vault).await?;
            info!(%vault, reason = ?outcome.reason, executed = outcome.executed, "Operator rebalance");
            Ok::<_, ServiceError>(outcome)
        }
        .await
        .into()
    }

    pub async fn scheduler_status(&self, credential: Option<&str>) -> ApiResponse<SchedulerStatus> {
        async {
            self.authorize(credential)?;
            Ok::<_, ServiceError>(self.scheduler()?.status())
        }
        .await
        .into()
    }

    pub async fn pause_scheduler(&self, credential: Option<&str>) -> ApiResponse<SchedulerStatus> {
        async {
            self.authorize(credential)?;
            let scheduler = self.scheduler()?;
            scheduler.pause().await?;
            Ok::<_, ServiceError>(scheduler.status())
        }
        .await
        .into()
    }

    pub async fn resume_scheduler(&self, credential: Option<&str>) -> ApiResponse<SchedulerStatus> {
        async {
            self.authorize(credential)?;
            let scheduler = self.scheduler()?;
            scheduler.resume().await?;
            Ok::<_, ServiceError>(scheduler.status())
        }
        .await
        .into()
    }

    /// Queues a cycle; returns before it runs.
    pub async fn trigger_scheduler(&self, credential: Option<&str>) -> ApiResponse<SchedulerStatus> {
        async {
            self.authorize(credential)?;
            let scheduler = self.scheduler()?;
            scheduler.trigger_now().await?;
            Ok::<_, ServiceError>(scheduler.status())
        }
        .await
        .into()
    }
}
