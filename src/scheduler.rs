//! Periodic driver: for each configured vault, ask the Decision Engine for a
//! fresh recommendation and hand it to the Rebalancer.
//!
//! Vaults are processed serially with a fixed delay between them to stay
//! under the RPC provider's rate limits. A failure for one vault is logged
//! and the cycle moves on to the next.

use alloy::primitives::Address;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::agent::DecisionEngine;
use crate::rebalancing::{RebalanceReason, Rebalancer};

const COMMAND_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct SchedulerConfig {
    pub(crate) enabled: Option<bool>,
    pub(crate) interval_secs: Option<u64>,
    pub(crate) inter_vault_delay_secs: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerSettings {
    /// A disabled scheduler starts paused; `resume` and `trigger_now`
    /// still work.
    pub enabled: bool,
    pub interval: Duration,
    pub inter_vault_delay: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(3_600),
            inter_vault_delay: Duration::from_secs(5),
        }
    }
}

impl From<SchedulerConfig> for SchedulerSettings {
    fn from(config: SchedulerConfig) -> Self {
        let defaults = Self::default();

        Self {
            enabled: config.enabled.unwrap_or(defaults.enabled),
            interval: config
                .interval_secs
                .map_or(defaults.interval, Duration::from_secs),
            inter_vault_delay: config
                .inter_vault_delay_secs
                .map_or(defaults.inter_vault_delay, Duration::from_secs),
        }
    }
}

/// Tally of one pass over every vault.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleSummary {
    pub vaults: usize,
    pub decisions: usize,
    pub rebalances_executed: usize,
    pub failures: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStatus {
    pub paused: bool,
    pub running: bool,
    pub cycles_completed: u64,
    pub last_cycle_started_at: Option<DateTime<Utc>>,
    pub last_cycle_finished_at: Option<DateTime<Utc>>,
    pub last_cycle: Option<CycleSummary>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Pause,
    Resume,
    TriggerNow,
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("scheduler has stopped")]
    Stopped,
}

/// Control surface for a running [`Scheduler`]. Cheap to clone.
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<SchedulerStatus>,
}

impl SchedulerHandle {
    /// Skips scheduled cycles until resumed. A cycle already running
    /// finishes.
    pub async fn pause(&self) -> Result<(), SchedulerError> {
        self.send(Command::Pause).await
    }

    pub async fn resume(&self) -> Result<(), SchedulerError> {
        self.send(Command::Resume).await
    }

    /// Queues one cycle to run as soon as the current one (if any) ends,
    /// whether or not the scheduler is paused.
    pub async fn trigger_now(&self) -> Result<(), SchedulerError> {
        self.send(Command::TriggerNow).await
    }

    pub fn status(&self) -> SchedulerStatus {
        self.status.borrow().clone()
    }

    /// Resolves once at least `cycles` cycles have completed.
    pub async fn wait_for_cycles(&self, cycles: u64) -> Result<SchedulerStatus, SchedulerError> {
        let mut status = self.status.clone();
        let reached = status
            .wait_for(|status| status.cycles_completed >= cycles)
            .await
            .map_err(|_| SchedulerError::Stopped)?;

        Ok(reached.clone())
    }

    async fn send(&self, command: Command) -> Result<(), SchedulerError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SchedulerError::Stopped)
    }
}

pub struct Scheduler {
    vaults: Vec<Address>,
    engine: DecisionEngine,
    rebalancer: Rebalancer,
    settings: SchedulerSettings,
    commands: mpsc::Receiver<Command>,
    status: watch::Sender<SchedulerStatus>,
}

impl Scheduler {
    pub fn new(
        vaults: Vec<Address>,
        engine: DecisionEngine,
        rebalancer: Rebalancer,
        settings: SchedulerSettings,
    ) -> (Self, SchedulerHandle) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (status_tx, status_rx) = watch::channel(SchedulerStatus {
            paused: !settings.enabled,
            ..SchedulerStatus::default()
        });

        let scheduler = Self {
            vaults,
            engine,
            rebalancer,
            settings,
            commands: command_rx,
            status: status_tx,
        };

        let handle = SchedulerHandle {
            commands: command_tx,
            status: status_rx,
        };

        (scheduler, handle)
    }

    /// Runs until every [`SchedulerHandle`] has been dropped. The first
    /// scheduled cycle fires one full interval after start, giving the
    /// indexer time to backfill.
    #[tracing::instrument(skip(self), fields(vaults = self.vaults.len()), level = tracing::Level::INFO)]
    pub async fn run(mut self) {
        let mut interval = tokio::time::interval_at(
            Instant::now() + self.settings.interval,
            self.settings.interval,
        );
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            interval = ?self.settings.interval,
            paused = self.status.borrow().paused,
            "Scheduler started"
        );

        loop {
            tokio::select! {
                biased;

                command = self.commands.recv() => {
                    let Some(command) = command else {
                        info!("All scheduler handles dropped, stopping");
                        return;
                    };

                    self.handle(command).await;
                }

                _ = interval.tick() => {
                    if self.status.borrow().paused {
                        debug!("Scheduler paused, skipping cycle");
                    } else {
                        self.run_cycle().await;
                    }
                }
            }
        }
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Pause => {
                info!("Scheduler paused");
                self.status.send_modify(|status| status.paused = true);
            }
            Command::Resume => {
                info!("Scheduler resumed");
                self.status.send_modify(|status| status.paused = false);
            }
            Command::TriggerNow => {
                info!("Manual cycle triggered");
                self.run_cycle().await;
            }
        }
    }

    async fn run_cycle(&self) {
        let started_at = Utc::now();
        self.status.send_modify(|status| {
            status.running = true;
            status.last_cycle_started_at = Some(started_at);
        });

        let mut summary = CycleSummary {
            vaults: self.vaults.len(),
            ..CycleSummary::default()
        };

        for (position, vault) in self.vaults.iter().enumerate() {
            if position > 0 && !self.settings.inter_vault_delay.is_zero() {
                tokio::time::sleep(self.settings.inter_vault_delay).await;
            }

            self.process_vault(*vault, &mut summary).await;
        }

        info!(
            vaults = summary.vaults,
            decisions = summary.decisions,
            rebalances_executed = summary.rebalances_executed,
            failures = summary.failures,
            "Scheduler cycle complete"
        );

        let finished_at = Utc::now();
        self.status.send_modify(|status| {
            status.running = false;
            status.cycles_completed += 1;
            status.last_cycle_finished_at = Some(finished_at);
            status.last_cycle = Some(summary);
        });
    }

    async fn process_vault(&self, vault: Address, summary: &mut CycleSummary) {
        let decision = match self.engine.decide(vault).await {
            Ok(decision) => decision,
            Err(error) => {
                error!(%vault, %error, "Decision failed, skipping vault this cycle");
                summary.failures += 1;
                return;
            }
        };

        summary.decisions += 1;
        debug!(%vault, decision_id = decision.id, confidence = decision.confidence, "Decision recorded");

        match self.rebalancer.execute(vault).await {
            Ok(outcome) if outcome.executed => {
                summary.rebalances_executed += 1;
                info!(%vault, tx_hash = ?outcome.tx_hash, "Scheduled rebalance executed");
            }
            Ok(outcome) if outcome.reason == RebalanceReason::NoSigner => {
                warn!(%vault, "Rebalance recommended but no signer is configured");
            }
            Ok(outcome) => {
                debug!(%vault, reason = ?outcome.reason, "No rebalance this cycle");
            }
            Err(error) => {
                error!(%vault, %error, "Rebalance failed");
                summary.failures += 1;
            }
        }
    }
}
