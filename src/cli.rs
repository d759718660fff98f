//! Operator commands run against the same config and database as the server.

use clap::{Parser, Subcommand};
use serde::Serialize;
use std::io::Write;
use tracing::info;

use crate::Keeper;
use crate::config::{Ctx, Env};
use crate::service::{ApiResponse, VaultService};
use crate::store::Page;

#[derive(Debug, Parser)]
#[command(name = "vault-keeper-cli")]
#[command(about = "Inspect and operate yield vaults managed by vault-keeper")]
#[command(version)]
pub struct CliEnv {
    #[clap(flatten)]
    env: Env,
    #[command(subcommand)]
    pub command: Commands,
}

impl CliEnv {
    /// Parse CLI arguments and load the config and secrets they point to.
    pub fn parse_and_convert() -> anyhow::Result<(Ctx, Commands)> {
        let cli_env = Self::parse();
        let ctx = Ctx::load_files(&cli_env.env.config, &cli_env.env.secrets)?;
        Ok((ctx, cli_env.command))
    }
}

#[derive(Debug, Clone, clap::Args)]
pub struct VaultArg {
    /// Vault contract address
    #[arg(long)]
    pub vault: String,
}

#[derive(Debug, Clone, clap::Args)]
pub struct PageArgs {
    /// Maximum rows to return (default 20, max 100)
    #[arg(long)]
    pub limit: Option<u32>,
    /// Rows to skip
    #[arg(long)]
    pub offset: Option<u32>,
}

impl From<&PageArgs> for Page {
    fn from(args: &PageArgs) -> Self {
        Self::new(args.limit, args.offset)
    }
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Latest stored vault metrics snapshot
    Metrics(VaultArg),
    /// Strategy composition, classification and risk scores
    Analyze(VaultArg),
    /// Request and record a new allocation decision
    Decide(VaultArg),
    /// Show what a rebalance would do without sending a transaction
    Preview(VaultArg),
    /// Rebalance the vault if the latest decision warrants it
    Rebalance(VaultArg),
    /// Most recent recorded allocation decision
    LatestDecision(VaultArg),
    /// Recorded allocation decisions, newest first
    Decisions {
        #[clap(flatten)]
        vault: VaultArg,
        #[clap(flatten)]
        page: PageArgs,
    },
    /// Deposits and withdrawals, newest first
    Flows {
        #[clap(flatten)]
        vault: VaultArg,
        /// Only `deposit` or only `withdrawal`
        #[arg(long)]
        kind: Option<String>,
        #[clap(flatten)]
        page: PageArgs,
    },
    /// Rebalances the vault emitted, newest first
    Rebalances {
        #[clap(flatten)]
        vault: VaultArg,
        #[clap(flatten)]
        page: PageArgs,
    },
    /// Yield harvests, newest first
    Harvests {
        #[clap(flatten)]
        vault: VaultArg,
        #[clap(flatten)]
        page: PageArgs,
    },
    /// Strategy deposits, withdrawals and allocation changes, newest first
    StrategyEvents {
        #[clap(flatten)]
        vault: VaultArg,
        /// Only `deposit`, `withdrawal` or `allocation_updated`
        #[arg(long = "type")]
        event_type: Option<String>,
        #[clap(flatten)]
        page: PageArgs,
    },
}

pub async fn run_command(ctx: Ctx, command: Commands) -> anyhow::Result<()> {
    let keeper = Keeper::connect(&ctx).await?;
    let service = keeper.service(&ctx, None);

    let succeeded = run_command_with_writers(
        &service,
        &ctx.operator_api_key,
        command,
        &mut std::io::stdout(),
    )
    .await?;

    anyhow::ensure!(succeeded, "command failed");
    Ok(())
}

/// Runs one command and prints its response envelope as JSON. Returns the
/// envelope's `success` flag.
async fn run_command_with_writers<W: Write>(
    service: &VaultService,
    operator_api_key: &str,
    command: Commands,
    stdout: &mut W,
) -> anyhow::Result<bool> {
    let credential = Some(operator_api_key);

    match command {
        Commands::Metrics(VaultArg { vault }) => print(stdout, &service.metrics(&vault).await),
        Commands::Analyze(VaultArg { vault }) => {
            print(stdout, &service.strategy_analysis(&vault).await)
        }
        Commands::Decide(VaultArg { vault }) => {
            info!(%vault, "Requesting allocation decision");
            print(stdout, &service.request_decision(credential, &vault).await)
        }
        Commands::Preview(VaultArg { vault }) => {
            print(stdout, &service.rebalance_recommendation(&vault).await)
        }
        Commands::Rebalance(VaultArg { vault }) => {
            info!(%vault, "Executing rebalance");
            print(stdout, &service.execute_rebalance(credential, &vault).await)
        }
        Commands::LatestDecision(VaultArg { vault }) => {
            print(stdout, &service.latest_decision(&vault).await)
        }
        Commands::Decisions { vault, page } => print(
            stdout,
            &service.list_decisions(&vault.vault, Page::from(&page)).await,
        ),
        Commands::Flows { vault, kind, page } => print(
            stdout,
            &service
                .list_flows(&vault.vault, kind.as_deref(), Page::from(&page))
                .await,
        ),
        Commands::Rebalances { vault, page } => print(
            stdout,
            &service.list_rebalances(&vault.vault, Page::from(&page)).await,
        ),
        Commands::Harvests { vault, page } => print(
            stdout,
            &service.list_harvests(&vault.vault, Page::from(&page)).await,
        ),
        Commands::StrategyEvents {
            vault,
            event_type,
            page,
        } => print(
            stdout,
            &service
                .list_strategy_events(&vault.vault, event_type.as_deref(), Page::from(&page))
                .await,
        ),
    }
}

fn print<W: Write, T: Serialize>(stdout: &mut W, response: &ApiResponse<T>) -> anyhow::Result<bool> {
    serde_json::to_writer_pretty(&mut *stdout, response)?;
    writeln!(stdout)?;
    Ok(response.success)
}
