//! Command-line interface for inspecting and operating managed vaults.

use vault_keeper::cli;
use vault_keeper::setup_tracing;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let (ctx, command) = cli::CliEnv::parse_and_convert()?;
    setup_tracing(ctx.log_level);

    cli::run_command(ctx, command).await?;
    Ok(())
}
