use clap::Parser;
use vault_keeper::{Ctx, Env, launch, setup_tracing};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let parsed_env = Env::parse();
    let ctx = Ctx::load_files(&parsed_env.config, &parsed_env.secrets)?;
    setup_tracing(ctx.log_level);

    launch(ctx).await
}
