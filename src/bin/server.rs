use clap::Parser;
use leadership_league::env::{Env, setup_tracing};
use leadership_league::launch;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv_override().ok();
    let env = Env::try_parse()?;
    let _telemetry_guard = setup_tracing(&env);

    launch(env).await
}
