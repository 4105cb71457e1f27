use leadership_league::cli;
use leadership_league::env::setup_tracing;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv_override().ok();
    let (env, command) = cli::CliEnv::parse_and_convert()?;
    let _telemetry_guard = setup_tracing(&env);

    cli::run_command(env, command).await?;
    Ok(())
}
