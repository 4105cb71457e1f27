use rocket::Config;
use tokio::sync::watch;
use tracing::{error, info};

pub mod accounts;
pub mod activities;
pub mod admins;
pub mod api;
pub mod cli;
pub mod crypto;
pub mod env;
pub mod error;
pub mod export;
pub mod leagues;
mod lock;
pub mod money;
pub mod payments;
pub mod ranking;
pub mod referrals;
pub mod settings;
pub mod snapshots;
pub mod sync;
pub mod telemetry;
pub mod users;
pub mod webhook;

#[cfg(test)]
pub mod test_utils;

pub use crate::env::{Env, LogLevel, setup_tracing};
pub use crate::error::LeagueError;

use crate::api::AppState;
use crate::sync::SyncScheduler;

/// Runs the HTTP API and the snapshot sync scheduler until either stops or
/// the process receives ctrl-c.
pub async fn launch(env: Env) -> anyhow::Result<()> {
    let pool = env.get_sqlite_pool().await?;

    sqlx::migrate!().run(&pool).await?;

    let state = AppState::from_env(&env)?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let scheduler = SyncScheduler::new(
        state.sync_config.clone(),
        pool.clone(),
        state.broker.clone(),
        shutdown_rx,
    );
    let scheduler_task = tokio::spawn(scheduler.run());

    let config = Config::figment()
        .merge(("port", env.server_port))
        .merge(("address", "0.0.0.0"));

    let rocket = api::mount(rocket::custom(config), pool, state);
    let server_task = tokio::spawn(rocket.launch());

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal, shutting down gracefully...");
        }

        result = server_task => {
            match result {
                Ok(Ok(_)) => info!("Server completed successfully"),
                Ok(Err(e)) => error!("Server failed: {e}"),
                Err(e) => error!("Server task panicked: {e}"),
            }
        }
    }

    if shutdown_tx.send(true).is_err() {
        error!("Snapshot sync scheduler already stopped");
    }

    if let Err(e) = scheduler_task.await {
        error!("Snapshot sync scheduler panicked: {e}");
    }

    info!("Shutdown complete");
    Ok(())
}
