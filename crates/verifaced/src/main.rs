use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use verifaced::challenge::ChallengeRegistry;
use verifaced::config::Config;
use verifaced::store::AuthStore;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("verifaced starting");

    let config = Config::from_env();
    let store = AuthStore::open(&config.db_path)
        .await
        .with_context(|| format!("opening database at {}", config.db_path.display()))?;
    tracing::info!(db = %config.db_path.display(), users = store.count_users().await?, "database open");

    let challenges = Arc::new(ChallengeRegistry::new(Duration::from_secs(
        config.challenge_ttl_secs,
    )));

    // Expired challenges are also rejected lazily on take; the sweep just
    // keeps the registry from accumulating abandoned attempts.
    let sweeper = Arc::clone(&challenges);
    let sweep_every = Duration::from_secs(config.sweep_interval_secs);
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(sweep_every);
        loop {
            tick.tick().await;
            let removed = sweeper.sweep();
            if removed > 0 {
                tracing::debug!(removed, "swept expired challenges");
            }
        }
    });

    tracing::info!("verifaced ready");

    // Keep running until signaled
    tokio::signal::ctrl_c().await?;
    tracing::info!("verifaced shutting down");

    Ok(())
}
