use std::sync::Arc;

use anyhow::Context;

use staybase_auth::InvitationService;
use staybase_infra::{InvitationSweeper, PostgresAuthorizationStore, StaybaseConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = StaybaseConfig::from_env().context("invalid configuration")?;
    staybase_observability::init_with(&config.observability());

    anyhow::ensure!(
        config.use_persistent_stores,
        "the invitation sweeper needs USE_PERSISTENT_STORES=true"
    );
    let database_url = config
        .database_url
        .as_deref()
        .context("DATABASE_URL must be set for the invitation sweeper")?;
    let policy = config.invitation_policy().context("invalid invitation ttl")?;

    let store = PostgresAuthorizationStore::connect(database_url, config.max_connections)
        .await
        .context("failed to connect to Postgres")?;
    store
        .ensure_schema()
        .await
        .context("failed to apply authorization schema")?;

    let service = InvitationService::new(Arc::new(store), policy);
    let handle = InvitationSweeper::spawn(service, config.sweep_interval);

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown requested");

    let expired = handle.shutdown().await;
    tracing::info!(expired, "invitation sweeper exited");
    Ok(())
}
