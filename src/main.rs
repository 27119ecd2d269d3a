//! bookdelta daemon
//!
//! Composition root: loads configuration, initializes logging, opens the
//! task store, connects the DevTools driver and runs the scheduling engine
//! until a shutdown signal arrives. The pool and service are constructed
//! here and dependency-injected; there is no global singleton.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use bookdelta::application::{CrawlService, SessionPool};
use bookdelta::domain::clock::{Clock, SystemClock};
use bookdelta::domain::collaborators::CrawlerRegistry;
use bookdelta::infrastructure::{
    CdpDriver, ConfigManager, DatabaseConnection, SqliteTaskStore, init_logging,
};

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(ConfigManager::default_path);
    let manager = ConfigManager::new(config_path);
    let config = manager.load_or_default().await?;

    init_logging(&config.logging)?;
    info!("bookdelta starting");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let db = DatabaseConnection::new(&config.database.url)
        .await
        .with_context(|| format!("failed to open database {}", config.database.url))?;
    let store = Arc::new(SqliteTaskStore::new(db.pool().clone(), Arc::clone(&clock)));
    store.migrate().await.context("task store migration failed")?;

    let driver = Arc::new(CdpDriver::new(&config.driver)?);
    match driver.version().await {
        Ok(version) => info!(
            browser = %version["Browser"].as_str().unwrap_or("unknown"),
            "connected to DevTools endpoint"
        ),
        Err(error) => warn!(
            %error,
            endpoint = %config.driver.debug_endpoint,
            "DevTools endpoint not reachable yet; sessions will be created once it is"
        ),
    }

    let pool = SessionPool::new(
        driver,
        Arc::clone(&clock),
        config.pool.clone(),
        config.rate.clone(),
    );
    pool.warm_up().await;

    // Site crawlers are linked in by the embedding application; with an
    // empty registry the engine still schedules and reports, and tasks for
    // unregistered sites fail with a descriptive message.
    let crawlers = Arc::new(CrawlerRegistry::new());
    if crawlers.sites().is_empty() {
        warn!("no site crawlers registered");
    }

    let service = CrawlService::start(pool, store, crawlers, config.scheduler.clone(), clock);
    info!("bookdelta ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown signal received");
    service.shutdown().await;
    info!("bookdelta stopped");
    Ok(())
}
