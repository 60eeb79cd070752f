use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};
use url::Url;

use kraken::admin::AdminHandler;
use kraken::beachplug;
use kraken::config::Config;
use kraken::events::EventBus;
use kraken::fileserver::Registry;
use kraken::server::ServerPool;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("kraken=debug".parse().context("valid log directive")?),
        )
        .init();

    let config = Config::from_env()?;

    // Register the file-server backends.
    let mut registry = Registry::new();
    registry.register("beachplug", beachplug::constructor())?;

    // Run the pool's start-channel consumer for the lifetime of the process.
    let pool = Arc::new(ServerPool::new(Arc::new(registry)));
    {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.listen().await });
    }

    let bus = EventBus::start();

    let listener = TcpListener::bind(&config.addr)
        .await
        .with_context(|| format!("failed to bind admin address {}", config.addr))?;
    let local_addr = listener.local_addr()?;
    let base_url = match config.base_url {
        Some(url) => url,
        None => Url::parse(&format!("http://{}", local_addr))?,
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handler = AdminHandler::new(pool, bus, base_url.clone());

    info!(addr = %local_addr, "listening");
    info!(url = %base_url, "admin API available");

    let admin_handle = tokio::spawn(async move {
        if let Err(e) = handler.run(listener, shutdown_rx).await {
            error!(error = %e, "admin server error");
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("received ctrl-c, shutting down");
    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(5), admin_handle).await;

    info!("shutdown complete");
    Ok(())
}
