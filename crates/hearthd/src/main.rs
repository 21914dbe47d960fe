use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use hearthd::Config;
use hearthd::Runtime;
use hearthd::api;
use hearthd::integrations::RestSource;
use hearthd_coordinator::CoordinatorUpdate;
use hearthd_coordinator::UpdateCoordinator;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug, Parser)]
#[command(version, about = "Polls configured devices and serves their state")]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "hearthd.toml")]
    config: PathBuf,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = Config::from_file(&args.config)?;
    if args.check {
        println!(
            "{}: ok ({} entries, {} enabled)",
            args.config.display(),
            config.entries.len(),
            config.enabled_entries().count()
        );
        return Ok(());
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(config.logging.filter())
        .init();

    tracing::info!("hearthd starting");
    tracing::info!("Loaded config from: {}", args.config.display());

    let client = reqwest::Client::builder()
        .user_agent(concat!("hearthd/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("Failed to build HTTP client")?;

    let runtime = Runtime::new();
    for (id, entry) in config.enabled_entries() {
        let url = entry
            .url
            .parse()
            .with_context(|| format!("Invalid url for entry {}", id))?;
        let mut source = RestSource::<serde_json::Value>::new(client.clone(), url);
        if let Some(token) = &entry.token {
            source = source.with_bearer_token(token.clone());
        }

        let coordinator = UpdateCoordinator::new(id, entry.coordinator.clone(), source);
        coordinator.add_listener(log_update);

        let state = runtime.add_entry(id, coordinator).await;
        tracing::info!("[{}] Entry state after setup: {:?}", id, state);
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    let api = tokio::spawn({
        let runtime = Arc::clone(&runtime);
        let listen = config.api.listen.clone();
        let port = config.api.port;
        async move { api::serve(&listen, port, runtime, shutdown_rx).await }
    });

    tracing::info!("All entries started, press Ctrl+C to exit");

    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received shutdown signal");
        }
        Err(e) => {
            tracing::error!("Failed to listen for shutdown signal: {}", e);
        }
    }

    runtime.shutdown();
    let _ = shutdown_tx.send(());
    match api.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!("HTTP API server failed: {:#}", e),
        Err(e) => tracing::error!("HTTP API task failed: {}", e),
    }

    tracing::info!("hearthd shutdown complete");

    Ok(())
}

fn log_update(update: &CoordinatorUpdate<serde_json::Value>) -> anyhow::Result<()> {
    match (&update.error, &update.data) {
        (Some(e), _) => tracing::debug!("[{}] Update #{} failed: {}", update.name, update.sequence, e),
        (None, Some(data)) => tracing::debug!("[{}] Update #{}: {}", update.name, update.sequence, data),
        (None, None) => {}
    }
    Ok(())
}
