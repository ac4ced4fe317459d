use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use dotenv::dotenv;
use tokio::signal::{
    self,
    unix::{signal, SignalKind},
};

use pact_common::{
    Config, EventSystem, FeedClient, RpcBalanceOracle, SolPriceClient, SupabaseStore,
};
use pact_engine::{CommandSurface, ScoringEngine, StreamSupervisor};

const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    tracing_subscriber::fmt::init();

    let config = Config::from_env().context("Failed to load configuration")?;

    let store = Arc::new(SupabaseStore::new(
        &config.supabase_url,
        &config.supabase_service_role_key,
        config.op_timeout,
    ));
    let price_oracle = Arc::new(SolPriceClient::new(&config.sol_price_url, config.op_timeout));
    let balance_oracle = Arc::new(RpcBalanceOracle::new(&config.rpc_url, config.op_timeout));
    let feed = Arc::new(FeedClient::spawn(
        config.upstream_ws_url.clone(),
        config.channel_capacity,
    ));
    let event_system = Arc::new(EventSystem::new());
    let scoring = Arc::new(ScoringEngine::default());

    let supervisor = Arc::new(StreamSupervisor::new(
        store,
        feed,
        price_oracle,
        balance_oracle,
        scoring,
        Arc::clone(&event_system),
        config.max_retries,
        config.base_retry_delay,
    ));

    supervisor.spawn_event_listener();
    supervisor.spawn_feed_watcher();

    let report = supervisor
        .start_all_pending()
        .await
        .context("Bulk startup failed")?;
    println!(
        "Stream supervisor up: {} streams scheduled, {} expired contracts reconciled",
        report.scheduled, report.reconciled
    );

    let commands = CommandSurface::new(Arc::clone(&supervisor));
    let health_surface = commands.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(HEALTH_LOG_INTERVAL);
        loop {
            interval.tick().await;
            let health = health_surface.health().await;
            tracing::info!(
                ready = health.ready,
                active_streams = health.active_streams,
                feed = ?health.feed,
                "engine health"
            );
        }
    });

    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to create SIGTERM signal handler")?;

    tokio::select! {
        _ = signal::ctrl_c() => {
            println!("\nReceived Ctrl+C, initiating graceful shutdown...");
        }
        _ = sigterm.recv() => {
            println!("\nReceived SIGTERM, initiating graceful shutdown...");
        }
    }

    supervisor.shutdown().await;
    println!("Shutdown complete.");

    Ok(())
}
