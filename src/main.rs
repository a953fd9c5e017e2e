//! mqtt-gateway server entry point.
//!
//! Starts the registry with logging hooks and stops it on Ctrl-C.

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use mqtt_gateway::config::GatewayConfig;
use mqtt_gateway::domain::Registry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json")) {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    // Load configuration
    let config = GatewayConfig::from_env().context("loading configuration")?;
    tracing::info!(?config, "starting mqtt-gateway");

    // Build registry with logging hooks
    let update = config
        .into_update()
        .on_connected(|client_id| tracing::info!(client_id, "client connected"))
        .on_disconnected(|record| match serde_json::to_string(&record) {
            Ok(json) => tracing::info!(client_id = %record.client_id, record = %json, "client disconnected"),
            Err(e) => tracing::warn!(client_id = %record.client_id, error = %e, "client disconnected"),
        })
        .on_packet(|client_id, packet| {
            tracing::debug!(
                client_id,
                packet_type = ?packet.packet_type(),
                len = packet.body().len(),
                "packet received"
            );
        });
    let registry = Registry::new(update);

    // Start listeners
    let addrs = registry.start().await.context("starting listeners")?;
    tracing::info!(tcp = %addrs.tcp, websocket = ?addrs.websocket, "gateway listening");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    tracing::info!("shutdown signal received");
    registry.stop().await;

    Ok(())
}
