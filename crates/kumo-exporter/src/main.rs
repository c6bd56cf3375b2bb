//! Prometheus metrics exporter for Mitsubishi Kumo indoor units.
//!
//! This exporter logs in to the Kumo cloud, bootstraps the configured adapters and
//! polls each one over the local network, collecting temperatures, set points and
//! adapter fault/reboot counts.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use clap::Parser;
use futures::future::join_all;
use kumo_core::{
    BackoffScope, ClientConfig, Credentials, Error, SessionOrchestrator, commands,
    response::IndoorUnitStatus,
};
use prometheus_client::{encoding::text::encode, registry::Registry};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

mod metrics;

use metrics::{DeviceLabels, DeviceMetrics};

/// Prometheus metrics exporter for Mitsubishi Kumo indoor units.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// HTTP listen address
    #[arg(long, default_value = "0.0.0.0:9102")]
    listen: SocketAddr,

    /// Device polling interval in seconds
    #[arg(long, default_value = "60")]
    scrape_interval: u64,

    /// Kumo cloud account username
    #[arg(long, env = "KUMO_USERNAME")]
    username: String,

    /// Kumo cloud account password
    #[arg(long, env = "KUMO_PASSWORD", hide_env_values = true)]
    password: String,

    /// Kumo cloud base URL
    #[arg(long, default_value = kumo_core::config::DEFAULT_CLOUD_URL)]
    cloud_url: String,

    /// Device to poll, as SERIAL=ADDRESS. Can be specified multiple times.
    #[arg(long = "device", value_name = "SERIAL=ADDRESS", value_parser = parse_device, required = true)]
    devices: Vec<(String, String)>,
}

fn parse_device(value: &str) -> Result<(String, String), String> {
    match value.split_once('=') {
        Some((serial, address)) if !serial.is_empty() && !address.is_empty() => {
            Ok((serial.trim().to_string(), address.trim().to_string()))
        }
        _ => Err(format!("expected SERIAL=ADDRESS, got `{value}`")),
    }
}

/// Shared application state
struct AppState {
    registry: RwLock<Registry>,
    metrics: DeviceMetrics,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize tracing
    if cli.verbose {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .init();
    }

    let client = Arc::new(SessionOrchestrator::new(
        Credentials::new(cli.username.clone(), cli.password.clone()),
        ClientConfig::default().with_cloud_url(cli.cloud_url.clone()),
    )?);

    // Create metrics registry
    let mut registry = Registry::default();
    let metrics = DeviceMetrics::new(&mut registry);
    metrics.set_devices_configured(cli.devices.len());

    let state = Arc::new(AppState {
        registry: RwLock::new(registry),
        metrics,
    });

    // Start background polling task
    let poll_state = Arc::clone(&state);
    let scrape_interval = Duration::from_secs(cli.scrape_interval);
    let devices = cli.devices.clone();

    tokio::spawn(async move {
        poll_devices(poll_state, client, scrape_interval, devices).await;
    });

    // Build HTTP router
    let app = Router::new()
        .route("/", get(index_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state);

    info!("Starting kumo-exporter on {}", cli.listen);
    info!("Polling interval: {}s", cli.scrape_interval);
    for (serial, address) in &cli.devices {
        info!("  - {} at {}", serial, address);
    }

    let listener = tokio::net::TcpListener::bind(cli.listen).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

/// Background task that polls devices at regular intervals
async fn poll_devices(
    state: Arc<AppState>,
    client: Arc<SessionOrchestrator>,
    interval: Duration,
    devices: Vec<(String, String)>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        debug!("Starting device poll cycle");

        let start = std::time::Instant::now();

        let results = join_all(
            devices
                .iter()
                .map(|(serial, address)| poll_device(&state, &client, serial, address)),
        )
        .await;

        // Credential failures affect every device; log them once per cycle.
        if let Some(e) = results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .find(|e| e.backoff_scope() == BackoffScope::Account)
        {
            error!(error = %e, "Kumo cloud account unusable");
        }

        let duration = start.elapsed();
        state.metrics.set_scrape_duration(duration);
        debug!("Poll cycle completed in {:?}", duration);
    }
}

/// Poll one device, bootstrapping its session first if needed
async fn poll_device(
    state: &AppState,
    client: &SessionOrchestrator,
    serial: &str,
    address: &str,
) -> Result<(), Error> {
    let labels = DeviceLabels::new(serial, address);

    let result = async {
        if client.device(serial).is_err() {
            client.bootstrap_device(serial, address).await?;
        }
        client
            .query(serial, &commands::indoor_unit_status())
            .await
    }
    .await;

    let reply = match result {
        Ok(reply) => reply,
        Err(e) => {
            state.metrics.set_scrape_success(&labels, false);
            if e.backoff_scope() != BackoffScope::Account {
                warn!(serial, address, error = %e, "Failed to poll device");
            }
            return Err(e);
        }
    };

    if let Some(report) = &reply.fault {
        warn!(
            serial,
            fault = %report.fault,
            consecutive = report.consecutive_errors,
            persistent = report.persistent,
            "Adapter reported a fault"
        );
        state
            .metrics
            .record_fault(&labels, report.fault, &report.reboot);
    }

    match IndoorUnitStatus::from_response(&reply.response) {
        Ok(status) => {
            state.metrics.set_status(&labels, &status);
            state.metrics.set_scrape_success(&labels, true);
            debug!(serial, room_temp = ?status.room_temp, "Polled device");
            Ok(())
        }
        Err(e) => {
            // A soft failure may come back without a status body.
            state.metrics.set_scrape_success(&labels, false);
            debug!(serial, error = %e, "No status in device response");
            Err(e)
        }
    }
}

/// Index page handler
async fn index_handler() -> impl IntoResponse {
    let html = r#"<!DOCTYPE html>
<html>
<head>
    <title>Kumo Exporter</title>
</head>
<body>
    <h1>Kumo Exporter</h1>
    <p>Prometheus metrics exporter for Mitsubishi Kumo indoor units.</p>
    <ul>
        <li><a href="/metrics">Metrics</a></li>
        <li><a href="/health">Health</a></li>
    </ul>
</body>
</html>"#;

    (StatusCode::OK, [("content-type", "text/html")], html)
}

/// Health check handler
async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// Metrics handler - returns Prometheus exposition format
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let registry = state.registry.read().await;
    let mut buffer = String::new();

    match encode(&mut buffer, &registry) {
        Ok(()) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            buffer,
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; charset=utf-8")],
            format!("Error encoding metrics: {}", e),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_device() {
        assert_eq!(
            parse_device("2234P008M100013F=192.168.1.20").unwrap(),
            ("2234P008M100013F".to_string(), "192.168.1.20".to_string())
        );
        assert!(parse_device("2234P008M100013F").is_err());
        assert!(parse_device("=192.168.1.20").is_err());
    }

    #[test]
    fn test_cli_requires_device() {
        let result = Cli::try_parse_from([
            "kumo-exporter",
            "--username",
            "user@example.com",
            "--password",
            "secret",
        ]);
        assert!(result.is_err());

        let cli = Cli::try_parse_from([
            "kumo-exporter",
            "--username",
            "user@example.com",
            "--password",
            "secret",
            "--device",
            "A=10.0.0.2",
            "--device",
            "B=10.0.0.3:8080",
        ])
        .unwrap();
        assert_eq!(cli.devices.len(), 2);
        assert_eq!(cli.devices[1].1, "10.0.0.3:8080");
    }
}
