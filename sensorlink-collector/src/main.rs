/**
 * SENSORLINK COLLECTOR - Point d'entrée du serveur central
 *
 * RÔLE : Assemblage : config, listener TCP, liveness monitor, API HTTP
 * optionnelle et journal des événements status/reading.
 *
 * ARCHITECTURE : Un token d'arrêt unique ; Ctrl-C l'annule et le serveur
 * ferme toutes les connexions avant de rendre la main.
 */

use anyhow::{Context, Result};
use sensorlink_collector::http::{self, ApiState};
use sensorlink_collector::{load_config, CollectorEvent, CollectorServer, SharedHub};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // .env optionnel
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = load_config().await;
    cfg.validate().context("invalid collector configuration")?;

    let server = CollectorServer::bind(cfg.clone()).await?;
    let shutdown = server.shutdown_token();
    info!("[collector] listening on {}", server.local_addr()?);

    spawn_event_logger(server.hub(), shutdown.clone());

    if let Some(http_addr) = &cfg.http_listen {
        let listener = TcpListener::bind(http_addr)
            .await
            .with_context(|| format!("failed to bind http api on {http_addr}"))?;
        let state = ApiState {
            hub: server.hub(),
            health: server.health(),
        };
        let http_shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = http::serve(listener, state, http_shutdown).await {
                error!("http api stopped: {e}");
            }
        });
    }

    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("[collector] ctrl-c received");
        }
        ctrl_c.cancel();
    });

    server.run().await
}

/// Journalise chaque transition de statut et chaque lecture reçue
fn spawn_event_logger(hub: SharedHub, shutdown: CancellationToken) {
    let mut events = hub.lock().subscribe();
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Ok(CollectorEvent::Status(status)) => info!(
                    identity = %status.identity,
                    reason = %status.reason,
                    status = ?status.status,
                    at = %format_ts(status.timestamp),
                    "client status changed"
                ),
                Ok(CollectorEvent::Reading(reading)) => info!(
                    identity = %reading.identity,
                    at = %format_ts(reading.timestamp),
                    "reading temperature={:.1} humidity={:.1}",
                    reading.temperature,
                    reading.humidity
                ),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event logger lagging behind"),
                Err(RecvError::Closed) => break,
            }
        }
    });
}

fn format_ts(unix: i64) -> String {
    OffsetDateTime::from_unix_timestamp(unix)
        .ok()
        .and_then(|ts| ts.format(&Rfc3339).ok())
        .unwrap_or_else(|| unix.to_string())
}
