/**
 * COLLECTOR SERVER - Boucle d'acceptation + orchestration des tâches
 *
 * RÔLE : Accepte les connexions TCP, lance un ConnectionHandler par connexion
 * et le liveness monitor, puis arrête tout proprement au shutdown.
 *
 * ARCHITECTURE : Un CancellationToken racine ; chaque connexion et le monitor
 * reçoivent un token enfant. Annuler la racine débloque accept() et toutes les
 * lectures en cours, puis on attend la fin de chaque tâche.
 */

use crate::config::CollectorConfig;
use crate::connection::{ConnectionHandler, ConnectionSettings};
use crate::health::HealthTracker;
use crate::hub::{Hub, SharedHub};
use crate::monitor::spawn_liveness_monitor;
use crate::registry::ConnectionHandle;
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(200);

pub struct CollectorServer {
    listener: TcpListener,
    hub: SharedHub,
    health: HealthTracker,
    config: CollectorConfig,
    shutdown: CancellationToken,
}

impl CollectorServer {
    pub async fn bind(config: CollectorConfig) -> Result<Self> {
        let hub = Hub::shared(config.max_history, config.event_buffer);
        Self::bind_with_hub(config, hub).await
    }

    pub async fn bind_with_hub(config: CollectorConfig, hub: SharedHub) -> Result<Self> {
        let listener = TcpListener::bind(&config.listen)
            .await
            .with_context(|| format!("failed to bind {}", config.listen))?;
        Ok(Self {
            listener,
            hub,
            health: HealthTracker::new(),
            config,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn hub(&self) -> SharedHub {
        self.hub.clone()
    }

    pub fn health(&self) -> HealthTracker {
        self.health.clone()
    }

    /// Annuler ce token arrête le serveur
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn run(self) -> Result<()> {
        let addr = self.local_addr()?;
        let settings = ConnectionSettings {
            handshake_timeout: self.config.handshake_timeout(),
            max_frame_bytes: self.config.max_frame_bytes,
        };
        let monitor = spawn_liveness_monitor(
            self.hub.clone(),
            self.config.liveness.policy(),
            self.config.liveness.sweep_interval(),
            self.shutdown.child_token(),
        );
        let mut connections = JoinSet::new();

        info!("[collector] accepting connections on {addr}");

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            warn!(peer = %peer, "set_nodelay failed: {e}");
                        }
                        self.health.record_connection();
                        let handle = ConnectionHandle::new(peer.to_string(), self.shutdown.child_token());
                        let handler = ConnectionHandler::new(
                            self.hub.clone(),
                            handle,
                            settings.clone(),
                            self.health.clone(),
                        );
                        connections.spawn(handler.run(stream));
                    }
                    Err(e) => {
                        // erreur transitoire (ex: trop de fichiers ouverts)
                        warn!("accept failed: {e}");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    log_join(joined);
                }
            }
        }

        info!("[collector] shutting down, closing {} connections", connections.len());
        drop(self.listener);
        self.shutdown.cancel();
        while let Some(joined) = connections.join_next().await {
            log_join(joined);
        }
        if let Err(e) = monitor.await {
            error!("liveness monitor failed: {e}");
        }
        info!("[collector] stopped");
        Ok(())
    }
}

fn log_join<T>(joined: Result<T, tokio::task::JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            error!("connection handler panicked: {e}");
        }
    }
}
