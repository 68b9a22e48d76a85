/*!
Test Harness pour le collector SensorLink

Facilite l'écriture de tests de bout en bout avec:
- Collector en process sur un port éphémère
- Liveness accélérée (sweeps de 100 ms)
- Attente des événements status/reading
- Accès direct au hub pour les assertions
*/

use anyhow::{bail, Result};
use sensorlink_collector::{
    ClientStatus, ClientView, CollectorConfig, CollectorEvent, CollectorServer, HealthTracker, HistoryEntry,
    LivenessConf, SharedHub, StatusEvent,
};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;

pub const DEFAULT_WAIT: Duration = Duration::from_secs(3);

/// Collector complet tournant dans le runtime du test
pub struct TestCollector {
    addr: SocketAddr,
    hub: SharedHub,
    health: HealthTracker,
    shutdown: CancellationToken,
    server: JoinHandle<Result<()>>,
    events: broadcast::Receiver<CollectorEvent>,
}

impl TestCollector {
    /// Config rapide : timeout après ~400 ms de silence
    pub fn fast_config() -> CollectorConfig {
        CollectorConfig {
            listen: "127.0.0.1:0".into(),
            handshake_timeout_ms: 2_000,
            liveness: LivenessConf {
                sweep_interval_ms: 100,
                grace_ms: 150,
                max_missed: 3,
            },
            ..CollectorConfig::default()
        }
    }

    pub async fn start() -> Result<Self> {
        Self::start_with(Self::fast_config()).await
    }

    pub async fn start_with(config: CollectorConfig) -> Result<Self> {
        env_logger::try_init().ok(); // Init logging pour tests

        let server = CollectorServer::bind(config).await?;
        let addr = server.local_addr()?;
        let hub = server.hub();
        let health = server.health();
        let shutdown = server.shutdown_token();
        // abonnement avant le premier client : aucun événement perdu
        let events = hub.lock().subscribe();
        let server = tokio::spawn(server.run());

        log::info!("🚀 Test collector listening on {addr}");
        Ok(Self {
            addr,
            hub,
            health,
            shutdown,
            server,
            events,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn hub(&self) -> SharedHub {
        self.hub.clone()
    }

    pub fn health(&self) -> HealthTracker {
        self.health.clone()
    }

    pub fn client(&self, identity: &str) -> Option<ClientView> {
        self.hub.lock().client(identity)
    }

    pub fn history(&self) -> Vec<HistoryEntry> {
        self.hub.lock().history()
    }

    pub fn online_count(&self) -> usize {
        self.hub.lock().online_count()
    }

    /// Prochain événement, quel qu'il soit
    pub async fn next_event(&mut self, wait: Duration) -> Result<CollectorEvent> {
        let deadline = Instant::now() + wait;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match timeout(remaining, self.events.recv()).await {
                Ok(Ok(event)) => return Ok(event),
                Ok(Err(RecvError::Lagged(skipped))) => log::warn!("⚠️ test harness skipped {skipped} events"),
                Ok(Err(RecvError::Closed)) => bail!("collector event channel closed"),
                Err(_) => bail!("no collector event within {wait:?}"),
            }
        }
    }

    /// Prochain événement de statut (les lectures sont ignorées)
    pub async fn next_status(&mut self, wait: Duration) -> Result<StatusEvent> {
        let deadline = Instant::now() + wait;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if let CollectorEvent::Status(status) = self.next_event(remaining).await? {
                log::info!("📡 {} -> {:?} ({})", status.identity, status.status, status.reason);
                return Ok(status);
            }
        }
    }

    /// Attend une transition précise pour une identité
    pub async fn wait_for_status(&mut self, identity: &str, status: ClientStatus, wait: Duration) -> Result<StatusEvent> {
        let deadline = Instant::now() + wait;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let event = self.next_status(remaining).await?;
            if event.identity == identity && event.status == status {
                return Ok(event);
            }
        }
    }

    /// Vérifie qu'aucun événement de statut n'arrive pendant `wait`
    pub async fn expect_no_status(&mut self, wait: Duration) -> Result<()> {
        match self.next_status(wait).await {
            Ok(status) => bail!("unexpected status event {status:?}"),
            Err(_) => Ok(()),
        }
    }

    /// Sonde le hub jusqu'à ce que la condition soit vraie
    pub async fn wait_until<F>(&self, wait: Duration, condition: F) -> Result<()>
    where
        F: Fn(&TestCollector) -> bool,
    {
        let start = Instant::now();
        while start.elapsed() < wait {
            if condition(self) {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        log::warn!("⏰ Timeout waiting for collector condition");
        bail!("condition not met within {wait:?}")
    }

    /// Arrête le collector et attend la fin de toutes ses tâches
    pub async fn shutdown(self) -> Result<()> {
        self.shutdown.cancel();
        self.server.await??;
        log::info!("🛑 Test collector stopped");
        Ok(())
    }
}
