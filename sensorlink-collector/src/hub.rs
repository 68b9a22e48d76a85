/**
 * HUB - Propriétaire unique de l'état partagé du collector
 *
 * RÔLE : Regroupe ClientRegistry + HistoryBuffer + diffusion des événements.
 * Chaque message entrant ou passe de liveness = une mutation atomique.
 *
 * ARCHITECTURE : Shared<Hub> (parking_lot::Mutex), jamais tenu à travers un .await.
 * Les événements sont émis sous le verrou : leur ordre suit celui des mutations.
 */

use crate::history::{HistoryBuffer, HistoryEntry};
use crate::models::{ClientView, CollectorEvent, ReadingEvent, StatusEvent};
use crate::registry::{
    ClientRegistry, ConnectOutcome, ConnectionHandle, ConnectionId, LivenessPolicy, Moment, RegistryError,
    StatusChange,
};
use parking_lot::Mutex;
use sensorlink_protocol::Reading;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::debug;

pub type Shared<T> = Arc<Mutex<T>>;

pub fn new_state<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}

pub type SharedHub = Shared<Hub>;

pub struct Hub {
    registry: ClientRegistry,
    history: HistoryBuffer,
    events: broadcast::Sender<CollectorEvent>,
}

impl Hub {
    pub fn new(max_history: usize, event_buffer: usize) -> Self {
        let (events, _) = broadcast::channel(event_buffer.max(1));
        Self {
            registry: ClientRegistry::new(),
            history: HistoryBuffer::new(max_history),
            events,
        }
    }

    pub fn shared(max_history: usize, event_buffer: usize) -> SharedHub {
        new_state(Self::new(max_history, event_buffer))
    }

    /// Abonnement aux événements status/reading
    pub fn subscribe(&self) -> broadcast::Receiver<CollectorEvent> {
        self.events.subscribe()
    }

    pub fn connect(&mut self, requested: &str, conn: &ConnectionHandle, at: Moment) -> ConnectOutcome {
        let outcome = self.registry.connect(requested, conn, at);
        if let ConnectOutcome::Accepted { change: Some(change), .. } = &outcome {
            self.publish_status(change, at);
        }
        outcome
    }

    pub fn heartbeat(&mut self, identity: &str, conn: ConnectionId, at: Moment) -> Result<(), RegistryError> {
        if let Some(change) = self.registry.heartbeat(identity, conn, at)? {
            self.publish_status(&change, at);
        }
        Ok(())
    }

    /// Lecture acceptée : registry + historique + événement, en une mutation
    pub fn data(&mut self, identity: &str, conn: ConnectionId, reading: Reading, at: Moment) -> Result<(), RegistryError> {
        self.registry.record_reading(identity, conn, reading, at)?;
        self.history.append(HistoryEntry {
            timestamp: at.unix,
            identity: identity.to_string(),
            temperature: reading.temperature,
            humidity: reading.humidity,
        });
        let _ = self.events.send(CollectorEvent::Reading(ReadingEvent {
            identity: identity.to_string(),
            temperature: reading.temperature,
            humidity: reading.humidity,
            timestamp: at.unix,
        }));
        Ok(())
    }

    pub fn disconnect(&mut self, identity: &str, conn: ConnectionId, at: Moment) -> Result<(), RegistryError> {
        if let Some(change) = self.registry.disconnect(identity, conn)? {
            self.publish_status(&change, at);
        }
        Ok(())
    }

    pub fn connection_lost(&mut self, identity: &str, conn: ConnectionId, at: Moment) {
        if let Some(change) = self.registry.connection_lost(identity, conn) {
            self.publish_status(&change, at);
        }
    }

    /// Une passe du liveness monitor, retourne le nombre de timeouts
    pub fn sweep(&mut self, at: Moment, policy: &LivenessPolicy) -> usize {
        let changes = self.registry.sweep(at.instant, policy);
        for change in &changes {
            self.publish_status(change, at);
        }
        changes.len()
    }

    pub fn clients(&self) -> Vec<ClientView> {
        let now = Instant::now();
        self.registry.records().map(|r| r.view(now)).collect()
    }

    pub fn client(&self, identity: &str) -> Option<ClientView> {
        self.registry.get(identity).map(|r| r.view(Instant::now()))
    }

    pub fn history(&self) -> Vec<HistoryEntry> {
        self.history.snapshot()
    }

    pub fn history_tail(&self, limit: usize) -> Vec<HistoryEntry> {
        self.history.tail(limit)
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn registry(&self) -> &ClientRegistry {
        &self.registry
    }

    pub fn online_count(&self) -> usize {
        self.registry.online_count()
    }

    fn publish_status(&self, change: &StatusChange, at: Moment) {
        let event = StatusEvent {
            identity: change.identity.clone(),
            status: change.reason.status(),
            reason: change.reason,
            timestamp: at.unix,
        };
        debug!(identity = %event.identity, status = ?event.status, reason = %event.reason, "status change");
        // pas d'abonné = personne à prévenir
        let _ = self.events.send(CollectorEvent::Status(event));
    }
}
