use crate::hub::SharedHub;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Serialize, Deserialize)]
pub struct CollectorHealth {
    pub uptime_seconds: u64,
    pub clients_known: u32,
    pub clients_online: u32,
    pub history_entries: u32,
    pub connections_accepted: u64,
    pub handshakes_rejected: u64,
    pub malformed_frames: u64,
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    connections_accepted: Arc<AtomicU64>,
    handshakes_rejected: Arc<AtomicU64>,
    malformed_frames: Arc<AtomicU64>,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            connections_accepted: Arc::new(AtomicU64::new(0)),
            handshakes_rejected: Arc::new(AtomicU64::new(0)),
            malformed_frames: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn record_connection(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected_handshake(&self) {
        self.handshakes_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_malformed_frame(&self) {
        self.malformed_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_health(&self, hub: &SharedHub) -> CollectorHealth {
        // compteurs du hub lus sous un seul verrou
        let (known, online, history) = {
            let hub = hub.lock();
            (hub.registry().len(), hub.online_count(), hub.history_len())
        };

        CollectorHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            clients_known: known as u32,
            clients_online: online as u32,
            history_entries: history as u32,
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            handshakes_rejected: self.handshakes_rejected.load(Ordering::Relaxed),
            malformed_frames: self.malformed_frames.load(Ordering::Relaxed),
        }
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}
