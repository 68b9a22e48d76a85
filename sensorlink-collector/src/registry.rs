/**
 * CLIENT REGISTRY - État par identité des producteurs de télémétrie
 *
 * RÔLE : Un ClientRecord par identité logique (online/offline, dernier contact,
 * heartbeats manqués, dernière lecture, connexion liée).
 *
 * ARCHITECTURE : Machine à états pure, sans I/O ni verrou. Le Hub la place
 * derrière un mutex unique et publie les StatusChange retournés.
 * UTILITÉ : Une identité n'est jamais oubliée, seulement marquée injoignable.
 */

use crate::models::{ClientStatus, ClientView, StatusReason};
use sensorlink_protocol::{unix_now, Reading};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

pub type ConnectionId = Uuid;

/// Instant monotone + horloge murale, pris une fois par mutation
#[derive(Debug, Clone, Copy)]
pub struct Moment {
    pub instant: Instant,
    pub unix: i64,
}

impl Moment {
    pub fn now() -> Self {
        Self {
            instant: Instant::now(),
            unix: unix_now(),
        }
    }
}

/// Référence opaque vers une connexion de transport vivante.
///
/// L'annuler demande à son handler de fermer le transport.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    peer: String,
    cancel: CancellationToken,
}

impl ConnectionHandle {
    pub fn new(peer: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            id: Uuid::new_v4(),
            peer: peer.into(),
            cancel,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }
}

#[derive(Debug, Clone)]
pub struct ClientRecord {
    pub identity: String,
    pub online: bool,
    pub last_seen: Instant,
    pub last_seen_at: i64,
    pub missed_heartbeats: u32,
    pub last_reading: Option<Reading>,
    pub first_seen_at: i64,
    pub sessions: u32,
    connection: Option<ConnectionHandle>,
}

impl ClientRecord {
    fn new(identity: String, connection: ConnectionHandle, at: Moment) -> Self {
        Self {
            identity,
            online: true,
            last_seen: at.instant,
            last_seen_at: at.unix,
            missed_heartbeats: 0,
            last_reading: None,
            first_seen_at: at.unix,
            sessions: 1,
            connection: Some(connection),
        }
    }

    pub fn connection(&self) -> Option<&ConnectionHandle> {
        self.connection.as_ref()
    }

    pub fn is_bound_to(&self, conn: ConnectionId) -> bool {
        self.connection.as_ref().is_some_and(|c| c.id() == conn)
    }

    fn touch(&mut self, at: Moment) {
        self.last_seen = at.instant;
        self.last_seen_at = at.unix;
        self.missed_heartbeats = 0;
    }

    pub fn view(&self, now: Instant) -> ClientView {
        ClientView {
            identity: self.identity.clone(),
            status: if self.online { ClientStatus::Online } else { ClientStatus::Offline },
            last_seen: self.last_seen_at,
            silent_for_seconds: now.saturating_duration_since(self.last_seen).as_secs(),
            missed_heartbeats: self.missed_heartbeats,
            last_reading: self.last_reading,
            first_seen: self.first_seen_at,
            sessions: self.sessions,
        }
    }
}

/// Transition produite par une mutation du registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub identity: String,
    pub reason: StatusReason,
}

impl StatusChange {
    fn new(identity: &str, reason: StatusReason) -> Self {
        Self {
            identity: identity.to_string(),
            reason,
        }
    }
}

#[derive(Debug, Clone)]
pub enum ConnectOutcome {
    Accepted {
        identity: String,
        change: Option<StatusChange>,
        /// Connexion restante que l'appelant doit fermer
        displaced: Option<ConnectionHandle>,
    },
    Rejected {
        identity: String,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown identity: {0}")]
    UnknownIdentity(String),
    #[error("identity {identity} is not bound to this connection")]
    NotBound { identity: String },
}

/// Seuils de détection de silence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessPolicy {
    /// Silence toléré avant qu'une passe compte un heartbeat manqué
    pub grace: Duration,
    /// Manques consécutifs avant de déclarer l'identité offline
    pub max_missed: u32,
}

impl Default for LivenessPolicy {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(4), // intervalle heartbeat 3s + 1s de tolérance
            max_missed: 3,
        }
    }
}

#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: BTreeMap<String, ClientRecord>,
    assigned: u64,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Traite un Connect : création, reconnexion ou rejet pour collision
    pub fn connect(&mut self, requested: &str, conn: &ConnectionHandle, at: Moment) -> ConnectOutcome {
        let identity = if requested.trim().is_empty() {
            self.assign_identity()
        } else {
            requested.to_string()
        };

        let Some(record) = self.clients.get_mut(&identity) else {
            self.clients
                .insert(identity.clone(), ClientRecord::new(identity.clone(), conn.clone(), at));
            return ConnectOutcome::Accepted {
                change: Some(StatusChange::new(&identity, StatusReason::FirstConnect)),
                identity,
                displaced: None,
            };
        };

        if record.online {
            let held_elsewhere = record.connection.as_ref().is_some_and(|c| c.id() != conn.id());
            if held_elsewhere {
                return ConnectOutcome::Rejected {
                    message: format!("identity {identity} is already online"),
                    identity,
                };
            }
            // Connect répété sur la même connexion : rien ne change
            record.connection = Some(conn.clone());
            record.touch(at);
            return ConnectOutcome::Accepted {
                identity,
                change: None,
                displaced: None,
            };
        }

        let displaced = record
            .connection
            .replace(conn.clone())
            .filter(|previous| previous.id() != conn.id());
        let reason = if displaced.is_some() {
            StatusReason::ReplacedConnection
        } else {
            StatusReason::Reconnected
        };

        record.online = true;
        record.sessions += 1;
        record.touch(at);

        ConnectOutcome::Accepted {
            change: Some(StatusChange::new(&identity, reason)),
            identity,
            displaced,
        }
    }

    /// Heartbeat : contact + récupération si l'identité était offline
    pub fn heartbeat(
        &mut self,
        identity: &str,
        conn: ConnectionId,
        at: Moment,
    ) -> Result<Option<StatusChange>, RegistryError> {
        let record = self.bound_record(identity, conn)?;
        record.touch(at);
        if record.online {
            return Ok(None);
        }
        record.online = true;
        Ok(Some(StatusChange::new(identity, StatusReason::HeartbeatRecovered)))
    }

    /// Data : contact ordinaire, ne remet pas une identité online
    pub fn record_reading(
        &mut self,
        identity: &str,
        conn: ConnectionId,
        reading: Reading,
        at: Moment,
    ) -> Result<(), RegistryError> {
        let record = self.bound_record(identity, conn)?;
        record.touch(at);
        record.last_reading = Some(reading);
        Ok(())
    }

    /// Disconnect explicite : la connexion est déliée dans tous les cas
    pub fn disconnect(&mut self, identity: &str, conn: ConnectionId) -> Result<Option<StatusChange>, RegistryError> {
        let record = self.bound_record(identity, conn)?;
        record.connection = None;
        record.missed_heartbeats = 0;
        if !record.online {
            return Ok(None);
        }
        record.online = false;
        Ok(Some(StatusChange::new(identity, StatusReason::GracefulDisconnect)))
    }

    /// Perte de transport sans Disconnect. Sans effet si l'identité est déjà
    /// liée à une autre connexion.
    pub fn connection_lost(&mut self, identity: &str, conn: ConnectionId) -> Option<StatusChange> {
        let record = self.bound_record(identity, conn).ok()?;
        record.connection = None;
        record.missed_heartbeats = 0;
        if !record.online {
            return None;
        }
        record.online = false;
        Some(StatusChange::new(identity, StatusReason::ConnectionLost))
    }

    /// Passe de liveness : compte les silences et déclare les timeouts
    pub fn sweep(&mut self, now: Instant, policy: &LivenessPolicy) -> Vec<StatusChange> {
        if self.online_count() == 0 {
            return Vec::new();
        }

        let mut changes = Vec::new();
        for record in self.clients.values_mut().filter(|r| r.online) {
            let silent = now.saturating_duration_since(record.last_seen);
            if silent <= policy.grace {
                continue;
            }
            record.missed_heartbeats += 1;
            debug!(
                identity = %record.identity,
                missed = record.missed_heartbeats,
                silent_ms = silent.as_millis() as u64,
                "client missed a heartbeat"
            );
            if record.missed_heartbeats >= policy.max_missed {
                // la connexion reste liée : un heartbeat tardif peut la récupérer
                record.online = false;
                record.missed_heartbeats = 0;
                changes.push(StatusChange::new(&record.identity, StatusReason::Timeout));
            }
        }
        changes
    }

    pub fn get(&self, identity: &str) -> Option<&ClientRecord> {
        self.clients.get(identity)
    }

    /// Records triés par identité
    pub fn records(&self) -> impl Iterator<Item = &ClientRecord> {
        self.clients.values()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn online_count(&self) -> usize {
        self.clients.values().filter(|r| r.online).count()
    }

    fn bound_record(&mut self, identity: &str, conn: ConnectionId) -> Result<&mut ClientRecord, RegistryError> {
        let record = self
            .clients
            .get_mut(identity)
            .ok_or_else(|| RegistryError::UnknownIdentity(identity.to_string()))?;
        if !record.is_bound_to(conn) {
            return Err(RegistryError::NotBound {
                identity: identity.to_string(),
            });
        }
        Ok(record)
    }

    /// Identité attribuée par le collector : CLIENT1, CLIENT2, ...
    fn assign_identity(&mut self) -> String {
        loop {
            self.assigned += 1;
            let candidate = format!("CLIENT{}", self.assigned);
            if !self.clients.contains_key(&candidate) {
                return candidate;
            }
        }
    }
}
