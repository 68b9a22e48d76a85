/**
 * CONNECTION HANDLER - Une tâche par connexion acceptée
 *
 * RÔLE : Lit les frames, applique le protocole de session (connect, disconnect,
 * heartbeat, data) sur le Hub et répond aux handshakes.
 *
 * FONCTIONNEMENT :
 * - Avant le Connect : seule une frame connect est traitée (timeout de handshake)
 * - Après le Connect : la connexion est liée à une identité unique
 * - Fin sans Disconnect (EOF, erreur, frame invalide) = "connection lost"
 * - Annulation du token = fermeture demandée (shutdown ou connexion remplacée)
 */

use crate::health::HealthTracker;
use crate::hub::SharedHub;
use crate::registry::{ConnectOutcome, ConnectionHandle, Moment, RegistryError};
use sensorlink_protocol::{FrameReader, FrameWriter, Message, MessageBody, ProtocolError, Reading, DEFAULT_MAX_FRAME_BYTES};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub handshake_timeout: Duration,
    pub max_frame_bytes: usize,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

/// Why a connection handler stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Peer closed the stream without a Disconnect
    PeerClosed,
    GracefulDisconnect,
    /// Identity collision, connection refused
    Rejected,
    Malformed,
    TransportFailure,
    HandshakeTimeout,
    /// Closed from our side (shutdown or replaced by a newer connection)
    Cancelled,
}

pub struct ConnectionHandler {
    hub: SharedHub,
    handle: ConnectionHandle,
    settings: ConnectionSettings,
    health: HealthTracker,
    bound: Option<String>,
    accepted_at: Instant,
}

impl ConnectionHandler {
    pub fn new(hub: SharedHub, handle: ConnectionHandle, settings: ConnectionSettings, health: HealthTracker) -> Self {
        Self {
            hub,
            handle,
            settings,
            health,
            bound: None,
            accepted_at: Instant::now(),
        }
    }

    /// Sert la connexion jusqu'à sa fin et retourne la raison
    pub async fn run<S>(mut self, stream: S) -> SessionEnd
    where
        S: AsyncRead + AsyncWrite + Send,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = FrameReader::with_max_frame(read_half, self.settings.max_frame_bytes);
        let mut writer = FrameWriter::new(write_half);
        let cancel = self.handle.cancel_token().clone();
        let handshake_deadline = self.accepted_at + self.settings.handshake_timeout;

        debug!(peer = %self.handle.peer(), "connection accepted");

        let end = loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break SessionEnd::Cancelled,
                _ = tokio::time::sleep_until(handshake_deadline), if self.bound.is_none() => {
                    break SessionEnd::HandshakeTimeout
                }
                next = reader.next_message() => next,
            };

            match next {
                Ok(Some(msg)) => {
                    if let Some(end) = self.dispatch(msg, &mut writer).await {
                        break end;
                    }
                }
                Ok(None) => break SessionEnd::PeerClosed,
                Err(ProtocolError::Io(e)) => {
                    debug!(peer = %self.handle.peer(), error = %e, "read failed");
                    break SessionEnd::TransportFailure;
                }
                Err(e) => {
                    warn!(peer = %self.handle.peer(), error = %e, "closing connection on bad frame");
                    self.health.record_malformed_frame();
                    break SessionEnd::Malformed;
                }
            }
        };

        self.finish(end);
        // fermeture best-effort : le pair peut déjà être parti
        let _ = writer.shutdown().await;
        end
    }

    async fn dispatch<W>(&mut self, msg: Message, writer: &mut FrameWriter<W>) -> Option<SessionEnd>
    where
        W: AsyncWrite + Unpin,
    {
        match msg.body {
            MessageBody::Connect => self.on_connect(&msg.identity, writer).await,
            MessageBody::Disconnect => self.on_disconnect(&msg.identity),
            MessageBody::Heartbeat => {
                let result = self.hub.lock().heartbeat(&msg.identity, self.handle.id(), Moment::now());
                self.drop_if_unbound("heartbeat", result);
                None
            }
            MessageBody::Data(reading) => {
                self.on_data(&msg.identity, reading);
                None
            }
            MessageBody::ConnectResponse(_) => {
                debug!(peer = %self.handle.peer(), "ignoring connect_response sent by a client");
                None
            }
        }
    }

    async fn on_connect<W>(&mut self, requested: &str, writer: &mut FrameWriter<W>) -> Option<SessionEnd>
    where
        W: AsyncWrite + Unpin,
    {
        // une connexion ne porte qu'une identité
        let requested = match &self.bound {
            Some(bound) if !requested.is_empty() && requested != bound => {
                let reply = Message::connect_response(requested, false, format!("connection already bound to {bound}"));
                return self.reply(writer, &reply).await;
            }
            Some(bound) => bound.clone(),
            None => requested.to_string(),
        };

        let outcome = self.hub.lock().connect(&requested, &self.handle, Moment::now());
        match outcome {
            ConnectOutcome::Accepted { identity, displaced, .. } => {
                if let Some(previous) = displaced {
                    info!(identity = %identity, stale_peer = %previous.peer(), "closing replaced connection");
                    previous.close();
                }
                info!(identity = %identity, peer = %self.handle.peer(), "client connected");
                self.bound = Some(identity.clone());
                let reply = Message::connect_response(identity, true, "connected");
                self.reply(writer, &reply).await
            }
            ConnectOutcome::Rejected { identity, message } => {
                warn!(identity = %identity, peer = %self.handle.peer(), "handshake rejected: {message}");
                self.health.record_rejected_handshake();
                let reply = Message::connect_response(identity, false, message);
                match self.reply(writer, &reply).await {
                    Some(SessionEnd::Cancelled) => Some(SessionEnd::Cancelled),
                    _ => Some(SessionEnd::Rejected),
                }
            }
        }
    }

    /// Envoie une réponse ; un pair qui ne lit plus ne bloque pas la fermeture
    async fn reply<W>(&self, writer: &mut FrameWriter<W>, msg: &Message) -> Option<SessionEnd>
    where
        W: AsyncWrite + Unpin,
    {
        tokio::select! {
            _ = self.handle.cancel_token().cancelled() => Some(SessionEnd::Cancelled),
            sent = writer.send(msg) => sent.err().map(|_| SessionEnd::TransportFailure),
        }
    }

    fn on_disconnect(&mut self, identity: &str) -> Option<SessionEnd> {
        if self.bound.as_deref() != Some(identity) {
            debug!(identity = %identity, peer = %self.handle.peer(), "dropping disconnect for unbound identity");
            return None;
        }
        let result = self.hub.lock().disconnect(identity, self.handle.id(), Moment::now());
        match result {
            Ok(()) => {
                info!(identity = %identity, "client disconnected");
                self.bound = None;
                Some(SessionEnd::GracefulDisconnect)
            }
            Err(e) => {
                self.drop_if_unbound("disconnect", Err(e));
                None
            }
        }
    }

    fn on_data(&mut self, identity: &str, reading: Reading) {
        if !reading.is_finite() {
            debug!(identity = %identity, "dropping non-finite reading");
            return;
        }
        let result = self.hub.lock().data(identity, self.handle.id(), reading, Moment::now());
        self.drop_if_unbound("data", result);
    }

    fn drop_if_unbound(&self, kind: &str, result: Result<(), RegistryError>) {
        if let Err(e) = result {
            debug!(peer = %self.handle.peer(), kind, "dropping frame: {e}");
        }
    }

    fn finish(&mut self, end: SessionEnd) {
        if let Some(identity) = self.bound.take() {
            self.hub.lock().connection_lost(&identity, self.handle.id(), Moment::now());
        }
        debug!(peer = %self.handle.peer(), ?end, "connection closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::Hub;
    use crate::models::{ClientStatus, CollectorEvent, StatusReason};
    use tokio::io::DuplexStream;
    use tokio::sync::broadcast;
    use tokio::task::JoinHandle;
    use tokio_util::sync::CancellationToken;

    struct Peer {
        reader: FrameReader<tokio::io::ReadHalf<DuplexStream>>,
        writer: FrameWriter<tokio::io::WriteHalf<DuplexStream>>,
        task: JoinHandle<SessionEnd>,
        handle: ConnectionHandle,
    }

    impl Peer {
        async fn send(&mut self, msg: Message) {
            self.writer.send(&msg).await.unwrap();
        }

        async fn recv(&mut self) -> Option<Message> {
            self.reader.next_message().await.unwrap()
        }
    }

    fn spawn_peer(hub: &SharedHub, settings: ConnectionSettings) -> Peer {
        spawn_peer_with_buffer(hub, settings, 4096)
    }

    fn spawn_peer_with_buffer(hub: &SharedHub, settings: ConnectionSettings, buffer: usize) -> Peer {
        let (client, server) = tokio::io::duplex(buffer);
        let handle = ConnectionHandle::new("duplex", CancellationToken::new());
        let handler = ConnectionHandler::new(hub.clone(), handle.clone(), settings, HealthTracker::new());
        let task = tokio::spawn(handler.run(server));
        let (read_half, write_half) = tokio::io::split(client);
        Peer {
            reader: FrameReader::new(read_half),
            writer: FrameWriter::new(write_half),
            task,
            handle,
        }
    }

    fn next_status(events: &mut broadcast::Receiver<CollectorEvent>) -> (String, ClientStatus, StatusReason) {
        loop {
            match events.try_recv().unwrap() {
                CollectorEvent::Status(s) => return (s.identity, s.status, s.reason),
                CollectorEvent::Reading(_) => continue,
            }
        }
    }

    async fn connected_peer(hub: &SharedHub, identity: &str) -> Peer {
        let mut peer = spawn_peer(hub, ConnectionSettings::default());
        peer.send(Message::connect(identity)).await;
        let reply = peer.recv().await.unwrap();
        assert_eq!(reply.body, MessageBody::ConnectResponse(sensorlink_protocol::ConnectResult {
            success: true,
            message: "connected".into(),
        }));
        peer
    }

    #[tokio::test]
    async fn test_connect_then_graceful_disconnect() {
        let hub = Hub::shared(100, 64);
        let mut events = hub.lock().subscribe();
        let mut peer = connected_peer(&hub, "C1").await;
        assert_eq!(next_status(&mut events), ("C1".into(), ClientStatus::Online, StatusReason::FirstConnect));

        peer.send(Message::data("C1", Reading::new(23.4, 55.0))).await;
        peer.send(Message::disconnect("C1")).await;
        assert_eq!((&mut peer.task).await.unwrap(), SessionEnd::GracefulDisconnect);
        assert!(peer.recv().await.is_none());

        assert_eq!(
            next_status(&mut events),
            ("C1".into(), ClientStatus::Offline, StatusReason::GracefulDisconnect)
        );
        let view = hub.lock().client("C1").unwrap();
        assert_eq!(view.status, ClientStatus::Offline);
        assert_eq!(view.last_reading, Some(Reading::new(23.4, 55.0)));
        assert_eq!(hub.lock().history_len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_connect_is_rejected_and_closed() {
        let hub = Hub::shared(100, 64);
        let first = connected_peer(&hub, "C1").await;

        let mut second = spawn_peer(&hub, ConnectionSettings::default());
        second.send(Message::connect("C1")).await;
        match second.recv().await.unwrap().body {
            MessageBody::ConnectResponse(result) => assert!(!result.success),
            other => panic!("unexpected reply {other:?}"),
        }
        assert_eq!(second.task.await.unwrap(), SessionEnd::Rejected);

        let record = hub.lock().registry().get("C1").cloned().unwrap();
        assert!(record.online);
        assert!(record.is_bound_to(first.handle.id()));
    }

    #[tokio::test]
    async fn test_abrupt_close_marks_connection_lost() {
        let hub = Hub::shared(100, 64);
        let mut events = hub.lock().subscribe();
        let peer = connected_peer(&hub, "C1").await;
        let _ = next_status(&mut events);

        let Peer { reader, writer, task, .. } = peer;
        drop(reader);
        drop(writer);
        assert_eq!(task.await.unwrap(), SessionEnd::PeerClosed);
        assert_eq!(
            next_status(&mut events),
            ("C1".into(), ClientStatus::Offline, StatusReason::ConnectionLost)
        );
    }

    #[tokio::test]
    async fn test_malformed_frame_closes_without_mutation() {
        let hub = Hub::shared(100, 64);
        let peer = spawn_peer(&hub, ConnectionSettings::default());
        let Peer { reader, writer, task, .. } = peer;
        let mut raw = writer.into_inner();
        tokio::io::AsyncWriteExt::write_all(&mut raw, b"{\"kind\":\"bogus\"}\n").await.unwrap();

        assert_eq!(task.await.unwrap(), SessionEnd::Malformed);
        assert!(hub.lock().registry().is_empty());
        drop(reader);
    }

    #[tokio::test]
    async fn test_frames_before_connect_are_dropped() {
        let hub = Hub::shared(100, 64);
        let mut peer = spawn_peer(&hub, ConnectionSettings::default());
        peer.send(Message::heartbeat("C1")).await;
        peer.send(Message::data("C1", Reading::new(20.0, 50.0))).await;
        peer.send(Message::connect("C1")).await;
        assert!(peer.recv().await.is_some());

        assert_eq!(hub.lock().history_len(), 0);
        assert!(hub.lock().registry().get("C1").unwrap().last_reading.is_none());
    }

    #[tokio::test]
    async fn test_second_identity_on_same_connection_is_refused() {
        let hub = Hub::shared(100, 64);
        let mut peer = connected_peer(&hub, "C1").await;
        peer.send(Message::connect("C2")).await;
        match peer.recv().await.unwrap().body {
            MessageBody::ConnectResponse(result) => {
                assert!(!result.success);
                assert!(result.message.contains("C1"));
            }
            other => panic!("unexpected reply {other:?}"),
        }
        assert!(hub.lock().registry().get("C2").is_none());
        assert!(hub.lock().registry().get("C1").unwrap().online);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_timeout_closes_idle_connection() {
        let hub = Hub::shared(100, 64);
        let settings = ConnectionSettings {
            handshake_timeout: Duration::from_secs(2),
            ..ConnectionSettings::default()
        };
        let mut peer = spawn_peer(&hub, settings);
        assert_eq!((&mut peer.task).await.unwrap(), SessionEnd::HandshakeTimeout);
        assert!(peer.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_cancel_closes_connection_and_marks_offline() {
        let hub = Hub::shared(100, 64);
        let mut peer = connected_peer(&hub, "C1").await;
        peer.handle.close();
        assert_eq!((&mut peer.task).await.unwrap(), SessionEnd::Cancelled);
        assert!(peer.recv().await.is_none());
        assert_eq!(hub.lock().online_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_reply_to_peer_that_never_reads() {
        let hub = Hub::shared(100, 64);
        let mut events = hub.lock().subscribe();
        let mut peer = spawn_peer_with_buffer(&hub, ConnectionSettings::default(), 64);

        // la réponse ne tient pas dans le tampon et le pair ne lit jamais
        peer.send(Message::connect("C1")).await;
        tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hub.lock().online_count(), 1);

        peer.handle.close();
        let end = tokio::time::timeout(Duration::from_secs(2), &mut peer.task)
            .await
            .expect("handler stuck on a blocked write")
            .unwrap();
        assert_eq!(end, SessionEnd::Cancelled);
        assert_eq!(hub.lock().online_count(), 0);
    }
}
