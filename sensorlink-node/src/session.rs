//! Client session state machine
//!
//! Owns one connection to the collector at a time:
//! - Handshake (Connect / ConnectResponse) bounded by a timeout
//! - Heartbeat and data emitters running independently of the read loop
//! - Pause / resume of data emission (heartbeats keep flowing)
//! - Explicit disconnect, and detection of a lost connection
//!
//! There is no automatic reconnect: after a failure the caller decides.

use crate::sensor::SensorSource;
use parking_lot::Mutex;
use sensorlink_protocol::{FrameReader, FrameWriter, Message, MessageBody, ProtocolError, Reading};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type SharedWriter = Arc<tokio::sync::Mutex<FrameWriter<BoxedWriter>>>;

/// Borne du Disconnect d'adieu quand le collector ne lit plus
const GOODBYE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Handshaking,
    Connected,
    Disconnected,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub heartbeat_interval: Duration,
    pub data_interval: Duration,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(3),
            data_interval: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("connection refused by collector: {0}")]
    HandshakeRejected(String),
    #[error("session already connected")]
    AlreadyConnected,
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("no connect_response within {0:?}")]
    HandshakeTimeout(Duration),
    #[error("expected connect_response, got {0}")]
    UnexpectedResponse(String),
}

/// Notifications for whoever drives the session (console, UI, tests)
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Connected { identity: String },
    Rejected { message: String },
    ReadingSent { identity: String, reading: Reading },
    ServerMessage(Message),
    ConnectionLost { reason: String },
    Disconnected,
    Paused,
    Resumed,
}

/// State visible from the background tasks
struct SessionShared {
    state: Mutex<SessionState>,
    paused: AtomicBool,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionShared {
    fn set_state(&self, state: SessionState) {
        *self.state.lock() = state;
    }

    fn emit(&self, event: SessionEvent) {
        // personne n'écoute : pas une erreur
        let _ = self.events.send(event);
    }
}

/// Everything a background task needs to report a broken connection
#[derive(Clone)]
struct Lifeline {
    shared: Arc<SessionShared>,
    link: CancellationToken,
}

impl Lifeline {
    /// Connected -> Disconnected at most once per connection
    fn fail(&self, reason: String) {
        {
            let mut state = self.shared.state.lock();
            if *state != SessionState::Connected {
                return;
            }
            *state = SessionState::Disconnected;
        }
        warn!("connection lost: {reason}");
        self.link.cancel();
        self.shared.emit(SessionEvent::ConnectionLost { reason });
    }
}

struct Link {
    writer: SharedWriter,
    /// Parent token: cancels the read loop and, through its child, the emitters
    link: CancellationToken,
    emitters: CancellationToken,
    emitter_tasks: Vec<JoinHandle<()>>,
    read_loop: JoinHandle<()>,
}

pub struct ClientSession<S> {
    config: SessionConfig,
    sensor: Arc<Mutex<S>>,
    shared: Arc<SessionShared>,
    identity: String,
    link: Option<Link>,
}

impl<S: SensorSource> ClientSession<S> {
    pub fn new(config: SessionConfig, sensor: S) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let session = Self {
            config,
            sensor: Arc::new(Mutex::new(sensor)),
            shared: Arc::new(SessionShared {
                state: Mutex::new(SessionState::Idle),
                paused: AtomicBool::new(false),
                events,
            }),
            identity: String::new(),
            link: None,
        };
        (session, rx)
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.lock()
    }

    /// Identity bound by the last successful handshake (empty before)
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::SeqCst)
    }

    /// Opens a TCP connection and runs the handshake.
    /// Returns the identity the collector bound the session to.
    pub async fn connect(&mut self, address: &str, identity: &str) -> Result<String, SessionError> {
        self.prepare().await?;
        self.shared.set_state(SessionState::Connecting);
        info!("connecting to {address} as {:?}", identity);

        let stream = match timeout(self.config.connect_timeout, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.shared.set_state(SessionState::Disconnected);
                return Err(SessionError::Transport(e));
            }
            Err(_) => {
                self.shared.set_state(SessionState::Disconnected);
                return Err(SessionError::Transport(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect to {address} timed out"),
                )));
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!("set_nodelay failed: {e}");
        }
        self.handshake(stream, identity).await
    }

    /// Same as `connect` over an already established transport
    pub async fn connect_stream<T>(&mut self, stream: T, identity: &str) -> Result<String, SessionError>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.prepare().await?;
        self.handshake(stream, identity).await
    }

    /// Stops the emitters, says goodbye, closes the transport and waits for
    /// the read loop. Safe to call at any time, any number of times.
    pub async fn disconnect(&mut self) {
        let Some(link) = self.link.take() else {
            return;
        };
        let was_connected = {
            let mut state = self.shared.state.lock();
            let was = *state == SessionState::Connected;
            *state = SessionState::Disconnected;
            was
        };

        link.emitters.cancel();
        for task in link.emitter_tasks {
            let _ = task.await;
        }

        {
            let mut writer = link.writer.lock().await;
            let goodbye = async {
                if was_connected {
                    // best-effort : le serveur peut déjà être parti
                    if let Err(e) = writer.send(&Message::disconnect(self.identity.clone())).await {
                        debug!("disconnect frame not sent: {e}");
                    }
                }
                let _ = writer.shutdown().await;
            };
            if timeout(GOODBYE_TIMEOUT, goodbye).await.is_err() {
                debug!("collector not reading, closing without goodbye");
            }
        }

        link.link.cancel();
        let _ = link.read_loop.await;

        if was_connected {
            info!("disconnected from collector");
            self.shared.emit(SessionEvent::Disconnected);
        }
    }

    pub fn pause(&self) {
        if !self.shared.paused.swap(true, Ordering::SeqCst) {
            self.shared.emit(SessionEvent::Paused);
        }
    }

    pub fn resume(&self) {
        if self.shared.paused.swap(false, Ordering::SeqCst) {
            self.shared.emit(SessionEvent::Resumed);
        }
    }

    async fn prepare(&mut self) -> Result<(), SessionError> {
        if self.state() == SessionState::Connected {
            return Err(SessionError::AlreadyConnected);
        }
        // restes d'une connexion perdue
        self.disconnect().await;
        Ok(())
    }

    async fn handshake<T>(&mut self, stream: T, identity: &str) -> Result<String, SessionError>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.shared.set_state(SessionState::Handshaking);
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = FrameReader::new(read_half);
        let mut writer: FrameWriter<BoxedWriter> = FrameWriter::new(Box::new(write_half));

        let exchange = async {
            writer.send(&Message::connect(identity)).await?;
            match reader.next_message().await? {
                Some(Message {
                    identity: bound,
                    body: MessageBody::ConnectResponse(result),
                    ..
                }) => Ok::<_, SessionError>((bound, result)),
                Some(other) => Err(SessionError::UnexpectedResponse(other.kind().to_string())),
                None => Err(SessionError::Transport(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "collector closed the connection during handshake",
                ))),
            }
        };

        let (bound, result) = match timeout(self.config.handshake_timeout, exchange).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                self.abort_handshake(&mut writer).await;
                return Err(e);
            }
            Err(_) => {
                self.abort_handshake(&mut writer).await;
                return Err(SessionError::HandshakeTimeout(self.config.handshake_timeout));
            }
        };

        if !result.success {
            self.abort_handshake(&mut writer).await;
            warn!("collector refused the session: {}", result.message);
            self.shared.emit(SessionEvent::Rejected {
                message: result.message.clone(),
            });
            return Err(SessionError::HandshakeRejected(result.message));
        }

        self.identity = if bound.is_empty() { identity.to_string() } else { bound };
        self.shared.set_state(SessionState::Connected);
        self.link = Some(self.start_link(reader, writer));
        info!("connected as {}", self.identity);
        self.shared.emit(SessionEvent::Connected {
            identity: self.identity.clone(),
        });
        Ok(self.identity.clone())
    }

    async fn abort_handshake(&self, writer: &mut FrameWriter<BoxedWriter>) {
        self.shared.set_state(SessionState::Disconnected);
        let _ = writer.shutdown().await;
    }

    fn start_link<R>(&self, reader: FrameReader<ReadHalf<R>>, writer: FrameWriter<BoxedWriter>) -> Link
    where
        R: AsyncRead + AsyncWrite + Send + 'static,
    {
        let writer: SharedWriter = Arc::new(tokio::sync::Mutex::new(writer));
        let link = CancellationToken::new();
        let emitters = link.child_token();
        let lifeline = Lifeline {
            shared: self.shared.clone(),
            link: link.clone(),
        };

        let heartbeat = tokio::spawn(heartbeat_loop(
            self.identity.clone(),
            self.config.heartbeat_interval,
            writer.clone(),
            lifeline.clone(),
            emitters.clone(),
        ));
        let data = tokio::spawn(data_loop(
            self.identity.clone(),
            self.config.data_interval,
            self.sensor.clone(),
            writer.clone(),
            lifeline.clone(),
            emitters.clone(),
        ));
        let read_loop = tokio::spawn(read_loop(reader, lifeline));

        Link {
            writer,
            link,
            emitters,
            emitter_tasks: vec![heartbeat, data],
            read_loop,
        }
    }
}

impl<S> Drop for ClientSession<S> {
    fn drop(&mut self) {
        if let Some(link) = &self.link {
            link.link.cancel();
        }
    }
}

/// Un envoi bloqué (collector qui ne lit plus) doit rester annulable
async fn send_frame(writer: &SharedWriter, msg: &Message) -> Result<(), ProtocolError> {
    writer.lock().await.send(msg).await
}

async fn heartbeat_loop(
    identity: String,
    period: Duration,
    writer: SharedWriter,
    lifeline: Lifeline,
    stop: CancellationToken,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {
                let msg = Message::heartbeat(identity.clone());
                let sent = tokio::select! {
                    _ = stop.cancelled() => break,
                    sent = send_frame(&writer, &msg) => sent,
                };
                if let Err(e) = sent {
                    lifeline.fail(format!("heartbeat send failed: {e}"));
                    break;
                }
                debug!("heartbeat sent");
            }
        }
    }
}

async fn data_loop<S: SensorSource>(
    identity: String,
    period: Duration,
    sensor: Arc<Mutex<S>>,
    writer: SharedWriter,
    lifeline: Lifeline,
    stop: CancellationToken,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {
                if lifeline.shared.paused.load(Ordering::SeqCst) {
                    continue;
                }
                let reading = sensor.lock().next_reading();
                let msg = Message::data(identity.clone(), reading);
                let sent = tokio::select! {
                    _ = stop.cancelled() => break,
                    sent = send_frame(&writer, &msg) => sent,
                };
                match sent {
                    Ok(()) => lifeline.shared.emit(SessionEvent::ReadingSent {
                        identity: identity.clone(),
                        reading,
                    }),
                    Err(ProtocolError::InvalidReading(reason)) => {
                        warn!("sensor produced an unsendable reading: {reason}");
                    }
                    Err(e) => {
                        lifeline.fail(format!("data send failed: {e}"));
                        break;
                    }
                }
            }
        }
    }
}

async fn read_loop<R>(mut reader: FrameReader<ReadHalf<R>>, lifeline: Lifeline)
where
    R: AsyncRead + AsyncWrite + Send + 'static,
{
    loop {
        let next = tokio::select! {
            _ = lifeline.link.cancelled() => break,
            next = reader.next_message() => next,
        };
        match next {
            Ok(Some(msg)) => {
                debug!(kind = %msg.kind(), "message from collector");
                lifeline.shared.emit(SessionEvent::ServerMessage(msg));
            }
            Ok(None) => {
                lifeline.fail("collector closed the connection".into());
                break;
            }
            Err(e) => {
                lifeline.fail(format!("receive failed: {e}"));
                break;
            }
        }
    }
}
