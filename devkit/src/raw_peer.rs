/*!
Pair TCP brut pour parler le protocole SensorLink sans session

Permet d'envoyer n'importe quelle séquence de frames (y compris invalides)
au collector et d'observer ses réponses, là où ClientSession impose le
déroulé normal.
*/

use anyhow::{bail, Result};
use sensorlink_protocol::{encode, FrameReader, Message, MessageBody, ProtocolError, Reading};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Réponse du collector à un Connect
#[derive(Debug, Clone, PartialEq)]
pub struct Handshake {
    pub identity: String,
    pub success: bool,
    pub message: String,
}

pub struct RawPeer {
    reader: FrameReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl RawPeer {
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            reader: FrameReader::new(read_half),
            writer: write_half,
        })
    }

    pub async fn send(&mut self, msg: &Message) -> Result<()> {
        let frame = encode(msg)?;
        self.writer.write_all(&frame).await?;
        Ok(())
    }

    /// Écrit des octets tels quels (frames invalides, frames coupées)
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.writer.write_all(bytes).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Prochain message, None si le collector a fermé la connexion
    pub async fn recv(&mut self, wait: Duration) -> Result<Option<Message>> {
        match timeout(wait, self.reader.next_message()).await {
            Ok(Ok(msg)) => Ok(msg),
            Ok(Err(ProtocolError::Io(_))) => Ok(None),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => bail!("no message from collector within {wait:?}"),
        }
    }

    /// Connect + attente du connect_response
    pub async fn handshake(&mut self, identity: &str) -> Result<Handshake> {
        self.send(&Message::connect(identity)).await?;
        match self.recv(Duration::from_secs(2)).await? {
            Some(Message {
                identity,
                body: MessageBody::ConnectResponse(result),
                ..
            }) => {
                log::info!("🤝 handshake for {identity}: success={}", result.success);
                Ok(Handshake {
                    identity,
                    success: result.success,
                    message: result.message,
                })
            }
            Some(other) => bail!("expected connect_response, got {}", other.kind()),
            None => bail!("collector closed the connection during handshake"),
        }
    }

    pub async fn heartbeat(&mut self, identity: &str) -> Result<()> {
        self.send(&Message::heartbeat(identity)).await
    }

    pub async fn data(&mut self, identity: &str, temperature: f64, humidity: f64) -> Result<()> {
        self.send(&Message::data(identity, Reading::new(temperature, humidity))).await
    }

    pub async fn disconnect(&mut self, identity: &str) -> Result<()> {
        self.send(&Message::disconnect(identity)).await
    }

    /// true si le collector ferme la connexion dans le délai
    pub async fn expect_closed(&mut self, wait: Duration) -> Result<bool> {
        match timeout(wait, self.reader.next_message()).await {
            Ok(Ok(None)) | Ok(Err(ProtocolError::Io(_))) => Ok(true),
            Ok(Ok(Some(msg))) => bail!("expected close, got {}", msg.kind()),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Ok(false),
        }
    }
}
