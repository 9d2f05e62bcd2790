// Broker session over TCP: the CONNECT handshake, subscriptions, the inbound
// frame stream, and a cloneable sender shared by every outbound publisher.

use super::frame::{FrameError, StompCodec, StompCommand, StompFrame};

use async_trait::async_trait;
use builder_common::{AckMode, Credentials};
use futures::{SinkExt, StreamExt};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, FramedWrite};
use uuid::Uuid;

type FrameReader = FramedRead<OwnedReadHalf, StompCodec>;
type FrameWriter = FramedWrite<OwnedWriteHalf, StompCodec>;

const STOMP_VERSION: &str = "1.2";
const JSON_CONTENT_TYPE: &str = "application/json";

/// Upper bound on one outbound frame from the message loop or a build.
/// The writer is shared, so one stuck write must not park everyone else.
pub const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Await `send`, failing with `SendError::Timeout` after `limit`.
pub async fn send_within<F>(limit: Duration, send: F) -> Result<(), SendError>
where
    F: Future<Output = Result<(), SendError>>,
{
    tokio::time::timeout(limit, send)
        .await
        .map_err(|_| SendError::Timeout)?
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("Failed to connect to broker at {addr}: {source}")]
    Io {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Timed out after {timeout:?} waiting for broker at {addr}")]
    Timeout { addr: String, timeout: Duration },

    #[error("Broker refused the session: {message}")]
    Rejected { message: String },

    #[error("Unexpected {command} frame during handshake")]
    UnexpectedFrame { command: StompCommand },

    #[error("Broker closed the connection during handshake")]
    Closed,

    #[error("Failed to subscribe to {destination}: {source}")]
    Subscribe {
        destination: String,
        #[source]
        source: SendError,
    },

    #[error(transparent)]
    Protocol(#[from] FrameError),
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("Not connected to the broker")]
    NotConnected,

    #[error("Timed out sending to the broker")]
    Timeout,

    #[error("Failed to write to the broker: {0}")]
    Transport(#[from] FrameError),

    #[error("Failed to serialize message: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Outbound side of the broker as seen by publishers.
#[async_trait]
pub trait MessageSink: Send + Sync {
    /// Publish `body` to `destination` with extra headers.
    async fn send(
        &self,
        destination: &str,
        body: &str,
        headers: &[(&str, &str)],
    ) -> Result<(), SendError>;

    /// Acknowledge a received message by its `ack` header value.
    async fn ack(&self, ack_id: &str) -> Result<(), SendError>;
}

// ---------------------------------------------------------------------------
// BrokerSender
// ---------------------------------------------------------------------------

/// Cloneable handle on the write half of the current session.
///
/// Survives reconnects: each new session attaches its writer here, so
/// publishers created at startup keep working.
#[derive(Clone, Default)]
pub struct BrokerSender {
    writer: Arc<Mutex<Option<FrameWriter>>>,
}

impl BrokerSender {
    pub fn new() -> Self {
        Self::default()
    }

    async fn attach(&self, writer: FrameWriter) {
        *self.writer.lock().await = Some(writer);
    }

    /// Drop the current writer. Sends fail with `NotConnected` until the next session.
    pub async fn detach(&self) {
        self.writer.lock().await.take();
    }

    /// Write one frame. A failed write detaches the session.
    pub async fn send_frame(&self, frame: StompFrame) -> Result<(), SendError> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(SendError::NotConnected)?;
        if let Err(e) = writer.send(frame).await {
            *guard = None;
            return Err(e.into());
        }
        Ok(())
    }
}

#[async_trait]
impl MessageSink for BrokerSender {
    async fn send(
        &self,
        destination: &str,
        body: &str,
        headers: &[(&str, &str)],
    ) -> Result<(), SendError> {
        let mut frame = StompFrame::new(StompCommand::Send)
            .header("destination", destination)
            .header("content-type", JSON_CONTENT_TYPE);
        for (key, value) in headers {
            frame = frame.header(*key, *value);
        }
        self.send_frame(frame.body(body.to_string())).await
    }

    async fn ack(&self, ack_id: &str) -> Result<(), SendError> {
        self.send_frame(StompFrame::new(StompCommand::Ack).header("id", ack_id))
            .await
    }
}

// ---------------------------------------------------------------------------
// BrokerConnection
// ---------------------------------------------------------------------------

/// One STOMP session. Owns the read half; writes go through the `BrokerSender`.
pub struct BrokerConnection {
    reader: FrameReader,
    sender: BrokerSender,
    address: String,
    server: Option<String>,
}

impl BrokerConnection {
    /// Open a TCP connection and complete the CONNECT / CONNECTED handshake.
    ///
    /// On success the session's writer is attached to `sender`.
    pub async fn connect(
        host: &str,
        port: u16,
        credentials: Option<&Credentials>,
        timeout: Duration,
        sender: &BrokerSender,
    ) -> Result<Self, ConnectError> {
        let address = format!("{host}:{port}");

        let stream = match tokio::time::timeout(timeout, TcpStream::connect(&address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(ConnectError::Io { addr: address, source }),
            Err(_) => return Err(ConnectError::Timeout { addr: address, timeout }),
        };
        stream
            .set_nodelay(true)
            .map_err(|source| ConnectError::Io {
                addr: address.clone(),
                source,
            })?;

        let (read_half, write_half) = stream.into_split();
        let mut reader = FramedRead::new(read_half, StompCodec::default());
        let mut writer = FramedWrite::new(write_half, StompCodec::default());

        let mut connect = StompFrame::new(StompCommand::Connect)
            .header("accept-version", STOMP_VERSION)
            .header("host", host)
            .header("heart-beat", "0,0");
        if let Some(credentials) = credentials {
            connect = connect
                .header("login", credentials.username.as_str())
                .header("passcode", credentials.password.as_str());
        }
        writer.send(connect).await?;

        let reply = match tokio::time::timeout(timeout, reader.next()).await {
            Ok(Some(reply)) => reply?,
            Ok(None) => return Err(ConnectError::Closed),
            Err(_) => return Err(ConnectError::Timeout { addr: address, timeout }),
        };
        match reply.command {
            StompCommand::Connected => {}
            StompCommand::Error => {
                return Err(ConnectError::Rejected {
                    message: error_message(&reply),
                })
            }
            command => return Err(ConnectError::UnexpectedFrame { command }),
        }

        sender.attach(writer).await;

        Ok(Self {
            reader,
            sender: sender.clone(),
            address,
            server: reply.get_header("server").map(str::to_string),
        })
    }

    /// Subscribe to `destination`. Returns the subscription id.
    pub async fn subscribe(&self, destination: &str, ack: AckMode) -> Result<String, ConnectError> {
        let id = Uuid::new_v4().to_string();
        let frame = StompFrame::new(StompCommand::Subscribe)
            .header("id", id.as_str())
            .header("destination", destination)
            .header("ack", ack.as_header());
        self.sender
            .send_frame(frame)
            .await
            .map_err(|source| ConnectError::Subscribe {
                destination: destination.to_string(),
                source,
            })?;
        Ok(id)
    }

    pub fn sender(&self) -> BrokerSender {
        self.sender.clone()
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Value of the `server` header the broker sent in CONNECTED.
    pub fn server(&self) -> Option<&str> {
        self.server.as_deref()
    }

    /// Next inbound frame, or `None` once the broker closes the stream.
    pub async fn next_frame(&mut self) -> Result<Option<StompFrame>, FrameError> {
        self.reader.next().await.transpose()
    }

    /// Send DISCONNECT and wait up to `timeout` for its receipt.
    pub async fn disconnect(mut self, timeout: Duration) -> Result<(), SendError> {
        let receipt = format!("disconnect-{}", Uuid::new_v4());
        let sent = self
            .sender
            .send_frame(StompFrame::new(StompCommand::Disconnect).header("receipt", receipt.as_str()))
            .await;

        if sent.is_ok() {
            let reader = &mut self.reader;
            let wait_for_receipt = async {
                while let Some(Ok(frame)) = reader.next().await {
                    if frame.command == StompCommand::Receipt
                        && frame.get_header("receipt-id") == Some(receipt.as_str())
                    {
                        break;
                    }
                }
            };
            // The broker may close without a receipt; that is fine too.
            let _ = tokio::time::timeout(timeout, wait_for_receipt).await;
        }

        self.sender.detach().await;
        sent
    }
}

/// Human readable text of a broker ERROR frame.
pub fn error_message(frame: &StompFrame) -> String {
    let header = frame.get_header("message").unwrap_or_default();
    let body = String::from_utf8_lossy(&frame.body);
    let body = body.trim();
    match (header.is_empty(), body.is_empty()) {
        (false, false) => format!("{header} ({body})"),
        (false, true) => header.to_string(),
        (true, false) => body.to_string(),
        (true, true) => "no details".to_string(),
    }
}
