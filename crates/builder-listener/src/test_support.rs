// Helpers shared by the listener's unit tests: an in-process STOMP broker,
// a sink that records outbound messages, and fake build programs.

use crate::broker::{MessageSink, SendError, StompCodec, StompCommand, StompFrame};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;

pub type ServerStream = Framed<TcpStream, StompCodec>;

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// FakeBroker
// ---------------------------------------------------------------------------

pub struct FakeBroker {
    listener: TcpListener,
}

impl FakeBroker {
    pub async fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        Self { listener }
    }

    pub fn port(&self) -> u16 {
        self.listener.local_addr().unwrap().port()
    }

    pub async fn accept(&self) -> ServerStream {
        let (socket, _) = tokio::time::timeout(TEST_TIMEOUT, self.listener.accept())
            .await
            .expect("client never connected")
            .unwrap();
        Framed::new(socket, StompCodec::default())
    }

    /// Accept a client, read its CONNECT and answer CONNECTED.
    pub async fn accept_session(&self) -> (ServerStream, StompFrame) {
        let mut stream = self.accept().await;
        let connect = expect_frame(&mut stream, StompCommand::Connect).await;
        stream
            .send(
                StompFrame::new(StompCommand::Connected)
                    .header("version", "1.2")
                    .header("server", "fake-broker"),
            )
            .await
            .unwrap();
        (stream, connect)
    }
}

/// Read frames until one with `command` arrives.
pub async fn expect_frame(stream: &mut ServerStream, command: StompCommand) -> StompFrame {
    let next = async {
        loop {
            let frame = stream
                .next()
                .await
                .expect("client closed the connection")
                .unwrap();
            if frame.command == command {
                return frame;
            }
        }
    };
    tokio::time::timeout(TEST_TIMEOUT, next)
        .await
        .unwrap_or_else(|_| panic!("no {command} frame received"))
}

/// A MESSAGE frame as the broker would deliver it.
pub fn message(destination: &str, body: &str) -> StompFrame {
    StompFrame::new(StompCommand::Message)
        .header("destination", destination)
        .header("message-id", "ID:fake-1")
        .header("subscription", "sub-0")
        .header("ack", "ack-1")
        .body(body.to_string())
}

// ---------------------------------------------------------------------------
// RecordingSink
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub destination: String,
    pub body: String,
    pub headers: Vec<(String, String)>,
}

impl SentMessage {
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn json(&self) -> serde_json::Value {
        serde_json::from_str(&self.body).unwrap()
    }
}

#[derive(Default)]
pub struct RecordingSink {
    sent: Mutex<Vec<SentMessage>>,
    acks: Mutex<Vec<String>>,
    fail_sends: AtomicBool,
    stall_sends: AtomicBool,
    stall_acks: AtomicBool,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later send fail with `NotConnected`.
    pub fn fail_sends(&self) {
        self.fail_sends.store(true, Ordering::SeqCst);
    }

    /// Make every later send hang, like a write on a half-dead socket.
    pub fn stall_sends(&self) {
        self.stall_sends.store(true, Ordering::SeqCst);
    }

    /// Make every later ack hang.
    pub fn stall_acks(&self) {
        self.stall_acks.store(true, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().clone()
    }

    pub fn sent_to(&self, destination: &str) -> Vec<SentMessage> {
        self.sent
            .lock()
            .iter()
            .filter(|m| m.destination == destination)
            .cloned()
            .collect()
    }

    pub fn acks(&self) -> Vec<String> {
        self.acks.lock().clone()
    }

    /// Wait until at least `count` messages went to `destination`.
    pub async fn wait_for(&self, destination: &str, count: usize) -> Vec<SentMessage> {
        let deadline = tokio::time::Instant::now() + TEST_TIMEOUT;
        loop {
            let sent = self.sent_to(destination);
            if sent.len() >= count {
                return sent;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("expected {count} messages on {destination}, got {}", sent.len());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[async_trait]
impl MessageSink for RecordingSink {
    async fn send(
        &self,
        destination: &str,
        body: &str,
        headers: &[(&str, &str)],
    ) -> Result<(), SendError> {
        if self.stall_sends.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(SendError::NotConnected);
        }
        self.sent.lock().push(SentMessage {
            destination: destination.to_string(),
            body: body.to_string(),
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        });
        Ok(())
    }

    async fn ack(&self, ack_id: &str) -> Result<(), SendError> {
        if self.stall_acks.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.acks.lock().push(ack_id.to_string());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Fake build programs
// ---------------------------------------------------------------------------

/// Write an executable shell script into `dir`.
#[cfg(unix)]
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Poll `path` until it exists.
pub async fn wait_for_file(path: &Path) {
    let deadline = tokio::time::Instant::now() + TEST_TIMEOUT;
    while !path.exists() {
        if tokio::time::Instant::now() >= deadline {
            panic!("{} never appeared", path.display());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
