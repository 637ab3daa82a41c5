//! A single signaling peer on top of a WebSocket.
//!
//! A [`Connection`] owns the socket halves and an [`Emitter`] scoped to the
//! [`MESSAGE_EVENT`] and [`CLOSE_EVENT`] events. [`Connection::run`] drives two
//! activities: a read task that pulls frames off the socket, and a dispatch loop that
//! emits those frames and sends the periodic heartbeat.

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::error::ProtocolError as WsProtocolError;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Bytes, Message, Utf8Bytes};
use tracing::{debug, error, info, warn};

use crate::emitter::{Emitter, Listener, ListenerToken};

/// Emitted with the raw bytes of every inbound data frame.
pub const MESSAGE_EVENT: &str = "message";
/// Emitted once with a JSON-encoded [`CloseNotice`] when the connection goes away.
pub const CLOSE_EVENT: &str = "close";

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

const HEARTBEAT_FRAME: &str = r#"{"type":"heartbeat","data":""}"#;

// RFC 6455 status codes
const CLOSE_NORMAL: u16 = 1000;
const CLOSE_PROTOCOL_ERROR: u16 = 1002;
const CLOSE_NO_STATUS: u16 = 1005;
const CLOSE_ABNORMAL: u16 = 1006;
const CLOSE_INVALID_PAYLOAD: u16 = 1007;
const CLOSE_POLICY: u16 = 1008;
const CLOSE_TOO_BIG: u16 = 1009;

type FrameSink = Pin<Box<dyn Sink<Message, Error = tungstenite::Error> + Send>>;
type FrameStream = Pin<Box<dyn Stream<Item = Result<Message, tungstenite::Error>> + Send>>;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connection closed")]
    Closed,

    #[error("write timed out after {0:?}")]
    WriteTimeout(Duration),

    #[error("transport error: {0}")]
    Transport(#[from] tungstenite::Error),
}

/// Random label used to tell connections apart in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u32);

impl ConnectionId {
    pub fn generate() -> Self {
        Self(rand::rng().random())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn_{:08x}", self.0)
    }
}

/// Wrapper for outbound text frames using tungstenite's Utf8Bytes.
///
/// Cloning is O(1), so one serialised message can be fanned out to a whole room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage(Utf8Bytes);

impl OutboundMessage {
    pub fn heartbeat() -> Self {
        Self(Utf8Bytes::from_static(HEARTBEAT_FRAME))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn into_inner(self) -> Utf8Bytes {
        self.0
    }
}

impl From<String> for OutboundMessage {
    fn from(s: String) -> Self {
        Self(Utf8Bytes::from(s))
    }
}

/// Payload of the [`CLOSE_EVENT`]. Never sent over the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseNotice {
    pub code: u16,
    pub text: String,
}

impl CloseNotice {
    fn new(code: u16, text: impl Into<String>) -> Self {
        Self {
            code,
            text: text.into(),
        }
    }

    fn local() -> Self {
        Self::new(CLOSE_NORMAL, "connection closed")
    }

    fn from_frame(frame: Option<CloseFrame>) -> Self {
        match frame {
            Some(frame) => Self::new(u16::from(frame.code), frame.reason.as_str()),
            None => Self::new(CLOSE_NO_STATUS, ""),
        }
    }

    fn from_error(e: &tungstenite::Error) -> Self {
        let code = match e {
            tungstenite::Error::Io(_) => CLOSE_POLICY,
            tungstenite::Error::Protocol(WsProtocolError::ResetWithoutClosingHandshake) => {
                CLOSE_ABNORMAL
            }
            tungstenite::Error::Protocol(_) => CLOSE_PROTOCOL_ERROR,
            tungstenite::Error::Capacity(_) => CLOSE_TOO_BIG,
            tungstenite::Error::Utf8(_) => CLOSE_INVALID_PAYLOAD,
            _ => CLOSE_ABNORMAL,
        };
        Self::new(code, e.to_string())
    }

    pub fn to_bytes(&self) -> Bytes {
        let json = serde_json::to_vec(self).expect("CloseNotice serialization should never fail");
        Bytes::from(json)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ConnectionOptions {
    pub heartbeat_interval: Duration,
    pub write_timeout: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }
}

pub struct Connection {
    id: ConnectionId,
    events: Emitter<Bytes>,
    sink: Mutex<FrameSink>,
    /// Taken by the read task when the loop starts.
    stream: parking_lot::Mutex<Option<FrameStream>>,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
    options: ConnectionOptions,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Connection {
    pub fn new<S>(socket: S, options: ConnectionOptions) -> Arc<Self>
    where
        S: Stream<Item = Result<Message, tungstenite::Error>>
            + Sink<Message, Error = tungstenite::Error>
            + Send
            + 'static,
    {
        let (sink, stream) = socket.split();
        let (shutdown, _) = watch::channel(false);

        Arc::new(Self {
            id: ConnectionId::generate(),
            events: Emitter::new(),
            sink: Mutex::new(Box::pin(sink)),
            stream: parking_lot::Mutex::new(Some(Box::pin(stream))),
            closed: AtomicBool::new(false),
            shutdown,
            options,
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Subscribe to [`MESSAGE_EVENT`] or [`CLOSE_EVENT`].
    pub fn on(&self, event: &str, listener: Listener<Bytes>) -> ListenerToken {
        self.events.register(event, listener)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Write one text frame. Concurrent callers are serialised on the write half.
    pub async fn send(&self, message: OutboundMessage) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }

        let mut sink = self.sink.lock().await;
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }

        let timeout = self.options.write_timeout;
        tokio::time::timeout(timeout, sink.send(Message::Text(message.into_inner())))
            .await
            .map_err(|_| ConnectionError::WriteTimeout(timeout))??;
        Ok(())
    }

    /// Shut the connection down. Only the first caller does any work.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        // wake the loop before waiting on any in-flight write
        self.shutdown.send_replace(true);

        let mut sink = self.sink.lock().await;
        match tokio::time::timeout(self.options.write_timeout, sink.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Close handshake with {} failed: {}", self.id, e),
            Err(_) => warn!("Close handshake with {} timed out", self.id),
        }

        info!("Connection {} closed", self.id);
    }

    /// Run the read task and the dispatch loop until the connection closes.
    ///
    /// Every frame handed off by the read task is dispatched before [`CLOSE_EVENT`]
    /// fires, and this returns once the close listeners have finished.
    pub async fn run(self: Arc<Self>) {
        let Some(stream) = self.stream.lock().take() else {
            warn!("Loop for {} is already running", self.id);
            return;
        };

        let (frames_tx, frames_rx) = async_channel::bounded::<Bytes>(1);
        let reader = tokio::spawn(read_loop(Arc::clone(&self), stream, frames_tx));

        let period = self.options.heartbeat_interval;
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut heartbeat_enabled = true;
        let mut shutdown = self.shutdown.subscribe();

        loop {
            tokio::select! {
                _ = closed(&mut shutdown) => break,

                // only fails once the read task is gone and the handoff is drained
                frame = frames_rx.recv() => match frame {
                    Ok(data) => {
                        debug!("{} bytes from {}", data.len(), self.id);
                        self.events.emit(MESSAGE_EVENT, data).await;
                    }
                    Err(_) => break,
                },

                _ = heartbeat.tick(), if heartbeat_enabled => {
                    match self.send(OutboundMessage::heartbeat()).await {
                        Ok(()) => debug!("Heartbeat sent to {}", self.id),
                        Err(e) => {
                            error!("Heartbeat to {} failed, stopping heartbeat: {}", self.id, e);
                            heartbeat_enabled = false;
                        }
                    }
                }
            }
        }

        drop(frames_rx);
        let notice = match reader.await {
            Ok(notice) => notice,
            Err(e) => {
                error!("Read task for {} failed: {}", self.id, e);
                CloseNotice::new(CLOSE_ABNORMAL, "read task failed")
            }
        };

        self.events.emit(CLOSE_EVENT, notice.to_bytes()).await;
        self.close().await;
        debug!("Loop for {} finished", self.id);
    }
}

/// Resolves once the connection has been marked closed.
async fn closed(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|closed| *closed).await;
}

/// Pull frames off the socket until it ends, returning why it ended.
async fn read_loop(
    conn: Arc<Connection>,
    mut stream: FrameStream,
    frames: async_channel::Sender<Bytes>,
) -> CloseNotice {
    let mut shutdown = conn.shutdown.subscribe();

    loop {
        let next = tokio::select! {
            _ = closed(&mut shutdown) => return CloseNotice::local(),
            next = stream.next() => next,
        };

        let data = match next {
            Some(Ok(Message::Text(text))) => Bytes::from(text),
            Some(Ok(Message::Binary(data))) => data,
            Some(Ok(Message::Close(frame))) => {
                let notice = CloseNotice::from_frame(frame);
                warn!(
                    "Close received from {}: {} {}",
                    conn.id, notice.code, notice.text
                );
                return notice;
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                warn!("Read error on {}: {}", conn.id, e);
                return CloseNotice::from_error(&e);
            }
            None => return CloseNotice::new(CLOSE_ABNORMAL, "stream ended"),
        };

        if frames.send(data).await.is_err() {
            return CloseNotice::local();
        }
    }
}
