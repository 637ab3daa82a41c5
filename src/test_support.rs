use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::DuplexStream;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::{self, Message};

use crate::connection::{Connection, ConnectionOptions};

pub(crate) type Client = WebSocketStream<DuplexStream>;

pub(crate) const WAIT: Duration = Duration::from_secs(5);

/// Options with a heartbeat slow enough to never show up in a test.
pub(crate) fn quiet() -> ConnectionOptions {
    ConnectionOptions {
        heartbeat_interval: Duration::from_secs(3600),
        ..ConnectionOptions::default()
    }
}

async fn sockets() -> (WebSocketStream<DuplexStream>, Client) {
    let (server_io, client_io) = tokio::io::duplex(64 * 1024);
    let server = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
    let client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
    (server, client)
}

/// A server-side connection and the client end of the same in-memory socket.
pub(crate) async fn pair(options: ConnectionOptions) -> (Arc<Connection>, Client) {
    let (server, client) = sockets().await;
    (Connection::new(server, options), client)
}

/// Like [`pair`], but the server side records what is done to its write half.
pub(crate) async fn tapped_pair(
    options: ConnectionOptions,
) -> (Arc<Connection>, Client, Arc<SinkTap>) {
    let (server, client) = sockets().await;
    let tap = Arc::new(SinkTap::default());
    let socket = TappedSocket {
        inner: server,
        tap: Arc::clone(&tap),
    };
    (Connection::new(socket, options), client, tap)
}

#[derive(Default)]
pub(crate) struct SinkTap {
    /// Frames handed to the socket, including ones that were refused.
    pub writes: AtomicUsize,
    /// Completed close handshakes.
    pub closes: AtomicUsize,
    /// Refuse every write with a broken pipe while set.
    pub fail_writes: AtomicBool,
}

struct TappedSocket {
    inner: WebSocketStream<DuplexStream>,
    tap: Arc<SinkTap>,
}

impl Stream for TappedSocket {
    type Item = Result<Message, tungstenite::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl Sink<Message> for TappedSocket {
    type Error = tungstenite::Error;

    fn poll_ready(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.inner).poll_ready(cx)
    }

    fn start_send(mut self: Pin<&mut Self>, item: Message) -> Result<(), Self::Error> {
        self.tap.writes.fetch_add(1, Ordering::SeqCst);
        if self.tap.fail_writes.load(Ordering::SeqCst) {
            return Err(tungstenite::Error::Io(io::Error::from(io::ErrorKind::BrokenPipe)));
        }
        Pin::new(&mut self.inner).start_send(item)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        let result = Pin::new(&mut self.inner).poll_close(cx);
        if result.is_ready() {
            self.tap.closes.fetch_add(1, Ordering::SeqCst);
        }
        result
    }
}

pub(crate) async fn send_json(client: &mut Client, value: serde_json::Value) {
    client
        .send(Message::text(value.to_string()))
        .await
        .expect("client send failed");
}

/// Next text frame from the server, skipping heartbeats.
pub(crate) async fn recv_text(client: &mut Client) -> String {
    loop {
        let message = tokio::time::timeout(WAIT, client.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .expect("read error");

        if let Message::Text(text) = message {
            if !text.as_str().contains(r#""type":"heartbeat""#) {
                return text.as_str().to_owned();
            }
        }
    }
}

pub(crate) async fn recv_json(client: &mut Client) -> serde_json::Value {
    let text = recv_text(client).await;
    serde_json::from_str(&text).expect("server sent invalid json")
}

/// Assert nothing but heartbeats arrives within a short window.
pub(crate) async fn assert_silent(client: &mut Client) {
    let window = Duration::from_millis(150);
    if let Ok(Some(Ok(Message::Text(text)))) = tokio::time::timeout(window, client.next()).await {
        panic!("unexpected frame: {}", text.as_str());
    }
}
