use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tracing::{error, info, warn};

use super::actor::RoomManagerHandle;
use crate::config::Config;
use crate::connection::{Connection, ConnectionOptions};

pub const DEFAULT_SIGNALING_PORT: u16 = 3479;

pub struct SignalingServer {
    listener: TcpListener,
    handle: RoomManagerHandle,
    ws_path: Arc<str>,
    options: ConnectionOptions,
}

impl SignalingServer {
    /// Bind the listener and start the room manager.
    pub async fn bind(config: &Config) -> std::io::Result<Self> {
        let listener = TcpListener::bind(config.server.socket_addr()).await?;
        info!(
            "Signaling server listening on {}{}",
            listener.local_addr()?,
            config.server.ws_path
        );

        Ok(Self {
            listener,
            handle: RoomManagerHandle::spawn(),
            ws_path: Arc::from(config.server.ws_path.as_str()),
            options: config.ws.connection_options(),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` resolves.
    pub async fn run_until(self, shutdown: impl Future<Output = ()>) -> std::io::Result<()> {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Signaling server shutting down");
                    return Ok(());
                }

                accepted = self.listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!("Accept failed: {}", e);
                            continue;
                        }
                    };

                    let handle = self.handle.clone();
                    let ws_path = Arc::clone(&self.ws_path);
                    let options = self.options;

                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, addr, handle, ws_path, options).await {
                            error!("Connection error from {}: {}", addr, e);
                        }
                    });
                }
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    handle: RoomManagerHandle,
    ws_path: Arc<str>,
    options: ConnectionOptions,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let check_path = |request: &Request, response: Response| {
        if request.uri().path() == &*ws_path {
            Ok(response)
        } else {
            let mut rejection = ErrorResponse::new(Some("not found".to_string()));
            *rejection.status_mut() = StatusCode::NOT_FOUND;
            Err(rejection)
        }
    };
    let ws_stream = tokio_tungstenite::accept_hdr_async(stream, check_path).await?;

    let conn = Connection::new(ws_stream, options);
    info!("WebSocket connection from {} as {}", addr, conn.id());

    handle.attach(&conn);
    conn.run().await;

    info!("WebSocket disconnected: {}", addr);
    Ok(())
}
