use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Bytes;
use tracing::{debug, info, warn};

use super::messages::{ClientMessage, HangUp, ServerMessage};
use super::types::{Delivery, Room, SignalingError, User, UserInfo};
use crate::connection::{CLOSE_EVENT, Connection, MESSAGE_EVENT, OutboundMessage};
use crate::emitter::listener;

const COMMAND_BUFFER: usize = 1024;

/// Commands sent to the room manager actor
pub(crate) enum RoomCommand {
    Join {
        info: UserInfo,
        room_id: String,
        conn: Arc<Connection>,
        reply: oneshot::Sender<Vec<Delivery>>,
    },
    Relay {
        room_id: String,
        to: String,
        envelope: OutboundMessage,
        reply: oneshot::Sender<Vec<Delivery>>,
    },
    HangUp {
        hang_up: HangUp,
        reply: oneshot::Sender<Vec<Delivery>>,
    },
    Leave {
        conn: Arc<Connection>,
        reply: oneshot::Sender<Vec<Delivery>>,
    },
    Members {
        room_id: String,
        reply: oneshot::Sender<Option<Vec<UserInfo>>>,
    },
    RoomCount {
        reply: oneshot::Sender<usize>,
    },
}

/// All rooms. Owned by the actor task, so every mutation is serialised.
///
/// Methods return the frames to write instead of writing them; the caller sends them
/// after the actor has moved on.
#[derive(Debug, Default)]
pub(crate) struct RoomRegistry {
    rooms: HashMap<String, Room>,
}

impl RoomRegistry {
    pub fn join(&mut self, info: UserInfo, room_id: String, conn: Arc<Connection>) -> Vec<Delivery> {
        let room = self.rooms.entry(room_id).or_insert_with_key(|id| {
            info!("Room created: {}", id);
            Room::new(id.clone())
        });

        let user_id = info.id.clone();
        match room.add_user(User { info, conn }) {
            Some(_) => info!("User {} rejoined room {}", user_id, room.id),
            None => info!("User {} joined room {} ({} users)", user_id, room.id, room.len()),
        }

        room.broadcast(&ServerMessage::UpdateUserList(room.user_infos()), None)
    }

    pub fn relay(&self, room_id: &str, to: &str, envelope: OutboundMessage) -> Vec<Delivery> {
        let Some(room) = self.rooms.get(room_id) else {
            warn!("Room {} not found, dropping message for {}", room_id, to);
            return Vec::new();
        };

        match room.get_user(to) {
            Some(user) => vec![Delivery {
                conn: Arc::clone(&user.conn),
                message: envelope,
            }],
            None => {
                warn!("User {} not found in room {}", to, room_id);
                Vec::new()
            }
        }
    }

    /// Notify both parties of the session, each tagged with its own id.
    pub fn hang_up(&self, hang_up: &HangUp) -> Vec<Delivery> {
        let Ok((self_id, peer_id)) = hang_up.peers() else {
            warn!("Invalid session id {:?}", hang_up.session_id);
            return Vec::new();
        };
        let Some(room) = self.rooms.get(&hang_up.room_id) else {
            warn!("Room {} not found, dropping hang up", hang_up.room_id);
            return Vec::new();
        };

        let mut deliveries = Vec::with_capacity(2);
        for id in [self_id, peer_id] {
            match room.get_user(id) {
                Some(user) => {
                    let msg = ServerMessage::HangUp {
                        to: id.to_string(),
                        session_id: hang_up.session_id.clone(),
                    };
                    deliveries.push(Delivery {
                        conn: Arc::clone(&user.conn),
                        message: msg.to_outbound(),
                    });
                }
                None => warn!("User {} not found in room {}", id, room.id),
            }
        }
        deliveries
    }

    /// Evict the user that joined through `conn` and tell the rest of its room.
    pub fn leave(&mut self, conn: &Arc<Connection>) -> Vec<Delivery> {
        let found = self.rooms.values().find_map(|room| {
            room.find_by_connection(conn)
                .map(|user| (room.id.clone(), user.info.id.clone()))
        });

        let Some((room_id, user_id)) = found else {
            warn!("No room found for closed connection {}", conn.id());
            return Vec::new();
        };
        let Some(room) = self.rooms.get_mut(&room_id) else {
            return Vec::new();
        };

        let mut deliveries = room.broadcast(&ServerMessage::LeaveRoom(user_id.clone()), Some(conn));
        room.remove_user(&user_id);
        deliveries.extend(room.broadcast(&ServerMessage::UpdateUserList(room.user_infos()), None));
        info!("User {} left room {}", user_id, room_id);

        if room.is_empty() {
            self.rooms.remove(&room_id);
            info!("Room {} removed (empty)", room_id);
        }

        deliveries
    }

    pub fn members(&self, room_id: &str) -> Option<Vec<UserInfo>> {
        self.rooms.get(room_id).map(Room::user_infos)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}

pub(crate) async fn room_manager_actor(mut rx: mpsc::Receiver<RoomCommand>) {
    let mut registry = RoomRegistry::default();

    while let Some(cmd) = rx.recv().await {
        match cmd {
            RoomCommand::Join {
                info,
                room_id,
                conn,
                reply,
            } => {
                let _ = reply.send(registry.join(info, room_id, conn));
            }

            RoomCommand::Relay {
                room_id,
                to,
                envelope,
                reply,
            } => {
                let _ = reply.send(registry.relay(&room_id, &to, envelope));
            }

            RoomCommand::HangUp { hang_up, reply } => {
                let _ = reply.send(registry.hang_up(&hang_up));
            }

            RoomCommand::Leave { conn, reply } => {
                let _ = reply.send(registry.leave(&conn));
            }

            RoomCommand::Members { room_id, reply } => {
                let _ = reply.send(registry.members(&room_id));
            }

            RoomCommand::RoomCount { reply } => {
                let _ = reply.send(registry.room_count());
            }
        }
    }

    debug!("Room manager stopped");
}

/// Handle to communicate with the room manager actor
#[derive(Clone)]
pub struct RoomManagerHandle {
    pub(crate) tx: mpsc::Sender<RoomCommand>,
}

impl RoomManagerHandle {
    /// Start the room manager actor on the current runtime.
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::channel::<RoomCommand>(COMMAND_BUFFER);
        tokio::spawn(room_manager_actor(rx));
        Self { tx }
    }

    /// Route `conn`'s `"message"` and `"close"` events into this manager.
    ///
    /// Call once per connection, before its loop starts.
    pub fn attach(&self, conn: &Arc<Connection>) {
        let manager = self.clone();
        let weak = Arc::downgrade(conn);
        conn.on(
            MESSAGE_EVENT,
            listener(move |frame: Bytes| {
                let manager = manager.clone();
                let weak = weak.clone();
                async move {
                    if let Some(conn) = weak.upgrade() {
                        manager.handle_frame(&conn, &frame).await;
                    }
                }
            }),
        );

        let manager = self.clone();
        let weak = Arc::downgrade(conn);
        conn.on(
            CLOSE_EVENT,
            listener(move |_notice: Bytes| {
                let manager = manager.clone();
                let weak = weak.clone();
                async move {
                    if let Some(conn) = weak.upgrade() {
                        if let Err(e) = manager.leave(&conn).await {
                            warn!("Failed to evict {}: {}", conn.id(), e);
                        }
                    }
                }
            }),
        );
    }

    /// Parse and route one inbound frame. Bad frames are logged and dropped.
    pub async fn handle_frame(&self, conn: &Arc<Connection>, frame: &[u8]) {
        let msg = match ClientMessage::parse(frame) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("Dropping frame from {}: {}", conn.id(), e);
                return;
            }
        };
        debug!("{} request from {}", msg.kind(), conn.id());

        let result = match msg {
            ClientMessage::JoinRoom(join) => {
                let info = UserInfo {
                    id: join.id,
                    name: join.name,
                };
                self.join_room(info, join.room_id, Arc::clone(conn)).await
            }
            ClientMessage::Relay {
                target, envelope, ..
            } => self.relay(target.room_id, target.to, envelope).await,
            ClientMessage::HangUp(hang_up) => self.hang_up(hang_up).await,
        };

        if let Err(e) = result {
            warn!("Message handling error: {}", e);
        }
    }

    /// Add or replace a user in a room, creating the room on first join, and send the
    /// new user list to everyone in it.
    pub async fn join_room(
        &self,
        info: UserInfo,
        room_id: String,
        conn: Arc<Connection>,
    ) -> Result<(), SignalingError> {
        let deliveries = self
            .request(|reply| RoomCommand::Join {
                info,
                room_id,
                conn,
                reply,
            })
            .await?;
        deliver(deliveries).await;
        Ok(())
    }

    /// Forward an offer/answer/candidate frame to user `to` in `room_id`.
    pub async fn relay(
        &self,
        room_id: String,
        to: String,
        envelope: OutboundMessage,
    ) -> Result<(), SignalingError> {
        let deliveries = self
            .request(|reply| RoomCommand::Relay {
                room_id,
                to,
                envelope,
                reply,
            })
            .await?;
        deliver(deliveries).await;
        Ok(())
    }

    pub async fn hang_up(&self, hang_up: HangUp) -> Result<(), SignalingError> {
        let deliveries = self
            .request(|reply| RoomCommand::HangUp { hang_up, reply })
            .await?;
        deliver(deliveries).await;
        Ok(())
    }

    /// Evict whoever joined through `conn`.
    pub async fn leave(&self, conn: &Arc<Connection>) -> Result<(), SignalingError> {
        let conn = Arc::clone(conn);
        let deliveries = self
            .request(|reply| RoomCommand::Leave { conn, reply })
            .await?;
        deliver(deliveries).await;
        Ok(())
    }

    /// Users currently in `room_id`, or `None` if there is no such room.
    pub async fn members(&self, room_id: &str) -> Result<Option<Vec<UserInfo>>, SignalingError> {
        let room_id = room_id.to_string();
        self.request(|reply| RoomCommand::Members { room_id, reply })
            .await
    }

    pub async fn room_count(&self) -> Result<usize, SignalingError> {
        self.request(|reply| RoomCommand::RoomCount { reply }).await
    }

    async fn request<R>(
        &self,
        make: impl FnOnce(oneshot::Sender<R>) -> RoomCommand,
    ) -> Result<R, SignalingError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| SignalingError::Internal("actor channel closed".to_string()))?;
        reply_rx
            .await
            .map_err(|_| SignalingError::Internal("actor dropped the reply".to_string()))
    }
}

async fn deliver(deliveries: Vec<Delivery>) {
    for Delivery { conn, message } in deliveries {
        if let Err(e) = conn.send(message).await {
            warn!("Failed to send to {}: {}", conn.id(), e);
        }
    }
}
