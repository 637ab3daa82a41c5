//! Room-based WebSocket signaling for peer-to-peer session negotiation

mod actor;
mod messages;
mod server;
mod types;

pub use actor::RoomManagerHandle;
pub use messages::{
    ClientMessage, HangUp, JoinRoom, ProtocolError, RelayKind, RelayTarget, ServerMessage,
};
pub use server::{DEFAULT_SIGNALING_PORT, SignalingServer};
pub use types::{SignalingError, UserInfo};
