use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use super::types::UserInfo;
use crate::connection::OutboundMessage;

pub const JOIN_ROOM: &str = "joinRoom";
pub const OFFER: &str = "offer";
pub const ANSWER: &str = "answer";
pub const CANDIDATE: &str = "candidate";
pub const HANG_UP: &str = "hangUp";

/// Joins the two user ids of a session id.
pub const SESSION_SEPARATOR: char = '-';

/// Reasons an inbound frame is dropped
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed envelope: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("invalid {kind} data: {source}")]
    InvalidData {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("{kind} data has an empty {field}")]
    EmptyField {
        kind: &'static str,
        field: &'static str,
    },

    #[error("unknown message type: {0}")]
    UnknownType(String),

    #[error("invalid session id: {0:?}")]
    InvalidSessionId(String),
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    data: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct JoinRoom {
    pub id: String,
    pub name: String,
    pub room_id: String,
}

/// Addressing fields of an offer/answer/candidate. SDP and ICE fields are not inspected.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RelayTarget {
    pub to: String,
    pub room_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HangUp {
    pub session_id: String,
    pub room_id: String,
}

impl HangUp {
    /// The two user ids the session id is made of, split on the first separator.
    pub fn peers(&self) -> Result<(&str, &str), ProtocolError> {
        match self.session_id.split_once(SESSION_SEPARATOR) {
            Some((a, b)) if !a.is_empty() && !b.is_empty() => Ok((a, b)),
            _ => Err(ProtocolError::InvalidSessionId(self.session_id.clone())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayKind {
    Offer,
    Answer,
    Candidate,
}

impl RelayKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RelayKind::Offer => OFFER,
            RelayKind::Answer => ANSWER,
            RelayKind::Candidate => CANDIDATE,
        }
    }
}

/// Messages sent from client to server
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    JoinRoom(JoinRoom),

    /// Forwarded to `target.to` as the untouched original frame
    Relay {
        kind: RelayKind,
        target: RelayTarget,
        envelope: OutboundMessage,
    },

    HangUp(HangUp),
}

impl ClientMessage {
    pub fn parse(frame: &[u8]) -> Result<Self, ProtocolError> {
        let envelope: Envelope = serde_json::from_slice(frame).map_err(ProtocolError::Malformed)?;
        let data = Value::Object(envelope.data);

        match envelope.kind.as_str() {
            JOIN_ROOM => {
                let join: JoinRoom = decode(JOIN_ROOM, data)?;
                require(JOIN_ROOM, "id", &join.id)?;
                require(JOIN_ROOM, "room_id", &join.room_id)?;
                Ok(ClientMessage::JoinRoom(join))
            }
            OFFER | ANSWER | CANDIDATE => {
                let kind = match envelope.kind.as_str() {
                    OFFER => RelayKind::Offer,
                    ANSWER => RelayKind::Answer,
                    _ => RelayKind::Candidate,
                };
                let target = decode(kind.as_str(), data)?;
                // from_slice succeeded, so the frame is valid UTF-8
                let text = String::from_utf8_lossy(frame).into_owned();
                Ok(ClientMessage::Relay {
                    kind,
                    target,
                    envelope: OutboundMessage::from(text),
                })
            }
            HANG_UP => {
                let hang_up: HangUp = decode(HANG_UP, data)?;
                hang_up.peers()?;
                Ok(ClientMessage::HangUp(hang_up))
            }
            other => Err(ProtocolError::UnknownType(other.to_string())),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::JoinRoom(_) => JOIN_ROOM,
            ClientMessage::Relay { kind, .. } => kind.as_str(),
            ClientMessage::HangUp(_) => HANG_UP,
        }
    }
}

fn decode<T: DeserializeOwned>(kind: &'static str, data: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(data).map_err(|source| ProtocolError::InvalidData { kind, source })
}

fn require(kind: &'static str, field: &'static str, value: &str) -> Result<(), ProtocolError> {
    if value.is_empty() {
        return Err(ProtocolError::EmptyField { kind, field });
    }
    Ok(())
}

/// Messages sent from server to client
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum ServerMessage {
    /// Everyone currently in the room
    #[serde(rename = "updateUserList")]
    UpdateUserList(Vec<UserInfo>),

    /// Id of the user that left
    #[serde(rename = "leaveRoom")]
    LeaveRoom(String),

    #[serde(rename = "hangUp")]
    HangUp { to: String, session_id: String },
}

impl ServerMessage {
    pub fn to_outbound(&self) -> OutboundMessage {
        let json =
            serde_json::to_string(self).expect("ServerMessage serialization should never fail");
        OutboundMessage::from(json)
    }
}
