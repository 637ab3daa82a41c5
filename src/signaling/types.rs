use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::messages::ServerMessage;
use crate::connection::{Connection, OutboundMessage};

/// Signaling server errors
#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("internal error: {0}")]
    Internal(String),
}

/// Participant identity as announced in `joinRoom`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserInfo {
    pub id: String,
    pub name: String,
}

/// A participant bound to the connection it joined from.
///
/// The connection is shared, not owned: closing it leaves the record in place until
/// the room manager evicts it.
#[derive(Debug)]
pub(crate) struct User {
    pub info: UserInfo,
    pub conn: Arc<Connection>,
}

/// One frame queued for one connection.
#[derive(Debug)]
pub(crate) struct Delivery {
    pub conn: Arc<Connection>,
    pub message: OutboundMessage,
}

#[derive(Debug)]
pub(crate) struct Room {
    pub id: String,
    users: HashMap<String, User>,
}

impl Room {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            users: HashMap::new(),
        }
    }

    /// Insert `user`, replacing any user with the same id. Returns the replaced one.
    pub fn add_user(&mut self, user: User) -> Option<User> {
        self.users.insert(user.info.id.clone(), user)
    }

    pub fn remove_user(&mut self, id: &str) -> Option<User> {
        self.users.remove(id)
    }

    pub fn get_user(&self, id: &str) -> Option<&User> {
        self.users.get(id)
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn user_infos(&self) -> Vec<UserInfo> {
        self.users.values().map(|u| u.info.clone()).collect()
    }

    /// The user that joined through `conn`, if any.
    pub fn find_by_connection(&self, conn: &Arc<Connection>) -> Option<&User> {
        self.users.values().find(|u| Arc::ptr_eq(&u.conn, conn))
    }

    /// Queue `msg` for every user, skipping the one on `except`.
    pub fn broadcast(&self, msg: &ServerMessage, except: Option<&Arc<Connection>>) -> Vec<Delivery> {
        let message = msg.to_outbound();
        self.users
            .values()
            .filter(|u| except.is_none_or(|skip| !Arc::ptr_eq(&u.conn, skip)))
            .map(|u| Delivery {
                conn: Arc::clone(&u.conn),
                message: message.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{pair, quiet};

    fn info(id: &str, name: &str) -> UserInfo {
        UserInfo {
            id: id.into(),
            name: name.into(),
        }
    }

    #[tokio::test]
    async fn rejoin_overwrites_the_slot() {
        let (first, _c1) = pair(quiet()).await;
        let (second, _c2) = pair(quiet()).await;
        let mut room = Room::new("r1");

        assert!(room.add_user(User { info: info("u1", "Alice"), conn: first }).is_none());
        let replaced = room.add_user(User {
            info: info("u1", "Alicia"),
            conn: Arc::clone(&second),
        });

        assert_eq!(replaced.unwrap().info.name, "Alice");
        assert_eq!(room.len(), 1);
        let user = room.get_user("u1").unwrap();
        assert_eq!(user.info.name, "Alicia");
        assert!(Arc::ptr_eq(&user.conn, &second));
    }

    #[tokio::test]
    async fn find_by_connection_uses_identity() {
        let (alice, _c1) = pair(quiet()).await;
        let (bob, _c2) = pair(quiet()).await;
        let (stranger, _c3) = pair(quiet()).await;
        let mut room = Room::new("r1");
        room.add_user(User { info: info("u1", "Alice"), conn: Arc::clone(&alice) });
        room.add_user(User { info: info("u2", "Bob"), conn: Arc::clone(&bob) });

        assert_eq!(room.find_by_connection(&bob).unwrap().info.id, "u2");
        assert!(room.find_by_connection(&stranger).is_none());
    }

    #[tokio::test]
    async fn broadcast_skips_the_excepted_connection() {
        let (alice, _c1) = pair(quiet()).await;
        let (bob, _c2) = pair(quiet()).await;
        let mut room = Room::new("r1");
        room.add_user(User { info: info("u1", "Alice"), conn: Arc::clone(&alice) });
        room.add_user(User { info: info("u2", "Bob"), conn: Arc::clone(&bob) });

        let msg = ServerMessage::LeaveRoom("u1".into());
        let all = room.broadcast(&msg, None);
        assert_eq!(all.len(), 2);

        let others = room.broadcast(&msg, Some(&alice));
        assert_eq!(others.len(), 1);
        assert!(Arc::ptr_eq(&others[0].conn, &bob));
        assert_eq!(others[0].message.as_str(), r#"{"type":"leaveRoom","data":"u1"}"#);
    }

    #[tokio::test]
    async fn remove_last_user_empties_the_room() {
        let (alice, _c1) = pair(quiet()).await;
        let mut room = Room::new("r1");
        room.add_user(User { info: info("u1", "Alice"), conn: alice });

        assert_eq!(room.user_infos(), vec![info("u1", "Alice")]);
        assert!(room.remove_user("u1").is_some());
        assert!(room.remove_user("u1").is_none());
        assert!(room.is_empty());
    }
}
