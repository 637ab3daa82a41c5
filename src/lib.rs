//! WebSocket signaling relay: rooms of participants exchanging offer, answer and
//! candidate messages, with per-connection heartbeats.

pub mod config;
pub mod connection;
pub mod emitter;
pub mod signaling;

#[cfg(test)]
mod test_support;
