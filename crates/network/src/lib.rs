//! Transport layer: framed JSON over TCP.
//!
//! One command listener serves requests from peers and local tools, one
//! publication listener fans publications out to subscribers, and each
//! configured peer gets an outgoing [`PeerLink`] that reconnects on its
//! own and surfaces solicited responses as [`LinkEvent`]s.

use thiserror::Error;

pub mod codec;
pub mod link;
pub mod listener;

pub use codec::{CodecError, JsonCodec};
pub use link::{LinkEvent, PeerLink};
pub use listener::{spawn_cmd_server, spawn_pub_fanout, ReplyHandle, ServerEvent};

/// Why a send to a peer did not happen. Never fatal: callers count the
/// failure and retry under backoff.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("send queue to peer {peer} is full")]
    QueueFull { peer: String },
    #[error("link to peer {peer} is closed")]
    Closed { peer: String },
}

impl TransportError {
    /// Short tag used in per-peer failure counters.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::QueueFull { .. } => "queue_full",
            Self::Closed { .. } => "closed",
        }
    }
}
