// SPDX-License-Identifier: MIT
//! Collaborative diagram sessions.
//!
//! One [`hub::SessionHub`] task per open diagram owns all mutable session
//! state; everything else talks to it through [`HubInput`] messages. The
//! [`registry::SessionRegistry`] creates hubs lazily on first join and
//! retires them after a grace window once the last participant leaves.

pub mod history;
pub mod hub;
pub mod presenter;
pub mod recorder;
pub mod registry;

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::identity::Identity;
use crate::protocol::ClientMessage;

/// The (threat model, diagram) pair a session is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub threat_model_id: Uuid,
    pub diagram_id: Uuid,
}

/// One live connection inside a session.
///
/// A user may hold several connections; each is its own participant. The hub
/// holds the send capability for the connection's outbound queue — dropping
/// it is how a participant is force-closed.
pub struct Participant {
    pub connection_id: Uuid,
    pub identity: Identity,
    pub(crate) outbound: mpsc::Sender<Arc<str>>,
}

/// Everything that can arrive on a hub's single-consumer ingress channel.
pub enum HubInput {
    /// A connection wants to join. `ack` fires once the participant is
    /// registered; if it is dropped instead, the hub retired mid-join and
    /// the caller should retry through the registry.
    Join {
        connection_id: Uuid,
        identity: Identity,
        outbound: mpsc::Sender<Arc<str>>,
        ack: oneshot::Sender<()>,
    },
    /// A decoded frame from a connection.
    Frame {
        connection_id: Uuid,
        message: ClientMessage,
    },
    /// A frame that failed to decode. The hub answers with a validation
    /// rejection when an operation id was recoverable.
    Malformed {
        connection_id: Uuid,
        operation_id: Option<String>,
        detail: String,
    },
    /// The connection is gone (any reason).
    Disconnect { connection_id: Uuid },
    /// An asynchronous save finished (success or logged failure).
    SaveDone,
    /// Process-wide shutdown: persist and drop everything.
    Shutdown,
}

/// Why a join through the registry failed.
#[derive(Debug, thiserror::Error)]
pub enum JoinError {
    #[error("failed to load diagram: {0}")]
    Store(anyhow::Error),
    #[error("session join retries exhausted")]
    Contended,
    #[error("server is shutting down")]
    ShuttingDown,
}
