// SPDX-License-Identifier: MIT
//! Wire protocol for the collaboration channel.
//!
//! Every frame is a JSON object with a `message_type` discriminator; the two
//! directions are separate closed sums ([`ClientMessage`], [`ServerMessage`]).
//! Field naming is snake_case, ids are strings (UUID v4 in practice), vectors
//! are unsigned 64-bit integers.
//!
//! Decoding never panics: a malformed frame yields a [`DecodeError`] that
//! carries the `operation_id` when one can still be dug out of the JSON, so
//! the session can answer with `operation_rejected(validation_failed)` instead
//! of dropping the frame silently.

use serde::{Deserialize, Serialize};

use crate::diagram::Cell;

// ─── Shared fragments ────────────────────────────────────────────────────────

/// `{id, display_name}` pair identifying the user behind an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRef {
    pub id: String,
    pub display_name: String,
}

/// One entry of a `participants_update` broadcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantInfo {
    pub user_id: String,
    pub display_name: String,
    pub role: crate::identity::Role,
    pub is_presenter: bool,
}

/// The kind of a single cell operation inside a patch.
///
/// Unrecognized kinds parse into `Unknown` so the whole frame still decodes
/// and the session can refuse it with `invalid_operation_type` rather than a
/// generic validation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellOpKind {
    Add,
    Update,
    Remove,
    #[serde(other)]
    Unknown,
}

/// One cell operation: `{id, operation, data?}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellOperation {
    pub id: String,
    pub operation: CellOpKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// The patch container: `{type: "patch", cells: [...]}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    #[serde(rename = "type")]
    pub kind: PatchKind,
    pub cells: Vec<CellOperation>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchKind {
    Patch,
    #[serde(other)]
    Unknown,
}

impl Patch {
    pub fn new(cells: Vec<CellOperation>) -> Self {
        Self {
            kind: PatchKind::Patch,
            cells,
        }
    }
}

/// Closed set of rejection reason codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    ValidationFailed,
    ConflictDetected,
    NoStateChange,
    DiagramNotFound,
    PermissionDenied,
    InvalidOperationType,
    EmptyOperation,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RejectReason::ValidationFailed => "validation_failed",
            RejectReason::ConflictDetected => "conflict_detected",
            RejectReason::NoStateChange => "no_state_change",
            RejectReason::DiagramNotFound => "diagram_not_found",
            RejectReason::PermissionDenied => "permission_denied",
            RejectReason::InvalidOperationType => "invalid_operation_type",
            RejectReason::EmptyOperation => "empty_operation",
        };
        write!(f, "{s}")
    }
}

// ─── Client → server ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "message_type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Cheap vector probe.
    SyncStatusRequest {},
    /// Request a full snapshot if the client's vector is stale.
    SyncRequest { update_vector: u64 },
    /// Apply a cell operation patch.
    DiagramOperationRequest {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        operation_id: Option<String>,
        /// Accepted and ignored; reserved for a future optimistic-concurrency
        /// mode. Cell-level validation is the sole conflict rule today.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        base_vector: Option<u64>,
        operation: Patch,
    },
    /// Non-host asks for the presenter role.
    PresenterRequest {},
    /// Host grants a pending presenter request.
    PresenterApprove { requester_id: String },
    /// Host refuses a pending presenter request.
    PresenterDeny { requester_id: String },
    /// Host force-assigns the presenter (or reclaims it with their own id).
    PresenterChange { target_user_id: String },
    /// Ephemeral presenter cursor. Dropped silently from non-presenters.
    CursorPosition { x: f64, y: f64 },
    /// Ephemeral presenter selection. Dropped silently from non-presenters.
    SelectionUpdate { selected_cells: Vec<String> },
    /// Revert the most recently applied mutation (writer and above).
    UndoRequest {},
    /// Re-apply the most recently undone mutation (writer and above).
    RedoRequest {},
}

impl ClientMessage {
    /// Wire name of the discriminator, for logs and the debug recorder.
    pub fn message_type(&self) -> &'static str {
        match self {
            ClientMessage::SyncStatusRequest {} => "sync_status_request",
            ClientMessage::SyncRequest { .. } => "sync_request",
            ClientMessage::DiagramOperationRequest { .. } => "diagram_operation_request",
            ClientMessage::PresenterRequest {} => "presenter_request",
            ClientMessage::PresenterApprove { .. } => "presenter_approve",
            ClientMessage::PresenterDeny { .. } => "presenter_deny",
            ClientMessage::PresenterChange { .. } => "presenter_change",
            ClientMessage::CursorPosition { .. } => "cursor_position",
            ClientMessage::SelectionUpdate { .. } => "selection_update",
            ClientMessage::UndoRequest {} => "undo_request",
            ClientMessage::RedoRequest {} => "redo_request",
        }
    }
}

// ─── Server → client ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "message_type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Full snapshot: authoritative cells plus the vector they correspond to.
    DiagramState {
        diagram_id: String,
        update_vector: u64,
        cells: Vec<Cell>,
    },
    /// Answer to a vector probe (and to an up-to-date `sync_request`).
    SyncStatusResponse { update_vector: u64 },
    /// An applied operation, broadcast to every participant in total order.
    /// Originators correlate via `operation_id` and suppress re-application.
    DiagramOperationEvent {
        initiating_user: UserRef,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        operation_id: Option<String>,
        sequence_number: u64,
        update_vector: u64,
        operation: Patch,
    },
    /// Refusal, sent to the originating connection only.
    OperationRejected {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        operation_id: Option<String>,
        sequence_number: u64,
        reason: RejectReason,
        message: String,
        update_vector: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        affected_cells: Option<Vec<String>>,
        requires_resync: bool,
    },
    /// A presenter request, forwarded to the host's connections.
    PresenterRequest { requester: UserRef },
    /// A denial, forwarded to the requester's connections.
    PresenterDeny { requester_id: String },
    /// Authoritative presenter update, broadcast.
    CurrentPresenter {
        presenter_user_id: String,
        sequence_number: u64,
    },
    /// Presenter cursor, broadcast.
    CursorPosition {
        user: UserRef,
        x: f64,
        y: f64,
        sequence_number: u64,
    },
    /// Presenter selection, broadcast.
    SelectionUpdate {
        user: UserRef,
        selected_cells: Vec<String>,
        sequence_number: u64,
    },
    /// Join/leave notification, broadcast.
    ParticipantsUpdate {
        participants: Vec<ParticipantInfo>,
        sequence_number: u64,
    },
}

impl ServerMessage {
    pub fn message_type(&self) -> &'static str {
        match self {
            ServerMessage::DiagramState { .. } => "diagram_state",
            ServerMessage::SyncStatusResponse { .. } => "sync_status_response",
            ServerMessage::DiagramOperationEvent { .. } => "diagram_operation_event",
            ServerMessage::OperationRejected { .. } => "operation_rejected",
            ServerMessage::PresenterRequest { .. } => "presenter_request",
            ServerMessage::PresenterDeny { .. } => "presenter_deny",
            ServerMessage::CurrentPresenter { .. } => "current_presenter",
            ServerMessage::CursorPosition { .. } => "cursor_position",
            ServerMessage::SelectionUpdate { .. } => "selection_update",
            ServerMessage::ParticipantsUpdate { .. } => "participants_update",
        }
    }
}

// ─── Codec ───────────────────────────────────────────────────────────────────

/// A frame that failed to decode.
///
/// `operation_id` is recovered on a best-effort basis so the session can
/// address the rejection; without it the frame is dropped and logged.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct DecodeError {
    pub message: String,
    pub operation_id: Option<String>,
}

/// Parse one text frame into a [`ClientMessage`].
pub fn decode_client(text: &str) -> Result<ClientMessage, DecodeError> {
    match serde_json::from_str::<ClientMessage>(text) {
        Ok(msg) => Ok(msg),
        Err(e) => Err(DecodeError {
            message: e.to_string(),
            operation_id: recover_operation_id(text),
        }),
    }
}

/// Serialize a server message. Serialization of our own closed sum cannot
/// fail; an empty string would only ever indicate a serde_json bug.
pub fn encode_server(msg: &ServerMessage) -> String {
    serde_json::to_string(msg).unwrap_or_default()
}

/// Pull `operation_id` out of a frame that failed typed decoding.
fn recover_operation_id(text: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(text).ok()?;
    value
        .get("operation_id")
        .and_then(|v| v.as_str())
        .map(str::to_string)
}
