// SPDX-License-Identifier: MIT
//! Per-message authorization gate.
//!
//! Maps `(role, message type, session context)` to a verdict before the hub
//! touches any state. The policy is a closed table; anything not explicitly
//! allowed is denied.

use crate::identity::Role;
use crate::protocol::ClientMessage;

/// Session facts the policy needs beyond the role.
#[derive(Debug, Clone, Copy)]
pub struct GateContext {
    /// The sender's user id equals the session host's. Host powers are tied
    /// to the user id, not the role.
    pub is_host: bool,
    /// The sender's user id equals the current presenter's.
    pub is_presenter: bool,
}

/// Outcome of the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    /// Refused; answered with `operation_rejected(permission_denied)`.
    Deny(&'static str),
    /// Ignored without a reply. Used for ephemeral presenter state from
    /// non-presenters, which clients are expected to self-regulate.
    Drop,
}

/// Policy table:
///
/// | message                         | reader | writer | host (by user id) |
/// |---------------------------------|--------|--------|-------------------|
/// | sync probes / requests          | allow  | allow  | allow             |
/// | diagram_operation_request       | deny   | allow  | allow             |
/// | undo_request / redo_request     | deny   | allow  | allow             |
/// | presenter_request               | allow  | allow  | allow             |
/// | presenter_approve / deny        | deny   | deny   | allow             |
/// | presenter_change                | deny   | deny   | allow             |
/// | cursor_position / selection     | presenter only, silent drop otherwise |
pub fn authorize(role: Role, msg: &ClientMessage, ctx: GateContext) -> Verdict {
    match msg {
        ClientMessage::SyncStatusRequest {} | ClientMessage::SyncRequest { .. } => Verdict::Allow,

        ClientMessage::DiagramOperationRequest { .. } => {
            if role.can_mutate() {
                Verdict::Allow
            } else {
                Verdict::Deny("role does not permit diagram mutation")
            }
        }

        ClientMessage::UndoRequest {} | ClientMessage::RedoRequest {} => {
            if role.can_mutate() {
                Verdict::Allow
            } else {
                Verdict::Deny("role does not permit undo/redo")
            }
        }

        ClientMessage::PresenterRequest {} => Verdict::Allow,

        // Host responses to a pending request. Enforced by user-id
        // comparison: an owner-role participant who is not the session host
        // cannot answer requests.
        ClientMessage::PresenterApprove { .. } | ClientMessage::PresenterDeny { .. } => {
            if ctx.is_host {
                Verdict::Allow
            } else {
                Verdict::Deny("only the session host may answer presenter requests")
            }
        }

        ClientMessage::PresenterChange { .. } => {
            if ctx.is_host {
                Verdict::Allow
            } else {
                Verdict::Deny("only the session host may assign the presenter")
            }
        }

        ClientMessage::CursorPosition { .. } | ClientMessage::SelectionUpdate { .. } => {
            if ctx.is_presenter {
                Verdict::Allow
            } else {
                Verdict::Drop
            }
        }
    }
}
