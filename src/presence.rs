//! Presence notifications for joins, leaves, and evictions.
//!
//! The session hub reports membership changes through this seam so the
//! platform can feed metrics or audit trails without touching session
//! internals. The default sink just logs.

use uuid::Uuid;

use crate::identity::Identity;

pub trait PresenceSink: Send + Sync {
    fn on_join(&self, diagram_id: Uuid, identity: &Identity, participant_count: usize);
    fn on_leave(&self, diagram_id: Uuid, user_id: &str, participant_count: usize);
    /// A participant force-closed by the server (e.g. slow consumer).
    fn on_evict(&self, diagram_id: Uuid, user_id: &str, reason: &str);
}

/// Default sink: structured log lines, nothing else.
pub struct LogPresenceSink;

impl PresenceSink for LogPresenceSink {
    fn on_join(&self, diagram_id: Uuid, identity: &Identity, participant_count: usize) {
        tracing::info!(
            diagram = %diagram_id,
            user = %identity.user_id,
            role = %identity.role,
            participants = participant_count,
            "participant joined"
        );
    }

    fn on_leave(&self, diagram_id: Uuid, user_id: &str, participant_count: usize) {
        tracing::info!(
            diagram = %diagram_id,
            user = %user_id,
            participants = participant_count,
            "participant left"
        );
    }

    fn on_evict(&self, diagram_id: Uuid, user_id: &str, reason: &str) {
        tracing::warn!(
            diagram = %diagram_id,
            user = %user_id,
            reason = %reason,
            "participant evicted"
        );
    }
}
