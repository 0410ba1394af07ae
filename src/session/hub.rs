// SPDX-License-Identifier: MIT
//! The per-session hub task.
//!
//! Exactly one task owns a session's mutable state — the cell map, vectors,
//! participants, presenter. Connections, timers, and save completions all
//! arrive on one ingress channel and are handled strictly one at a time, so
//! every participant observes broadcasts in the same total order and no lock
//! guards the hot path.
//!
//! The hub never blocks on a participant: outbound queues are bounded and
//! overflow force-closes the offender, not the session. The only awaits in
//! the main loop are the ingress receive itself and the final persist at
//! teardown; saves during the session run on spawned tasks and report back
//! through the ingress channel.

use std::collections::HashSet;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::authz::{self, GateContext, Verdict};
use crate::config::CollabConfig;
use crate::diagram::{self, apply_patch, CellMap};
use crate::identity::{Identity, Role};
use crate::presence::PresenceSink;
use crate::protocol::{
    encode_server, CellOpKind, CellOperation, ClientMessage, ParticipantInfo, Patch, RejectReason,
    ServerMessage, UserRef,
};
use crate::session::history::{History, HistoryEntry};
use crate::session::presenter::{PresenterEffect, PresenterState};
use crate::session::recorder::DebugRecorder;
use crate::session::registry::SessionRegistry;
use crate::session::{HubInput, Participant, SessionKey};
use crate::storage::{DiagramRecord, DiagramStore};

/// Why a participant was removed, for presence reporting and logs.
enum LeaveCause {
    Disconnect,
    Evict(&'static str),
}

pub(crate) struct SessionHub {
    key: SessionKey,
    /// Identifies this hub instance in the registry, so a retiring hub never
    /// removes a successor's entry.
    epoch: Uuid,
    cfg: Arc<CollabConfig>,
    store: Arc<dyn DiagramStore>,
    presence: Arc<dyn PresenceSink>,
    registry: Weak<SessionRegistry>,
    /// Clone handed to save tasks so completions come back through ingress.
    ingress_tx: mpsc::Sender<HubInput>,

    cells: CellMap,
    update_vector: u64,
    /// Vector at load time; teardown skips the final save when nothing moved.
    loaded_vector: u64,
    sequence_number: u64,
    participants: indexmap::IndexMap<Uuid, Participant>,
    presenter: Option<PresenterState>,
    history: History,
    recorder: DebugRecorder,

    save_in_flight: bool,
    dirty: bool,
}

impl SessionHub {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        key: SessionKey,
        epoch: Uuid,
        cfg: Arc<CollabConfig>,
        store: Arc<dyn DiagramStore>,
        presence: Arc<dyn PresenceSink>,
        registry: Weak<SessionRegistry>,
        ingress_tx: mpsc::Sender<HubInput>,
        record: Option<DiagramRecord>,
        debug_flag: Arc<AtomicBool>,
    ) -> Self {
        let (cells, update_vector) = match record {
            Some(r) => (r.cells, r.update_vector),
            None => (CellMap::new(), 0),
        };
        let history = History::new(cfg.history_depth);
        let recorder = DebugRecorder::new(cfg.debug_recorder_capacity, debug_flag);
        Self {
            key,
            epoch,
            store,
            presence,
            registry,
            ingress_tx,
            cells,
            update_vector,
            loaded_vector: update_vector,
            sequence_number: 0,
            participants: indexmap::IndexMap::new(),
            presenter: None,
            history,
            recorder,
            save_in_flight: false,
            dirty: false,
            cfg,
        }
    }

    /// Main loop. Consumes ingress until shutdown or the post-drain grace
    /// window expires with nobody connected.
    pub(crate) async fn run(mut self, mut ingress: mpsc::Receiver<HubInput>) {
        info!(diagram = %self.key.diagram_id, "session hub started");
        loop {
            let input = if self.participants.is_empty() {
                // Draining: a rejoin within the grace window keeps the
                // session (and its loaded state) alive.
                match tokio::time::timeout(self.cfg.session_grace(), ingress.recv()).await {
                    Ok(Some(input)) => input,
                    Ok(None) => break,
                    Err(_) => {
                        if self.try_retire().await {
                            break;
                        }
                        continue;
                    }
                }
            } else {
                match ingress.recv().await {
                    Some(input) => input,
                    None => break,
                }
            };

            if !self.handle(input) {
                // Shutdown: take ourselves out of the registry so late
                // joiners re-create rather than attach to a dead hub.
                self.try_retire().await;
                break;
            }
        }
        self.finalize(&mut ingress).await;
        info!(diagram = %self.key.diagram_id, "session hub stopped");
    }

    /// Dispatch one ingress message. Returns `false` on shutdown.
    fn handle(&mut self, input: HubInput) -> bool {
        match input {
            HubInput::Join {
                connection_id,
                identity,
                outbound,
                ack,
            } => self.on_join(connection_id, identity, outbound, ack),
            HubInput::Frame {
                connection_id,
                message,
            } => self.on_frame(connection_id, message),
            HubInput::Malformed {
                connection_id,
                operation_id,
                detail,
            } => self.on_malformed(connection_id, operation_id, detail),
            HubInput::Disconnect { connection_id } => {
                self.remove_participant(connection_id, LeaveCause::Disconnect)
            }
            HubInput::SaveDone => {
                self.save_in_flight = false;
                if self.dirty {
                    self.dirty = false;
                    self.spawn_save();
                }
            }
            HubInput::Shutdown => return false,
        }
        true
    }

    // ─── Join / leave ─────────────────────────────────────────────────────────

    fn on_join(
        &mut self,
        connection_id: Uuid,
        identity: Identity,
        outbound: mpsc::Sender<Arc<str>>,
        ack: tokio::sync::oneshot::Sender<()>,
    ) {
        // The first user to open the session is its host for the session's
        // whole lifetime, and the initial presenter.
        if self.presenter.is_none() {
            self.presenter = Some(PresenterState::new(identity.user_id.clone()));
        }

        self.participants.insert(
            connection_id,
            Participant {
                connection_id,
                identity: identity.clone(),
                outbound,
            },
        );
        self.presence
            .on_join(self.key.diagram_id, &identity, self.participants.len());
        let _ = ack.send(());

        // The joiner gets the authoritative state and presenter directly;
        // everyone learns about the membership change.
        let snapshot = self.snapshot_message();
        self.unicast(connection_id, &snapshot);
        let current = ServerMessage::CurrentPresenter {
            presenter_user_id: self.presenter_id().to_string(),
            sequence_number: self.sequence_number,
        };
        self.unicast(connection_id, &current);
        self.broadcast_participants_update();
    }

    fn remove_participant(&mut self, connection_id: Uuid, cause: LeaveCause) {
        let Some(participant) = self.participants.shift_remove(&connection_id) else {
            // Disconnect notice for a connection we already evicted.
            return;
        };
        let user_id = participant.identity.user_id;
        match cause {
            LeaveCause::Disconnect => {
                self.presence
                    .on_leave(self.key.diagram_id, &user_id, self.participants.len())
            }
            LeaveCause::Evict(reason) => {
                self.presence.on_evict(self.key.diagram_id, &user_id, reason)
            }
        }

        // Presenter fallback fires only when the user's last connection is
        // gone — the same user may still be present on another socket.
        let user_still_connected = self
            .participants
            .values()
            .any(|p| p.identity.user_id == user_id);
        if !user_still_connected {
            let effect = match self.presenter.as_mut() {
                Some(presenter) => presenter.on_user_gone(&user_id),
                None => PresenterEffect::None,
            };
            if effect == PresenterEffect::Announce {
                self.broadcast_current_presenter();
            }
        }

        self.broadcast_participants_update();
    }

    // ─── Frame dispatch ───────────────────────────────────────────────────────

    fn on_frame(&mut self, connection_id: Uuid, message: ClientMessage) {
        self.recorder
            .record_ingress(connection_id, message.message_type());

        let Some(participant) = self.participants.get(&connection_id) else {
            return; // evicted while the frame was in flight
        };
        let identity = participant.identity.clone();

        let ctx = GateContext {
            is_host: self.presenter_is_host(&identity.user_id),
            is_presenter: self
                .presenter
                .as_ref()
                .is_some_and(|p| p.is_presenter(&identity.user_id)),
        };
        match authz::authorize(identity.role, &message, ctx) {
            Verdict::Allow => {}
            Verdict::Drop => {
                debug!(
                    diagram = %self.key.diagram_id,
                    user = %identity.user_id,
                    message_type = message.message_type(),
                    "dropping ephemeral message from non-presenter"
                );
                return;
            }
            Verdict::Deny(detail) => {
                self.reject_denied(connection_id, &identity, &message, detail);
                return;
            }
        }

        match message {
            ClientMessage::SyncStatusRequest {} => {
                self.unicast(
                    connection_id,
                    &ServerMessage::SyncStatusResponse {
                        update_vector: self.update_vector,
                    },
                );
            }
            ClientMessage::SyncRequest { update_vector } => {
                // Cheap when the client is current, full snapshot otherwise.
                if update_vector == self.update_vector {
                    self.unicast(
                        connection_id,
                        &ServerMessage::SyncStatusResponse {
                            update_vector: self.update_vector,
                        },
                    );
                } else {
                    let snapshot = self.snapshot_message();
                    self.unicast(connection_id, &snapshot);
                }
            }
            ClientMessage::DiagramOperationRequest {
                operation_id,
                base_vector: _,
                operation,
            } => self.on_operation(connection_id, &identity, operation_id, operation),
            ClientMessage::PresenterRequest {} => self.on_presenter_request(&identity),
            ClientMessage::PresenterApprove { requester_id } => {
                let connected = self.user_connected(&requester_id);
                let effect = match self.presenter.as_mut() {
                    Some(p) => p.approve(&requester_id, connected),
                    None => PresenterEffect::None,
                };
                if effect == PresenterEffect::Announce {
                    self.broadcast_current_presenter();
                }
            }
            ClientMessage::PresenterDeny { requester_id } => {
                let effect = match self.presenter.as_ref() {
                    Some(p) => p.deny(),
                    None => PresenterEffect::None,
                };
                if effect == PresenterEffect::ForwardDenyToRequester {
                    self.forward_to_user(
                        &requester_id,
                        &ServerMessage::PresenterDeny {
                            requester_id: requester_id.clone(),
                        },
                    );
                }
            }
            ClientMessage::PresenterChange { target_user_id } => {
                let connected = self.user_connected(&target_user_id);
                let effect = match self.presenter.as_mut() {
                    Some(p) => p.change(&target_user_id, connected),
                    None => PresenterEffect::None,
                };
                if effect == PresenterEffect::Announce {
                    self.broadcast_current_presenter();
                } else {
                    debug!(
                        diagram = %self.key.diagram_id,
                        target = %target_user_id,
                        "presenter_change target is not connected — dropped"
                    );
                }
            }
            ClientMessage::CursorPosition { x, y } => {
                let msg = ServerMessage::CursorPosition {
                    user: user_ref(&identity),
                    x,
                    y,
                    sequence_number: self.next_seq(),
                };
                self.broadcast(&msg);
            }
            ClientMessage::SelectionUpdate { selected_cells } => {
                let msg = ServerMessage::SelectionUpdate {
                    user: user_ref(&identity),
                    selected_cells,
                    sequence_number: self.next_seq(),
                };
                self.broadcast(&msg);
            }
            ClientMessage::UndoRequest {} => self.on_undo(connection_id),
            ClientMessage::RedoRequest {} => self.on_redo(connection_id),
        }
    }

    fn on_malformed(
        &mut self,
        connection_id: Uuid,
        operation_id: Option<String>,
        detail: String,
    ) {
        self.recorder.record_ingress(connection_id, "malformed");
        match operation_id {
            Some(operation_id) => {
                let msg = self.rejection(
                    Some(operation_id),
                    RejectReason::ValidationFailed,
                    detail,
                    None,
                    false,
                );
                self.unicast(connection_id, &msg);
            }
            None => {
                debug!(
                    diagram = %self.key.diagram_id,
                    connection = %connection_id,
                    err = %detail,
                    "dropping malformed frame with no recoverable operation_id"
                );
            }
        }
    }

    // ─── Mutations ────────────────────────────────────────────────────────────

    fn on_operation(
        &mut self,
        connection_id: Uuid,
        identity: &Identity,
        operation_id: Option<String>,
        patch: Patch,
    ) {
        let outcome = match apply_patch(&mut self.cells, &patch) {
            Ok(outcome) => outcome,
            Err(rejection) => {
                let msg = self.rejection(
                    operation_id,
                    rejection.reason(),
                    rejection.to_string(),
                    rejection.affected_cells(),
                    rejection.requires_resync(),
                );
                self.unicast(connection_id, &msg);
                return;
            }
        };

        if outcome.is_noop() {
            // Misbehaving clients re-send local applications of remote
            // events; answering instead of broadcasting keeps the stream
            // free of empty updates.
            let msg = self.rejection(
                operation_id,
                RejectReason::NoStateChange,
                "operation produced no state change".into(),
                None,
                false,
            );
            self.unicast(connection_id, &msg);
            return;
        }

        self.update_vector += 1;
        self.history.record(HistoryEntry {
            forward: outcome.effective.clone(),
            inverse: outcome.inverse,
        });
        self.schedule_save();

        let event = ServerMessage::DiagramOperationEvent {
            initiating_user: user_ref(identity),
            operation_id,
            sequence_number: self.next_seq(),
            update_vector: self.update_vector,
            operation: Patch::new(outcome.effective),
        };
        self.broadcast(&event);
    }

    fn on_undo(&mut self, connection_id: Uuid) {
        let Some(entry) = self.history.pop_undo() else {
            let msg = self.rejection(
                None,
                RejectReason::NoStateChange,
                "nothing to undo".into(),
                None,
                false,
            );
            self.unicast(connection_id, &msg);
            return;
        };
        let inverse = Patch::new(entry.inverse.clone());
        match apply_patch(&mut self.cells, &inverse) {
            Ok(outcome) => {
                if !outcome.is_noop() {
                    self.update_vector += 1;
                    self.schedule_save();
                }
                self.history.push_redo(entry);
                // Every client converges on the authoritative post-undo
                // state, including ones that missed intermediate events.
                self.next_seq();
                let snapshot = self.snapshot_message();
                self.broadcast(&snapshot);
            }
            Err(rejection) => {
                // A LIFO inverse always applies cleanly; reaching this means
                // the history no longer matches the map. Drop it and resync.
                error!(
                    diagram = %self.key.diagram_id,
                    err = %rejection,
                    "undo inverse failed to apply — clearing history"
                );
                self.history.clear();
                let msg = self.rejection(
                    None,
                    RejectReason::ConflictDetected,
                    "undo history no longer applies".into(),
                    None,
                    true,
                );
                self.unicast(connection_id, &msg);
            }
        }
    }

    fn on_redo(&mut self, connection_id: Uuid) {
        let Some(entry) = self.history.pop_redo() else {
            let msg = self.rejection(
                None,
                RejectReason::NoStateChange,
                "nothing to redo".into(),
                None,
                false,
            );
            self.unicast(connection_id, &msg);
            return;
        };
        let forward = Patch::new(entry.forward.clone());
        match apply_patch(&mut self.cells, &forward) {
            Ok(outcome) => {
                if !outcome.is_noop() {
                    self.update_vector += 1;
                    self.schedule_save();
                }
                self.history.restore(entry);
                self.next_seq();
                let snapshot = self.snapshot_message();
                self.broadcast(&snapshot);
            }
            Err(rejection) => {
                error!(
                    diagram = %self.key.diagram_id,
                    err = %rejection,
                    "redo failed to apply — clearing history"
                );
                self.history.clear();
                let msg = self.rejection(
                    None,
                    RejectReason::ConflictDetected,
                    "redo history no longer applies".into(),
                    None,
                    true,
                );
                self.unicast(connection_id, &msg);
            }
        }
    }

    // ─── Presenter ────────────────────────────────────────────────────────────

    fn on_presenter_request(&mut self, identity: &Identity) {
        let effect = match self.presenter.as_mut() {
            Some(presenter) => presenter.request(&identity.user_id),
            None => PresenterEffect::None,
        };
        match effect {
            PresenterEffect::Announce => self.broadcast_current_presenter(),
            PresenterEffect::ForwardRequestToHost => {
                let host = self.presenter_host().to_string();
                self.forward_to_user(
                    &host,
                    &ServerMessage::PresenterRequest {
                        requester: user_ref(identity),
                    },
                );
            }
            _ => {}
        }
    }

    // ─── Denials ──────────────────────────────────────────────────────────────

    fn reject_denied(
        &mut self,
        connection_id: Uuid,
        identity: &Identity,
        message: &ClientMessage,
        detail: &'static str,
    ) {
        let operation_id = match message {
            ClientMessage::DiagramOperationRequest { operation_id, .. } => operation_id.clone(),
            _ => None,
        };
        let msg = self.rejection(
            operation_id,
            RejectReason::PermissionDenied,
            detail.to_string(),
            None,
            false,
        );
        self.unicast(connection_id, &msg);

        // A reader that attempted a mutation applied it optimistically on
        // its side; a corrective event synthesized from the authoritative
        // map puts that view back.
        if identity.role == Role::Reader {
            if let ClientMessage::DiagramOperationRequest { operation, .. } = message {
                let corrective = self.corrective_event(operation, identity);
                self.unicast(connection_id, &corrective);
            }
        }
    }

    /// Rebuild the attempted cells from the authoritative map: update for
    /// cells that exist, remove for cells that don't. Carries the current
    /// (unadvanced) sequence and vector — it corrects one client and is not
    /// part of the total-order stream.
    fn corrective_event(&self, attempted: &Patch, identity: &Identity) -> ServerMessage {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut ops: Vec<CellOperation> = Vec::new();
        for op in &attempted.cells {
            if !seen.insert(op.id.as_str()) {
                continue;
            }
            match self.cells.get(&op.id) {
                Some(cell) => ops.push(CellOperation {
                    id: op.id.clone(),
                    operation: CellOpKind::Update,
                    data: Some(cell.to_value()),
                }),
                None => ops.push(CellOperation {
                    id: op.id.clone(),
                    operation: CellOpKind::Remove,
                    data: None,
                }),
            }
        }
        ServerMessage::DiagramOperationEvent {
            initiating_user: user_ref(identity),
            operation_id: None,
            sequence_number: self.sequence_number,
            update_vector: self.update_vector,
            operation: Patch::new(ops),
        }
    }

    // ─── Fan-out ──────────────────────────────────────────────────────────────

    fn next_seq(&mut self) -> u64 {
        self.sequence_number += 1;
        self.sequence_number
    }

    /// Enqueue one already-serialized frame to every participant. A full or
    /// closed queue marks that participant for eviction; the session never
    /// waits for a slow consumer.
    fn broadcast(&mut self, msg: &ServerMessage) {
        self.recorder.record_egress(None, msg.message_type());
        let frame: Arc<str> = Arc::from(encode_server(msg));
        let mut evicted: Vec<Uuid> = Vec::new();
        for (conn, participant) in &self.participants {
            if participant.outbound.try_send(frame.clone()).is_err() {
                evicted.push(*conn);
            }
        }
        for conn in evicted {
            warn!(
                diagram = %self.key.diagram_id,
                connection = %conn,
                "outbound queue overflow — force-closing slow consumer"
            );
            self.remove_participant(conn, LeaveCause::Evict("slow_consumer"));
        }
    }

    fn unicast(&mut self, connection_id: Uuid, msg: &ServerMessage) {
        self.recorder
            .record_egress(Some(connection_id), msg.message_type());
        let Some(participant) = self.participants.get(&connection_id) else {
            return;
        };
        let frame: Arc<str> = Arc::from(encode_server(msg));
        match participant.outbound.try_send(frame) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    diagram = %self.key.diagram_id,
                    connection = %connection_id,
                    "outbound queue overflow — force-closing slow consumer"
                );
                self.remove_participant(connection_id, LeaveCause::Evict("slow_consumer"));
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                // Writer already gone; the disconnect notice is in flight.
            }
        }
    }

    /// Unicast to every connection a user holds.
    fn forward_to_user(&mut self, user_id: &str, msg: &ServerMessage) {
        let conns: Vec<Uuid> = self
            .participants
            .values()
            .filter(|p| p.identity.user_id == user_id)
            .map(|p| p.connection_id)
            .collect();
        for conn in conns {
            self.unicast(conn, msg);
        }
    }

    fn broadcast_current_presenter(&mut self) {
        let msg = ServerMessage::CurrentPresenter {
            presenter_user_id: self.presenter_id().to_string(),
            sequence_number: self.next_seq(),
        };
        self.broadcast(&msg);
    }

    fn broadcast_participants_update(&mut self) {
        let participants: Vec<ParticipantInfo> = self
            .participants
            .values()
            .map(|p| ParticipantInfo {
                user_id: p.identity.user_id.clone(),
                display_name: p.identity.display_name.clone(),
                role: p.identity.role,
                is_presenter: self
                    .presenter
                    .as_ref()
                    .is_some_and(|s| s.is_presenter(&p.identity.user_id)),
            })
            .collect();
        let msg = ServerMessage::ParticipantsUpdate {
            participants,
            sequence_number: self.next_seq(),
        };
        self.broadcast(&msg);
    }

    // ─── Persistence ──────────────────────────────────────────────────────────

    /// At most one save in flight; a backlog collapses to the newest state.
    fn schedule_save(&mut self) {
        if self.save_in_flight {
            self.dirty = true;
        } else {
            self.spawn_save();
        }
    }

    fn spawn_save(&mut self) {
        self.save_in_flight = true;
        let store = self.store.clone();
        let cells = self.cells.clone();
        let vector = self.update_vector;
        let diagram_id = self.key.diagram_id;
        let deadline = self.cfg.save_deadline();
        let tx = self.ingress_tx.clone();
        tokio::spawn(async move {
            match tokio::time::timeout(deadline, store.save(diagram_id, &cells, vector)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(
                    diagram = %diagram_id,
                    err = %e,
                    "diagram save failed — in-memory state remains authoritative"
                ),
                Err(_) => warn!(
                    diagram = %diagram_id,
                    deadline_secs = deadline.as_secs(),
                    "diagram save timed out — in-memory state remains authoritative"
                ),
            }
            let _ = tx.send(HubInput::SaveDone).await;
        });
    }

    // ─── Teardown ─────────────────────────────────────────────────────────────

    async fn try_retire(&mut self) -> bool {
        match self.registry.upgrade() {
            Some(registry) => {
                registry
                    .remove_if_epoch(self.key.diagram_id, self.epoch)
                    .await
            }
            None => true,
        }
    }

    async fn finalize(&mut self, ingress: &mut mpsc::Receiver<HubInput>) {
        // Refuse further sends, then drain what already got in. Buffered
        // joins lose their ack; the caller retries through the registry and
        // lands on a fresh hub.
        ingress.close();
        while ingress.recv().await.is_some() {}

        // Dropping the participants drops their outbound senders; writers
        // observe the closed queue and shut the sockets.
        self.participants.clear();

        if self.update_vector > self.loaded_vector {
            let deadline = self.cfg.save_deadline();
            match tokio::time::timeout(
                deadline,
                self.store
                    .save(self.key.diagram_id, &self.cells, self.update_vector),
            )
            .await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(diagram = %self.key.diagram_id, err = %e, "final diagram save failed")
                }
                Err(_) => {
                    error!(diagram = %self.key.diagram_id, "final diagram save timed out")
                }
            }
        }

        if self.recorder.is_enabled() && !self.recorder.is_empty() {
            let path = self
                .cfg
                .data_dir
                .join("traces")
                .join(format!("{}.jsonl", self.key.diagram_id));
            if let Err(e) = self.recorder.dump_to(&path).await {
                warn!(diagram = %self.key.diagram_id, err = %e, "failed to dump session trace");
            }
        }
    }

    // ─── Small helpers ────────────────────────────────────────────────────────

    fn snapshot_message(&self) -> ServerMessage {
        ServerMessage::DiagramState {
            diagram_id: self.key.diagram_id.to_string(),
            update_vector: self.update_vector,
            cells: diagram::snapshot(&self.cells),
        }
    }

    fn rejection(
        &self,
        operation_id: Option<String>,
        reason: RejectReason,
        message: String,
        affected_cells: Option<Vec<String>>,
        requires_resync: bool,
    ) -> ServerMessage {
        ServerMessage::OperationRejected {
            operation_id,
            sequence_number: self.sequence_number,
            reason,
            message,
            update_vector: self.update_vector,
            affected_cells,
            requires_resync,
        }
    }

    fn presenter_id(&self) -> &str {
        self.presenter.as_ref().map(|p| p.presenter()).unwrap_or("")
    }

    fn presenter_host(&self) -> &str {
        self.presenter.as_ref().map(|p| p.host()).unwrap_or("")
    }

    fn presenter_is_host(&self, user_id: &str) -> bool {
        self.presenter.as_ref().is_some_and(|p| p.is_host(user_id))
    }

    fn user_connected(&self, user_id: &str) -> bool {
        self.participants
            .values()
            .any(|p| p.identity.user_id == user_id)
    }
}

fn user_ref(identity: &Identity) -> UserRef {
    UserRef {
        id: identity.user_id.clone(),
        display_name: identity.display_name.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::LogPresenceSink;
    use crate::storage::MemoryDiagramStore;
    use serde_json::json;
    use tokio::sync::oneshot;

    struct TestSession {
        ingress: mpsc::Sender<HubInput>,
        store: Arc<MemoryDiagramStore>,
        diagram_id: Uuid,
    }

    struct TestClient {
        connection_id: Uuid,
        rx: mpsc::Receiver<Arc<str>>,
    }

    impl TestClient {
        /// Next outbound frame as JSON, or panic after a short wait.
        async fn next(&mut self) -> serde_json::Value {
            let frame = tokio::time::timeout(std::time::Duration::from_secs(2), self.rx.recv())
                .await
                .expect("timed out waiting for frame")
                .expect("outbound closed");
            serde_json::from_str(&frame).unwrap()
        }

        /// Skip frames until one with the given message_type arrives.
        async fn next_of_type(&mut self, message_type: &str) -> serde_json::Value {
            loop {
                let v = self.next().await;
                if v["message_type"] == message_type {
                    return v;
                }
            }
        }

    }

    async fn spawn_session() -> TestSession {
        let dir = tempfile::tempdir().unwrap().keep();
        let mut cfg = CollabConfig::for_tests(dir);
        cfg.session_grace_seconds = 60; // keep the hub alive for the test
        let cfg = Arc::new(cfg);
        let store = Arc::new(MemoryDiagramStore::new());
        let key = SessionKey {
            threat_model_id: Uuid::new_v4(),
            diagram_id: Uuid::new_v4(),
        };
        let (tx, rx) = mpsc::channel(64);
        let hub = SessionHub::new(
            key,
            Uuid::new_v4(),
            cfg,
            store.clone(),
            Arc::new(LogPresenceSink),
            Weak::new(),
            tx.clone(),
            None,
            Arc::new(AtomicBool::new(false)),
        );
        tokio::spawn(hub.run(rx));
        TestSession {
            ingress: tx,
            store,
            diagram_id: key.diagram_id,
        }
    }

    impl TestSession {
        async fn join(&self, user: &str, name: &str, role: Role) -> TestClient {
            let (out_tx, out_rx) = mpsc::channel(256);
            self.join_with_queue(user, name, role, out_tx, out_rx).await
        }

        async fn join_with_queue(
            &self,
            user: &str,
            name: &str,
            role: Role,
            out_tx: mpsc::Sender<Arc<str>>,
            out_rx: mpsc::Receiver<Arc<str>>,
        ) -> TestClient {
            let connection_id = Uuid::new_v4();
            let (ack_tx, ack_rx) = oneshot::channel();
            self.ingress
                .send(HubInput::Join {
                    connection_id,
                    identity: Identity {
                        user_id: user.into(),
                        display_name: name.into(),
                        role,
                    },
                    outbound: out_tx,
                    ack: ack_tx,
                })
                .await
                .unwrap();
            ack_rx.await.unwrap();
            let mut client = TestClient {
                connection_id,
                rx: out_rx,
            };
            // Every joiner is greeted with state + presenter, then the
            // membership broadcast.
            client.next_of_type("diagram_state").await;
            client.next_of_type("current_presenter").await;
            client.next_of_type("participants_update").await;
            client
        }

        async fn send(&self, client: &TestClient, message: ClientMessage) {
            self.ingress
                .send(HubInput::Frame {
                    connection_id: client.connection_id,
                    message,
                })
                .await
                .unwrap();
        }
    }

    fn add_op(id: &str, body: serde_json::Value) -> ClientMessage {
        ClientMessage::DiagramOperationRequest {
            operation_id: Some(format!("op-{id}")),
            base_vector: None,
            operation: Patch::new(vec![CellOperation {
                id: id.into(),
                operation: CellOpKind::Add,
                data: Some(body),
            }]),
        }
    }

    #[tokio::test]
    async fn applied_operation_broadcasts_to_all_including_originator() {
        let session = spawn_session().await;
        let mut alice = session.join("alice", "Alice", Role::Owner).await;
        let mut bob = session.join("bob", "Bob", Role::Writer).await;
        // Alice also sees Bob's join.
        alice.next_of_type("participants_update").await;

        session.send(&alice, add_op("c1", json!({ "x": 10 }))).await;

        for client in [&mut alice, &mut bob] {
            let event = client.next_of_type("diagram_operation_event").await;
            assert_eq!(event["update_vector"], 1);
            assert_eq!(event["operation_id"], "op-c1");
            assert_eq!(event["initiating_user"]["id"], "alice");
            assert_eq!(event["operation"]["cells"][0]["operation"], "add");
        }

        session.send(&bob, ClientMessage::SyncStatusRequest {}).await;
        let status = bob.next_of_type("sync_status_response").await;
        assert_eq!(status["update_vector"], 1);
    }

    #[tokio::test]
    async fn reader_mutation_is_denied_with_corrective_event() {
        let session = spawn_session().await;
        let mut alice = session.join("alice", "Alice", Role::Owner).await;
        let mut charlie = session.join("charlie", "Charlie", Role::Reader).await;

        session.send(&alice, add_op("c1", json!({ "x": 1 }))).await;
        charlie.next_of_type("diagram_operation_event").await;

        // Charlie optimistically removes c1 locally and asks the server.
        session
            .send(
                &charlie,
                ClientMessage::DiagramOperationRequest {
                    operation_id: Some("C1".into()),
                    base_vector: None,
                    operation: Patch::new(vec![CellOperation {
                        id: "c1".into(),
                        operation: CellOpKind::Remove,
                        data: None,
                    }]),
                },
            )
            .await;

        let rejected = charlie.next_of_type("operation_rejected").await;
        assert_eq!(rejected["reason"], "permission_denied");
        assert_eq!(rejected["operation_id"], "C1");
        assert_eq!(rejected["update_vector"], 1);

        let corrective = charlie.next_of_type("diagram_operation_event").await;
        assert_eq!(corrective["operation"]["cells"][0]["id"], "c1");
        assert_eq!(corrective["operation"]["cells"][0]["operation"], "update");
        assert_eq!(corrective["operation"]["cells"][0]["data"]["x"], 1);

        // The server state never moved.
        session
            .send(&charlie, ClientMessage::SyncStatusRequest {})
            .await;
        let status = charlie.next_of_type("sync_status_response").await;
        assert_eq!(status["update_vector"], 1);
    }

    #[tokio::test]
    async fn update_of_missing_cell_is_a_conflict() {
        let session = spawn_session().await;
        let mut bob = session.join("bob", "Bob", Role::Writer).await;

        session
            .send(
                &bob,
                ClientMessage::DiagramOperationRequest {
                    operation_id: Some("B1".into()),
                    base_vector: None,
                    operation: Patch::new(vec![CellOperation {
                        id: "c999".into(),
                        operation: CellOpKind::Update,
                        data: Some(json!({ "x": 1 })),
                    }]),
                },
            )
            .await;

        let rejected = bob.next_of_type("operation_rejected").await;
        assert_eq!(rejected["reason"], "conflict_detected");
        assert_eq!(rejected["affected_cells"][0], "c999");
        assert_eq!(rejected["requires_resync"], true);
        assert_eq!(rejected["update_vector"], 0);
    }

    #[tokio::test]
    async fn noop_operation_is_rejected_without_broadcast() {
        let session = spawn_session().await;
        let mut alice = session.join("alice", "Alice", Role::Owner).await;

        session.send(&alice, add_op("c1", json!({ "x": 1 }))).await;
        let first = alice.next_of_type("diagram_operation_event").await;
        assert_eq!(first["update_vector"], 1);

        // Identical add: no state change, no broadcast, vector unchanged.
        session.send(&alice, add_op("c1", json!({ "x": 1 }))).await;
        let rejected = alice.next_of_type("operation_rejected").await;
        assert_eq!(rejected["reason"], "no_state_change");
        assert_eq!(rejected["update_vector"], 1);
    }

    #[tokio::test]
    async fn sequence_numbers_strictly_increase_for_everyone() {
        let session = spawn_session().await;
        let mut alice = session.join("alice", "Alice", Role::Owner).await;
        let mut bob = session.join("bob", "Bob", Role::Writer).await;
        alice.next_of_type("participants_update").await;

        for i in 0..5 {
            session
                .send(&alice, add_op(&format!("c{i}"), json!({ "n": i })))
                .await;
        }

        for client in [&mut alice, &mut bob] {
            let mut last_seq = 0;
            let mut last_vector = 0;
            for _ in 0..5 {
                let event = client.next_of_type("diagram_operation_event").await;
                let seq = event["sequence_number"].as_u64().unwrap();
                let vector = event["update_vector"].as_u64().unwrap();
                assert!(seq > last_seq);
                assert!(vector > last_vector);
                last_seq = seq;
                last_vector = vector;
            }
        }
    }

    #[tokio::test]
    async fn presenter_handoff_and_cursor_gating() {
        let session = spawn_session().await;
        let mut alice = session.join("alice", "Alice", Role::Owner).await;
        let mut bob = session.join("bob", "Bob", Role::Writer).await;
        let mut charlie = session.join("charlie", "Charlie", Role::Reader).await;
        alice.next_of_type("participants_update").await;
        alice.next_of_type("participants_update").await;
        bob.next_of_type("participants_update").await;

        // Bob asks; the request lands on the host's connection.
        session.send(&bob, ClientMessage::PresenterRequest {}).await;
        let request = alice.next_of_type("presenter_request").await;
        assert_eq!(request["requester"]["id"], "bob");

        session
            .send(
                &alice,
                ClientMessage::PresenterApprove {
                    requester_id: "bob".into(),
                },
            )
            .await;
        for client in [&mut alice, &mut bob, &mut charlie] {
            let current = client.next_of_type("current_presenter").await;
            assert_eq!(current["presenter_user_id"], "bob");
        }

        // The presenter's cursor is broadcast.
        session
            .send(&bob, ClientMessage::CursorPosition { x: 5.0, y: 7.0 })
            .await;
        for client in [&mut alice, &mut bob, &mut charlie] {
            let cursor = client.next_of_type("cursor_position").await;
            assert_eq!(cursor["user"]["id"], "bob");
            assert_eq!(cursor["x"], 5.0);
        }

        // A non-presenter's cursor is dropped silently: the next frame
        // Charlie sees is the probe response, not a cursor echo.
        session
            .send(&charlie, ClientMessage::CursorPosition { x: 1.0, y: 1.0 })
            .await;
        session
            .send(&charlie, ClientMessage::SyncStatusRequest {})
            .await;
        let next = charlie.next().await;
        assert_eq!(next["message_type"], "sync_status_response");
    }

    #[tokio::test]
    async fn denied_presenter_request_reaches_only_the_requester() {
        let session = spawn_session().await;
        let mut alice = session.join("alice", "Alice", Role::Owner).await;
        let mut bob = session.join("bob", "Bob", Role::Writer).await;
        alice.next_of_type("participants_update").await;

        session.send(&bob, ClientMessage::PresenterRequest {}).await;
        alice.next_of_type("presenter_request").await;

        session
            .send(
                &alice,
                ClientMessage::PresenterDeny {
                    requester_id: "bob".into(),
                },
            )
            .await;
        let denied = bob.next_of_type("presenter_deny").await;
        assert_eq!(denied["requester_id"], "bob");

        // The role never moved; bob's cursor is still gated off.
        session
            .send(&bob, ClientMessage::CursorPosition { x: 1.0, y: 1.0 })
            .await;
        session.send(&bob, ClientMessage::SyncStatusRequest {}).await;
        let next = bob.next().await;
        assert_eq!(next["message_type"], "sync_status_response");
    }

    #[tokio::test]
    async fn presenter_disconnect_reverts_to_host() {
        let session = spawn_session().await;
        let mut alice = session.join("alice", "Alice", Role::Owner).await;
        let mut bob = session.join("bob", "Bob", Role::Writer).await;
        alice.next_of_type("participants_update").await;

        session
            .send(
                &alice,
                ClientMessage::PresenterChange {
                    target_user_id: "bob".into(),
                },
            )
            .await;
        alice.next_of_type("current_presenter").await;

        session
            .ingress
            .send(HubInput::Disconnect {
                connection_id: bob.connection_id,
            })
            .await
            .unwrap();

        let current = alice.next_of_type("current_presenter").await;
        assert_eq!(current["presenter_user_id"], "alice");
        let update = alice.next_of_type("participants_update").await;
        assert_eq!(update["participants"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn slow_consumer_is_evicted_without_stalling_the_session() {
        let session = spawn_session().await;
        let mut alice = session.join("alice", "Alice", Role::Owner).await;

        // Dana never drains her queue.
        let (dana_tx, dana_rx) = mpsc::channel(4);
        let dana = session
            .join_with_queue("dana", "Dana", Role::Writer, dana_tx, dana_rx)
            .await;
        alice.next_of_type("participants_update").await;
        drop(dana.rx); // stop draining

        for i in 0..30 {
            session
                .send(&alice, add_op(&format!("c{i}"), json!({ "n": i })))
                .await;
        }

        // Alice keeps receiving all 30 events; Dana's overflow produced a
        // participants_update showing her gone.
        let mut events = 0;
        let mut dana_removed = false;
        while events < 30 {
            let v = alice.next().await;
            match v["message_type"].as_str().unwrap() {
                "diagram_operation_event" => events += 1,
                "participants_update" => {
                    let users: Vec<&str> = v["participants"]
                        .as_array()
                        .unwrap()
                        .iter()
                        .map(|p| p["user_id"].as_str().unwrap())
                        .collect();
                    if !users.contains(&"dana") {
                        dana_removed = true;
                    }
                }
                _ => {}
            }
        }
        assert!(dana_removed);

        session.send(&alice, ClientMessage::SyncStatusRequest {}).await;
        let status = alice.next_of_type("sync_status_response").await;
        assert_eq!(status["update_vector"], 30);
    }

    #[tokio::test]
    async fn undo_reverts_and_broadcasts_a_snapshot() {
        let session = spawn_session().await;
        let mut alice = session.join("alice", "Alice", Role::Owner).await;

        session.send(&alice, add_op("c1", json!({ "x": 1 }))).await;
        alice.next_of_type("diagram_operation_event").await;

        session.send(&alice, ClientMessage::UndoRequest {}).await;
        let snapshot = alice.next_of_type("diagram_state").await;
        assert_eq!(snapshot["cells"].as_array().unwrap().len(), 0);
        assert_eq!(snapshot["update_vector"], 2);

        session.send(&alice, ClientMessage::RedoRequest {}).await;
        let snapshot = alice.next_of_type("diagram_state").await;
        assert_eq!(snapshot["cells"].as_array().unwrap().len(), 1);
        assert_eq!(snapshot["update_vector"], 3);
    }

    #[tokio::test]
    async fn session_persists_on_last_disconnect() {
        let session = spawn_session().await;
        let alice = session.join("alice", "Alice", Role::Owner).await;
        session.send(&alice, add_op("c1", json!({ "x": 1 }))).await;

        session
            .ingress
            .send(HubInput::Shutdown)
            .await
            .unwrap();
        // Give the hub a moment to finalize.
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;

        let record = session.store.load(session.diagram_id).await.unwrap().unwrap();
        assert_eq!(record.update_vector, 1);
        assert!(record.cells.contains_key("c1"));
    }
}
