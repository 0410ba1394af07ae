// SPDX-License-Identifier: MIT
//! Process-wide session registry.
//!
//! One entry per open diagram. Joins race through the registry lock: the
//! winner loads the diagram from the store and spawns the hub, losers wait
//! on the creation watch and then join the resulting hub. A retiring hub
//! removes its own entry (epoch-checked, so it can never remove a
//! successor's), and a joiner that catches a hub mid-retirement simply
//! retries and becomes the next winner.

use futures_util::FutureExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::CollabConfig;
use crate::identity::Identity;
use crate::presence::PresenceSink;
use crate::session::hub::SessionHub;
use crate::session::{HubInput, JoinError, SessionKey};
use crate::storage::DiagramStore;

/// Capacity of a hub's ingress channel. Sized for fan-in from many
/// connections plus save completions; ingress sends are awaited, so this
/// bounds memory, not correctness.
const INGRESS_CAPACITY: usize = 512;

/// Joins retry when they catch a hub mid-retirement; this bounds the loop
/// against pathological churn.
const MAX_JOIN_ATTEMPTS: usize = 8;

/// Send capability for one hub, handed to joining connections.
#[derive(Clone, Debug)]
pub struct HubHandle {
    pub epoch: Uuid,
    pub ingress: mpsc::Sender<HubInput>,
}

enum Slot {
    /// A winner is loading the diagram; the watch flips when it finishes.
    Pending(watch::Receiver<bool>),
    Ready {
        handle: HubHandle,
        task: JoinHandle<()>,
    },
}

pub struct SessionRegistry {
    cfg: Arc<CollabConfig>,
    store: Arc<dyn DiagramStore>,
    presence: Arc<dyn PresenceSink>,
    /// Live trace toggle shared with every hub's recorder.
    debug_recorder: Arc<AtomicBool>,
    slots: Mutex<HashMap<Uuid, Slot>>,
    shutting_down: AtomicBool,
    weak_self: Weak<SessionRegistry>,
}

impl SessionRegistry {
    pub fn new(
        cfg: Arc<CollabConfig>,
        store: Arc<dyn DiagramStore>,
        presence: Arc<dyn PresenceSink>,
        debug_recorder: Arc<AtomicBool>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            cfg,
            store,
            presence,
            debug_recorder,
            slots: Mutex::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
            weak_self: weak.clone(),
        })
    }

    pub async fn active_count(&self) -> usize {
        self.slots
            .lock()
            .await
            .values()
            .filter(|slot| matches!(slot, Slot::Ready { .. }))
            .count()
    }

    /// Join a connection to the session for `key`, creating the session if
    /// this is the first participant. Returns the hub's send capability once
    /// the participant is registered; the greeting (`diagram_state`,
    /// `current_presenter`, `participants_update`) arrives on `outbound`.
    pub async fn join(
        &self,
        key: SessionKey,
        connection_id: Uuid,
        identity: Identity,
        outbound: mpsc::Sender<Arc<str>>,
    ) -> Result<HubHandle, JoinError> {
        if self.shutting_down.load(Ordering::Relaxed) {
            return Err(JoinError::ShuttingDown);
        }

        for _ in 0..MAX_JOIN_ATTEMPTS {
            enum Plan {
                Use(HubHandle),
                Wait(watch::Receiver<bool>),
                Create(watch::Sender<bool>),
            }

            let plan = {
                let mut slots = self.slots.lock().await;
                match slots.get(&key.diagram_id) {
                    Some(Slot::Ready { handle, .. }) => Plan::Use(handle.clone()),
                    Some(Slot::Pending(rx)) => Plan::Wait(rx.clone()),
                    None => {
                        let (tx, rx) = watch::channel(false);
                        slots.insert(key.diagram_id, Slot::Pending(rx));
                        Plan::Create(tx)
                    }
                }
            };

            let handle = match plan {
                Plan::Use(handle) => handle,
                Plan::Wait(mut rx) => {
                    // Winner finished (or failed); either way, re-examine.
                    let _ = rx.changed().await;
                    continue;
                }
                Plan::Create(done) => {
                    let handle = match self.create_session(key).await {
                        Ok(handle) => handle,
                        Err(e) => {
                            self.slots.lock().await.remove(&key.diagram_id);
                            let _ = done.send(true);
                            return Err(JoinError::Store(e));
                        }
                    };
                    let _ = done.send(true);
                    handle
                }
            };

            let (ack_tx, ack_rx) = oneshot::channel();
            let sent = handle
                .ingress
                .send(HubInput::Join {
                    connection_id,
                    identity: identity.clone(),
                    outbound: outbound.clone(),
                    ack: ack_tx,
                })
                .await
                .is_ok();
            if sent && ack_rx.await.is_ok() {
                return Ok(handle);
            }

            // The hub retired underneath us. Clear the stale slot (only if
            // it is still this hub's) and try again from the top.
            let mut slots = self.slots.lock().await;
            if matches!(
                slots.get(&key.diagram_id),
                Some(Slot::Ready { handle: h, .. }) if h.epoch == handle.epoch
            ) {
                slots.remove(&key.diagram_id);
            }
        }

        warn!(diagram = %key.diagram_id, "join retries exhausted");
        Err(JoinError::Contended)
    }

    /// Load the diagram and spawn its hub. Caller holds the Pending slot.
    async fn create_session(&self, key: SessionKey) -> anyhow::Result<HubHandle> {
        let record = self.store.load(key.diagram_id).await?;
        if record.is_none() {
            // First-ever session for this diagram: start empty at vector 0.
            info!(diagram = %key.diagram_id, "no stored state — starting empty diagram");
        }

        let epoch = Uuid::new_v4();
        let (ingress_tx, ingress_rx) = mpsc::channel(INGRESS_CAPACITY);
        let hub = SessionHub::new(
            key,
            epoch,
            self.cfg.clone(),
            self.store.clone(),
            self.presence.clone(),
            self.weak_self.clone(),
            ingress_tx.clone(),
            record,
            self.debug_recorder.clone(),
        );

        let registry = self.weak_self.clone();
        let diagram_id = key.diagram_id;
        let task = tokio::spawn(async move {
            // A panicking hub must not leave a dead entry behind: recover,
            // drop the slot, and let clients reconnect onto a fresh session.
            let result = std::panic::AssertUnwindSafe(hub.run(ingress_rx))
                .catch_unwind()
                .await;
            if result.is_err() {
                error!(diagram = %diagram_id, "session hub panicked — destroying session");
                if let Some(registry) = registry.upgrade() {
                    registry.remove_if_epoch(diagram_id, epoch).await;
                }
            }
        });

        let handle = HubHandle {
            epoch,
            ingress: ingress_tx,
        };
        let mut slots = self.slots.lock().await;
        slots.insert(
            key.diagram_id,
            Slot::Ready {
                handle: handle.clone(),
                task,
            },
        );
        info!(diagram = %key.diagram_id, "session created");
        Ok(handle)
    }

    /// Remove the entry for `diagram_id` if it still belongs to the hub
    /// identified by `epoch`. Returns whether the caller owned the entry —
    /// a retiring hub must exit only when this is true, otherwise a racing
    /// joiner already replaced it.
    pub(crate) async fn remove_if_epoch(&self, diagram_id: Uuid, epoch: Uuid) -> bool {
        let mut slots = self.slots.lock().await;
        match slots.get(&diagram_id) {
            Some(Slot::Ready { handle, .. }) if handle.epoch == epoch => {
                slots.remove(&diagram_id);
                info!(diagram = %diagram_id, "session destroyed");
                true
            }
            _ => false,
        }
    }

    /// Graceful shutdown: stop accepting joins, tell every hub to persist
    /// and exit, and wait (bounded) for each to finish.
    pub async fn drain(&self) {
        self.shutting_down.store(true, Ordering::Relaxed);
        let entries: Vec<(Uuid, HubHandle, JoinHandle<()>)> = {
            let mut slots = self.slots.lock().await;
            slots
                .drain()
                .filter_map(|(id, slot)| match slot {
                    Slot::Ready { handle, task } => Some((id, handle, task)),
                    Slot::Pending(_) => None,
                })
                .collect()
        };
        for (diagram_id, handle, task) in entries {
            let _ = handle.ingress.send(HubInput::Shutdown).await;
            // Give each hub up to 5 seconds to persist and stop.
            if tokio::time::timeout(std::time::Duration::from_secs(5), task)
                .await
                .is_err()
            {
                warn!(diagram = %diagram_id, "session hub did not stop within 5s during drain");
            }
        }
        info!("all sessions drained");
    }
}
