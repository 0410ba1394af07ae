// SPDX-License-Identifier: MIT
//! Diagram cell state and patch application.
//!
//! The server treats a cell body as an opaque JSON object; only the `id`
//! field matters to it. Cells live in an insertion-ordered map so that full
//! snapshots serialize reproducibly.
//!
//! Patch application is atomic from the session's point of view: the whole
//! patch is validated against a simulated post-state first, then applied.
//! Nothing is mutated when any operation is invalid.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::protocol::{CellOpKind, CellOperation, Patch, PatchKind, RejectReason};

/// One diagram cell. `body` is opaque to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cell {
    pub id: String,
    #[serde(flatten)]
    pub body: serde_json::Map<String, serde_json::Value>,
}

impl Cell {
    /// Build a cell from an operation's `data` payload.
    ///
    /// The operation's `id` is canonical; an `id` field embedded in the body
    /// is discarded so the two can never disagree.
    pub fn from_op_data(id: &str, data: &serde_json::Value) -> Option<Self> {
        let mut body = data.as_object()?.clone();
        body.remove("id");
        Some(Self {
            id: id.to_string(),
            body,
        })
    }

    /// The full cell as a JSON value (id plus body), as broadcast in events.
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

/// Insertion-ordered cell id → cell association.
pub type CellMap = IndexMap<String, Cell>;

/// Clone the map into snapshot order (insertion order).
pub fn snapshot(cells: &CellMap) -> Vec<Cell> {
    cells.values().cloned().collect()
}

/// Rebuild a map from stored snapshot order.
pub fn from_snapshot(cells: Vec<Cell>) -> CellMap {
    cells.into_iter().map(|c| (c.id.clone(), c)).collect()
}

// ─── Rejections ──────────────────────────────────────────────────────────────

/// Why a patch could not be applied. Maps onto the wire rejection codes.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PatchRejection {
    #[error("operation type is not \"patch\"")]
    NotAPatch,
    #[error("patch contains no cell operations")]
    Empty,
    #[error("unrecognized operation kind for cell {cell_id}")]
    UnknownOpKind { cell_id: String },
    #[error("cell {cell_id} requires an object body")]
    MissingBody { cell_id: String },
    #[error("update of nonexistent cell")]
    UpdateNonexistent { affected: Vec<String> },
}

impl PatchRejection {
    pub fn reason(&self) -> RejectReason {
        match self {
            PatchRejection::NotAPatch | PatchRejection::UnknownOpKind { .. } => {
                RejectReason::InvalidOperationType
            }
            PatchRejection::Empty => RejectReason::EmptyOperation,
            PatchRejection::MissingBody { .. } => RejectReason::ValidationFailed,
            PatchRejection::UpdateNonexistent { .. } => RejectReason::ConflictDetected,
        }
    }

    /// Conflicts are self-healable with a full resync; protocol errors aren't.
    pub fn requires_resync(&self) -> bool {
        matches!(self, PatchRejection::UpdateNonexistent { .. })
    }

    pub fn affected_cells(&self) -> Option<Vec<String>> {
        match self {
            PatchRejection::UpdateNonexistent { affected } => Some(affected.clone()),
            PatchRejection::UnknownOpKind { cell_id }
            | PatchRejection::MissingBody { cell_id } => Some(vec![cell_id.clone()]),
            _ => None,
        }
    }
}

// ─── Application ─────────────────────────────────────────────────────────────

/// Result of applying a patch.
///
/// `effective` holds only the operations that touched state, in patch order,
/// with canonical post-state bodies — exactly what gets broadcast.
///
/// `inverse` is ready to apply as-is to revert the patch: operations are
/// already in reverse order with pre-image bodies.
///
/// `changed` is the no-op verdict, and it is a *net* comparison of the
/// resulting map against the pre-image in canonical (insertion) order. A
/// patch can touch cells yet change nothing — a replayed `[add, remove]`
/// pair lands back on the pre-image — and such a patch must not advance the
/// update vector or reach other participants.
#[derive(Debug, Clone, PartialEq)]
pub struct ApplyOutcome {
    pub effective: Vec<CellOperation>,
    pub inverse: Vec<CellOperation>,
    changed: bool,
}

impl ApplyOutcome {
    pub fn is_noop(&self) -> bool {
        !self.changed
    }
}

/// Validate and apply a patch against the cell map.
///
/// Per-op semantics:
/// - `add`: insert when absent; idempotent update when present (clients retry
///   after reconnect, so a duplicate add is not a conflict).
/// - `update`: replace when present; reject the whole patch when absent.
///   An update may target a cell added earlier in the same patch.
/// - `remove`: delete when present; no-op when absent.
pub fn apply_patch(cells: &mut CellMap, patch: &Patch) -> Result<ApplyOutcome, PatchRejection> {
    if patch.kind != PatchKind::Patch {
        return Err(PatchRejection::NotAPatch);
    }
    if patch.cells.is_empty() {
        return Err(PatchRejection::Empty);
    }

    // Validation pass over a simulated presence set — nothing is mutated
    // until the whole patch is known to be valid.
    let mut present: HashSet<&str> = cells.keys().map(String::as_str).collect();
    let mut missing: Vec<String> = Vec::new();
    for op in &patch.cells {
        match op.operation {
            CellOpKind::Add => {
                if op
                    .data
                    .as_ref()
                    .and_then(serde_json::Value::as_object)
                    .is_none()
                {
                    return Err(PatchRejection::MissingBody {
                        cell_id: op.id.clone(),
                    });
                }
                present.insert(&op.id);
            }
            CellOpKind::Update => {
                if op
                    .data
                    .as_ref()
                    .and_then(serde_json::Value::as_object)
                    .is_none()
                {
                    return Err(PatchRejection::MissingBody {
                        cell_id: op.id.clone(),
                    });
                }
                if !present.contains(op.id.as_str()) {
                    missing.push(op.id.clone());
                }
            }
            CellOpKind::Remove => {
                present.remove(op.id.as_str());
            }
            CellOpKind::Unknown => {
                return Err(PatchRejection::UnknownOpKind {
                    cell_id: op.id.clone(),
                });
            }
        }
    }
    if !missing.is_empty() {
        return Err(PatchRejection::UpdateNonexistent { affected: missing });
    }

    // Apply pass. Collects effective ops and their inverses. The pre-image
    // is kept for the net no-op comparison at the end.
    let pre_image = cells.clone();
    let mut effective: Vec<CellOperation> = Vec::new();
    let mut inverse: Vec<CellOperation> = Vec::new();
    for op in &patch.cells {
        match op.operation {
            CellOpKind::Add | CellOpKind::Update => {
                // Validated above: data is an object.
                let new_cell = match op.data.as_ref().and_then(|d| Cell::from_op_data(&op.id, d)) {
                    Some(c) => c,
                    None => continue,
                };
                match cells.get_mut(&op.id) {
                    Some(existing) => {
                        if existing.body == new_cell.body {
                            continue; // no state change for this op
                        }
                        let old = existing.clone();
                        effective.push(CellOperation {
                            id: op.id.clone(),
                            operation: CellOpKind::Update,
                            data: Some(new_cell.to_value()),
                        });
                        inverse.push(CellOperation {
                            id: op.id.clone(),
                            operation: CellOpKind::Update,
                            data: Some(old.to_value()),
                        });
                        *existing = new_cell;
                    }
                    None => {
                        effective.push(CellOperation {
                            id: op.id.clone(),
                            operation: CellOpKind::Add,
                            data: Some(new_cell.to_value()),
                        });
                        inverse.push(CellOperation {
                            id: op.id.clone(),
                            operation: CellOpKind::Remove,
                            data: None,
                        });
                        cells.insert(op.id.clone(), new_cell);
                    }
                }
            }
            CellOpKind::Remove => {
                // shift_remove keeps the insertion order of the survivors.
                if let Some(old) = cells.shift_remove(&op.id) {
                    effective.push(CellOperation {
                        id: op.id.clone(),
                        operation: CellOpKind::Remove,
                        data: None,
                    });
                    inverse.push(CellOperation {
                        id: op.id.clone(),
                        operation: CellOpKind::Add,
                        data: Some(old.to_value()),
                    });
                }
            }
            CellOpKind::Unknown => unreachable!("rejected during validation"),
        }
    }

    // Inverses revert in reverse application order.
    inverse.reverse();

    // Ordered comparison: a patch that only rotates a cell to the tail of
    // the map still changes the canonical snapshot.
    let changed = !effective.is_empty() && !cells.iter().eq(pre_image.iter());

    Ok(ApplyOutcome {
        effective,
        inverse,
        changed,
    })
}
