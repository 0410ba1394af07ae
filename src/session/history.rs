//! Bounded undo/redo history.
//!
//! Every applied mutation records the effective forward ops and their
//! pre-image inverses (captured at apply time — the only moment the
//! pre-image exists). Undo pops the newest entry and the hub applies its
//! inverse; redo re-applies the forward ops. A fresh mutation invalidates
//! the redo branch.

use crate::protocol::CellOperation;
use std::collections::VecDeque;

/// One applied mutation, both directions.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    /// Effective ops exactly as they were broadcast.
    pub forward: Vec<CellOperation>,
    /// Pre-image ops, already in reverse order, ready to apply as a patch.
    pub inverse: Vec<CellOperation>,
}

/// LIFO undo stack plus its redo mirror, both bounded by `depth`.
/// `depth == 0` disables history entirely.
#[derive(Debug, Default)]
pub struct History {
    depth: usize,
    undo: VecDeque<HistoryEntry>,
    redo: Vec<HistoryEntry>,
}

impl History {
    pub fn new(depth: usize) -> Self {
        Self {
            depth,
            undo: VecDeque::new(),
            redo: Vec::new(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.depth > 0
    }

    /// Record a freshly applied mutation. Drops the oldest entry past the
    /// cap and invalidates the redo branch.
    pub fn record(&mut self, entry: HistoryEntry) {
        if !self.enabled() {
            return;
        }
        self.undo.push_back(entry);
        if self.undo.len() > self.depth {
            self.undo.pop_front();
        }
        self.redo.clear();
    }

    /// Pop the entry to undo. The hub applies its `inverse` and, on success,
    /// hands the entry to [`History::push_redo`].
    pub fn pop_undo(&mut self) -> Option<HistoryEntry> {
        self.undo.pop_back()
    }

    pub fn push_redo(&mut self, entry: HistoryEntry) {
        self.redo.push(entry);
    }

    /// Pop the entry to redo. The hub applies its `forward` ops and, on
    /// success, hands the entry to [`History::restore`].
    pub fn pop_redo(&mut self) -> Option<HistoryEntry> {
        self.redo.pop()
    }

    /// Put an entry back on the undo stack after a redo, without touching
    /// the rest of the redo branch.
    pub fn restore(&mut self, entry: HistoryEntry) {
        if !self.enabled() {
            return;
        }
        self.undo.push_back(entry);
        if self.undo.len() > self.depth {
            self.undo.pop_front();
        }
    }

    /// Forget everything. Called when a snapshot replaces session state.
    pub fn clear(&mut self) {
        self.undo.clear();
        self.redo.clear();
    }

    pub fn undo_len(&self) -> usize {
        self.undo.len()
    }

    pub fn redo_len(&self) -> usize {
        self.redo.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::CellOpKind;

    fn entry(id: &str) -> HistoryEntry {
        HistoryEntry {
            forward: vec![CellOperation {
                id: id.into(),
                operation: CellOpKind::Add,
                data: Some(serde_json::json!({})),
            }],
            inverse: vec![CellOperation {
                id: id.into(),
                operation: CellOpKind::Remove,
                data: None,
            }],
        }
    }

    #[test]
    fn zero_depth_disables_recording() {
        let mut h = History::new(0);
        h.record(entry("a"));
        assert_eq!(h.undo_len(), 0);
        assert!(h.pop_undo().is_none());
    }

    #[test]
    fn record_caps_at_depth() {
        let mut h = History::new(3);
        for i in 0..5 {
            h.record(entry(&format!("c{i}")));
        }
        assert_eq!(h.undo_len(), 3);
        // The newest entries survive.
        assert_eq!(h.pop_undo().unwrap().forward[0].id, "c4");
        assert_eq!(h.pop_undo().unwrap().forward[0].id, "c3");
        assert_eq!(h.pop_undo().unwrap().forward[0].id, "c2");
    }

    #[test]
    fn fresh_mutation_clears_redo() {
        let mut h = History::new(10);
        h.record(entry("a"));
        let e = h.pop_undo().unwrap();
        h.push_redo(e);
        assert_eq!(h.redo_len(), 1);
        h.record(entry("b"));
        assert_eq!(h.redo_len(), 0);
    }

    #[test]
    fn redo_restores_without_clearing_branch() {
        let mut h = History::new(10);
        h.record(entry("a"));
        h.record(entry("b"));
        let e = h.pop_undo().unwrap(); // undo b
        h.push_redo(e);
        let e = h.pop_undo().unwrap(); // undo a
        h.push_redo(e);
        assert_eq!(h.redo_len(), 2);

        let e = h.pop_redo().unwrap(); // redo a
        h.restore(e);
        assert_eq!(h.undo_len(), 1);
        assert_eq!(h.redo_len(), 1); // b still redoable
    }

    #[test]
    fn clear_forgets_both_stacks() {
        let mut h = History::new(10);
        h.record(entry("a"));
        h.push_redo(entry("b"));
        h.clear();
        assert_eq!(h.undo_len(), 0);
        assert_eq!(h.redo_len(), 0);
    }
}
