//! Append-ordered operation log with author-scoped undo/redo.
//!
//! ```text
//!   committed: [ op1 | op2 | op3 | op4 ]      redo: [ opA | opB ]
//!                                   ▲                        ▲
//!                           undo_last()          redo_last() pops here,
//!                        undo_last_by(a) scans   appends to committed tail
//!                        backward from here
//! ```
//!
//! The redo buffer is shared by every author in the room. Author-scoped
//! undo may remove an operation from the middle of the log; every redo
//! appends at the tail. Ids are never reassigned, so a redone operation
//! keeps its id but not its original position.

use log::warn;

use crate::operation::{ConnectionId, Operation, OperationDraft, OperationId};

/// First id handed out by an empty log.
pub const FIRST_OPERATION_ID: OperationId = 1;

/// Committed operations plus the shared redo buffer for one room.
#[derive(Debug, Clone)]
pub struct OperationLog {
    committed: Vec<Operation>,
    /// Most recently undone last.
    redo: Vec<Operation>,
    next_id: OperationId,
}

impl Default for OperationLog {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationLog {
    pub fn new() -> Self {
        Self {
            committed: Vec::new(),
            redo: Vec::new(),
            next_id: FIRST_OPERATION_ID,
        }
    }

    /// Rebuild a log from persisted state. The redo buffer always starts empty.
    ///
    /// A `next_id` that does not exceed every stored id is raised to
    /// `max(id) + 1`.
    pub fn hydrate(operations: Vec<Operation>, next_id: OperationId) -> Self {
        let floor = operations
            .iter()
            .map(|op| op.id.saturating_add(1))
            .max()
            .unwrap_or(FIRST_OPERATION_ID);
        let next_id = if next_id < floor {
            warn!("Snapshot next_id {next_id} is behind stored ids, raising to {floor}");
            floor
        } else {
            next_id
        };
        Self {
            committed: operations,
            redo: Vec::new(),
            next_id,
        }
    }

    /// Assign the next id, stamp the author, append, and drop all pending redo.
    pub fn commit(&mut self, draft: OperationDraft, author: Option<ConnectionId>) -> Operation {
        let op = Operation {
            id: self.next_id,
            author_id: author,
            kind: draft.kind,
            payload: draft.payload,
        };
        self.next_id = self.next_id.saturating_add(1);
        self.redo.clear();
        self.committed.push(op.clone());
        op
    }

    /// Owned copy of the committed log, in log order.
    pub fn snapshot(&self) -> Vec<Operation> {
        self.committed.clone()
    }

    /// Remove the tail operation regardless of author.
    pub fn undo_last(&mut self) -> Option<Operation> {
        let op = self.committed.pop()?;
        self.redo.push(op.clone());
        Some(op)
    }

    /// Remove the most recent operation committed by `author`, wherever it sits.
    pub fn undo_last_by(&mut self, author: &ConnectionId) -> Option<Operation> {
        let index = self.committed.iter().rposition(|op| op.is_authored_by(author))?;
        let op = self.committed.remove(index);
        self.redo.push(op.clone());
        Some(op)
    }

    /// Re-append the most recently undone operation.
    pub fn redo_last(&mut self) -> Option<Operation> {
        let op = self.redo.pop()?;
        self.committed.push(op.clone());
        Some(op)
    }

    /// Re-append the most recently undone operation authored by `author`.
    pub fn redo_last_by(&mut self, author: &ConnectionId) -> Option<Operation> {
        let index = self.redo.iter().rposition(|op| op.is_authored_by(author))?;
        let op = self.redo.remove(index);
        self.committed.push(op.clone());
        Some(op)
    }

    /// Empty the log and the redo buffer. Ids keep counting from where they were.
    pub fn clear(&mut self) {
        self.committed.clear();
        self.redo.clear();
    }

    pub fn next_id(&self) -> OperationId {
        self.next_id
    }

    pub fn len(&self) -> usize {
        self.committed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.committed.is_empty()
    }

    pub fn redo_len(&self) -> usize {
        self.redo.len()
    }

    /// Committed ids in log order.
    pub fn ids(&self) -> Vec<OperationId> {
        self.committed.iter().map(|op| op.id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::OperationKind;
    use serde_json::json;
    use uuid::Uuid;

    fn draft(label: &str) -> OperationDraft {
        OperationDraft::new(OperationKind::FreehandPath, json!({ "label": label }))
    }

    #[test]
    fn test_commit_assigns_increasing_ids() {
        let mut log = OperationLog::new();
        let a = Uuid::new_v4();

        let first = log.commit(draft("a"), Some(a));
        let second = log.commit(draft("b"), Some(a));

        assert_eq!(first.id, 1);
        assert_eq!(second.id, 2);
        assert_eq!(first.author_id, Some(a));
        assert_eq!(log.next_id(), 3);
        assert_eq!(log.ids(), vec![1, 2]);
    }

    #[test]
    fn test_ids_never_reused_across_undo_redo() {
        let mut log = OperationLog::new();
        let a = Uuid::new_v4();
        let mut seen = Vec::new();

        seen.push(log.commit(draft("1"), Some(a)).id);
        seen.push(log.commit(draft("2"), Some(a)).id);
        log.undo_last();
        log.undo_last();
        seen.push(log.commit(draft("3"), Some(a)).id);
        log.undo_last_by(&a);
        log.redo_last_by(&a);
        seen.push(log.commit(draft("4"), None).id);

        assert_eq!(seen, vec![1, 2, 3, 4]);
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_commit_clears_redo_buffer() {
        let mut log = OperationLog::new();
        let a = Uuid::new_v4();
        log.commit(draft("a"), Some(a));
        log.undo_last();
        assert_eq!(log.redo_len(), 1);

        log.commit(draft("b"), Some(a));
        assert_eq!(log.redo_len(), 0);
        assert!(log.redo_last().is_none());
        assert!(log.redo_last_by(&a).is_none());
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let mut log = OperationLog::new();
        log.commit(draft("a"), None);
        let snapshot = log.snapshot();

        log.undo_last();
        assert_eq!(snapshot.len(), 1);
        assert!(log.is_empty());
    }

    #[test]
    fn test_undo_last_on_empty_log() {
        let mut log = OperationLog::new();
        assert!(log.undo_last().is_none());
        assert_eq!(log.redo_len(), 0);
    }

    #[test]
    fn test_undo_last_by_removes_from_middle() {
        let mut log = OperationLog::new();
        let x = Uuid::new_v4();
        let y = Uuid::new_v4();
        log.commit(draft("x1"), Some(x));
        log.commit(draft("y1"), Some(y));
        log.commit(draft("y2"), Some(y));

        let undone = log.undo_last_by(&x).unwrap();
        assert_eq!(undone.id, 1);
        assert_eq!(log.ids(), vec![2, 3]);
        assert_eq!(log.redo_len(), 1);
    }

    #[test]
    fn test_undo_last_by_unknown_author_is_noop() {
        let mut log = OperationLog::new();
        let x = Uuid::new_v4();
        log.commit(draft("x1"), Some(x));
        log.commit(draft("sys"), None);

        assert!(log.undo_last_by(&Uuid::new_v4()).is_none());
        assert_eq!(log.ids(), vec![1, 2]);
        assert_eq!(log.redo_len(), 0);
    }

    #[test]
    fn test_redo_by_reinserts_at_tail() {
        let mut log = OperationLog::new();
        let x = Uuid::new_v4();
        let y = Uuid::new_v4();
        let a = log.commit(draft("A"), Some(x));
        log.commit(draft("B"), Some(y));

        log.undo_last_by(&x).unwrap();
        let redone = log.redo_last_by(&x).unwrap();

        assert_eq!(redone, a);
        assert_eq!(log.ids(), vec![2, 1]);
        assert_eq!(log.snapshot()[1].payload, json!({ "label": "A" }));
    }

    #[test]
    fn test_redo_by_skips_other_authors() {
        let mut log = OperationLog::new();
        let x = Uuid::new_v4();
        let y = Uuid::new_v4();
        log.commit(draft("x"), Some(x));
        log.commit(draft("y"), Some(y));
        log.undo_last_by(&x);
        log.undo_last_by(&y);

        let redone = log.redo_last_by(&x).unwrap();
        assert_eq!(redone.id, 1);
        assert_eq!(log.redo_len(), 1);
        assert!(log.redo_last_by(&x).is_none());

        let global = log.redo_last().unwrap();
        assert_eq!(global.id, 2);
        assert_eq!(log.ids(), vec![1, 2]);
    }

    #[test]
    fn test_global_undo_redo_is_lifo() {
        let mut log = OperationLog::new();
        log.commit(draft("1"), None);
        log.commit(draft("2"), None);
        log.undo_last();
        log.undo_last();

        assert_eq!(log.redo_last().unwrap().id, 1);
        assert_eq!(log.redo_last().unwrap().id, 2);
        assert!(log.redo_last().is_none());
    }

    #[test]
    fn test_system_operations_only_undone_globally() {
        let mut log = OperationLog::new();
        log.commit(draft("sys"), None);
        assert!(log.undo_last_by(&Uuid::nil()).is_none());
        assert_eq!(log.undo_last().unwrap().author_id, None);
    }

    #[test]
    fn test_clear_keeps_id_counter() {
        let mut log = OperationLog::new();
        log.commit(draft("1"), None);
        log.commit(draft("2"), None);
        log.undo_last();
        log.clear();

        assert!(log.is_empty());
        assert_eq!(log.redo_len(), 0);
        assert_eq!(log.commit(draft("3"), None).id, 3);
    }

    #[test]
    fn test_hydrate_resumes_ids_with_empty_redo() {
        let ops = vec![
            Operation { id: 1, author_id: None, kind: OperationKind::Text, payload: json!({}) },
            Operation { id: 2, author_id: None, kind: OperationKind::Image, payload: json!({}) },
        ];
        let mut log = OperationLog::hydrate(ops, 3);

        assert_eq!(log.redo_len(), 0);
        assert!(log.redo_last().is_none());
        assert_eq!(log.commit(draft("next"), None).id, 3);
    }

    #[test]
    fn test_hydrate_repairs_stale_counter() {
        let ops = vec![
            Operation { id: 4, author_id: None, kind: OperationKind::Text, payload: json!({}) },
            Operation { id: 9, author_id: None, kind: OperationKind::Text, payload: json!({}) },
        ];
        let log = OperationLog::hydrate(ops, 2);
        assert_eq!(log.next_id(), 10);

        let empty = OperationLog::hydrate(Vec::new(), 0);
        assert_eq!(empty.next_id(), FIRST_OPERATION_ID);
    }

    #[test]
    fn test_hydrate_with_max_id_does_not_overflow() {
        let ops = vec![Operation {
            id: OperationId::MAX,
            author_id: None,
            kind: OperationKind::Text,
            payload: json!({}),
        }];
        let log = OperationLog::hydrate(ops, 1);
        assert_eq!(log.next_id(), OperationId::MAX);
    }
}
