//! Item status store.
//!
//! The scheduler never owns queue items directly: it holds an [`ItemStore`]
//! and mutates status only through per-item compare-and-set, so the "mark
//! executing" step of an admission cycle and a concurrent completion report
//! can never race on the same item.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use cliq_core::{ItemFailure, ItemStatus, QueueItem, QueueSnapshot};
use tracing::warn;

/// Errors from an item store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Item not found: {item_id}")]
    ItemNotFound { item_id: String },

    #[error("Invalid transition for item {item_id}: {from} -> {to}")]
    InvalidTransition {
        item_id: String,
        from: ItemStatus,
        to: ItemStatus,
    },

    #[error("Failed to persist queue snapshot: {0}")]
    Persist(#[from] cliq_core::Error),
}

/// The new status of an item plus the details that go with it.
///
/// `failure` and `blocked_by` replace the stored values, so leaving them
/// `None` clears stale details from an earlier run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemUpdate {
    pub status: ItemStatus,
    pub failure: Option<ItemFailure>,
    pub blocked_by: Option<String>,
}

impl ItemUpdate {
    pub const fn status(status: ItemStatus) -> Self {
        Self {
            status,
            failure: None,
            blocked_by: None,
        }
    }

    pub const fn failed(failure: ItemFailure) -> Self {
        Self {
            status: ItemStatus::Failed,
            failure: Some(failure),
            blocked_by: None,
        }
    }

    pub const fn blocked(root: String) -> Self {
        Self {
            status: ItemStatus::Blocked,
            failure: None,
            blocked_by: Some(root),
        }
    }
}

/// Shared, injectable item-status store.
pub trait ItemStore: Send + Sync + 'static {
    /// Copy of every item, in snapshot order.
    fn snapshot(&self) -> Vec<QueueItem>;

    fn get(&self, item_id: &str) -> Option<QueueItem>;

    /// Apply `update` only if the item's status is currently `expected`.
    ///
    /// Returns `Ok(false)` when the item has moved on. Illegal edges are an
    /// error. `blocked -> blocked` is allowed to relabel the blocking root.
    fn compare_and_set(
        &self,
        item_id: &str,
        expected: ItemStatus,
        update: ItemUpdate,
    ) -> Result<bool, StoreError>;
}

struct Inner {
    items: Vec<QueueItem>,
    index: HashMap<String, usize>,
}

/// In-memory store over a [`QueueSnapshot`], optionally written back to disk
/// after every change.
pub struct SnapshotStore {
    inner: Mutex<Inner>,
    path: Option<PathBuf>,
}

impl SnapshotStore {
    pub fn new(snapshot: QueueSnapshot) -> Self {
        let index = snapshot
            .items
            .iter()
            .enumerate()
            .map(|(i, item)| (item.item_id.clone(), i))
            .collect();
        Self {
            inner: Mutex::new(Inner {
                items: snapshot.items,
                index,
            }),
            path: None,
        }
    }

    /// Persist the snapshot to `path` after every applied update.
    #[must_use]
    pub fn with_persistence(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Write the current snapshot to the configured path, if any.
    pub fn flush(&self) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        QueueSnapshot::new(self.snapshot()).save(path)?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl ItemStore for SnapshotStore {
    fn snapshot(&self) -> Vec<QueueItem> {
        self.lock().items.clone()
    }

    fn get(&self, item_id: &str) -> Option<QueueItem> {
        let inner = self.lock();
        inner.index.get(item_id).map(|&i| inner.items[i].clone())
    }

    fn compare_and_set(
        &self,
        item_id: &str,
        expected: ItemStatus,
        update: ItemUpdate,
    ) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        let Some(&pos) = inner.index.get(item_id) else {
            return Err(StoreError::ItemNotFound {
                item_id: item_id.to_string(),
            });
        };
        if inner.items[pos].status != expected {
            return Ok(false);
        }
        let relabel = expected == ItemStatus::Blocked && update.status == ItemStatus::Blocked;
        if !relabel && !expected.can_transition_to(update.status) {
            return Err(StoreError::InvalidTransition {
                item_id: item_id.to_string(),
                from: expected,
                to: update.status,
            });
        }

        // Written under the lock so snapshots land on disk in update order.
        // Memory only changes once the write has succeeded.
        if let Some(path) = &self.path {
            let mut items = inner.items.clone();
            apply(&mut items[pos], update.clone());
            if let Err(e) = QueueSnapshot::new(items).save(path) {
                warn!(item_id, error = %e, "Failed to persist queue snapshot");
                return Err(e.into());
            }
        }
        apply(&mut inner.items[pos], update);
        Ok(true)
    }
}

fn apply(item: &mut QueueItem, update: ItemUpdate) {
    item.status = update.status;
    item.failure = update.failure;
    item.blocked_by = update.blocked_by;
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use cliq_core::FailureKind;

    fn store() -> SnapshotStore {
        SnapshotStore::new(QueueSnapshot::new(vec![
            QueueItem::new("a", "i"),
            QueueItem::new("b", "i").with_deps(&["a"]),
        ]))
    }

    #[test]
    fn cas_applies_when_expected_matches() {
        let store = store();
        assert!(
            store
                .compare_and_set("a", ItemStatus::Pending, ItemUpdate::status(ItemStatus::Ready))
                .unwrap()
        );
        assert_eq!(store.get("a").unwrap().status, ItemStatus::Ready);
    }

    #[test]
    fn cas_is_noop_when_status_moved_on() {
        let store = store();
        assert!(
            !store
                .compare_and_set("a", ItemStatus::Ready, ItemUpdate::status(ItemStatus::Executing))
                .unwrap()
        );
        assert_eq!(store.get("a").unwrap().status, ItemStatus::Pending);
    }

    #[test]
    fn cas_rejects_illegal_edge() {
        let store = store();
        let err = store
            .compare_and_set("a", ItemStatus::Pending, ItemUpdate::status(ItemStatus::Completed))
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
    }

    #[test]
    fn cas_unknown_item() {
        let err = store()
            .compare_and_set("zzz", ItemStatus::Pending, ItemUpdate::status(ItemStatus::Ready))
            .unwrap_err();
        assert!(matches!(err, StoreError::ItemNotFound { .. }));
    }

    #[test]
    fn only_one_concurrent_admission_wins() {
        let store = std::sync::Arc::new(store());
        store
            .compare_and_set("a", ItemStatus::Pending, ItemUpdate::status(ItemStatus::Ready))
            .unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = std::sync::Arc::clone(&store);
                std::thread::spawn(move || {
                    store
                        .compare_and_set(
                            "a",
                            ItemStatus::Ready,
                            ItemUpdate::status(ItemStatus::Executing),
                        )
                        .unwrap()
                })
            })
            .collect();
        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(wins, 1);
    }

    #[test]
    fn update_replaces_failure_details() {
        let store = store();
        for (from, to) in [
            (ItemStatus::Pending, ItemStatus::Ready),
            (ItemStatus::Ready, ItemStatus::Executing),
        ] {
            store.compare_and_set("a", from, ItemUpdate::status(to)).unwrap();
        }
        store
            .compare_and_set(
                "a",
                ItemStatus::Executing,
                ItemUpdate::failed(ItemFailure::new(FailureKind::Execution, "exit 1")),
            )
            .unwrap();
        assert!(store.get("a").unwrap().failure.is_some());

        store
            .compare_and_set("a", ItemStatus::Failed, ItemUpdate::status(ItemStatus::Pending))
            .unwrap();
        assert!(store.get("a").unwrap().failure.is_none());
    }

    #[test]
    fn blocked_can_be_relabelled() {
        let store = store();
        store
            .compare_and_set("b", ItemStatus::Pending, ItemUpdate::blocked("a".into()))
            .unwrap();
        assert!(
            store
                .compare_and_set("b", ItemStatus::Blocked, ItemUpdate::blocked("x".into()))
                .unwrap()
        );
        assert_eq!(store.get("b").unwrap().blocked_by.as_deref(), Some("x"));
    }

    #[test]
    fn persists_every_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.json");
        let store = store().with_persistence(&path);
        store
            .compare_and_set("a", ItemStatus::Pending, ItemUpdate::status(ItemStatus::Ready))
            .unwrap();

        let on_disk = QueueSnapshot::load(&path).unwrap();
        assert_eq!(on_disk.get("a").unwrap().status, ItemStatus::Ready);
        assert_eq!(on_disk.get("b").unwrap().status, ItemStatus::Pending);
    }

    #[test]
    fn failed_write_keeps_previous_status() {
        let dir = tempfile::tempdir().unwrap();
        // A regular file where the queue directory should be.
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"").unwrap();
        let path = blocker.join("queue.json");
        let store = store().with_persistence(&path);

        let err = store
            .compare_and_set("a", ItemStatus::Pending, ItemUpdate::status(ItemStatus::Ready))
            .unwrap_err();
        assert!(matches!(err, StoreError::Persist(_)));
        assert_eq!(store.get("a").unwrap().status, ItemStatus::Pending);

        std::fs::remove_file(&blocker).unwrap();
        assert!(
            store
                .compare_and_set("a", ItemStatus::Pending, ItemUpdate::status(ItemStatus::Ready))
                .unwrap()
        );
        assert_eq!(QueueSnapshot::load(&path).unwrap().get("a").unwrap().status, ItemStatus::Ready);
    }
}
