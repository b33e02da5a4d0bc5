//! Dependency graph over queue items.
//!
//! [`QueueGraph`] is a read-only view of an item snapshot. It validates that
//! the `depends_on` edges form a DAG (Kahn's algorithm), computes the ready
//! frontier, and works out which items must be blocked or may recover after
//! a status change. It never mutates items; callers apply the results.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use cliq_core::{ItemStatus, QueueItem};
use serde::Serialize;

/// Errors from graph validation.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("Invalid queue graph: {message}")]
    Validation { message: String },
}

/// Status changes implied by the current failure set.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Propagation {
    /// `(item_id, root failed item_id)` for every item that must become `blocked`.
    pub block: Vec<(String, String)>,
    /// Blocked items with no failed ancestor whose dependencies all completed.
    pub recover: Vec<String>,
}

impl Propagation {
    pub const fn is_empty(&self) -> bool {
        self.block.is_empty() && self.recover.is_empty()
    }
}

/// Run progress: settled items (completed, failed, blocked) over total.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Progress {
    pub settled: usize,
    pub total: usize,
    pub percent: f64,
}

impl Progress {
    #[allow(clippy::cast_precision_loss)]
    pub fn new(settled: usize, total: usize) -> Self {
        let percent = if total == 0 {
            100.0
        } else {
            settled as f64 * 100.0 / total as f64
        };
        Self {
            settled,
            total,
            percent,
        }
    }

    pub const fn is_done(&self) -> bool {
        self.settled == self.total
    }
}

/// Borrowed graph view over a slice of items.
#[derive(Debug)]
pub struct QueueGraph<'a> {
    items: &'a [QueueItem],
    index: HashMap<&'a str, usize>,
    /// Reverse edges: item position -> positions of items that depend on it.
    dependents: Vec<Vec<usize>>,
}

impl<'a> QueueGraph<'a> {
    /// Build the view. Unknown dependency ids are ignored here; use
    /// [`QueueGraph::validate`] to reject them.
    pub fn new(items: &'a [QueueItem]) -> Self {
        let index: HashMap<&str, usize> = items
            .iter()
            .enumerate()
            .map(|(i, item)| (item.item_id.as_str(), i))
            .collect();

        let mut dependents = vec![Vec::new(); items.len()];
        for (pos, item) in items.iter().enumerate() {
            for dep in &item.depends_on {
                if let Some(&dep_pos) = index.get(dep.as_str()) {
                    dependents[dep_pos].push(pos);
                }
            }
        }

        Self {
            items,
            index,
            dependents,
        }
    }

    pub fn get(&self, item_id: &str) -> Option<&'a QueueItem> {
        self.index.get(item_id).map(|&i| &self.items[i])
    }

    fn status_of(&self, item_id: &str) -> Option<ItemStatus> {
        self.get(item_id).map(|i| i.status)
    }

    fn deps_completed(&self, item: &QueueItem) -> bool {
        item.depends_on
            .iter()
            .all(|d| self.status_of(d) == Some(ItemStatus::Completed))
    }

    /// Pending items whose dependencies have all completed, ordered by
    /// `execution_order`. Ties keep snapshot order.
    pub fn ready_items(&self) -> Vec<&'a QueueItem> {
        let mut ready: Vec<&QueueItem> = self
            .items
            .iter()
            .filter(|i| i.status == ItemStatus::Pending && self.deps_completed(i))
            .collect();
        ready.sort_by_key(|i| i.execution_order);
        ready
    }

    /// Compute blocking and recovery from the current failure set.
    ///
    /// Every item reachable from a `failed` item over dependent edges is
    /// tainted. Tainted `pending`/`ready` items must be blocked; a tainted
    /// `blocked` item is relabelled if its recorded root changed. `blocked`
    /// items that are no longer tainted recover once all their dependencies
    /// have completed. `executing` and terminal items are never touched.
    pub fn propagate_blocked(&self) -> Propagation {
        let mut root_of: Vec<Option<usize>> = vec![None; self.items.len()];
        let mut queue: VecDeque<(usize, usize)> = VecDeque::new();

        for (pos, item) in self.items.iter().enumerate() {
            if item.status == ItemStatus::Failed {
                for &ds in &self.dependents[pos] {
                    queue.push_back((ds, pos));
                }
            }
        }

        let mut visited: HashSet<usize> = HashSet::new();
        while let Some((pos, root)) = queue.pop_front() {
            if !visited.insert(pos) {
                continue;
            }
            root_of[pos] = Some(root);
            for &ds in &self.dependents[pos] {
                queue.push_back((ds, root));
            }
        }

        let mut propagation = Propagation::default();
        for (pos, item) in self.items.iter().enumerate() {
            match (item.status, root_of[pos]) {
                (ItemStatus::Pending | ItemStatus::Ready, Some(root)) => {
                    propagation
                        .block
                        .push((item.item_id.clone(), self.items[root].item_id.clone()));
                }
                (ItemStatus::Blocked, Some(root)) => {
                    let root_id = &self.items[root].item_id;
                    if item.blocked_by.as_ref() != Some(root_id) {
                        propagation.block.push((item.item_id.clone(), root_id.clone()));
                    }
                }
                (ItemStatus::Blocked, None) if self.deps_completed(item) => {
                    propagation.recover.push(item.item_id.clone());
                }
                _ => {}
            }
        }
        propagation
    }

    pub fn progress(&self) -> Progress {
        let settled = self.items.iter().filter(|i| i.status.is_settled()).count();
        Progress::new(settled, self.items.len())
    }

    /// Item ids per execution group. Groups never gate scheduling.
    pub fn groups(&self) -> BTreeMap<&'a str, Vec<&'a str>> {
        let mut groups: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for item in self.items {
            groups
                .entry(item.execution_group.as_str())
                .or_default()
                .push(item.item_id.as_str());
        }
        groups
    }

    /// Reject duplicate ids, unknown or self dependencies, and cycles.
    pub fn validate(&self) -> Result<(), GraphError> {
        if self.index.len() != self.items.len() {
            let mut seen = HashSet::new();
            for item in self.items {
                if !seen.insert(item.item_id.as_str()) {
                    return Err(GraphError::Validation {
                        message: format!("Duplicate item id '{}'", item.item_id),
                    });
                }
            }
        }

        for item in self.items {
            for dep in &item.depends_on {
                if *dep == item.item_id {
                    return Err(GraphError::Validation {
                        message: format!("Item '{}' depends on itself", item.item_id),
                    });
                }
                if !self.index.contains_key(dep.as_str()) {
                    return Err(GraphError::Validation {
                        message: format!(
                            "Item '{}' depends on unknown item '{dep}'",
                            item.item_id
                        ),
                    });
                }
            }
        }

        // Kahn's algorithm over the reverse edges.
        let mut in_degree: Vec<usize> = self
            .items
            .iter()
            .map(|i| {
                i.depends_on
                    .iter()
                    .collect::<HashSet<_>>()
                    .len()
            })
            .collect();
        let mut queue: VecDeque<usize> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, d)| **d == 0)
            .map(|(i, _)| i)
            .collect();

        let mut processed = 0usize;
        while let Some(pos) = queue.pop_front() {
            processed += 1;
            let mut seen = HashSet::new();
            for &ds in &self.dependents[pos] {
                if !seen.insert(ds) {
                    continue;
                }
                in_degree[ds] = in_degree[ds].saturating_sub(1);
                if in_degree[ds] == 0 {
                    queue.push_back(ds);
                }
            }
        }

        if processed != self.items.len() {
            return Err(GraphError::Validation {
                message: "Dependency graph contains a cycle".to_string(),
            });
        }
        Ok(())
    }
}
