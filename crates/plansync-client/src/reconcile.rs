//! Reconciliation engine.
//!
//! Owns the task collection and the class color map. Remote input comes in
//! two shapes: a full snapshot that replaces everything, and targeted
//! upsert/delete changes. Local mutations report what they replaced so the
//! relay path can roll them back, and whether they changed anything so the
//! session only broadcasts real changes.
//!
//! After every remote apply the store opens a settle window; local changes
//! made inside it are not broadcast. This keeps an application that writes
//! back whatever it was just handed from echoing the update to the room.

use std::collections::HashSet;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use plansync_shared::{ClassColors, PeerId, TaskId, TaskRecord};

/// Targeted change pushed by a relay backend.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteChange {
    Upsert(TaskRecord),
    Delete(TaskId),
}

/// Outcome of a local mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation<T> {
    /// The value the mutation replaced
    pub previous: T,
    pub changed: bool,
}

/// A record removed by a local delete, with its former position.
#[derive(Debug, Clone, PartialEq)]
pub struct Removed {
    pub index: usize,
    pub record: TaskRecord,
}

#[derive(Debug)]
pub struct TaskStore {
    tasks: Vec<TaskRecord>,
    class_colors: ClassColors,
    settle_window: Duration,
    settle_until: Option<Instant>,
}

impl TaskStore {
    pub fn new(settle_window: Duration) -> Self {
        Self {
            tasks: Vec::new(),
            class_colors: ClassColors::new(),
            settle_window,
            settle_until: None,
        }
    }

    pub fn tasks(&self) -> &[TaskRecord] {
        &self.tasks
    }

    pub fn class_colors(&self) -> &ClassColors {
        &self.class_colors
    }

    pub fn get(&self, id: &TaskId) -> Option<&TaskRecord> {
        self.tasks.iter().find(|t| &t.id == id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    // -- Remote input --

    /// Replace the whole collection with a received snapshot. Duplicate ids
    /// collapse to their last occurrence. Returns the resulting task count.
    pub fn apply_snapshot(
        &mut self,
        tasks: Vec<TaskRecord>,
        class_colors: ClassColors,
        now: Instant,
    ) -> usize {
        let received = tasks.len();
        self.tasks = dedupe_keep_last(tasks);
        self.class_colors = class_colors;
        self.open_settle_window(now);

        if self.tasks.len() != received {
            debug!(
                received,
                kept = self.tasks.len(),
                "Collapsed duplicate ids in snapshot"
            );
        }
        self.tasks.len()
    }

    /// Apply a targeted change. Returns whether the collection changed.
    pub fn apply_change(&mut self, change: RemoteChange, now: Instant) -> bool {
        self.open_settle_window(now);
        match change {
            RemoteChange::Upsert(task) => self.put(task).1,
            RemoteChange::Delete(id) => self.take(&id).is_some(),
        }
    }

    /// Show a placeholder for a snapshot from `from` that could not be
    /// decrypted. Local records stay; the next readable snapshot replaces it.
    pub fn mark_undecryptable(&mut self, from: &PeerId, now: Instant) -> TaskId {
        let id = TaskId::new(format!("undecryptable-{from}"));
        self.apply_change(RemoteChange::Upsert(TaskRecord::undecryptable(id.clone())), now);
        id
    }

    /// Records fit to send to other devices. Placeholders stay local.
    pub fn shareable_tasks(&self) -> Vec<&TaskRecord> {
        self.tasks.iter().filter(|t| !t.is_undecryptable()).collect()
    }

    // -- Local mutations --

    pub fn replace_tasks(&mut self, tasks: Vec<TaskRecord>) -> Mutation<Vec<TaskRecord>> {
        let tasks = dedupe_keep_last(tasks);
        let changed = tasks != self.tasks;
        let previous = std::mem::replace(&mut self.tasks, tasks);
        Mutation { previous, changed }
    }

    pub fn set_class_colors(&mut self, class_colors: ClassColors) -> Mutation<ClassColors> {
        let changed = class_colors != self.class_colors;
        let previous = std::mem::replace(&mut self.class_colors, class_colors);
        Mutation { previous, changed }
    }

    /// Insert or replace in place. `previous` is the record that was replaced.
    pub fn upsert(&mut self, task: TaskRecord) -> Mutation<Option<TaskRecord>> {
        let (previous, changed) = self.put(task);
        Mutation { previous, changed }
    }

    /// Delete by id; deleting an unknown id is a no-op.
    pub fn delete(&mut self, id: &TaskId) -> Mutation<Option<Removed>> {
        let previous = self.take(id);
        Mutation {
            changed: previous.is_some(),
            previous,
        }
    }

    // -- Rollback --

    /// Undo an upsert of `id`.
    pub fn restore(&mut self, id: &TaskId, previous: Option<TaskRecord>) {
        match previous {
            Some(record) => {
                self.put(record);
            }
            None => {
                self.take(id);
            }
        }
    }

    /// Undo a delete.
    pub fn reinsert(&mut self, removed: Removed) {
        if self.get(&removed.record.id).is_some() {
            return;
        }
        let index = removed.index.min(self.tasks.len());
        self.tasks.insert(index, removed.record);
    }

    // -- Outbound gate --

    pub fn settling(&self, now: Instant) -> bool {
        self.settle_until.map(|until| now < until).unwrap_or(false)
    }

    /// Whether a local mutation should go out to the room.
    pub fn should_broadcast(&self, changed: bool, now: Instant) -> bool {
        changed && !self.settling(now)
    }

    fn open_settle_window(&mut self, now: Instant) {
        self.settle_until = Some(now + self.settle_window);
    }

    fn put(&mut self, task: TaskRecord) -> (Option<TaskRecord>, bool) {
        match self.tasks.iter_mut().find(|t| t.id == task.id) {
            Some(slot) => {
                let changed = *slot != task;
                (Some(std::mem::replace(slot, task)), changed)
            }
            None => {
                self.tasks.push(task);
                (None, true)
            }
        }
    }

    fn take(&mut self, id: &TaskId) -> Option<Removed> {
        let index = self.tasks.iter().position(|t| &t.id == id)?;
        Some(Removed {
            index,
            record: self.tasks.remove(index),
        })
    }
}

fn dedupe_keep_last(tasks: Vec<TaskRecord>) -> Vec<TaskRecord> {
    let mut seen = HashSet::new();
    let mut kept: Vec<TaskRecord> = tasks
        .into_iter()
        .rev()
        .filter(|t| seen.insert(t.id.clone()))
        .collect();
    kept.reverse();
    kept
}
