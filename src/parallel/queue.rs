//! Ready queue ordered by (priority, id) with include/exclude filters

use std::collections::{BTreeSet, HashSet};

/// Allow-list / skip-list applied before items are exposed for dispatch
#[derive(Debug, Clone, Default)]
pub struct ItemFilter {
    include: HashSet<String>,
    exclude: HashSet<String>,
}

impl ItemFilter {
    pub fn new<I, E>(include: I, exclude: E) -> Self
    where
        I: IntoIterator<Item = String>,
        E: IntoIterator<Item = String>,
    {
        Self {
            include: include.into_iter().collect(),
            exclude: exclude.into_iter().collect(),
        }
    }

    /// An empty include list admits everything; exclude always wins
    pub fn allows(&self, id: &str) -> bool {
        if self.exclude.contains(id) {
            return false;
        }
        self.include.is_empty() || self.include.contains(id)
    }
}

/// Priority queue of ready items.
///
/// Each id can be popped at most once per run, so an item is never
/// dispatched twice even if planning pushes it again.
#[derive(Debug, Default)]
pub struct ReadyQueue {
    entries: BTreeSet<(u32, String)>,
    queued: HashSet<String>,
    dispatched: HashSet<String>,
    filter: ItemFilter,
}

impl ReadyQueue {
    pub fn new(filter: ItemFilter) -> Self {
        Self {
            filter,
            ..Default::default()
        }
    }

    /// Queue an item. Returns false when it was filtered out, already queued
    /// or already dispatched.
    pub fn push(&mut self, id: &str, priority: u32) -> bool {
        if !self.filter.allows(id) || self.dispatched.contains(id) || self.queued.contains(id) {
            return false;
        }
        self.queued.insert(id.to_string());
        self.entries.insert((priority, id.to_string()));
        true
    }

    /// Take the highest-priority item and mark it dispatched
    pub fn pop(&mut self) -> Option<String> {
        let (_, id) = self.entries.pop_first()?;
        self.queued.remove(&id);
        self.dispatched.insert(id.clone());
        Some(id)
    }

    pub fn peek(&self) -> Option<&str> {
        self.entries.first().map(|(_, id)| id.as_str())
    }

    pub fn is_dispatched(&self, id: &str) -> bool {
        self.dispatched.contains(id)
    }

    pub fn allows(&self, id: &str) -> bool {
        self.filter.allows(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Queued ids in dispatch order
    pub fn queued_ids(&self) -> Vec<String> {
        self.entries.iter().map(|(_, id)| id.clone()).collect()
    }
}
