/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The predicate registry: recurrent and one-shot predicate/trigger pairs evaluated on every
//! observed row update.
//!
//! Predicates are pure functions of a row snapshot; triggers run inline on the table's single
//! evaluator thread and may mutate the local row, put it, freeze ranks, and insert or remove
//! predicates. Insertions and removals requested from inside a trigger take effect at the next
//! evaluation sweep, preserving registration order for everything already installed.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use super::{SstHandle, SstSnapshot};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PredicateKind {
    /// Re-evaluated on every sweep until removed.
    Recurrent,
    /// Retired after its first firing. Used as a continuation.
    OneShot,
}

/// Identifies an installed predicate, for removal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PredicateHandle(u64);

pub type Predicate = Box<dyn Fn(&SstSnapshot) -> bool + Send>;
pub type Trigger = Box<dyn FnMut(&SstHandle) + Send>;

struct Entry {
    id: u64,
    predicate: Predicate,
    trigger: Trigger,
    kind: PredicateKind,
}

#[derive(Default)]
struct StoreInner {
    entries: Vec<Entry>,
    /// Insertions land here and merge into `entries` at the start of the next sweep, so a
    /// trigger inserting a continuation never mutates the list being iterated.
    pending: Vec<Entry>,
    removed: HashSet<u64>,
}

pub struct PredicateStore {
    inner: Mutex<StoreInner>,
    next_id: AtomicU64,
}

impl PredicateStore {
    pub(crate) fn new() -> PredicateStore {
        PredicateStore {
            inner: Mutex::new(StoreInner::default()),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn insert(
        &self,
        predicate: Predicate,
        trigger: Trigger,
        kind: PredicateKind,
    ) -> PredicateHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.lock().unwrap().pending.push(Entry {
            id,
            predicate,
            trigger,
            kind,
        });
        PredicateHandle(id)
    }

    pub fn remove(&self, handle: PredicateHandle) {
        self.inner.lock().unwrap().removed.insert(handle.0);
    }

    pub fn remove_all(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.clear();
        inner.pending.clear();
        inner.removed.clear();
    }

    /// Evaluate every installed predicate once, in registration order, running the trigger of
    /// each one whose predicate holds. Returns whether any trigger ran.
    pub(crate) fn sweep(&self, sst: &SstHandle) -> bool {
        let mut work = {
            let mut inner = self.inner.lock().unwrap();
            let pending = std::mem::take(&mut inner.pending);
            inner.entries.extend(pending);
            let removed = std::mem::take(&mut inner.removed);
            let mut work = std::mem::take(&mut inner.entries);
            work.retain(|entry| !removed.contains(&entry.id));
            work
        };

        let mut fired_any = false;
        let mut survivors = Vec::with_capacity(work.len());
        for mut entry in work.drain(..) {
            // A trigger earlier in this sweep may have removed this entry.
            if self.inner.lock().unwrap().removed.contains(&entry.id) {
                continue;
            }
            let snapshot = sst.snapshot();
            let fired = (entry.predicate)(&snapshot);
            if fired {
                (entry.trigger)(sst);
                fired_any = true;
            }
            if !(fired && entry.kind == PredicateKind::OneShot) {
                survivors.push(entry);
            }
        }

        let mut inner = self.inner.lock().unwrap();
        let removed = std::mem::take(&mut inner.removed);
        survivors.retain(|entry| !removed.contains(&entry.id));
        // Anything inserted mid-sweep is still in `pending` and merges next sweep.
        inner.entries = survivors;
        fired_any
    }
}
