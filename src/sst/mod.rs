/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The shared-state table: a replicated row-per-node structure where each node writes its own row
//! and observes everyone else's, with predicate/trigger pairs evaluated on every observed update.
//!
//! Both the ordered-delivery engine and the group-membership service run entirely on this table,
//! using disjoint column sets of the same [row](row::GroupRow). One evaluator thread per table
//! runs all triggers, so triggers never race each other and may mutate the local row without
//! additional locks.

pub mod predicates;
pub mod row;
pub mod transport;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use borsh::BorshDeserialize;

use crate::types::ViewNumber;

use predicates::PredicateStore;
use row::GroupRow;
use transport::RowSession;

/// A point-in-time copy of the table, handed to predicates. Predicates are pure functions of a
/// snapshot; by the time a trigger runs the table may already have moved on.
pub struct SstSnapshot {
    pub rows: Vec<GroupRow>,
    pub frozen: Vec<bool>,
    pub my_rank: usize,
}

impl SstSnapshot {
    pub fn num_members(&self) -> usize {
        self.rows.len()
    }

    /// Ranks whose rows still accept updates.
    pub fn live_ranks(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.rows.len()).filter(|&r| !self.frozen[r])
    }
}

impl std::ops::Index<usize> for SstSnapshot {
    type Output = GroupRow;

    fn index(&self, rank: usize) -> &GroupRow {
        &self.rows[rank]
    }
}

struct RowTable {
    rows: Vec<GroupRow>,
    frozen: Vec<bool>,
}

struct SstCore {
    my_rank: usize,
    table: Mutex<RowTable>,
    /// Bumped on every local put and accepted remote update; the evaluator idles on it.
    generation: Mutex<u64>,
    update_cv: Condvar,
    predicates: PredicateStore,
    session: Arc<dyn RowSession>,
    shutdown: AtomicBool,
}

impl SstCore {
    fn snapshot(&self) -> SstSnapshot {
        let table = self.table.lock().unwrap();
        SstSnapshot {
            rows: table.rows.clone(),
            frozen: table.frozen.clone(),
            my_rank: self.my_rank,
        }
    }

    fn bump_generation(&self) {
        let mut generation = self.generation.lock().unwrap();
        *generation += 1;
        self.update_cv.notify_all();
    }
}

/// The owning handle to a view's table. Exactly one exists per view; dropping it stops and joins
/// the evaluator thread.
pub struct Sst {
    core: Arc<SstCore>,
    evaluator: Option<JoinHandle<()>>,
}

/// A cheap, cloneable handle to a table. Held by the delivery engine for row writes and passed to
/// every trigger. Holding an `SstHandle` does not keep the evaluator alive.
#[derive(Clone)]
pub struct SstHandle {
    core: Arc<SstCore>,
}

/// The entry point through which a [`RowTransport`](transport::RowTransport) session pushes
/// remote rows into the table. Holds the table weakly so a lingering transport cannot keep a
/// retired view alive.
#[derive(Clone)]
pub struct RowSink {
    core: Weak<SstCore>,
}

impl RowSink {
    /// Apply a serialized remote row received from `rank`. Ignored if the rank is frozen, out of
    /// range, or the bytes do not parse (a frozen sender's last write racing its freeze).
    pub fn apply(&self, rank: usize, row_bytes: &[u8]) {
        let Some(core) = self.core.upgrade() else {
            return;
        };
        let Ok(row) = GroupRow::try_from_slice(row_bytes) else {
            log::warn!("discarding malformed row update from rank {}", rank);
            return;
        };
        {
            let mut table = core.table.lock().unwrap();
            if rank >= table.rows.len() || table.frozen[rank] || rank == core.my_rank {
                return;
            }
            table.rows[rank] = row;
        }
        core.bump_generation();
    }
}

impl Sst {
    /// Build the table for a view of `num_members` members, with this node at `my_rank`. Ranks
    /// already failed at construction time start frozen.
    pub fn new(
        num_members: usize,
        my_rank: usize,
        vid: ViewNumber,
        max_members: usize,
        failed: &[bool],
        session_factory: impl FnOnce(RowSink) -> Arc<dyn RowSession>,
    ) -> Sst {
        let mut rows = Vec::with_capacity(num_members);
        for rank in 0..num_members {
            let mut row = GroupRow::new(max_members);
            // Remote rows keep a sentinel vid until their first real update arrives, so
            // predicates can tell a placeholder from a peer's actual state.
            row.vid = if rank == my_rank { vid } else { -1 };
            rows.push(row);
        }
        let core = Arc::new_cyclic(|weak: &Weak<SstCore>| {
            let sink = RowSink { core: weak.clone() };
            SstCore {
                my_rank,
                table: Mutex::new(RowTable {
                    rows,
                    frozen: failed.to_vec(),
                }),
                generation: Mutex::new(0),
                update_cv: Condvar::new(),
                predicates: PredicateStore::new(),
                session: session_factory(sink),
                shutdown: AtomicBool::new(false),
            }
        });
        Sst {
            core,
            evaluator: None,
        }
    }

    pub fn handle(&self) -> SstHandle {
        SstHandle {
            core: self.core.clone(),
        }
    }

    pub fn snapshot(&self) -> SstSnapshot {
        self.core.snapshot()
    }

    pub fn with_local_row<R>(&self, f: impl FnOnce(&mut GroupRow) -> R) -> R {
        self.handle().with_local_row(f)
    }

    pub fn put(&self) {
        self.handle().put()
    }

    pub fn freeze(&self, rank: usize) {
        self.handle().freeze(rank)
    }

    pub fn sync_with_members(&self) {
        self.core.session.sync_with_members()
    }

    pub fn predicates(&self) -> &PredicateStore {
        &self.core.predicates
    }

    /// Start the evaluator thread. All predicates installed before this point are evaluated on
    /// the first sweep.
    pub fn start_predicate_evaluation(&mut self) {
        assert!(self.evaluator.is_none());
        let handle = self.handle();
        let core = self.core.clone();
        self.evaluator = Some(thread::spawn(move || {
            let mut seen_generation = 0u64;
            loop {
                if core.shutdown.load(Ordering::Relaxed) {
                    return;
                }
                core.predicates.sweep(&handle);
                let generation = core.generation.lock().unwrap();
                if *generation != seen_generation {
                    seen_generation = *generation;
                    continue;
                }
                // No update since the last sweep: idle briefly. Recurrent predicates whose
                // conditions depend on engine-internal state (not rows) rely on this periodic
                // re-sweep.
                let (generation, _) = core
                    .update_cv
                    .wait_timeout(generation, Duration::from_micros(200))
                    .unwrap();
                seen_generation = *generation;
            }
        }));
    }
}

impl Drop for Sst {
    fn drop(&mut self) {
        self.core.shutdown.store(true, Ordering::Relaxed);
        self.core.update_cv.notify_all();
        if let Some(evaluator) = self.evaluator.take() {
            let _ = evaluator.join();
        }
    }
}

impl SstHandle {
    pub fn snapshot(&self) -> SstSnapshot {
        self.core.snapshot()
    }

    pub fn my_rank(&self) -> usize {
        self.core.my_rank
    }

    /// Mutate this node's row. Call [`put`](Self::put) afterwards to replicate the change.
    pub fn with_local_row<R>(&self, f: impl FnOnce(&mut GroupRow) -> R) -> R {
        let mut table = self.core.table.lock().unwrap();
        let my_rank = self.core.my_rank;
        f(&mut table.rows[my_rank])
    }

    /// Broadcast this node's row to every other member. The table lock is held through the
    /// publish so concurrent puts cannot reach peers out of order (a stale row replacing a
    /// newer one would regress their counters).
    pub fn put(&self) {
        {
            let table = self.core.table.lock().unwrap();
            let row_bytes = borsh::to_vec(&table.rows[self.core.my_rank])
                .expect("row serialization cannot fail");
            self.core.session.publish(&row_bytes);
        }
        self.core.bump_generation();
    }

    /// Cease to accept updates from `rank`. The rank's row keeps its last accepted value.
    pub fn freeze(&self, rank: usize) {
        {
            let mut table = self.core.table.lock().unwrap();
            table.frozen[rank] = true;
        }
        self.core.bump_generation();
    }

    pub fn predicates(&self) -> &PredicateStore {
        &self.core.predicates
    }
}

#[cfg(test)]
mod tests {
    use super::predicates::PredicateKind;
    use super::transport::RowSession;
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    /// Records published rows; no peers.
    struct NullSession {
        publishes: AtomicUsize,
    }

    impl RowSession for NullSession {
        fn publish(&self, _row_bytes: &[u8]) {
            self.publishes.fetch_add(1, Ordering::Relaxed);
        }

        fn sync_with_members(&self) {}
    }

    fn solo_sst() -> Sst {
        Sst::new(1, 0, 0, 4, &[false], |_| {
            Arc::new(NullSession {
                publishes: AtomicUsize::new(0),
            })
        })
    }

    fn pair_sst() -> (Sst, RowSink) {
        let mut captured = None;
        let sst = Sst::new(2, 0, 0, 4, &[false, false], |sink| {
            captured = Some(sink);
            Arc::new(NullSession {
                publishes: AtomicUsize::new(0),
            })
        });
        (sst, captured.unwrap())
    }

    #[test]
    fn local_writes_are_visible_in_snapshots() {
        let sst = solo_sst();
        sst.with_local_row(|row| row.seq_num = 9);
        sst.put();
        assert_eq!(sst.snapshot()[0].seq_num, 9);
    }

    #[test]
    fn frozen_ranks_reject_remote_updates() {
        let (sst, sink) = pair_sst();
        let mut row = GroupRow::new(4);
        row.seq_num = 5;
        sink.apply(1, &borsh::to_vec(&row).unwrap());
        assert_eq!(sst.snapshot()[1].seq_num, 5);

        sst.freeze(1);
        row.seq_num = 11;
        sink.apply(1, &borsh::to_vec(&row).unwrap());
        assert_eq!(sst.snapshot()[1].seq_num, 5);
    }

    #[test]
    fn one_shot_predicates_fire_once() {
        let mut sst = solo_sst();
        let (tx, rx) = mpsc::channel();
        sst.predicates().insert(
            Box::new(|snapshot| snapshot[0].seq_num >= 0),
            Box::new(move |_| tx.send(()).unwrap()),
            PredicateKind::OneShot,
        );
        sst.with_local_row(|row| row.seq_num = 0);
        sst.put();
        sst.start_predicate_evaluation();
        rx.recv_timeout(Duration::from_secs(1)).unwrap();
        // A second update must not re-fire the continuation.
        sst.with_local_row(|row| row.seq_num = 1);
        sst.put();
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn triggers_may_install_continuations() {
        let mut sst = solo_sst();
        let (tx, rx) = mpsc::channel();
        let handle_for_trigger = sst.handle();
        sst.predicates().insert(
            Box::new(|snapshot| snapshot[0].wedged),
            Box::new(move |_| {
                let tx = tx.clone();
                handle_for_trigger.predicates().insert(
                    Box::new(|snapshot| snapshot[0].global_min_ready),
                    Box::new(move |_| tx.send(()).unwrap()),
                    PredicateKind::OneShot,
                );
            }),
            PredicateKind::OneShot,
        );
        sst.start_predicate_evaluation();
        sst.with_local_row(|row| row.wedged = true);
        sst.put();
        sst.with_local_row(|row| row.global_min_ready = true);
        sst.put();
        rx.recv_timeout(Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn removed_predicates_stop_firing() {
        let mut sst = solo_sst();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_in_trigger = fired.clone();
        let handle = sst.predicates().insert(
            Box::new(|_| true),
            Box::new(move |_| {
                fired_in_trigger.fetch_add(1, Ordering::Relaxed);
            }),
            PredicateKind::Recurrent,
        );
        sst.start_predicate_evaluation();
        while fired.load(Ordering::Relaxed) == 0 {
            thread::yield_now();
        }
        sst.predicates().remove(handle);
        // Allow in-flight sweeps to settle, then confirm the count stops moving.
        thread::sleep(Duration::from_millis(20));
        let settled = fired.load(Ordering::Relaxed);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(fired.load(Ordering::Relaxed), settled);
    }
}
