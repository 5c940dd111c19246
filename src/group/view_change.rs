/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The group-membership service: a leader-driven two-phase consensus on the next view, riding
//! entirely on the shared-state table.
//!
//! Five predicates run on every installed view:
//! 1. *suspicion*: amplifies failure suspicions across members, freezes failed rows, wedges, and
//!    (at the leader) proposes removal changes;
//! 2. *join-start* (leader): pulls an accepted joiner socket and proposes an addition change;
//! 3. *change-ack* (followers): echoes the leader's proposals and wedges;
//! 4. *change-commit* (leader): commits once every non-failed member acknowledged;
//! 5. *view-install* (one-shot): on a committed change beyond the current view, wedges, computes
//!    the successor, and chains two further one-shot continuations ("every non-failed member is
//!    wedged", then for followers "the leader's ragged-edge decision is ready") before the
//!    successor is built, synchronized and swapped in.
//!
//! Ragged-edge cleanup decides, per sender, exactly how many in-flight messages the outgoing
//! view delivers at every surviving member, so a successor view's first delivery is strictly
//! after its predecessor's last.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use crate::events::*;
use crate::sst::predicates::PredicateKind;
use crate::sst::row::GroupRow;
use crate::sst::{SstHandle, SstSnapshot};
use crate::types::{FatalError, MsgIndex, NodeId, ViewNumber};

use super::join;
use super::view::View;
use super::GroupCore;

/// Failed members at or beyond this count mean this node may be in a minority partition and must
/// halt: strictly more than half of the view is gone.
pub(crate) fn majority_threshold(num_members: usize) -> usize {
    num_members / 2 + 1
}

/// Install the membership predicates into the current view's table. Called once at startup and
/// again after every view installation.
pub(crate) fn register_predicates(core: &Arc<GroupCore>) {
    let view = core.curr_view.lock().unwrap();
    // A shutdown racing the tail of a view change may already have detached the table.
    let Some(sst) = view.sst.as_ref() else {
        return;
    };
    let max_members = core.config.max_members;
    *core.last_suspected.lock().unwrap() = vec![false; max_members];

    let suspected_changed = {
        let weak = Arc::downgrade(core);
        sst.predicates().insert(
            Box::new(move |snapshot: &SstSnapshot| {
                let Some(core) = weak.upgrade() else {
                    return false;
                };
                if core.is_dead() {
                    return false;
                }
                let last_suspected = core.last_suspected.lock().unwrap();
                (0..snapshot.num_members()).any(|rank| {
                    (0..snapshot.num_members())
                        .any(|who| snapshot[rank].suspected[who] && !last_suspected[who])
                })
            }),
            {
                let weak = Arc::downgrade(core);
                Box::new(move |sst: &SstHandle| {
                    if let Some(core) = weak.upgrade() {
                        core.on_suspicion(sst);
                    }
                })
            },
            PredicateKind::Recurrent,
        )
    };

    // Only start one join at a time.
    let start_join = {
        let weak = Arc::downgrade(core);
        sst.predicates().insert(
            Box::new(move |_: &SstSnapshot| {
                let Some(core) = weak.upgrade() else {
                    return false;
                };
                if core.is_dead() {
                    return false;
                }
                core.curr_view.lock().unwrap().i_am_leader()
                    && !core.pending_joins.lock().unwrap().is_empty()
                    && core.joining_client.lock().unwrap().is_none()
            }),
            {
                let weak = Arc::downgrade(core);
                Box::new(move |sst: &SstHandle| {
                    if let Some(core) = weak.upgrade() {
                        core.on_start_join(sst);
                    }
                })
            },
            PredicateKind::Recurrent,
        )
    };

    let change_commit = {
        let weak = Arc::downgrade(core);
        sst.predicates().insert(
            Box::new(move |snapshot: &SstSnapshot| {
                let Some(core) = weak.upgrade() else {
                    return false;
                };
                if core.is_dead() {
                    return false;
                }
                let view = core.curr_view.lock().unwrap();
                view.i_am_leader()
                    && min_acked(snapshot, &view.failed) > snapshot[view.my_rank].n_committed
            }),
            {
                let weak = Arc::downgrade(core);
                Box::new(move |sst: &SstHandle| {
                    if let Some(core) = weak.upgrade() {
                        core.on_commit(sst);
                    }
                })
            },
            PredicateKind::Recurrent,
        )
    };

    let leader_proposed = {
        let weak = Arc::downgrade(core);
        sst.predicates().insert(
            Box::new(move |snapshot: &SstSnapshot| {
                let Some(core) = weak.upgrade() else {
                    return false;
                };
                if core.is_dead() {
                    return false;
                }
                let view = core.curr_view.lock().unwrap();
                let leader_rank = view.leader_rank();
                let my_rank = view.my_rank;
                if snapshot[leader_rank].n_changes > snapshot[my_rank].n_acked {
                    return true;
                }
                // A freshly promoted leader may reuse a change index the dead leader's proposal
                // occupied on this row; re-echo whenever the pending window stops mirroring the
                // current leader's. Uncommitted entries only - committed ones were acked by
                // every live member and cannot differ. The vid check keeps the comparison off
                // the leader's placeholder row before its first update arrives.
                leader_rank != my_rank
                    && snapshot[leader_rank].vid == view.vid
                    && !echoes_leader(
                        &snapshot[leader_rank],
                        &snapshot[my_rank],
                        core.config.max_members,
                    )
            }),
            {
                let weak = Arc::downgrade(core);
                Box::new(move |sst: &SstHandle| {
                    if let Some(core) = weak.upgrade() {
                        core.on_ack(sst);
                    }
                })
            },
            PredicateKind::Recurrent,
        )
    };

    let leader_committed = {
        let weak = Arc::downgrade(core);
        sst.predicates().insert(
            Box::new(move |snapshot: &SstSnapshot| {
                let Some(core) = weak.upgrade() else {
                    return false;
                };
                if core.is_dead() {
                    return false;
                }
                let view = core.curr_view.lock().unwrap();
                snapshot[view.leader_rank()].n_committed > view.vid
            }),
            {
                let weak = Arc::downgrade(core);
                Box::new(move |sst: &SstHandle| {
                    if let Some(core) = weak.upgrade() {
                        core.start_view_change(sst);
                    }
                })
            },
            PredicateKind::OneShot,
        )
    };

    let mut handles = core.gms_handles.lock().unwrap();
    handles.suspected_changed = Some(suspected_changed);
    handles.start_join = Some(start_join);
    handles.change_commit = Some(change_commit);
    handles.leader_proposed = Some(leader_proposed);
    handles.leader_committed = Some(leader_committed);
}

impl GroupCore {
    /// Quiesce the view: halt its delivery engine and announce the fact on our row.
    fn wedge_view_locked(&self, view: &View) {
        view.wedge();
        let sst = view.sst();
        let newly_wedged = sst.with_local_row(|row| {
            let newly_wedged = !row.wedged;
            row.wedged = true;
            newly_wedged
        });
        sst.put();
        if newly_wedged {
            self.publish_event(Event::WedgeView(WedgeViewEvent {
                timestamp: SystemTime::now(),
                vid: view.vid,
            }));
        }
    }

    /// Suspicion trigger. ORs in the union of suspicions from all rows; for each newly suspected
    /// member: freeze its row, wedge, mark it failed, and (leader) propose its removal. Halts the
    /// node if a majority is gone.
    pub(crate) fn on_suspicion(self: &Arc<Self>, sst: &SstHandle) {
        if self.is_dead() {
            return;
        }
        log::debug!("suspected[] changed");
        let mut view = self.curr_view.lock().unwrap();
        if view.sst.is_none() {
            return;
        }
        let my_rank = view.my_rank;
        let num_members = view.num_members();
        let max_members = self.config.max_members;

        let snapshot = sst.snapshot();
        let mut my_suspected = snapshot[my_rank].suspected.clone();
        for rank in 0..num_members {
            for who in 0..num_members {
                if snapshot[rank].suspected[who] {
                    my_suspected[who] = true;
                }
            }
        }
        sst.with_local_row(|row| row.suspected.copy_from_slice(&my_suspected));

        for suspect_rank in 0..num_members {
            if !my_suspected[suspect_rank] || view.failed[suspect_rank] {
                continue;
            }
            let suspect_id = view.members[suspect_rank];
            if view.n_failed >= majority_threshold(num_members) {
                let n_failed = view.n_failed;
                drop(view);
                self.fatal(FatalError::MajorityLost {
                    n_failed,
                    num_members,
                });
                return;
            }

            log::debug!(
                "gms telling sst to freeze row {} which is node {}",
                suspect_rank,
                suspect_id
            );
            self.publish_event(Event::SuspectFailure(SuspectFailureEvent {
                timestamp: SystemTime::now(),
                suspect: suspect_id,
            }));
            sst.freeze(suspect_rank);
            self.wedge_view_locked(&view);
            view.failed[suspect_rank] = true;
            view.n_failed += 1;

            if view.n_failed >= majority_threshold(num_members) {
                let n_failed = view.n_failed;
                drop(view);
                self.fatal(FatalError::MajorityLost {
                    n_failed,
                    num_members,
                });
                return;
            }
            sst.put();

            // Leader initiated: report the failure as a removal change.
            if view.i_am_leader()
                && !changes_contains(&sst.snapshot()[my_rank], view.vid, suspect_id, max_members)
            {
                let overflowed = sst.with_local_row(|row| {
                    if (row.n_changes - row.n_committed) as usize == max_members {
                        return true;
                    }
                    let n_changes = row.n_changes;
                    row.changes[n_changes as usize % max_members] = suspect_id;
                    row.n_changes = n_changes + 1;
                    false
                });
                if overflowed {
                    drop(view);
                    self.fatal(FatalError::ChangeListOverflow);
                    return;
                }
                log::debug!("leader proposed a change to remove failed node {}", suspect_id);
                self.publish_event(Event::ProposeChange(ProposeChangeEvent {
                    timestamp: SystemTime::now(),
                    node: suspect_id,
                    n_changes: sst.snapshot()[my_rank].n_changes,
                }));
                sst.put();
            }
        }

        core_copy_suspected(&my_suspected, &mut self.last_suspected.lock().unwrap());
    }

    /// Join-start trigger (leader). Pulls the next queued joiner socket, validates the announced
    /// id against the preconfigured map, and proposes the addition.
    pub(crate) fn on_start_join(self: &Arc<Self>, sst: &SstHandle) {
        if self.is_dead() {
            return;
        }
        let view = self.curr_view.lock().unwrap();
        if view.sst.is_none() || !view.i_am_leader() {
            return;
        }
        let Some(mut socket) = self.pending_joins.lock().unwrap().pop_front() else {
            return;
        };
        log::debug!("gms handling a new client connection");

        let joiner_id = match join::read_joiner_id(&mut socket) {
            Ok(joiner_id) => joiner_id,
            Err(error) => {
                log::warn!("aborting join: {}", error);
                return;
            }
        };
        let Some(joiner_addr) = self.config.member_addrs.get(&joiner_id).cloned() else {
            log::warn!(
                "aborting join: node id {} has no preassigned address",
                joiner_id
            );
            return;
        };
        if view.rank_of(joiner_id).is_some() {
            log::warn!("aborting join: node {} is already a member", joiner_id);
            return;
        }

        let max_members = self.config.max_members;
        let snapshot = sst.snapshot();
        let my_row = &snapshot[view.my_rank];
        if (my_row.n_changes - my_row.n_committed) as usize == max_members / 2 {
            drop(view);
            self.fatal(FatalError::ChangeListOverflow);
            return;
        }

        self.publish_event(Event::ReceiveJoinRequest(ReceiveJoinRequestEvent {
            timestamp: SystemTime::now(),
            joiner: joiner_id,
            joiner_addr: joiner_addr.clone(),
        }));
        log::debug!("proposing change to add node {}", joiner_id);
        let n_changes = sst.with_local_row(|row| {
            let n_changes = row.n_changes;
            row.changes[n_changes as usize % max_members] = joiner_id;
            row.joiner_addr = joiner_addr;
            row.n_changes = n_changes + 1;
            row.n_changes
        });
        self.publish_event(Event::ProposeChange(ProposeChangeEvent {
            timestamp: SystemTime::now(),
            node: joiner_id,
            n_changes,
        }));

        log::debug!("wedging view {}", view.vid);
        self.wedge_view_locked(&view);
        sst.put();
        *self.joining_client.lock().unwrap() = Some((joiner_id, socket));
    }

    /// Change-ack trigger. Echo the leader's proposals, acknowledge them, and wedge.
    pub(crate) fn on_ack(self: &Arc<Self>, sst: &SstHandle) {
        if self.is_dead() {
            return;
        }
        let view = self.curr_view.lock().unwrap();
        if view.sst.is_none() {
            return;
        }
        let my_rank = view.my_rank;
        let leader_rank = view.leader_rank();
        let snapshot = sst.snapshot();
        log::debug!(
            "detected that leader proposed view change #{}; acknowledging",
            snapshot[leader_rank].n_changes
        );
        let leader_row = snapshot[leader_rank].clone();
        let n_acked = sst.with_local_row(|row| {
            if my_rank != leader_rank {
                // Echo the vector including the new changes, the joiner's address, and the
                // counts.
                row.changes.copy_from_slice(&leader_row.changes);
                row.joiner_addr = leader_row.joiner_addr.clone();
                row.n_changes = leader_row.n_changes;
                row.n_committed = leader_row.n_committed;
            }
            row.n_acked = leader_row.n_changes;
            row.n_acked
        });
        sst.put();
        self.publish_event(Event::AckChange(AckChangeEvent {
            timestamp: SystemTime::now(),
            n_acked,
        }));
        log::debug!("wedging current view");
        self.wedge_view_locked(&view);
    }

    /// Change-commit trigger (leader). Advance `n_committed` to the minimum acknowledged by any
    /// non-failed member.
    pub(crate) fn on_commit(self: &Arc<Self>, sst: &SstHandle) {
        if self.is_dead() {
            return;
        }
        let view = self.curr_view.lock().unwrap();
        if view.sst.is_none() {
            return;
        }
        let n_committed = min_acked(&sst.snapshot(), &view.failed);
        sst.with_local_row(|row| row.n_committed = n_committed);
        log::debug!("leader committing view proposal #{}", n_committed);
        sst.put();
        self.publish_event(Event::CommitChange(CommitChangeEvent {
            timestamp: SystemTime::now(),
            n_committed,
        }));
    }

    /// View-install trigger (one-shot): a change beyond the current view committed. Wedge,
    /// compute the successor, and await meta-wedged.
    pub(crate) fn start_view_change(self: &Arc<Self>, sst: &SstHandle) {
        if self.is_dead() {
            return;
        }
        let view = self.curr_view.lock().unwrap();
        if view.sst.is_none() {
            return;
        }
        log::debug!("starting view change to view {}", view.vid + 1);
        self.publish_event(Event::StartViewChange(StartViewChangeEvent {
            timestamp: SystemTime::now(),
            from_vid: view.vid,
        }));

        // Disable all the other membership predicates except suspicion and the continuation
        // about to be registered.
        {
            let mut handles = self.gms_handles.lock().unwrap();
            for handle in [
                handles.start_join.take(),
                handles.change_commit.take(),
                handles.leader_proposed.take(),
            ]
            .into_iter()
            .flatten()
            {
                sst.predicates().remove(handle);
            }
        }

        self.wedge_view_locked(&view);

        let snapshot = sst.snapshot();
        let my_row = &snapshot[view.my_rank];
        let change_id = my_row.changes[(view.vid as usize) % self.config.max_members];
        let joiner_addr = my_row.joiner_addr.clone();
        let join_case = view.rank_of(change_id).is_none();
        let (next, my_next_rank) = view.successor(change_id, &joiner_addr);
        if my_next_rank.is_none() {
            let my_id = view.my_id();
            drop(view);
            self.fatal(FatalError::Evicted { my_id });
            return;
        }
        {
            let mut next_view = self.next_view.lock().unwrap();
            if next_view.is_some() {
                drop(next_view);
                drop(view);
                self.fatal(FatalError::SstOverwrite);
                return;
            }
            *next_view = Some(next);
        }
        let wedging_vid = view.vid;
        drop(view);

        // At this point we need to await "meta wedged": every non-failed member has quiesced.
        // The rest of the view change runs in the continuation.
        let meta_wedged = {
            let weak = Arc::downgrade(self);
            Box::new(move |snapshot: &SstSnapshot| {
                let Some(core) = weak.upgrade() else {
                    return false;
                };
                if core.is_dead() {
                    return false;
                }
                let view = core.curr_view.lock().unwrap();
                (0..view.num_members()).all(|rank| view.failed[rank] || snapshot[rank].wedged)
            })
        };
        let meta_wedged_continuation = {
            let weak = Arc::downgrade(self);
            Box::new(move |sst: &SstHandle| {
                if let Some(core) = weak.upgrade() {
                    core.on_meta_wedged(sst, join_case, wedging_vid);
                }
            })
        };
        sst.predicates()
            .insert(meta_wedged, meta_wedged_continuation, PredicateKind::OneShot);
    }

    /// Every non-failed member is wedged. The leader can continue into installation directly;
    /// followers interpose one more continuation waiting for the leader's ragged-edge decision.
    fn on_meta_wedged(self: &Arc<Self>, sst: &SstHandle, join_case: bool, wedging_vid: ViewNumber) {
        if self.is_dead() {
            return;
        }
        log::debug!("meta-wedged is true; continuing view change");
        let i_am_leader = self.curr_view.lock().unwrap().i_am_leader();
        if i_am_leader {
            self.install_view(sst, join_case);
        } else {
            let leader_global_min_is_ready = {
                let weak = Arc::downgrade(self);
                Box::new(move |snapshot: &SstSnapshot| {
                    let Some(core) = weak.upgrade() else {
                        return false;
                    };
                    if core.is_dead() {
                        return false;
                    }
                    let view = core.curr_view.lock().unwrap();
                    let leader_rank = view.leader_rank();
                    // Either the decision arrived (vid-tagged against a prior leader's stale
                    // row), or cascading failures made us the leader ourselves.
                    leader_rank == view.my_rank
                        || (snapshot[leader_rank].global_min_ready
                            && snapshot[leader_rank].vid == wedging_vid)
                })
            };
            let global_min_ready_continuation = {
                let weak = Arc::downgrade(self);
                Box::new(move |sst: &SstHandle| {
                    if let Some(core) = weak.upgrade() {
                        core.install_view(sst, join_case);
                    }
                })
            };
            sst.predicates().insert(
                leader_global_min_is_ready,
                global_min_ready_continuation,
                PredicateKind::OneShot,
            );
        }
    }

    /// The tail of the view change: ragged-edge cleanup, the joiner handshake reply, successor
    /// construction and synchronization, the swap, and the upcalls.
    fn install_view(self: &Arc<Self>, sst: &SstHandle, join_case: bool) {
        if self.is_dead() {
            return;
        }
        let mut view = self.curr_view.lock().unwrap();
        if view.sst.is_none() {
            // Shutdown got here first.
            return;
        }
        let old_members = view.members.clone();

        self.ragged_edge_cleanup(&view);

        if view.i_am_leader() && join_case {
            // Send the view to the newly joined client before we try to do table and multicast
            // setup.
            let joining_client = self.joining_client.lock().unwrap().take();
            let next_view = self.next_view.lock().unwrap();
            if let (Some((joiner_id, mut socket)), Some(next)) =
                (joining_client, next_view.as_ref())
            {
                log::debug!("sending client the new view");
                match join::write_view(&mut socket, next) {
                    Ok(()) => self.publish_event(Event::SendJoinResponse(SendJoinResponseEvent {
                        timestamp: SystemTime::now(),
                        joiner: joiner_id,
                        vid: next.vid,
                    })),
                    // The joiner retries from scratch; the change stands and the view installs
                    // without it responding.
                    Err(error) => log::warn!("failed to send view to joiner: {}", error),
                }
            }
        }

        // Delete the last membership predicates from the old table in preparation for retiring
        // it.
        {
            let mut handles = self.gms_handles.lock().unwrap();
            for handle in [
                handles.leader_committed.take(),
                handles.suspected_changed.take(),
            ]
            .into_iter()
            .flatten()
            {
                sst.predicates().remove(handle);
            }
        }

        let mut next = self
            .next_view
            .lock()
            .unwrap()
            .take()
            .expect("view change reached installation without a committed next view");
        log::debug!(
            "starting creation of new SST and delivery engine for view {}",
            next.vid
        );

        // Senders that did not survive must not block the old session's pending receives.
        let removed_ranks: Vec<usize> = (0..view.num_members())
            .filter(|&rank| !next.members.contains(&view.members[rank]))
            .collect();
        view.engine().mark_removed_senders(&removed_ranks);

        // This blocks until every member of the new view responds to the initial handshake.
        self.attach_sst_and_engine(&mut next);
        let old_row = sst.snapshot()[view.my_rank].clone();
        let next_vid = next.vid;
        next.sst().with_local_row(|row| {
            row.init_from_existing(&old_row);
            row.vid = next_vid;
        });
        next.sst().put();
        next.sst().sync_with_members();
        log::debug!(
            "done setting up SST and delivery engine for view {}",
            next_vid
        );

        let new_members = next.members.clone();
        let old_view = std::mem::replace(&mut *view, next);
        {
            let mut old_views = self.old_views.lock().unwrap();
            old_views.push_back(old_view);
            self.old_views_cv.notify_all();
        }
        self.publish_event(Event::InstallView(InstallViewEvent {
            timestamp: SystemTime::now(),
            vid: next_vid,
            members: new_members.clone(),
        }));
        self.view_change_cv.notify_all();
        drop(view);

        // Register predicates in the new view.
        register_predicates(self);
        {
            let mut view = self.curr_view.lock().unwrap();
            if let Some(new_sst) = view.sst.as_mut() {
                new_sst.start_predicate_evaluation();
            } else {
                return;
            }

            // First task with the new view: if this node just became leader and everyone who
            // has not failed agrees, create a combined list of pending changes.
            if view.i_am_leader() && !view.i_know_i_am_leader {
                view.i_know_i_am_leader = true;
                self.merge_changes(&view);
            }
        }

        for view_upcall in &self.view_upcalls {
            view_upcall(&new_members, &old_members);
        }
    }

    /// Determine the per-sender delivery cutoffs for the outgoing view and flush the ragged edge
    /// in the canonical total order.
    fn ragged_edge_cleanup(&self, view: &View) {
        log::debug!("running ragged edge cleanup");
        if view.i_am_leader() {
            self.leader_ragged_edge_cleanup(view);
        } else {
            self.follower_ragged_edge_cleanup(view);
        }
        log::debug!("done with ragged edge cleanup");
    }

    fn leader_ragged_edge_cleanup(&self, view: &View) {
        let sst = view.sst();
        let num_members = view.num_members();
        let snapshot = sst.snapshot();

        // A prior leader may have decided and died; propagate its decision rather than computing
        // a fresh (possibly different) one.
        let mut global_min = (0..num_members)
            .find(|&rank| snapshot[rank].global_min_ready)
            .map(|rank| snapshot[rank].global_min.clone());

        if global_min.is_none() {
            let mut fresh = vec![-1; self.config.max_members];
            for (sender, slot) in fresh.iter_mut().enumerate().take(num_members) {
                *slot = (0..num_members)
                    .filter(|&rank| !view.failed[rank])
                    .map(|rank| snapshot[rank].n_received[sender])
                    .min()
                    .unwrap_or(-1);
            }
            global_min = Some(fresh);
        }
        let global_min = global_min.unwrap();

        sst.with_local_row(|row| {
            row.global_min.copy_from_slice(&global_min);
            row.global_min_ready = true;
        });
        log::debug!("leader finished computing global_min");
        sst.put();
        self.publish_event(Event::RaggedEdge(RaggedEdgeEvent {
            timestamp: SystemTime::now(),
            vid: view.vid,
            global_min: global_min[..num_members].to_vec(),
        }));

        self.deliver_in_order(view, &global_min);
    }

    fn follower_ragged_edge_cleanup(&self, view: &View) {
        let sst = view.sst();
        let leader_rank = view.leader_rank();
        // Learn the leader's data and push it before acting upon it.
        log::debug!("received leader's global_min; echoing it");
        let global_min = sst.snapshot()[leader_rank].global_min.clone();
        sst.with_local_row(|row| {
            row.global_min.copy_from_slice(&global_min);
            row.global_min_ready = true;
        });
        sst.put();
        self.publish_event(Event::RaggedEdge(RaggedEdgeEvent {
            timestamp: SystemTime::now(),
            vid: view.vid,
            global_min: global_min[..view.num_members()].to_vec(),
        }));

        self.deliver_in_order(view, &global_min);
    }

    fn deliver_in_order(&self, view: &View, global_min: &[MsgIndex]) {
        log::debug!(
            "delivering ragged-edge messages in order: {:?}",
            &global_min[..view.num_members()]
        );
        view.engine().deliver_upto(&global_min[..view.num_members()]);
    }

    /// A freshly promoted leader unions every non-failed member's pending changes into its own
    /// row, so proposals of the dead leader (and of anyone who echoed them) survive. Failed
    /// members whose removal proposal was lost entirely get a fresh one.
    fn merge_changes(&self, view: &View) {
        let sst = view.sst();
        let snapshot = sst.snapshot();
        let max_members = self.config.max_members;
        let vid = view.vid;
        sst.with_local_row(|row| {
            let mut append = |row: &mut GroupRow, id: NodeId| {
                if !changes_contains(row, vid, id, max_members) {
                    let n_changes = row.n_changes;
                    row.changes[n_changes as usize % max_members] = id;
                    row.n_changes = n_changes + 1;
                }
            };
            for rank in 0..view.num_members() {
                if view.failed[rank] {
                    continue;
                }
                let other = snapshot[rank].clone();
                for change in other.n_committed..other.n_changes {
                    append(row, other.changes[change as usize % max_members]);
                }
            }
            for rank in 0..view.num_members() {
                if view.failed[rank] {
                    append(row, view.members[rank]);
                }
            }
        });
        sst.put();
    }

    /// A node joining with a non-initial view copies the leader's change history so the
    /// leader's standing `n_changes` does not read as a brand-new proposal. Waits (bounded) for
    /// the leader's row to arrive; remote rows start with a sentinel `vid` of -1.
    pub(crate) fn adopt_leader_row(&self) {
        let view = self.curr_view.lock().unwrap();
        let sst = view.sst();
        let leader_rank = view.leader_rank();
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let snapshot = sst.snapshot();
            if snapshot[leader_rank].vid == view.vid {
                sst.with_local_row(|row| row.init_from_existing(&snapshot[leader_rank]));
                sst.put();
                return;
            }
            if Instant::now() > deadline {
                log::warn!("timed out waiting for the leader's row; continuing uninitialized");
                return;
            }
            std::thread::sleep(Duration::from_micros(200));
        }
    }
}

/// The smallest change count acknowledged by any non-failed member.
fn min_acked(snapshot: &SstSnapshot, failed: &[bool]) -> i32 {
    let my_rank = snapshot.my_rank;
    let mut min = snapshot[my_rank].n_acked;
    for (rank, &failed) in failed.iter().enumerate() {
        if !failed && snapshot[rank].n_acked < min {
            min = snapshot[rank].n_acked;
        }
    }
    min
}

/// Whether `id` is among the row's unapplied changes. The scan starts at the change the current
/// view would apply next (`vid`), not at `n_committed`: a committed-but-unapplied removal must
/// still suppress re-proposal, or its second application would misread as a join.
fn changes_contains(row: &GroupRow, from_vid: ViewNumber, id: NodeId, max_members: usize) -> bool {
    (from_vid..row.n_changes).any(|change| row.changes[change as usize % max_members] == id)
}

/// Whether `my_row`'s unacknowledged change window mirrors the leader's.
fn echoes_leader(leader_row: &GroupRow, my_row: &GroupRow, max_members: usize) -> bool {
    my_row.n_changes == leader_row.n_changes
        && (leader_row.n_committed..leader_row.n_changes).all(|change| {
            my_row.changes[change as usize % max_members]
                == leader_row.changes[change as usize % max_members]
        })
}

fn core_copy_suspected(my_suspected: &[bool], last_suspected: &mut Vec<bool>) {
    last_suspected[..my_suspected.len()].copy_from_slice(my_suspected);
}
