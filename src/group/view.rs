/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The [`View`]: one incarnation of the group's membership, together with the shared-state table
//! and delivery engine attached to it.

use crate::sst::Sst;
use crate::types::{NodeId, ViewNumber};

use super::delivery::DeliveryEngine;

/// An installed view. The membership descriptor is immutable for the view's lifetime (except for
/// `failed`, which suspicion may raise); the attached table and engine live and die with it.
pub struct View {
    pub vid: ViewNumber,
    /// Ordered member ids; a member's index is its rank.
    pub members: Vec<NodeId>,
    /// `"ip:port"` of each member, parallel to `members`.
    pub member_addrs: Vec<String>,
    /// True where a member is considered failed. Within a view `failed[leader_rank()]` is false
    /// at install time; the leader only changes across installations.
    pub failed: Vec<bool>,
    pub n_failed: usize,
    /// This node's rank. Views in which this node is not a member are never installed; eviction
    /// is detected before installation and terminates the node.
    pub my_rank: usize,
    /// Latched true the first time this node leads; used to detect becoming leader.
    pub(crate) i_know_i_am_leader: bool,
    pub(crate) sst: Option<Sst>,
    pub(crate) engine: Option<DeliveryEngine>,
}

impl View {
    /// The bootstrap view: this node alone, leading.
    pub(crate) fn bootstrap(my_id: NodeId, my_addr: String) -> View {
        View {
            vid: 0,
            members: vec![my_id],
            member_addrs: vec![my_addr],
            failed: vec![false],
            n_failed: 0,
            my_rank: 0,
            i_know_i_am_leader: true,
            sst: None,
            engine: None,
        }
    }

    pub fn num_members(&self) -> usize {
        self.members.len()
    }

    pub fn rank_of(&self, id: NodeId) -> Option<usize> {
        self.members.iter().position(|&member| member == id)
    }

    /// Smallest rank whose `failed` flag is false.
    pub fn leader_rank(&self) -> usize {
        self.failed
            .iter()
            .position(|&failed| !failed)
            .expect("a view with no live members cannot be observed")
    }

    pub fn i_am_leader(&self) -> bool {
        self.my_rank == self.leader_rank()
    }

    pub(crate) fn my_id(&self) -> NodeId {
        self.members[self.my_rank]
    }

    pub(crate) fn sst(&self) -> &Sst {
        self.sst.as_ref().expect("view has no table attached")
    }

    pub(crate) fn engine(&self) -> &DeliveryEngine {
        self.engine.as_ref().expect("view has no engine attached")
    }

    /// Quiesce the attached delivery engine: no new sends start, `reserve_send` fails, in-flight
    /// receives may still complete.
    pub(crate) fn wedge(&self) {
        if let Some(engine) = &self.engine {
            engine.wedge();
        }
    }

    /// Compute the successor view that applies the committed change `change_id`: drop that rank
    /// if the id is currently a member, otherwise append it at the next free rank with
    /// `joiner_addr`. Relative `failed` positions are preserved. The successor has no table or
    /// engine attached yet, and `my_rank` is only meaningful if this node is a member (`None`
    /// return means this node was evicted).
    pub(crate) fn successor(&self, change_id: NodeId, joiner_addr: &str) -> (View, Option<usize>) {
        let who_failed = self.rank_of(change_id);
        let mut members = Vec::with_capacity(self.num_members() + 1);
        let mut member_addrs = Vec::with_capacity(self.num_members() + 1);
        let mut failed = Vec::with_capacity(self.num_members() + 1);
        for rank in 0..self.num_members() {
            if Some(rank) != who_failed {
                members.push(self.members[rank]);
                member_addrs.push(self.member_addrs[rank].clone());
                failed.push(self.failed[rank]);
            }
        }
        let n_failed = match who_failed {
            Some(rank) if self.failed[rank] => self.n_failed - 1,
            Some(_) => self.n_failed,
            None => {
                members.push(change_id);
                member_addrs.push(joiner_addr.to_string());
                failed.push(false);
                self.n_failed
            }
        };

        let my_rank = members.iter().position(|&member| member == self.my_id());
        let next = View {
            vid: self.vid + 1,
            members,
            member_addrs,
            failed,
            n_failed,
            my_rank: my_rank.unwrap_or(usize::MAX),
            i_know_i_am_leader: self.i_know_i_am_leader,
            sst: None,
            engine: None,
        };
        (next, my_rank)
    }
}
