/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The shared-state row schema: one [`GroupRow`] per member, replicated to every other member.
//!
//! The delivery columns (`seq_num` through `n_received`) drive the ordered-delivery engine; the
//! remaining columns belong to the group-membership service. Both protocols ride on the same row,
//! using disjoint column sets.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::{MsgIndex, NodeId, SeqNum, ViewNumber};

/// One node's replicated row. Every sequence column is sized `max_members` at construction; the
/// group-size cap is a configuration constant, not a type parameter.
#[derive(Clone, Debug, BorshSerialize, BorshDeserialize)]
pub struct GroupRow {
    /// The view this row belongs to.
    pub vid: ViewNumber,

    // Delivery columns.
    /// Highest contiguous sequence number received, encoded as
    /// `(min_undelivered_index + 1) * num_members + min_rank - 1`: one less than the first
    /// missing position in the total order.
    pub seq_num: SeqNum,
    /// Largest `seq_num` known to be received by every non-failed member.
    pub stable_num: SeqNum,
    /// Largest sequence number this node has invoked the delivery upcall for.
    pub delivered_num: SeqNum,
    /// Per-sender index of the latest message received from that sender, -1 if none.
    pub n_received: Vec<MsgIndex>,

    // GMS columns.
    /// This node's suspicion that member rank `k` has failed.
    pub suspected: Vec<bool>,
    /// Circular list of proposed membership changes (node ids), indexed by absolute change
    /// number modulo capacity.
    pub changes: Vec<NodeId>,
    /// Address of the pending joiner, if any.
    pub joiner_addr: String,
    /// Total changes proposed so far.
    pub n_changes: i32,
    /// Total changes committed so far. Change number `vid` creates view `vid + 1`.
    pub n_committed: i32,
    /// Highest change number this node has acknowledged.
    pub n_acked: i32,
    /// This node has quiesced its delivery engine for the current view.
    pub wedged: bool,
    /// The leader's proposal of the last message index from each sender that will be delivered
    /// before the view change completes.
    pub global_min: Vec<MsgIndex>,
    pub global_min_ready: bool,
}

impl GroupRow {
    pub fn new(max_members: usize) -> GroupRow {
        GroupRow {
            vid: 0,
            seq_num: -1,
            stable_num: -1,
            delivered_num: -1,
            n_received: vec![-1; max_members],
            suspected: vec![false; max_members],
            changes: vec![0; max_members],
            joiner_addr: String::new(),
            n_changes: 0,
            n_committed: 0,
            n_acked: 0,
            wedged: false,
            global_min: vec![-1; max_members],
            global_min_ready: false,
        }
    }

    /// Carry the membership-protocol state of `other` into this (freshly initialized) row. Used
    /// when a node initializes its row in a successor view's table from its row in the
    /// predecessor, and when a joiner adopts the leader's change history. Delivery columns and
    /// per-view flags start over.
    pub fn init_from_existing(&mut self, other: &GroupRow) {
        self.changes.copy_from_slice(&other.changes);
        self.joiner_addr = other.joiner_addr.clone();
        self.n_changes = other.n_changes;
        self.n_committed = other.n_committed;
        self.n_acked = other.n_acked;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_row_uses_sentinels() {
        let row = GroupRow::new(4);
        assert_eq!(row.seq_num, -1);
        assert_eq!(row.stable_num, -1);
        assert_eq!(row.delivered_num, -1);
        assert_eq!(row.n_received, vec![-1; 4]);
        assert!(!row.wedged);
        assert!(!row.global_min_ready);
    }

    #[test]
    fn init_from_existing_carries_change_history_only() {
        let mut old = GroupRow::new(4);
        old.changes[0] = 7;
        old.n_changes = 1;
        old.n_committed = 1;
        old.n_acked = 1;
        old.joiner_addr = "127.0.0.1:28001".to_string();
        old.seq_num = 42;
        old.wedged = true;

        let mut new = GroupRow::new(4);
        new.init_from_existing(&old);
        assert_eq!(new.changes[0], 7);
        assert_eq!(new.n_changes, 1);
        assert_eq!(new.n_committed, 1);
        assert_eq!(new.n_acked, 1);
        assert_eq!(new.joiner_addr, "127.0.0.1:28001");
        // Delivery state and per-view flags do not carry over.
        assert_eq!(new.seq_num, -1);
        assert!(!new.wedged);
    }

    #[test]
    fn row_roundtrips_through_borsh() {
        let mut row = GroupRow::new(3);
        row.vid = 2;
        row.seq_num = 17;
        row.n_received[1] = 5;
        row.suspected[2] = true;
        row.joiner_addr = "127.0.0.1:28002".to_string();
        let bytes = borsh::to_vec(&row).unwrap();
        let back = GroupRow::try_from_slice(&bytes).unwrap();
        assert_eq!(back.vid, 2);
        assert_eq!(back.seq_num, 17);
        assert_eq!(back.n_received[1], 5);
        assert!(back.suspected[2]);
        assert_eq!(back.joiner_addr, "127.0.0.1:28002");
    }
}
