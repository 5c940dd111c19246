/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! [Trait definition](RowTransport) for the pluggable shared-state-table transport.
//!
//! The table logic (rows, freezing, predicates, the evaluator thread) lives in this crate; how
//! one node's row bytes reach its peers (RDMA writes, TCP, an in-process hub in tests) is the
//! provider's concern. Rows cross the boundary Borsh-serialized.

use std::sync::Arc;

use crate::types::{NodeId, ViewNumber};

use super::RowSink;

/// A provider of row-replication sessions, one per installed view.
pub trait RowTransport: Send + Sync + 'static {
    /// Create the replication session for view `vid` over `members` (ordered by rank). Remote
    /// rows received by the provider are handed to `sink`, tagged with the sender's rank.
    fn create_session(
        &self,
        vid: ViewNumber,
        members: &[NodeId],
        my_rank: usize,
        sink: RowSink,
    ) -> Arc<dyn RowSession>;
}

/// One view's worth of row replication. Dropped when the view is reclaimed.
pub trait RowSession: Send + Sync + 'static {
    /// Broadcast this node's serialized row to every other member.
    fn publish(&self, row_bytes: &[u8]);

    /// Barrier with the view's members. Used once per view, right after installation, to ensure
    /// every member has put its initial row before predicate evaluation begins.
    fn sync_with_members(&self);
}
