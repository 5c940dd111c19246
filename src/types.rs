/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Basic types shared across the crate.

use std::sync::Arc;

use borsh::{BorshDeserialize, BorshSerialize};

/// Stable integer identity of a participant, assigned before startup. The mapping from node id to
/// network address is fixed for the lifetime of the process.
pub type NodeId = u32;

/// Monotonically increasing number of an installed view. The bootstrap leader starts at view 0;
/// joiners receive their first view number from the leader.
pub type ViewNumber = i32;

/// A position in the global total order. Computed as `index * num_members + sender_rank`, so the
/// order is round-robin across senders with a deterministic tie-break on rank. `-1` means "nothing
/// yet".
pub type SeqNum = i64;

/// A sender-local message index, assigned monotonically from 0 at buffer reservation time.
pub type MsgIndex = i64;

/// Dissemination algorithm selector, passed through to the block multicast provider.
#[derive(Clone, Copy, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum DisseminationAlgorithm {
    BinomialSend,
    ChainSend,
    SequentialSend,
    TreeSend,
}

/// Invoked exactly once per delivered message, in the same total order at every non-failed node.
/// Arguments: sender's node id, sender-local message index, message payload.
///
/// The callback runs on internal protocol threads and must not call back into the
/// [`Group`](crate::group::Group) that invoked it.
pub type MessageCallback = Arc<dyn Fn(NodeId, MsgIndex, &[u8]) + Send + Sync>;

/// Invoked after each successful view installation with (new members, old members).
///
/// Runs on internal protocol threads and must not call back into the group.
pub type ViewUpcall = Arc<dyn Fn(&[NodeId], &[NodeId]) + Send + Sync>;

/// Conditions under which a node cannot safely continue participating in the group.
///
/// These are terminal: the protocol's safety arguments do not hold past any of them, so they are
/// never surfaced as recoverable errors. The configured [`FatalHandler`] decides how the process
/// dies; the default logs the condition and exits.
#[derive(Clone, Debug, thiserror::Error)]
pub enum FatalError {
    #[error("majority of the group failed ({n_failed} of {num_members}): this node is no longer in the majority and must shut down")]
    MajorityLost { n_failed: usize, num_members: usize },
    #[error("the committed view no longer contains this node (id {my_id}): terminating")]
    Evicted { my_id: NodeId },
    #[error("ran out of room in the pending changes list")]
    ChangeListOverflow,
    #[error("attempted to overwrite the shared-state table of a view under construction")]
    SstOverwrite,
}

/// Handler for [`FatalError`]s. After the handler returns the group stops all protocol activity.
pub type FatalHandler = Arc<dyn Fn(&FatalError) + Send + Sync>;
