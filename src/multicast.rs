/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! [Trait definition](BlockMulticast) for the pluggable reliable block multicast, the transport
//! primitive the delivery engine is built on.
//!
//! The block multicast provides, per sender slot, reliable in-order delivery of whole messages
//! into caller-supplied buffer regions. The delivery engine registers one slot per member of a
//! view and hands the transport three hooks per slot: where to place the next incoming message,
//! what to call once a whole message has arrived, and what to call if the slot permanently fails.
//!
//! Providers deliver messages of a slot in send order, and must not block their receive path on
//! the hooks (the hooks take short internal locks only). At the sending node itself the provider
//! does not place bytes, since the message is already in the sender's region; it invokes the
//! completion hook directly with the offset that was passed to [`MulticastSession::send`].

use std::sync::Arc;

use crate::buffer::MemoryRegion;
use crate::types::{DisseminationAlgorithm, NodeId, ViewNumber};

/// Where the transport places the next incoming message of a slot.
pub struct ReceiveDestination {
    pub region: Arc<MemoryRegion>,
    pub offset: u64,
}

/// Per-slot callbacks registered by the delivery engine at session creation.
pub struct SlotHooks {
    /// Returns where to place the next incoming message of `len` bytes.
    pub destination: Box<dyn Fn(u64) -> ReceiveDestination + Send + Sync>,
    /// Called with `(offset, size)` once a whole message has been placed.
    pub completion: Box<dyn Fn(u64, u64) + Send + Sync>,
    /// Called when the slot permanently fails.
    pub fault: Box<dyn Fn() + Send + Sync>,
}

/// A provider of reliable block multicast sessions, one session per installed view.
pub trait BlockMulticast: Send + Sync + 'static {
    /// Create the multicast session for view `vid` over `members` (ordered by rank). `hooks` has
    /// one entry per member, indexed by slot = rank.
    fn create_session(
        &self,
        vid: ViewNumber,
        members: &[NodeId],
        my_rank: usize,
        block_size: u64,
        algorithm: DisseminationAlgorithm,
        hooks: Vec<SlotHooks>,
    ) -> Arc<dyn MulticastSession>;
}

/// One view's worth of multicast slots. Dropped when the view is reclaimed.
pub trait MulticastSession: Send + Sync + 'static {
    /// Transmit `[offset, offset + size)` of `region` on this node's sender slot.
    fn send(&self, slot: usize, region: &Arc<MemoryRegion>, offset: u64, size: u64);

    /// Mark a sender slot as permanently faulted so that pending receives from it do not block.
    fn mark_faulted(&self, slot: usize);
}
