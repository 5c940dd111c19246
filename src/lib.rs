/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! A reliable, totally-ordered, virtually-synchronous group multicast engine for a small,
//! dynamically-changing set of peer nodes.
//!
//! Messages sent by group members are delivered at every non-failed member in the same total
//! order, and the membership evolves through a sequence of numbered views, each view agreeing on
//! which messages from the previous view are delivered before it begins.
//!
//! Two subsystems carry the protocol: the per-view [ordered-delivery
//! engine](crate::group::delivery), a ring-buffered multi-sender pipelined multicast whose
//! [shared-state table](crate::sst) computes global stability and commits the delivery order;
//! and the [group-membership service](crate::group::view_change), a leader-driven view-change
//! protocol riding on the same table.
//!
//! The two transports underneath, the reliable [block multicast](crate::multicast) and the
//! [row replication](crate::sst::transport) of the shared-state table, are consumed through
//! traits and supplied by the library user.

pub mod buffer;

pub mod config;

pub mod event_bus;

pub mod events;

pub mod group;

pub mod logging;

pub mod multicast;

pub mod sst;

pub mod types;

// Re-exports
pub use config::Configuration;
pub use group::{Callbacks, Group};
