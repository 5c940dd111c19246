/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Notifications that are emitted when significant things happen in the local group member.
//!
//! ## Event enum
//!
//! Significant occurrences include delivering a message, suspecting a member, wedging the current
//! view, the steps of a view change, and installing a new view. Each corresponds to a variant of
//! the [event enum](Event) whose inner struct carries a timestamp taken when the event occurred,
//! plus a summary of the occurrence.
//!
//! ## Registering event handlers
//!
//! Library users register event handler closures in the [callbacks](crate::group::Callbacks)
//! passed to [`Group::start`](crate::group::Group::start); the [event bus](crate::event_bus)
//! thread calls them when the matching event happens. Default handlers that log events out are
//! enabled via [`Configuration::log_events`](crate::config::Configuration).
//!
//! Events are emitted **after** the corresponding occurrence completes: `InstallView` fires once
//! the successor view's table has synchronized and the swap is done.

use std::sync::mpsc::Sender;
use std::time::SystemTime;

use crate::types::{MsgIndex, NodeId, ViewNumber};

/// Enumerates all events defined for this crate.
pub enum Event {
    // Delivery-engine events.
    DeliverMessage(DeliverMessageEvent),

    // Membership events on the current view.
    SuspectFailure(SuspectFailureEvent),
    WedgeView(WedgeViewEvent),
    ProposeChange(ProposeChangeEvent),
    AckChange(AckChangeEvent),
    CommitChange(CommitChangeEvent),

    // View transition events.
    StartViewChange(StartViewChangeEvent),
    RaggedEdge(RaggedEdgeEvent),
    InstallView(InstallViewEvent),

    // Joiner handshake events.
    ReceiveJoinRequest(ReceiveJoinRequestEvent),
    SendJoinResponse(SendJoinResponseEvent),
}

impl Event {
    /// Publishes this event on the event publisher channel (if one is defined).
    pub(crate) fn publish(self, event_publisher: &Option<Sender<Event>>) {
        if let Some(event_publisher) = event_publisher {
            let _ = event_publisher.send(self);
        }
    }
}

/// The global-stability callback was invoked for a message; every non-failed member delivers the
/// same messages in the same order.
pub struct DeliverMessageEvent {
    pub timestamp: SystemTime,
    pub sender: NodeId,
    pub index: MsgIndex,
    pub size: u64,
}

/// This node started suspecting a member, either locally or by amplifying another member's
/// suspicion.
pub struct SuspectFailureEvent {
    pub timestamp: SystemTime,
    pub suspect: NodeId,
}

/// The current view's delivery engine was quiesced: no new sends start, in-flight receives may
/// still complete.
pub struct WedgeViewEvent {
    pub timestamp: SystemTime,
    pub vid: ViewNumber,
}

/// The leader appended a membership change (a joiner's id, or a failed member's id) to its
/// proposed-changes list.
pub struct ProposeChangeEvent {
    pub timestamp: SystemTime,
    pub node: NodeId,
    pub n_changes: i32,
}

/// This node acknowledged the leader's proposed changes up to `n_acked`.
pub struct AckChangeEvent {
    pub timestamp: SystemTime,
    pub n_acked: i32,
}

/// The leader committed changes up to `n_committed` (every non-failed member acknowledged them).
pub struct CommitChangeEvent {
    pub timestamp: SystemTime,
    pub n_committed: i32,
}

/// This node observed a committed change beyond the current view and began the view change.
pub struct StartViewChangeEvent {
    pub timestamp: SystemTime,
    pub from_vid: ViewNumber,
}

/// Ragged-edge cleanup finished: the per-sender cutoffs every surviving member delivers up to
/// before the next view begins.
pub struct RaggedEdgeEvent {
    pub timestamp: SystemTime,
    pub vid: ViewNumber,
    pub global_min: Vec<MsgIndex>,
}

/// A new view was installed and its table synchronized.
pub struct InstallViewEvent {
    pub timestamp: SystemTime,
    pub vid: ViewNumber,
    pub members: Vec<NodeId>,
}

/// The leader pulled a prospective joiner's connection off the accept queue.
pub struct ReceiveJoinRequestEvent {
    pub timestamp: SystemTime,
    pub joiner: NodeId,
    pub joiner_addr: String,
}

/// The leader sent the committed next view to the joiner and closed the connection.
pub struct SendJoinResponseEvent {
    pub timestamp: SystemTime,
    pub joiner: NodeId,
    pub vid: ViewNumber,
}
