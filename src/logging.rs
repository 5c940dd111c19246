/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions that log out events.
//!
//! The logs defined in this module are printed if the user enabled them via
//! [`Configuration::log_events`](crate::config::Configuration). This crate logs using the
//! [log](https://docs.rs/log/latest/log/) crate; to get these messages printed onto a terminal or
//! to a file, set up a logging implementation.
//!
//! ## Log message format
//!
//! Log messages are CSVs with at least two values. The first two values are always:
//! 1. The name of the [event](crate::events) in PascalCase (defined in this module as constants).
//! 2. The time the event was emitted (as number of seconds since the Unix Epoch).
//!
//! The rest of the values differ depending on the kind of event. For example, the following
//! snippet is how a [DeliverMessage](crate::events::DeliverMessageEvent) is printed:
//!
//! ```text
//! DeliverMessage, 1701329264, 2, 17, 1000
//! ```
//!
//! where the third value is the sender's node id, the fourth the sender-local message index, and
//! the fifth the payload size in bytes.

use std::time::SystemTime;

use crate::events::*;

// Names of each event in PascalCase for printing:
pub const DELIVER_MESSAGE: &str = "DeliverMessage";

pub const SUSPECT_FAILURE: &str = "SuspectFailure";
pub const WEDGE_VIEW: &str = "WedgeView";
pub const PROPOSE_CHANGE: &str = "ProposeChange";
pub const ACK_CHANGE: &str = "AckChange";
pub const COMMIT_CHANGE: &str = "CommitChange";

pub const START_VIEW_CHANGE: &str = "StartViewChange";
pub const RAGGED_EDGE: &str = "RaggedEdge";
pub const INSTALL_VIEW: &str = "InstallView";

pub const RECEIVE_JOIN_REQUEST: &str = "ReceiveJoinRequest";
pub const SEND_JOIN_RESPONSE: &str = "SendJoinResponse";

/// Implemented by event types. Used to get a closure that logs the event.
pub(crate) trait Logger {
    /// Returns a pointer to the default logging handler for a given event type.
    fn get_logger() -> Box<dyn Fn(&Self) + Send>;
}

impl Logger for DeliverMessageEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |deliver_message_event: &DeliverMessageEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                DELIVER_MESSAGE,
                secs_since_unix_epoch(deliver_message_event.timestamp),
                deliver_message_event.sender,
                deliver_message_event.index,
                deliver_message_event.size
            )
        };
        Box::new(logger)
    }
}

impl Logger for SuspectFailureEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |suspect_failure_event: &SuspectFailureEvent| {
            log::info!(
                "{}, {}, {}",
                SUSPECT_FAILURE,
                secs_since_unix_epoch(suspect_failure_event.timestamp),
                suspect_failure_event.suspect
            )
        };
        Box::new(logger)
    }
}

impl Logger for WedgeViewEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |wedge_view_event: &WedgeViewEvent| {
            log::info!(
                "{}, {}, {}",
                WEDGE_VIEW,
                secs_since_unix_epoch(wedge_view_event.timestamp),
                wedge_view_event.vid
            )
        };
        Box::new(logger)
    }
}

impl Logger for ProposeChangeEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |propose_change_event: &ProposeChangeEvent| {
            log::info!(
                "{}, {}, {}, {}",
                PROPOSE_CHANGE,
                secs_since_unix_epoch(propose_change_event.timestamp),
                propose_change_event.node,
                propose_change_event.n_changes
            )
        };
        Box::new(logger)
    }
}

impl Logger for AckChangeEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |ack_change_event: &AckChangeEvent| {
            log::info!(
                "{}, {}, {}",
                ACK_CHANGE,
                secs_since_unix_epoch(ack_change_event.timestamp),
                ack_change_event.n_acked
            )
        };
        Box::new(logger)
    }
}

impl Logger for CommitChangeEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |commit_change_event: &CommitChangeEvent| {
            log::info!(
                "{}, {}, {}",
                COMMIT_CHANGE,
                secs_since_unix_epoch(commit_change_event.timestamp),
                commit_change_event.n_committed
            )
        };
        Box::new(logger)
    }
}

impl Logger for StartViewChangeEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |start_view_change_event: &StartViewChangeEvent| {
            log::info!(
                "{}, {}, {}",
                START_VIEW_CHANGE,
                secs_since_unix_epoch(start_view_change_event.timestamp),
                start_view_change_event.from_vid
            )
        };
        Box::new(logger)
    }
}

impl Logger for RaggedEdgeEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |ragged_edge_event: &RaggedEdgeEvent| {
            log::info!(
                "{}, {}, {}, {:?}",
                RAGGED_EDGE,
                secs_since_unix_epoch(ragged_edge_event.timestamp),
                ragged_edge_event.vid,
                ragged_edge_event.global_min
            )
        };
        Box::new(logger)
    }
}

impl Logger for InstallViewEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |install_view_event: &InstallViewEvent| {
            log::info!(
                "{}, {}, {}, {:?}",
                INSTALL_VIEW,
                secs_since_unix_epoch(install_view_event.timestamp),
                install_view_event.vid,
                install_view_event.members
            )
        };
        Box::new(logger)
    }
}

impl Logger for ReceiveJoinRequestEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |receive_join_request_event: &ReceiveJoinRequestEvent| {
            log::info!(
                "{}, {}, {}, {}",
                RECEIVE_JOIN_REQUEST,
                secs_since_unix_epoch(receive_join_request_event.timestamp),
                receive_join_request_event.joiner,
                receive_join_request_event.joiner_addr
            )
        };
        Box::new(logger)
    }
}

impl Logger for SendJoinResponseEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |send_join_response_event: &SendJoinResponseEvent| {
            log::info!(
                "{}, {}, {}, {}",
                SEND_JOIN_RESPONSE,
                secs_since_unix_epoch(send_join_response_event.timestamp),
                send_join_response_event.joiner,
                send_join_response_event.vid
            )
        };
        Box::new(logger)
    }
}

fn secs_since_unix_epoch(timestamp: SystemTime) -> u64 {
    timestamp
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("Event occurred before the Unix Epoch.")
        .as_secs()
}
