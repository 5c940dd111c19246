/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Thread that receives events emitted by the protocol threads and passes them to event handlers.
//!
//! When the thread receives a message containing an [event](crate::events::Event), it triggers
//! the execution of all handlers defined for the contained event type, where the handlers for
//! each event type are stored in [`EventHandlers`].
//!
//! When no handlers are present in a group's instance of `EventHandlers` this thread is not
//! started.
//!
//! ## Event Handlers
//!
//! A group's instance of `EventHandlers` contains:
//! 1. The handlers provided in the [callbacks](crate::group::Callbacks) passed to
//!    [`Group::start`](crate::group::Group::start), and
//! 2. If logging is enabled via [config](crate::config::Configuration), also the default logging
//!    handlers defined in [logging](crate::logging).

use std::{
    sync::mpsc::{Receiver, TryRecvError},
    thread,
    thread::JoinHandle,
};

use crate::{events::*, logging::Logger};

/// Pointer to a handler closure, parametrised by the argument (for our use case, event) type.
pub type HandlerPtr<T> = Box<dyn Fn(&T) + Send>;

/// Stores the two optional handlers enabled for an event type that implements the [`Logger`]
/// trait, namely one logging handler, defined in [`logging`](crate::logging), and one
/// user-defined handler.
pub(crate) struct HandlerPair<T: Logger> {
    pub(crate) user_defined_handler: Option<HandlerPtr<T>>,
    pub(crate) logging_handler: Option<HandlerPtr<T>>,
}

impl<T: Logger> HandlerPair<T> {
    // Checks if no event handlers are defined for this event.
    pub(crate) fn is_empty(&self) -> bool {
        self.user_defined_handler.is_none() && self.logging_handler.is_none()
    }

    /// Creates a new `HandlerPair` with the user-defined handler, and the default logging handler
    /// if logging is enabled.
    pub(crate) fn new(log: bool, user_defined_handler: Option<HandlerPtr<T>>) -> HandlerPair<T> {
        HandlerPair {
            user_defined_handler,
            logging_handler: if log { Some(T::get_logger()) } else { None },
        }
    }

    fn fire(&self, event: &T) {
        self.user_defined_handler
            .iter()
            .for_each(|handler| handler(event));
        self.logging_handler
            .iter()
            .for_each(|handler| handler(event));
    }
}

/// Stores the `HandlerPair` of user-defined and optional logging handlers for each pre-defined
/// event type from [events](crate::events).
pub(crate) struct EventHandlers {
    pub(crate) deliver_message_handlers: HandlerPair<DeliverMessageEvent>,

    pub(crate) suspect_failure_handlers: HandlerPair<SuspectFailureEvent>,
    pub(crate) wedge_view_handlers: HandlerPair<WedgeViewEvent>,
    pub(crate) propose_change_handlers: HandlerPair<ProposeChangeEvent>,
    pub(crate) ack_change_handlers: HandlerPair<AckChangeEvent>,
    pub(crate) commit_change_handlers: HandlerPair<CommitChangeEvent>,

    pub(crate) start_view_change_handlers: HandlerPair<StartViewChangeEvent>,
    pub(crate) ragged_edge_handlers: HandlerPair<RaggedEdgeEvent>,
    pub(crate) install_view_handlers: HandlerPair<InstallViewEvent>,

    pub(crate) receive_join_request_handlers: HandlerPair<ReceiveJoinRequestEvent>,
    pub(crate) send_join_response_handlers: HandlerPair<SendJoinResponseEvent>,
}

impl EventHandlers {
    /// Checks if no handlers are defined, i.e., neither user-defined handlers were defined nor
    /// logging is enabled.
    pub(crate) fn is_empty(&self) -> bool {
        self.deliver_message_handlers.is_empty()
            && self.suspect_failure_handlers.is_empty()
            && self.wedge_view_handlers.is_empty()
            && self.propose_change_handlers.is_empty()
            && self.ack_change_handlers.is_empty()
            && self.commit_change_handlers.is_empty()
            && self.start_view_change_handlers.is_empty()
            && self.ragged_edge_handlers.is_empty()
            && self.install_view_handlers.is_empty()
            && self.receive_join_request_handlers.is_empty()
            && self.send_join_response_handlers.is_empty()
    }

    /// Triggers the execution of each of the two handlers - the user-defined and the logging
    /// handler, if defined - for a given event type from [events](crate::events).
    pub(crate) fn fire_handlers(&self, event: Event) {
        match event {
            Event::DeliverMessage(deliver_message_event) => {
                self.deliver_message_handlers.fire(&deliver_message_event)
            }
            Event::SuspectFailure(suspect_failure_event) => {
                self.suspect_failure_handlers.fire(&suspect_failure_event)
            }
            Event::WedgeView(wedge_view_event) => self.wedge_view_handlers.fire(&wedge_view_event),
            Event::ProposeChange(propose_change_event) => {
                self.propose_change_handlers.fire(&propose_change_event)
            }
            Event::AckChange(ack_change_event) => self.ack_change_handlers.fire(&ack_change_event),
            Event::CommitChange(commit_change_event) => {
                self.commit_change_handlers.fire(&commit_change_event)
            }
            Event::StartViewChange(start_view_change_event) => self
                .start_view_change_handlers
                .fire(&start_view_change_event),
            Event::RaggedEdge(ragged_edge_event) => {
                self.ragged_edge_handlers.fire(&ragged_edge_event)
            }
            Event::InstallView(install_view_event) => {
                self.install_view_handlers.fire(&install_view_event)
            }
            Event::ReceiveJoinRequest(receive_join_request_event) => self
                .receive_join_request_handlers
                .fire(&receive_join_request_event),
            Event::SendJoinResponse(send_join_response_event) => self
                .send_join_response_handlers
                .fire(&send_join_response_event),
        }
    }
}

/// Starts the event bus thread, which runs an infinite loop until a shutdown signal is received
/// from the parent thread. In each iteration of the loop, the thread checks if it received any
/// event notifications, and if so, then triggers the execution of the handlers defined for the
/// event.
pub(crate) fn start_event_bus(
    event_handlers: EventHandlers,
    event_subscriber: Receiver<Event>,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) => return,
            Err(TryRecvError::Empty) => (),
            Err(TryRecvError::Disconnected) => {
                panic!("event_bus thread disconnected from main thread")
            }
        }

        match event_subscriber.try_recv() {
            Ok(event) => event_handlers.fire_handlers(event),
            Err(TryRecvError::Empty) => thread::yield_now(),
            // The publishing side dies with the views that hold it; remaining events can never
            // arrive, but the shutdown signal still will.
            Err(TryRecvError::Disconnected) => thread::yield_now(),
        }
    })
}
