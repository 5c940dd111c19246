/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions that [start](Group::start) a group member, as well as [the type](Group) which keeps
//! it alive.
//!
//! A group is a small, dynamically-changing set of peer nodes delivering each other's messages in
//! one total order. Each process participates through a `Group` value: starting one either
//! bootstraps a new group (if this node is the configured leader) or joins the existing one by
//! contacting the leader. Messages are sent with [`send`](Group::send) (or the lower-level
//! [`reserve_send`](Group::reserve_send)/[`commit_send`](Group::commit_send) pair) and arrive
//! through the global-stability callback, in the same order at every non-failed member.
//!
//! Membership evolves through a sequence of numbered views. The group-membership service that
//! drives it lives in [`view_change`]; this module owns the background threads around it: the
//! TCP accept listener feeding the leader's join queue, the stale-view reclaimer that frees
//! retired views' buffers, and the event bus.

pub mod delivery;
pub mod join;
pub mod view;
pub(crate) mod view_change;

use std::collections::VecDeque;
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use crate::buffer::BufferPool;
use crate::config::{ConfigError, Configuration};
use crate::event_bus::{start_event_bus, EventHandlers, HandlerPair, HandlerPtr};
use crate::events::*;
use crate::multicast::BlockMulticast;
use crate::sst::predicates::PredicateHandle;
use crate::sst::transport::RowTransport;
use crate::sst::Sst;
use crate::types::{
    FatalError, FatalHandler, MessageCallback, NodeId, ViewNumber, ViewUpcall,
};

use delivery::{DeliveryEngine, SendBuffer};
use join::JoinError;
use view::View;

/// Everything a library user can hook into.
pub struct Callbacks {
    /// The global-stability callback: invoked exactly once per delivered message, in total
    /// order, on every non-failed member.
    pub global_stability: MessageCallback,
    /// Invoked after each successful view installation.
    pub view_upcalls: Vec<ViewUpcall>,
    /// Invoked on conditions the node cannot survive. Defaults to logging and exiting the
    /// process.
    pub fatal_handler: Option<FatalHandler>,

    // Optional per-event handlers, run on the event bus thread.
    pub on_deliver_message: Option<HandlerPtr<DeliverMessageEvent>>,
    pub on_suspect_failure: Option<HandlerPtr<SuspectFailureEvent>>,
    pub on_wedge_view: Option<HandlerPtr<WedgeViewEvent>>,
    pub on_propose_change: Option<HandlerPtr<ProposeChangeEvent>>,
    pub on_ack_change: Option<HandlerPtr<AckChangeEvent>>,
    pub on_commit_change: Option<HandlerPtr<CommitChangeEvent>>,
    pub on_start_view_change: Option<HandlerPtr<StartViewChangeEvent>>,
    pub on_ragged_edge: Option<HandlerPtr<RaggedEdgeEvent>>,
    pub on_install_view: Option<HandlerPtr<InstallViewEvent>>,
    pub on_receive_join_request: Option<HandlerPtr<ReceiveJoinRequestEvent>>,
    pub on_send_join_response: Option<HandlerPtr<SendJoinResponseEvent>>,
}

impl Callbacks {
    pub fn new(global_stability: MessageCallback) -> Callbacks {
        Callbacks {
            global_stability,
            view_upcalls: Vec::new(),
            fatal_handler: None,
            on_deliver_message: None,
            on_suspect_failure: None,
            on_wedge_view: None,
            on_propose_change: None,
            on_ack_change: None,
            on_commit_change: None,
            on_start_view_change: None,
            on_ragged_edge: None,
            on_install_view: None,
            on_receive_join_request: None,
            on_send_join_response: None,
        }
    }

    fn into_event_handlers(self, log: bool) -> (EventHandlers, MessageCallback, Vec<ViewUpcall>, Option<FatalHandler>) {
        let handlers = EventHandlers {
            deliver_message_handlers: HandlerPair::new(log, self.on_deliver_message),
            suspect_failure_handlers: HandlerPair::new(log, self.on_suspect_failure),
            wedge_view_handlers: HandlerPair::new(log, self.on_wedge_view),
            propose_change_handlers: HandlerPair::new(log, self.on_propose_change),
            ack_change_handlers: HandlerPair::new(log, self.on_ack_change),
            commit_change_handlers: HandlerPair::new(log, self.on_commit_change),
            start_view_change_handlers: HandlerPair::new(log, self.on_start_view_change),
            ragged_edge_handlers: HandlerPair::new(log, self.on_ragged_edge),
            install_view_handlers: HandlerPair::new(log, self.on_install_view),
            receive_join_request_handlers: HandlerPair::new(log, self.on_receive_join_request),
            send_join_response_handlers: HandlerPair::new(log, self.on_send_join_response),
        };
        (
            handlers,
            self.global_stability,
            self.view_upcalls,
            self.fatal_handler,
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Join(#[from] JoinError),
    #[error("failed to bind the joiner listener: {0}")]
    Listen(std::io::Error),
}

/// Handles to the predicates of the group-membership service, kept so the view-change trigger
/// can remove them selectively.
#[derive(Default)]
pub(crate) struct GmsHandles {
    pub(crate) suspected_changed: Option<PredicateHandle>,
    pub(crate) start_join: Option<PredicateHandle>,
    pub(crate) change_commit: Option<PredicateHandle>,
    pub(crate) leader_proposed: Option<PredicateHandle>,
    pub(crate) leader_committed: Option<PredicateHandle>,
}

/// State shared between the public [`Group`] handle, the background threads, and the closures
/// registered into each view's shared-state table. Those closures hold this weakly and resolve
/// at callback time, so retired views cannot keep the group alive.
pub(crate) struct GroupCore {
    pub(crate) config: Configuration,
    pub(crate) multicast: Arc<dyn BlockMulticast>,
    pub(crate) row_transport: Arc<dyn RowTransport>,
    pub(crate) buffer_pool: Arc<BufferPool>,
    pub(crate) delivery_callback: MessageCallback,
    pub(crate) view_upcalls: Vec<ViewUpcall>,
    pub(crate) event_publisher: Option<Sender<Event>>,
    pub(crate) fatal_handler: FatalHandler,

    pub(crate) curr_view: Mutex<View>,
    /// Signalled on every view installation; senders parked by a wedge wait here.
    pub(crate) view_change_cv: Condvar,
    /// The successor view, between the commit that creates it and its installation.
    pub(crate) next_view: Mutex<Option<View>>,
    pub(crate) last_suspected: Mutex<Vec<bool>>,
    /// Joiner sockets accepted by the listener thread, awaiting the join-start predicate.
    pub(crate) pending_joins: Mutex<VecDeque<TcpStream>>,
    /// The join in progress, if any. Only one join runs at a time.
    pub(crate) joining_client: Mutex<Option<(NodeId, TcpStream)>>,
    pub(crate) old_views: Mutex<VecDeque<View>>,
    pub(crate) old_views_cv: Condvar,
    pub(crate) gms_handles: Mutex<GmsHandles>,
    pub(crate) thread_shutdown: AtomicBool,
    /// Set by [`fatal`](Self::fatal); once dead, the membership service stops acting.
    pub(crate) dead: AtomicBool,
}

impl GroupCore {
    pub(crate) fn publish_event(&self, event: Event) {
        event.publish(&self.event_publisher);
    }

    pub(crate) fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Relaxed)
    }

    /// Terminal conditions: log, stop the membership service, and hand the process's fate to the
    /// fatal handler. Never unwinds, never locks the current view (callers may hold it).
    pub(crate) fn fatal(&self, error: FatalError) {
        if self.dead.swap(true, Ordering::Relaxed) {
            return;
        }
        log::error!("{}", error);
        self.thread_shutdown.store(true, Ordering::Relaxed);
        (self.fatal_handler)(&error);
    }

    /// Build and attach the shared-state table and delivery engine of `view`. The engine's
    /// stability, delivery and window predicates are installed; the membership predicates are
    /// registered separately by [`view_change`].
    pub(crate) fn attach_sst_and_engine(self: &Arc<Self>, view: &mut View) {
        let members = view.members.clone();
        let my_rank = view.my_rank;
        let vid = view.vid;

        let row_transport = self.row_transport.clone();
        let sst = Sst::new(
            view.num_members(),
            my_rank,
            vid,
            self.config.max_members,
            &view.failed,
            |sink| row_transport.create_session(vid, &members, my_rank, sink),
        );

        let weak = Arc::downgrade(self);
        let fault_reporter: Arc<dyn Fn(usize) + Send + Sync> = Arc::new(move |rank| {
            if let Some(core) = weak.upgrade() {
                core.report_failure_by_rank(rank);
            }
        });

        let engine = DeliveryEngine::new(
            vid,
            view.members.clone(),
            my_rank,
            sst.handle(),
            self.config.buffer_size,
            self.config.block_size,
            self.config.window_size,
            self.config.algorithm,
            &self.multicast,
            &self.buffer_pool,
            self.delivery_callback.clone(),
            self.event_publisher.clone(),
            fault_reporter,
        );
        engine.register_predicates(&sst);

        view.sst = Some(sst);
        view.engine = Some(engine);
    }

    /// An external failure report, by member rank of the current view.
    pub(crate) fn report_failure_by_rank(&self, rank: usize) {
        let view = self.curr_view.lock().unwrap();
        if rank >= view.num_members() {
            return;
        }
        let id = view.members[rank];
        drop(view);
        self.report_failure(id);
    }

    /// Mark `id` suspected in this node's row. The suspicion predicate at every member (this one
    /// included) takes it from there.
    pub(crate) fn report_failure(&self, id: NodeId) {
        if self.is_dead() {
            return;
        }
        let view = self.curr_view.lock().unwrap();
        if view.sst.is_none() {
            return;
        }
        let Some(rank) = view.rank_of(id) else {
            log::warn!("failure reported for node {} which is not a member", id);
            return;
        };
        log::debug!("node {} failure reported; marking suspected[{}]", id, rank);
        let num_members = view.num_members();
        let suspected_count = view.sst().with_local_row(|row| {
            row.suspected[rank] = true;
            row.suspected[..num_members]
                .iter()
                .filter(|&&suspected| suspected)
                .count()
        });
        if suspected_count >= view_change::majority_threshold(num_members) {
            drop(view);
            self.fatal(FatalError::MajorityLost {
                n_failed: suspected_count,
                num_members,
            });
            return;
        }
        view.sst().put();
    }

    /// Cleanly leave the group: quiesce, report ourselves failed, and let the others run the
    /// view change without us.
    pub(crate) fn leave(&self) {
        log::debug!("cleanly leaving the group");
        let view = self.curr_view.lock().unwrap();
        if view.sst.is_none() {
            return;
        }
        view.wedge();
        let sst = view.sst();
        sst.predicates().remove_all();
        let my_rank = view.my_rank;
        sst.with_local_row(|row| {
            row.wedged = true;
            row.suspected[my_rank] = true;
        });
        sst.put();
        drop(view);
        self.thread_shutdown.store(true, Ordering::Relaxed);
        self.dead.store(true, Ordering::Relaxed);
    }
}

/// A running group member. Dropping it shuts the member down: background threads are joined in
/// dependency order and the current view's engine and table are torn down.
pub struct Group {
    core: Arc<GroupCore>,
    listener: Option<JoinHandle<()>>,
    reclaimer: Option<JoinHandle<()>>,
    event_bus: Option<JoinHandle<()>>,
    event_bus_shutdown: Option<Sender<()>>,
}

impl Group {
    /// Start participating. If `config.my_id == config.leader_id` this node bootstraps a new
    /// group as the solo member of view 0; otherwise it contacts the leader and blocks until a
    /// view containing it is committed.
    pub fn start(
        config: Configuration,
        multicast: impl BlockMulticast,
        row_transport: impl RowTransport,
        callbacks: Callbacks,
    ) -> Result<Group, StartError> {
        config.validate()?;

        let listener_socket =
            TcpListener::bind(config.my_addr()).map_err(StartError::Listen)?;

        let (event_handlers, delivery_callback, view_upcalls, fatal_handler) =
            callbacks.into_event_handlers(config.log_events);
        let (event_publisher, event_bus, event_bus_shutdown) = if event_handlers.is_empty() {
            (None, None, None)
        } else {
            let (event_publisher, event_subscriber) = mpsc::channel();
            let (shutdown_sender, shutdown_receiver) = mpsc::channel();
            let bus = start_event_bus(event_handlers, event_subscriber, shutdown_receiver);
            (Some(event_publisher), Some(bus), Some(shutdown_sender))
        };
        let fatal_handler = fatal_handler.unwrap_or_else(|| {
            Arc::new(|error: &FatalError| {
                log::error!("terminating: {}", error);
                std::process::exit(1);
            })
        });

        let initial_view = if config.my_id == config.leader_id {
            log::debug!("starting new empty group with myself as leader");
            View::bootstrap(config.my_id, config.my_addr().to_string())
        } else {
            join::join_existing(&config.member_addrs[&config.leader_id], config.my_id)?
        };
        let joined_vid = initial_view.vid;

        let core = Arc::new(GroupCore {
            multicast: Arc::new(multicast),
            row_transport: Arc::new(row_transport),
            buffer_pool: Arc::new(BufferPool::new()),
            delivery_callback,
            view_upcalls,
            event_publisher,
            fatal_handler,
            curr_view: Mutex::new(initial_view),
            view_change_cv: Condvar::new(),
            next_view: Mutex::new(None),
            last_suspected: Mutex::new(vec![false; config.max_members]),
            pending_joins: Mutex::new(VecDeque::new()),
            joining_client: Mutex::new(None),
            old_views: Mutex::new(VecDeque::new()),
            old_views_cv: Condvar::new(),
            gms_handles: Mutex::new(GmsHandles::default()),
            thread_shutdown: AtomicBool::new(false),
            dead: AtomicBool::new(false),
            config,
        });

        log::debug!("initializing SST and block multicast for the first time");
        {
            let mut view = core.curr_view.lock().unwrap();
            core.attach_sst_and_engine(&mut view);
            view.sst().put();
            view.sst().sync_with_members();
        }

        if core.config.my_id != core.config.leader_id && joined_vid != 0 {
            // Joining an existing group with a non-initial view: adopt the leader's change
            // history, otherwise [leader].n_changes > our n_acked reads as a brand new proposal.
            core.adopt_leader_row();
            log::debug!("joining node initialized its SST row from the leader");
        }

        view_change::register_predicates(&core);
        {
            let mut view = core.curr_view.lock().unwrap();
            view.sst.as_mut().unwrap().start_predicate_evaluation();
        }

        let listener = Self::start_listener(core.clone(), listener_socket);
        let reclaimer = Self::start_reclaimer(core.clone());

        // Initial view upcalls: the previous membership is everyone but the member that just
        // came up (for the bootstrap leader, nobody).
        {
            let view = core.curr_view.lock().unwrap();
            let old_members = &view.members[..view.num_members() - 1];
            for view_upcall in &core.view_upcalls {
                view_upcall(&view.members, old_members);
            }
        }

        Ok(Group {
            core,
            listener: Some(listener),
            reclaimer: Some(reclaimer),
            event_bus,
            event_bus_shutdown,
        })
    }

    /// Reserve space for a `size`-byte message in the current view. `None` means the message is
    /// oversized, the sender window is exhausted, or a view change is in progress: retry after a
    /// delivery upcall (or on the next view). Fill the buffer, then call
    /// [`commit_send`](Self::commit_send).
    pub fn reserve_send(&self, size: u64) -> Option<SendBuffer> {
        let view = self.core.curr_view.lock().unwrap();
        view.engine().reserve_send(size)
    }

    /// Enqueue the message most recently reserved. Returns false if the view wedged since the
    /// reservation, voiding it; re-reserve on the successor view.
    pub fn commit_send(&self) -> bool {
        let view = self.core.curr_view.lock().unwrap();
        view.engine().commit_send()
    }

    /// Send `payload`, retrying across buffer exhaustion and view changes. Returns false only if
    /// the group terminated before the message could be enqueued.
    pub fn send(&self, payload: &[u8]) -> bool {
        loop {
            if self.core.is_dead() {
                return false;
            }
            // Reserve and commit under one view lock, so the reservation cannot land on an
            // engine that is swapped out in between.
            let view = self.core.curr_view.lock().unwrap();
            if let Some(send_buffer) = view.engine().reserve_send(payload.len() as u64) {
                send_buffer.fill(payload);
                if view.engine().commit_send() {
                    return true;
                }
            }
            drop(view);
            thread::yield_now();
        }
    }

    /// The current view's members, in rank order.
    pub fn members(&self) -> Vec<NodeId> {
        self.core.curr_view.lock().unwrap().members.clone()
    }

    /// The current view number.
    pub fn vid(&self) -> ViewNumber {
        self.core.curr_view.lock().unwrap().vid
    }

    /// Report that `id` is believed failed. Failure detection itself is external; this is the
    /// entry point detectors (and the block multicast's fault callbacks) feed.
    pub fn report_failure(&self, id: NodeId) {
        self.core.report_failure(id);
    }

    /// Leave the group cleanly. The group is unusable afterwards.
    pub fn leave(&self) {
        self.core.leave();
    }

    /// Barrier with the current view's members.
    pub fn barrier_sync(&self) {
        let view = self.core.curr_view.lock().unwrap();
        view.sst().sync_with_members();
    }

    fn start_listener(core: Arc<GroupCore>, listener_socket: TcpListener) -> JoinHandle<()> {
        thread::spawn(move || {
            loop {
                match listener_socket.accept() {
                    Ok((socket, peer_addr)) => {
                        if core.thread_shutdown.load(Ordering::Relaxed) {
                            break;
                        }
                        log::debug!("got a client connection from {}", peer_addr);
                        core.pending_joins.lock().unwrap().push_back(socket);
                    }
                    Err(error) => {
                        if core.thread_shutdown.load(Ordering::Relaxed) {
                            break;
                        }
                        log::warn!("joiner listener accept failed: {}", error);
                    }
                }
            }
            log::debug!("connection listener thread shutting down");
        })
    }

    fn start_reclaimer(core: Arc<GroupCore>) -> JoinHandle<()> {
        thread::spawn(move || {
            loop {
                let mut old_views = core.old_views.lock().unwrap();
                old_views = core
                    .old_views_cv
                    .wait_while(old_views, |queue| {
                        queue.is_empty() && !core.thread_shutdown.load(Ordering::Relaxed)
                    })
                    .unwrap();
                if core.thread_shutdown.load(Ordering::Relaxed) && old_views.is_empty() {
                    break;
                }
                let retired = old_views.pop_front();
                drop(old_views);
                // Dropping the view joins its evaluator and send worker and returns its buffer
                // frames to the pool.
                drop(retired);
            }
            log::debug!("old view cleanup thread shutting down");
        })
    }
}

impl Drop for Group {
    fn drop(&mut self) {
        // Safety: the order of thread shutdown in this function is important. The listener is
        // unblocked by a self-connect; the reclaimer must drain retired views before the current
        // view is torn down; the event bus goes last so teardown can still publish.
        self.core.thread_shutdown.store(true, Ordering::Relaxed);

        let _ = TcpStream::connect(self.core.config.my_addr());
        if let Some(listener) = self.listener.take() {
            let _ = listener.join();
        }

        self.core.old_views_cv.notify_all();
        if let Some(reclaimer) = self.reclaimer.take() {
            let _ = reclaimer.join();
        }

        {
            let mut view = self.core.curr_view.lock().unwrap();
            // Engine first: its send worker reads rows through the table.
            view.engine.take();
            view.sst.take();
        }

        if let Some(event_bus_shutdown) = self.event_bus_shutdown.take() {
            let _ = event_bus_shutdown.send(());
        }
        if let Some(event_bus) = self.event_bus.take() {
            let _ = event_bus.join();
        }
    }
}
