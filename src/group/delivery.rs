/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The ordered-delivery engine: a ring-buffered, multi-sender pipelined multicast whose shared
//! state table computes global stability and commits a total delivery order.
//!
//! One engine exists per view. Senders reserve space in their ring, fill it, and commit; a send
//! worker submits messages to the block multicast when the window permits. Every receive records
//! the message as locally stable and advances this node's `seq_num` row column; three recurrent
//! predicates on the table then advance stability, drive in-order delivery upcalls, and reopen
//! the sender window.
//!
//! A message moves through
//! `RESERVED → PENDING_SEND → IN_FLIGHT → LOCALLY_STABLE → GLOBALLY_STABLE → DELIVERED`;
//! only the sender traverses the first three states, receivers enter at `LOCALLY_STABLE`.

use std::collections::{BTreeMap, VecDeque};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};

use crate::buffer::{BufferPool, MemoryRegion, Ring};
use crate::events::{DeliverMessageEvent, Event};
use crate::multicast::{BlockMulticast, MulticastSession, ReceiveDestination, SlotHooks};
use crate::sst::{Sst, SstHandle, SstSnapshot};
use crate::types::{
    DisseminationAlgorithm, MessageCallback, MsgIndex, NodeId, SeqNum, ViewNumber,
};

/// How long a sender's slot must continuously block delivery before a null message fills it.
/// Long enough that a sender with traffic on the way does not burn an index on a filler.
const NULL_SEND_DELAY: Duration = Duration::from_millis(5);

/// A message buffered at its sender, or received and not yet delivered.
#[derive(Clone, Copy, Debug)]
struct PendingMessage {
    slot: usize,
    index: MsgIndex,
    offset: u64,
    size: u64,
}

/// Space reserved in this node's ring for one outgoing message. Fill it, then call
/// [`commit_send`](DeliveryEngine::commit_send).
pub struct SendBuffer {
    region: Arc<MemoryRegion>,
    offset: u64,
    size: u64,
}

impl SendBuffer {
    /// Copy `bytes` into the reserved space, starting at its beginning. Panics if `bytes` is
    /// longer than the reservation.
    pub fn fill(&self, bytes: &[u8]) {
        assert!(bytes.len() as u64 <= self.size);
        self.region.write_at(self.offset, bytes);
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

struct EngineState {
    rings: Vec<Ring>,
    /// Index of the latest message received from each slot, -1 if none.
    last_received: Vec<MsgIndex>,
    /// Received but undelivered messages, keyed by `index * num_members + slot`.
    locally_stable: BTreeMap<SeqNum, PendingMessage>,
    pending_sends: VecDeque<PendingMessage>,
    /// The reservation made by the last `reserve_send`, consumed by `commit_send`.
    next_message: Option<PendingMessage>,
    /// Index the next `reserve_send` will assign.
    future_index: MsgIndex,
    /// Counter of the window-advance predicate: how many of this node's messages every member
    /// has delivered.
    next_to_deliver: MsgIndex,
    wedged: bool,
}

struct EngineShared {
    members: Vec<NodeId>,
    my_rank: usize,
    window_size: u32,
    max_msg_size: u64,
    regions: Vec<Arc<MemoryRegion>>,
    sst: SstHandle,
    state: Mutex<EngineState>,
    send_cv: Condvar,
    delivery_callback: MessageCallback,
    event_publisher: Option<Sender<Event>>,
}

impl EngineShared {
    fn num_members(&self) -> usize {
        self.members.len()
    }

    /// Deliver one message, already removed from the locally-stable table, under the state lock.
    /// Null messages (zero-size slot fillers) advance the delivery frontier but are invisible to
    /// the user.
    fn deliver(&self, state: &mut EngineState, key: SeqNum, msg: PendingMessage) {
        if msg.size > 0 {
            self.regions[msg.slot].with_slice(msg.offset, msg.size, |bytes| {
                (self.delivery_callback)(self.members[msg.slot], msg.index, bytes)
            });
            state.rings[msg.slot].release(msg.offset, msg.size);
            Event::DeliverMessage(DeliverMessageEvent {
                timestamp: SystemTime::now(),
                sender: self.members[msg.slot],
                index: msg.index,
                size: msg.size,
            })
            .publish(&self.event_publisher);
        }
        self.sst.with_local_row(|row| row.delivered_num = key);
    }
}

/// A view's delivery engine. Owns the message buffers (one region per sender slot, reused for
/// every message of that slot) and the block multicast session; dropping the engine joins the
/// send worker and returns the regions to the buffer pool.
pub(crate) struct DeliveryEngine {
    shared: Arc<EngineShared>,
    session: Arc<dyn MulticastSession>,
    pool: Arc<BufferPool>,
    send_worker: Option<JoinHandle<()>>,
}

impl DeliveryEngine {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        vid: ViewNumber,
        members: Vec<NodeId>,
        my_rank: usize,
        sst: SstHandle,
        buffer_size: u64,
        block_size: u64,
        window_size: u32,
        algorithm: DisseminationAlgorithm,
        multicast: &Arc<dyn BlockMulticast>,
        pool: &Arc<BufferPool>,
        delivery_callback: MessageCallback,
        event_publisher: Option<Sender<Event>>,
        fault_reporter: Arc<dyn Fn(usize) + Send + Sync>,
    ) -> DeliveryEngine {
        let num_members = members.len();
        let regions: Vec<Arc<MemoryRegion>> =
            (0..num_members).map(|_| pool.take(buffer_size)).collect();

        let shared = Arc::new(EngineShared {
            members: members.clone(),
            my_rank,
            window_size,
            max_msg_size: buffer_size / window_size as u64,
            regions,
            sst,
            state: Mutex::new(EngineState {
                rings: (0..num_members).map(|_| Ring::new(buffer_size)).collect(),
                last_received: vec![-1; num_members],
                locally_stable: BTreeMap::new(),
                pending_sends: VecDeque::new(),
                next_message: None,
                future_index: 0,
                next_to_deliver: 0,
                wedged: false,
            }),
            send_cv: Condvar::new(),
            delivery_callback,
            event_publisher,
        });

        let hooks = (0..num_members)
            .map(|slot| Self::slot_hooks(&shared, slot, &fault_reporter))
            .collect();
        let session = multicast.create_session(
            vid,
            &members,
            my_rank,
            block_size,
            algorithm,
            hooks,
        );
        let send_worker = Self::start_send_worker(shared.clone(), session.clone());

        DeliveryEngine {
            shared,
            session,
            pool: pool.clone(),
            send_worker: Some(send_worker),
        }
    }

    fn slot_hooks(
        shared: &Arc<EngineShared>,
        slot: usize,
        fault_reporter: &Arc<dyn Fn(usize) + Send + Sync>,
    ) -> SlotHooks {
        let weak_for_destination: Weak<EngineShared> = Arc::downgrade(shared);
        let weak_for_completion: Weak<EngineShared> = Arc::downgrade(shared);
        let fault_reporter = fault_reporter.clone();

        SlotHooks {
            destination: Box::new(move |len| {
                let Some(shared) = weak_for_destination.upgrade() else {
                    // The view is gone; give the transport somewhere harmless to write.
                    return ReceiveDestination {
                        region: Arc::new(MemoryRegion::new(len)),
                        offset: 0,
                    };
                };
                let mut state = shared.state.lock().unwrap();
                let offset = state.rings[slot].place(len);
                ReceiveDestination {
                    region: shared.regions[slot].clone(),
                    offset,
                }
            }),
            completion: Box::new(move |offset, size| {
                let Some(shared) = weak_for_completion.upgrade() else {
                    return;
                };
                shared.on_receive(slot, offset, size);
            }),
            fault: Box::new(move || fault_reporter(slot)),
        }
    }

    /// Reserve `size` bytes of this node's ring for the next message, assigning it the next
    /// sender-local index. Returns `None` if the message is oversized, the ring is currently
    /// full, or the view is wedged; the caller retries (on the next view, if wedged).
    pub(crate) fn reserve_send(&self, size: u64) -> Option<SendBuffer> {
        if size > self.shared.max_msg_size {
            log::warn!(
                "cannot send messages of size larger than the size of the circular buffer divided by the window size ({} > {})",
                size,
                self.shared.max_msg_size
            );
            return None;
        }
        let my_rank = self.shared.my_rank;
        let mut state = self.shared.state.lock().unwrap();
        if state.wedged {
            return None;
        }
        let offset = state.rings[my_rank].reserve(size)?;
        let index = state.future_index;
        state.future_index += 1;
        state.next_message = Some(PendingMessage {
            slot: my_rank,
            index,
            offset,
            size,
        });
        Some(SendBuffer {
            region: self.shared.regions[my_rank].clone(),
            offset,
            size,
        })
    }

    /// Enqueue the most recently reserved message for sending. Returns false if the view wedged
    /// since the reservation (voiding it) or no reservation is pending on this engine; the
    /// caller re-reserves on the successor view.
    pub(crate) fn commit_send(&self) -> bool {
        let mut state = self.shared.state.lock().unwrap();
        if state.wedged {
            state.next_message = None;
            return false;
        }
        let Some(msg) = state.next_message.take() else {
            return false;
        };
        state.pending_sends.push_back(msg);
        drop(state);
        self.shared.send_cv.notify_one();
        true
    }

    /// Install the stability, delivery and window-advance predicates into the view's table.
    pub(crate) fn register_predicates(&self, sst: &Sst) {
        let num_members = self.shared.num_members() as i64;
        let my_rank = self.shared.my_rank;

        // Stability: lift the minimum of everyone's seq_num into our stable_num.
        sst.predicates().insert(
            Box::new(|_: &SstSnapshot| true),
            Box::new(move |sst: &SstHandle| {
                let snapshot = sst.snapshot();
                let min_seq_num = min_over_live(&snapshot, |row_rank| snapshot[row_rank].seq_num);
                if min_seq_num > snapshot[my_rank].stable_num {
                    sst.with_local_row(|row| row.stable_num = min_seq_num);
                    sst.put();
                }
            }),
            crate::sst::predicates::PredicateKind::Recurrent,
        );

        // Delivery: invoke the upcall for the oldest locally-stable message once it is globally
        // stable. At most one message per firing; the predicate re-fires.
        let weak = Arc::downgrade(&self.shared);
        sst.predicates().insert(
            Box::new(|_: &SstSnapshot| true),
            Box::new(move |sst: &SstHandle| {
                let Some(shared) = weak.upgrade() else {
                    return;
                };
                let snapshot = sst.snapshot();
                let min_stable_num =
                    min_over_live(&snapshot, |row_rank| snapshot[row_rank].stable_num);
                let mut state = shared.state.lock().unwrap();
                // Once wedged, the only deliveries left are the ragged-edge flush: the
                // successor view's cutoffs decide what else gets out of this one.
                if state.wedged {
                    return;
                }
                let Some((&key, _)) = state.locally_stable.iter().next() else {
                    return;
                };
                if key <= min_stable_num {
                    let msg = state.locally_stable.remove(&key).unwrap();
                    shared.deliver(&mut state, key, msg);
                    drop(state);
                    sst.put();
                }
            }),
            crate::sst::predicates::PredicateKind::Recurrent,
        );

        // Window advance: once every member has delivered this node's message
        // `next_to_deliver`, a new send may launch.
        let weak_pred = Arc::downgrade(&self.shared);
        let weak_trig = Arc::downgrade(&self.shared);
        sst.predicates().insert(
            Box::new(move |snapshot: &SstSnapshot| {
                let Some(shared) = weak_pred.upgrade() else {
                    return false;
                };
                let next_to_deliver = shared.state.lock().unwrap().next_to_deliver;
                let seq_num = next_to_deliver * num_members + my_rank as i64;
                snapshot
                    .live_ranks()
                    .all(|row_rank| snapshot[row_rank].delivered_num >= seq_num)
            }),
            Box::new(move |_| {
                let Some(shared) = weak_trig.upgrade() else {
                    return;
                };
                shared.state.lock().unwrap().next_to_deliver += 1;
                shared.send_cv.notify_one();
            }),
            crate::sst::predicates::PredicateKind::Recurrent,
        );
    }

    /// Freeze the engine: no new sends start, `reserve_send` fails, the send worker drains out.
    /// In-flight receives still complete.
    pub(crate) fn wedge(&self) {
        let mut state = self.shared.state.lock().unwrap();
        if state.wedged {
            return;
        }
        state.wedged = true;
        state.next_message = None;
        drop(state);
        self.shared.send_cv.notify_all();
    }

    /// Deliver every undelivered locally-stable message whose sender-local index is within the
    /// per-sender cutoffs, in sequence order, ignoring global stability. Messages beyond the
    /// cutoffs are discarded with the view.
    pub(crate) fn deliver_upto(&self, max_indices: &[MsgIndex]) {
        let mut state = self.shared.state.lock().unwrap();
        let deliverable: Vec<SeqNum> = state
            .locally_stable
            .iter()
            .filter(|(_, msg)| msg.index <= max_indices[msg.slot])
            .map(|(&key, _)| key)
            .collect();
        for key in deliverable {
            let msg = state.locally_stable.remove(&key).unwrap();
            self.shared.deliver(&mut state, key, msg);
        }
    }

    /// Mark the block-multicast slots of removed members as permanently faulted so pending
    /// receives from them do not block the successor view.
    pub(crate) fn mark_removed_senders(&self, removed_ranks: &[usize]) {
        for &rank in removed_ranks {
            self.session.mark_faulted(rank);
        }
    }

    fn start_send_worker(
        shared: Arc<EngineShared>,
        session: Arc<dyn MulticastSession>,
    ) -> JoinHandle<()> {
        thread::spawn(move || {
            let num_members = shared.num_members() as i64;
            let my_rank = shared.my_rank;
            let window_size = shared.window_size as i64;
            let mut blocked_since: Option<Instant> = None;
            let mut state = shared.state.lock().unwrap();
            loop {
                if state.wedged {
                    return;
                }
                let ready = match state.pending_sends.front() {
                    None => false,
                    Some(msg) => {
                        // The previous message from this sender must have completed its own
                        // receive (keeps slot receives in order), and every member must have
                        // delivered up to `index - window_size`.
                        state.last_received[my_rank] >= msg.index - 1 && {
                            let floor =
                                (msg.index - window_size) * num_members + my_rank as i64;
                            let snapshot = shared.sst.snapshot();
                            let ok = snapshot
                                .live_ranks()
                                .all(|row_rank| snapshot[row_rank].delivered_num >= floor);
                            ok
                        }
                    }
                };
                if ready {
                    let msg = state.pending_sends.pop_front().unwrap();
                    session.send(my_rank, &shared.regions[my_rank], msg.offset, msg.size);
                    blocked_since = None;
                    continue;
                }

                // Null filling: the total order is round-robin over sender slots, so a silent
                // sender stalls delivery of everyone else's messages. If our slot holds the
                // first missing position and it blocks the oldest undelivered message, fill it
                // with a zero-size message once the condition has held for a grace period.
                if Self::own_slot_blocks_delivery(&state, my_rank, num_members) {
                    match blocked_since {
                        Some(since) if since.elapsed() >= NULL_SEND_DELAY => {
                            state.future_index += 1;
                            session.send(my_rank, &shared.regions[my_rank], 0, 0);
                            blocked_since = None;
                            continue;
                        }
                        Some(_) => (),
                        None => blocked_since = Some(Instant::now()),
                    }
                } else {
                    blocked_since = None;
                }

                state = shared
                    .send_cv
                    .wait_timeout(state, Duration::from_millis(1))
                    .unwrap()
                    .0;
            }
        })
    }

    fn own_slot_blocks_delivery(state: &EngineState, my_rank: usize, num_members: i64) -> bool {
        // Nothing of ours may be pending, reserved or in flight, or the gap is not ours to
        // fill (or will be filled by the flight itself).
        if !state.pending_sends.is_empty()
            || state.next_message.is_some()
            || state.last_received[my_rank] + 1 != state.future_index
        {
            return false;
        }
        let Some((&oldest_key, _)) = state.locally_stable.iter().next() else {
            return false;
        };
        let (min_rank, min_index) = first_min(&state.last_received);
        let first_missing = (min_index + 1) * num_members + min_rank as i64;
        min_rank == my_rank && first_missing < oldest_key
    }
}

impl Drop for DeliveryEngine {
    fn drop(&mut self) {
        self.wedge();
        if let Some(send_worker) = self.send_worker.take() {
            let _ = send_worker.join();
        }
        for region in self.shared.regions.iter() {
            self.pool.put_back(region.clone());
        }
    }
}

impl EngineShared {
    /// Receive-completion path: a whole message from `slot` has been placed at
    /// `[offset, offset + size)` of the slot's region. Registers it as locally stable and
    /// advances this node's contiguous `seq_num`.
    fn on_receive(&self, slot: usize, offset: u64, size: u64) {
        let num_members = self.num_members() as i64;
        let mut state = self.state.lock().unwrap();
        state.last_received[slot] += 1;
        let index = state.last_received[slot];
        state.locally_stable.insert(
            index * num_members + slot as i64,
            PendingMessage {
                slot,
                index,
                offset,
                size,
            },
        );

        // The first missing position in the total order is (min+1, argmin); everything before it
        // has been received.
        let (min_rank, min_index) = first_min(&state.last_received);
        let new_seq_num = (min_index + 1) * num_members + min_rank as i64 - 1;
        self.sst.with_local_row(|row| {
            row.n_received[slot] = index;
            if new_seq_num > row.seq_num {
                row.seq_num = new_seq_num;
            }
        });
        drop(state);
        self.sst.put();
        self.send_cv.notify_one();
    }
}

fn min_over_live(snapshot: &SstSnapshot, f: impl Fn(usize) -> SeqNum) -> SeqNum {
    snapshot.live_ranks().map(f).min().unwrap_or(-1)
}

/// The smallest value and its first (lowest-rank) position. The tie-break matters: the first
/// missing position in the total order belongs to the lowest rank among the least-advanced
/// senders.
fn first_min(last_received: &[MsgIndex]) -> (usize, MsgIndex) {
    let mut min_rank = 0;
    let mut min_index = last_received[0];
    for (rank, &received) in last_received.iter().enumerate().skip(1) {
        if received < min_index {
            min_rank = rank;
            min_index = received;
        }
    }
    (min_rank, min_index)
}

#[cfg(test)]
mod tests {
    use super::first_min;

    #[test]
    fn first_min_breaks_ties_toward_the_lowest_rank() {
        assert_eq!(first_min(&[-1, -1, -1]), (0, -1));
        assert_eq!(first_min(&[3, 1, 1]), (1, 1));
        assert_eq!(first_min(&[0, 2, 1]), (0, 0));
    }
}
