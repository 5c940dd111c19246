//! A "mock" (totally local) pair of transports: an in-process block multicast and an in-process
//! row-replication fabric, connected through one hub.
//!
//! ## Limitations
//!
//! Messages and rows are moved between nodes over channels, with one dispatcher thread per
//! session playing the role of the transport's receive threads. Sessions are keyed by
//! `(view number, node id)`, and traffic for a session that does not exist yet is queued until
//! it is created, which papers over the installation skew between members of a new view.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use groupcast::multicast::{BlockMulticast, MulticastSession, SlotHooks};
use groupcast::buffer::MemoryRegion;
use groupcast::sst::transport::{RowSession, RowTransport};
use groupcast::sst::RowSink;
use groupcast::types::{DisseminationAlgorithm, NodeId, ViewNumber};

enum MsgEnvelope {
    /// A remote message: bytes to place through the destination hook.
    Remote { slot: usize, bytes: Vec<u8> },
    /// The sender's own message: already in its region, complete directly.
    Local { slot: usize, offset: u64, size: u64 },
}

struct RowEnvelope {
    rank: usize,
    bytes: Vec<u8>,
}

type Key = (ViewNumber, NodeId);

struct Mailboxes<T> {
    open: HashMap<Key, Sender<T>>,
    queued: HashMap<Key, Vec<T>>,
}

impl<T> Default for Mailboxes<T> {
    fn default() -> Mailboxes<T> {
        Mailboxes {
            open: HashMap::new(),
            queued: HashMap::new(),
        }
    }
}

impl<T> Mailboxes<T> {
    fn deliver(&mut self, key: Key, envelope: T) {
        if let Some(sender) = self.open.get(&key) {
            let _ = sender.send(envelope);
        } else {
            self.queued.entry(key).or_default().push(envelope);
        }
    }

    fn open(&mut self, key: Key) -> Receiver<T> {
        let (sender, receiver) = mpsc::channel();
        for envelope in self.queued.remove(&key).unwrap_or_default() {
            let _ = sender.send(envelope);
        }
        self.open.insert(key, sender);
        receiver
    }
}

#[derive(Default)]
struct BarrierState {
    arrived: usize,
    epoch: u64,
}

struct HubInner {
    msgs: Mutex<Mailboxes<MsgEnvelope>>,
    rows: Mutex<Mailboxes<RowEnvelope>>,
    barriers: Mutex<HashMap<ViewNumber, BarrierState>>,
    barrier_cv: Condvar,
    /// Nodes whose outgoing row updates are currently withheld (and queued).
    row_gated: Mutex<HashSet<NodeId>>,
    gated_rows: Mutex<Vec<(Key, RowEnvelope)>>,
}

/// The hub all test nodes hang off. Hand each node [`multicast`](Self::multicast) and
/// [`rows`](Self::rows).
#[derive(Clone)]
pub(crate) struct LoopbackHub {
    inner: Arc<HubInner>,
}

impl LoopbackHub {
    pub(crate) fn new() -> LoopbackHub {
        LoopbackHub {
            inner: Arc::new(HubInner {
                msgs: Mutex::new(Mailboxes::default()),
                rows: Mutex::new(Mailboxes::default()),
                barriers: Mutex::new(HashMap::new()),
                barrier_cv: Condvar::new(),
                row_gated: Mutex::new(HashSet::new()),
                gated_rows: Mutex::new(Vec::new()),
            }),
        }
    }

    pub(crate) fn multicast(&self) -> LoopbackMulticast {
        LoopbackMulticast {
            inner: self.inner.clone(),
        }
    }

    pub(crate) fn rows(&self) -> LoopbackRows {
        LoopbackRows {
            inner: self.inner.clone(),
        }
    }

    /// Withhold `node`'s outgoing row updates until [`release_rows`](Self::release_rows). Lets a
    /// test stall global stability deterministically.
    pub(crate) fn gate_rows(&self, node: NodeId) {
        self.inner.row_gated.lock().unwrap().insert(node);
    }

    pub(crate) fn release_rows(&self, node: NodeId) {
        self.inner.row_gated.lock().unwrap().remove(&node);
        let withheld = std::mem::take(&mut *self.inner.gated_rows.lock().unwrap());
        let mut rows = self.inner.rows.lock().unwrap();
        for (key, envelope) in withheld {
            rows.deliver(key, envelope);
        }
    }
}

impl HubInner {
    fn barrier(&self, vid: ViewNumber, expected: usize) {
        let mut barriers = self.barriers.lock().unwrap();
        let state = barriers.entry(vid).or_default();
        state.arrived += 1;
        if state.arrived >= expected {
            state.arrived = 0;
            state.epoch += 1;
            self.barrier_cv.notify_all();
            return;
        }
        let arrival_epoch = state.epoch;
        // Bounded wait: a node that halted mid-change never arrives, and a test must not hang
        // on teardown because of it.
        let _unused = self
            .barrier_cv
            .wait_timeout_while(barriers, Duration::from_secs(10), |barriers| {
                barriers.get(&vid).map(|state| state.epoch) == Some(arrival_epoch)
            })
            .unwrap();
    }
}

#[derive(Clone)]
pub(crate) struct LoopbackMulticast {
    inner: Arc<HubInner>,
}

impl BlockMulticast for LoopbackMulticast {
    fn create_session(
        &self,
        vid: ViewNumber,
        members: &[NodeId],
        my_rank: usize,
        _block_size: u64,
        _algorithm: DisseminationAlgorithm,
        hooks: Vec<SlotHooks>,
    ) -> Arc<dyn MulticastSession> {
        let my_id = members[my_rank];
        let receiver = self.inner.msgs.lock().unwrap().open((vid, my_id));
        let faulted: Arc<Mutex<HashSet<usize>>> = Arc::new(Mutex::new(HashSet::new()));
        let shutdown = Arc::new(AtomicBool::new(false));

        let dispatcher = {
            let faulted = faulted.clone();
            let shutdown = shutdown.clone();
            thread::spawn(move || loop {
                if shutdown.load(Ordering::Relaxed) {
                    return;
                }
                match receiver.recv_timeout(Duration::from_millis(5)) {
                    Ok(MsgEnvelope::Local { slot, offset, size }) => {
                        if !faulted.lock().unwrap().contains(&slot) {
                            (hooks[slot].completion)(offset, size);
                        }
                    }
                    Ok(MsgEnvelope::Remote { slot, bytes }) => {
                        if !faulted.lock().unwrap().contains(&slot) {
                            let destination = (hooks[slot].destination)(bytes.len() as u64);
                            destination.region.write_at(destination.offset, &bytes);
                            (hooks[slot].completion)(destination.offset, bytes.len() as u64);
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => return,
                }
            })
        };

        Arc::new(LoopbackMulticastSession {
            inner: self.inner.clone(),
            vid,
            members: members.to_vec(),
            my_id,
            faulted,
            shutdown,
            dispatcher: Mutex::new(Some(dispatcher)),
        })
    }
}

struct LoopbackMulticastSession {
    inner: Arc<HubInner>,
    vid: ViewNumber,
    members: Vec<NodeId>,
    my_id: NodeId,
    faulted: Arc<Mutex<HashSet<usize>>>,
    shutdown: Arc<AtomicBool>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl MulticastSession for LoopbackMulticastSession {
    fn send(&self, slot: usize, region: &Arc<MemoryRegion>, offset: u64, size: u64) {
        let bytes = region.with_slice(offset, size, |bytes| bytes.to_vec());
        let mut msgs = self.inner.msgs.lock().unwrap();
        for &member in &self.members {
            let envelope = if member == self.my_id {
                MsgEnvelope::Local { slot, offset, size }
            } else {
                MsgEnvelope::Remote {
                    slot,
                    bytes: bytes.clone(),
                }
            };
            msgs.deliver((self.vid, member), envelope);
        }
    }

    fn mark_faulted(&self, slot: usize) {
        self.faulted.lock().unwrap().insert(slot);
    }
}

impl Drop for LoopbackMulticastSession {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(dispatcher) = self.dispatcher.lock().unwrap().take() {
            let _ = dispatcher.join();
        }
    }
}

#[derive(Clone)]
pub(crate) struct LoopbackRows {
    inner: Arc<HubInner>,
}

impl RowTransport for LoopbackRows {
    fn create_session(
        &self,
        vid: ViewNumber,
        members: &[NodeId],
        my_rank: usize,
        sink: RowSink,
    ) -> Arc<dyn RowSession> {
        let my_id = members[my_rank];
        let receiver = self.inner.rows.lock().unwrap().open((vid, my_id));
        let shutdown = Arc::new(AtomicBool::new(false));

        let dispatcher = {
            let shutdown = shutdown.clone();
            thread::spawn(move || loop {
                if shutdown.load(Ordering::Relaxed) {
                    return;
                }
                match receiver.recv_timeout(Duration::from_millis(5)) {
                    Ok(envelope) => sink.apply(envelope.rank, &envelope.bytes),
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => return,
                }
            })
        };

        Arc::new(LoopbackRowSession {
            inner: self.inner.clone(),
            vid,
            members: members.to_vec(),
            my_id,
            my_rank,
            shutdown,
            dispatcher: Mutex::new(Some(dispatcher)),
        })
    }
}

struct LoopbackRowSession {
    inner: Arc<HubInner>,
    vid: ViewNumber,
    members: Vec<NodeId>,
    my_id: NodeId,
    my_rank: usize,
    shutdown: Arc<AtomicBool>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl RowSession for LoopbackRowSession {
    fn publish(&self, row_bytes: &[u8]) {
        let gated = self.inner.row_gated.lock().unwrap().contains(&self.my_id);
        for &member in &self.members {
            if member == self.my_id {
                continue;
            }
            let envelope = RowEnvelope {
                rank: self.my_rank,
                bytes: row_bytes.to_vec(),
            };
            if gated {
                self.inner
                    .gated_rows
                    .lock()
                    .unwrap()
                    .push(((self.vid, member), envelope));
            } else {
                self.inner
                    .rows
                    .lock()
                    .unwrap()
                    .deliver((self.vid, member), envelope);
            }
        }
    }

    fn sync_with_members(&self) {
        self.inner.barrier(self.vid, self.members.len());
    }
}

impl Drop for LoopbackRowSession {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(dispatcher) = self.dispatcher.lock().unwrap().take() {
            let _ = dispatcher.join();
        }
    }
}
