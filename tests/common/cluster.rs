//! Helpers for assembling in-process clusters of group members.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use groupcast::group::{Callbacks, Group};
use groupcast::types::{DisseminationAlgorithm, FatalError, MsgIndex, NodeId};
use groupcast::Configuration;

use super::transport::LoopbackHub;

/// What the delivery upcall observed, in order.
pub(crate) type Delivered = Arc<Mutex<Vec<(NodeId, MsgIndex, Vec<u8>)>>>;

pub(crate) struct TestNode {
    pub(crate) id: NodeId,
    pub(crate) group: Group,
    pub(crate) delivered: Delivered,
    /// Member lists passed to the view upcall, in order.
    pub(crate) views: Arc<Mutex<Vec<Vec<NodeId>>>>,
    /// Fatal conditions the node hit instead of exiting the process.
    pub(crate) fatals: Arc<Mutex<Vec<FatalError>>>,
}

impl TestNode {
    pub(crate) fn delivered(&self) -> Vec<(NodeId, MsgIndex, Vec<u8>)> {
        self.delivered.lock().unwrap().clone()
    }

    pub(crate) fn latest_members(&self) -> Vec<NodeId> {
        self.group.members()
    }

    pub(crate) fn fatals(&self) -> Vec<FatalError> {
        self.fatals.lock().unwrap().clone()
    }
}

/// Build the fixed id → address map for a cluster on localhost, one port per node starting at
/// `base_port`. Each test uses its own base port so test binaries can run concurrently.
pub(crate) fn member_addrs(ids: &[NodeId], base_port: u16) -> HashMap<NodeId, String> {
    ids.iter()
        .enumerate()
        .map(|(i, &id)| (id, format!("127.0.0.1:{}", base_port + i as u16)))
        .collect()
}

pub(crate) fn configuration(
    my_id: NodeId,
    leader_id: NodeId,
    member_addrs: &HashMap<NodeId, String>,
) -> Configuration {
    Configuration {
        my_id,
        leader_id,
        member_addrs: member_addrs.clone(),
        buffer_size: 3000,
        block_size: 1000,
        window_size: 3,
        max_members: 8,
        algorithm: DisseminationAlgorithm::BinomialSend,
        log_events: false,
    }
}

pub(crate) fn start_node(hub: &LoopbackHub, config: Configuration) -> TestNode {
    let id = config.my_id;
    let delivered: Delivered = Arc::new(Mutex::new(Vec::new()));
    let views = Arc::new(Mutex::new(Vec::new()));
    let fatals = Arc::new(Mutex::new(Vec::new()));

    let delivered_in_callback = delivered.clone();
    let mut callbacks = Callbacks::new(Arc::new(move |sender, index, bytes: &[u8]| {
        delivered_in_callback
            .lock()
            .unwrap()
            .push((sender, index, bytes.to_vec()));
    }));
    let views_in_upcall = views.clone();
    callbacks.view_upcalls.push(Arc::new(move |new_members, _| {
        views_in_upcall.lock().unwrap().push(new_members.to_vec());
    }));
    let fatals_in_handler = fatals.clone();
    callbacks.fatal_handler = Some(Arc::new(move |error: &FatalError| {
        fatals_in_handler.lock().unwrap().push(error.clone());
    }));

    let group = Group::start(config, hub.multicast(), hub.rows(), callbacks)
        .expect("node failed to start");
    TestNode {
        id,
        group,
        delivered,
        views,
        fatals,
    }
}

/// Poll `condition` until it holds or `timeout` passes. Returns whether it held.
pub(crate) fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    condition()
}

/// Wait until every listed node's current view has exactly `expected` members.
pub(crate) fn wait_for_membership(nodes: &[&TestNode], expected: &[NodeId], timeout: Duration) -> bool {
    wait_until(timeout, || {
        nodes.iter().all(|node| node.latest_members() == expected)
    })
}
