//! Three senders, ten messages each: every node delivers the exact round-robin total order
//! `(A,0),(B,0),(C,0),(A,1),…`, with identical payload bytes.

mod common;

use std::time::Duration;

use log::LevelFilter;

use common::cluster::{configuration, member_addrs, start_node, wait_for_membership, wait_until};
use common::logging::setup_logger;
use common::transport::LoopbackHub;

const MESSAGES_PER_SENDER: i64 = 10;
const MESSAGE_SIZE: usize = 1000;

fn payload(sender: u32, index: i64) -> Vec<u8> {
    let mut bytes = vec![0u8; MESSAGE_SIZE];
    bytes[0] = sender as u8;
    bytes[1] = index as u8;
    bytes
}

#[test]
fn three_node_round_robin() {
    setup_logger(LevelFilter::Warn);
    let addrs = member_addrs(&[0, 1, 2], 28200);
    let hub = LoopbackHub::new();

    let node_a = start_node(&hub, configuration(0, 0, &addrs));
    let node_b = start_node(&hub, configuration(1, 0, &addrs));
    assert!(wait_for_membership(
        &[&node_a, &node_b],
        &[0, 1],
        Duration::from_secs(10)
    ));
    let node_c = start_node(&hub, configuration(2, 0, &addrs));
    let nodes = [&node_a, &node_b, &node_c];
    assert!(
        wait_for_membership(&nodes, &[0, 1, 2], Duration::from_secs(10)),
        "view [0, 1, 2] was not installed everywhere"
    );

    // Senders must run concurrently: with buffer_size 3000 a sender can hold at most three
    // undelivered messages, and delivery of its fourth waits on the other senders' traffic.
    std::thread::scope(|scope| {
        for node in nodes {
            scope.spawn(move || {
                for index in 0..MESSAGES_PER_SENDER {
                    assert!(node.group.send(&payload(node.id, index)));
                }
            });
        }
    });

    let total = (MESSAGES_PER_SENDER * 3) as usize;
    assert!(
        wait_until(Duration::from_secs(30), || {
            nodes.iter().all(|node| node.delivered().len() == total)
        }),
        "not all messages were delivered everywhere"
    );

    let expected: Vec<(u32, i64, Vec<u8>)> = (0..MESSAGES_PER_SENDER)
        .flat_map(|index| [0u32, 1, 2].map(|sender| (sender, index, payload(sender, index))))
        .collect();
    for node in nodes {
        assert_eq!(
            node.delivered(),
            expected,
            "node {} deviated from the round-robin total order",
            node.id
        );
    }
}
