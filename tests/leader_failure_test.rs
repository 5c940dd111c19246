//! The leader fails while a membership change is in flight. The next-ranked survivor takes over,
//! re-runs ragged-edge cleanup (copying a prior decision where one exists), merges the dead
//! leader's pending proposals, and drives the group to the agreed successor views. No message is
//! delivered twice.

mod common;

use std::collections::HashSet;
use std::time::Duration;

use log::LevelFilter;

use groupcast::types::FatalError;

use common::cluster::{configuration, member_addrs, start_node, wait_for_membership, wait_until};
use common::logging::setup_logger;
use common::transport::LoopbackHub;

#[test]
fn leader_fault_during_change() {
    setup_logger(LevelFilter::Warn);
    let addrs = member_addrs(&[0, 1, 2, 3], 28400);
    let hub = LoopbackHub::new();

    let node_a = start_node(&hub, configuration(0, 0, &addrs));
    let node_b = start_node(&hub, configuration(1, 0, &addrs));
    assert!(wait_for_membership(
        &[&node_a, &node_b],
        &[0, 1],
        Duration::from_secs(10)
    ));
    let node_c = start_node(&hub, configuration(2, 0, &addrs));
    assert!(wait_for_membership(
        &[&node_a, &node_b, &node_c],
        &[0, 1, 2],
        Duration::from_secs(10)
    ));
    let node_d = start_node(&hub, configuration(3, 0, &addrs));
    let nodes = [&node_a, &node_b, &node_c, &node_d];
    assert!(wait_for_membership(&nodes, &[0, 1, 2, 3], Duration::from_secs(10)));

    // Some traffic so the ragged edge is non-trivial.
    std::thread::scope(|scope| {
        for node in nodes {
            scope.spawn(move || {
                for index in 0..4i64 {
                    assert!(node.group.send(&[node.id as u8, index as u8]));
                }
            });
        }
    });
    assert!(wait_until(Duration::from_secs(30), || {
        nodes.iter().all(|node| node.delivered().len() == 16)
    }));

    // D and the leader A fail together, observed at B. B becomes leader mid-change: it must
    // carry the pending removal of D (proposed by whoever saw it first) as well as A's own
    // removal through commit and installation.
    node_b.group.report_failure(3);
    node_b.group.report_failure(0);

    assert!(
        wait_for_membership(&[&node_b, &node_c], &[1, 2], Duration::from_secs(15)),
        "survivors did not converge on the two-member view"
    );

    // Identical histories, no duplicates.
    let delivered_b = node_b.delivered();
    assert_eq!(delivered_b, node_c.delivered());
    let mut seen = HashSet::new();
    for (sender, index, _) in &delivered_b {
        assert!(seen.insert((*sender, *index)), "duplicate delivery");
    }

    // The removed members terminate once a committed view excludes them.
    for (node, id) in [(&node_a, 0u32), (&node_d, 3u32)] {
        assert!(
            wait_until(Duration::from_secs(10), || {
                node.fatals()
                    .iter()
                    .any(|fatal| matches!(fatal, FatalError::Evicted { my_id } if *my_id == id))
            }),
            "removed node {} did not terminate",
            id
        );
    }

    // The survivors' group remains live under the new leader.
    assert!(node_b.group.send(&[0xBB]));
    assert!(wait_until(Duration::from_secs(5), || {
        node_b.delivered().len() == 17 && node_c.delivered().len() == 17
    }));
}
