/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Configuration as specified by the operator.

use std::collections::HashMap;

use crate::types::{DisseminationAlgorithm, NodeId};

/// Process-level configuration. Constructed by the operator and validated once at
/// [`Group::start`](crate::group::Group::start).
#[derive(Clone)]
pub struct Configuration {
    /// This node's preassigned id. Must appear in `member_addrs`.
    pub my_id: NodeId,
    /// The id of the bootstrap leader. If `my_id == leader_id` this node starts a new group,
    /// otherwise it joins the existing one by contacting the leader.
    pub leader_id: NodeId,
    /// The fixed id → `"ip:port"` map of every node that may ever participate. Joiners are
    /// admitted only if their announced id appears here.
    pub member_addrs: HashMap<NodeId, String>,
    /// Size in bytes of each per-sender ring buffer.
    pub buffer_size: u64,
    /// Transport block size, passed through to the block multicast.
    pub block_size: u64,
    /// Maximum number of undelivered messages a sender may have outstanding. Must be at least 1.
    /// The maximum single message size is `buffer_size / window_size`.
    pub window_size: u32,
    /// Upper bound on group size. Sizes the circular pending-changes list and the per-sender
    /// columns of the shared-state row. A runtime bound, not a type parameter.
    pub max_members: usize,
    /// Dissemination algorithm selector for the block multicast.
    pub algorithm: DisseminationAlgorithm,
    /// Whether to install the default logging handlers for every event.
    pub log_events: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("window_size must be at least 1")]
    ZeroWindow,
    #[error("buffer_size ({buffer_size}) must hold at least one message per window slot")]
    BufferTooSmall { buffer_size: u64 },
    #[error("max_members must be at least 1")]
    ZeroMaxMembers,
    #[error("node id {id} is missing from member_addrs")]
    UnknownNode { id: NodeId },
    #[error("address for node {id} is not a valid ip:port pair: {addr}")]
    BadAddress { id: NodeId, addr: String },
}

impl Configuration {
    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.window_size == 0 {
            return Err(ConfigError::ZeroWindow);
        }
        if self.buffer_size / self.window_size as u64 == 0 {
            return Err(ConfigError::BufferTooSmall {
                buffer_size: self.buffer_size,
            });
        }
        if self.max_members == 0 {
            return Err(ConfigError::ZeroMaxMembers);
        }
        for id in [self.my_id, self.leader_id] {
            if !self.member_addrs.contains_key(&id) {
                return Err(ConfigError::UnknownNode { id });
            }
        }
        for (id, addr) in &self.member_addrs {
            if addr.parse::<std::net::SocketAddr>().is_err() {
                return Err(ConfigError::BadAddress {
                    id: *id,
                    addr: addr.clone(),
                });
            }
        }
        Ok(())
    }

    /// The address this node listens on for joiner handshakes.
    pub(crate) fn my_addr(&self) -> &str {
        &self.member_addrs[&self.my_id]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Configuration {
        let mut member_addrs = HashMap::new();
        member_addrs.insert(0, "127.0.0.1:28000".to_string());
        member_addrs.insert(1, "127.0.0.1:28001".to_string());
        Configuration {
            my_id: 0,
            leader_id: 0,
            member_addrs,
            buffer_size: 3000,
            block_size: 1000,
            window_size: 3,
            max_members: 8,
            algorithm: DisseminationAlgorithm::BinomialSend,
            log_events: false,
        }
    }

    #[test]
    fn accepts_valid_configuration() {
        assert!(base().validate().is_ok());
    }

    #[test]
    fn rejects_zero_window() {
        let mut config = base();
        config.window_size = 0;
        assert!(matches!(config.validate(), Err(ConfigError::ZeroWindow)));
    }

    #[test]
    fn rejects_unknown_self() {
        let mut config = base();
        config.my_id = 42;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnknownNode { id: 42 })
        ));
    }

    #[test]
    fn rejects_bad_address() {
        let mut config = base();
        config.member_addrs.insert(1, "not-an-address".to_string());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::BadAddress { id: 1, .. })
        ));
    }
}
