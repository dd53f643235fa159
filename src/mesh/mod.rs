//! Peer mesh networking module using Chitchat.
//!
//! This module implements the peer-to-peer mesh used by the gossip counter
//! store when replicas share limits without a central Redis. It uses the
//! chitchat library for cluster membership and state dissemination.

mod cluster;

pub use cluster::{Cluster, ClusterConfig, ClusterError, CounterKey, RegisterValue};
