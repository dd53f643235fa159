//! Cluster management using Chitchat.
//!
//! This module wraps the chitchat library to provide cluster membership,
//! failure detection, and state gossip for the mesh counter store.
//!
//! Each node only ever writes its own node state. Counters are the sum of
//! every live node's contribution; registers are last-writer-wins across
//! nodes, keyed by write timestamp.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chitchat::transport::UdpTransport;
use chitchat::{
    spawn_chitchat, ChitchatConfig, ChitchatHandle, ChitchatId, FailureDetectorConfig,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const COUNTER_PREFIX: &str = "counter|";
const REGISTER_PREFIX: &str = "reg|";

/// Errors that can occur in cluster operations.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("Failed to start cluster: {0}")]
    StartError(String),
    #[error("Failed to shut down cluster: {0}")]
    ShutdownError(String),
}

/// Configuration for the cluster.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Unique node identifier.
    pub node_id: String,
    /// The address to listen on for gossip.
    pub listen_addr: SocketAddr,
    /// The address to advertise to other nodes.
    pub advertise_addr: SocketAddr,
    /// Seed nodes to bootstrap cluster membership.
    pub seed_nodes: Vec<String>,
    /// Cluster identifier (nodes must have matching cluster IDs).
    pub cluster_id: String,
    /// How often to gossip with peers.
    pub gossip_interval: Duration,
    /// Grace period before considering a dead node's state deletable.
    pub dead_node_grace_period: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        let default_addr = SocketAddr::from(([0, 0, 0, 0], 7946));
        Self {
            node_id: uuid::Uuid::new_v4().to_string(),
            listen_addr: default_addr,
            advertise_addr: default_addr,
            seed_nodes: Vec::new(),
            cluster_id: "floodgate".to_string(),
            gossip_interval: Duration::from_millis(100),
            dead_node_grace_period: Duration::from_secs(3600),
        }
    }
}

/// Key identifying a counter in the cluster state.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CounterKey {
    /// The store key the counter belongs to.
    pub key: String,
}

impl CounterKey {
    pub fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
        }
    }

    /// Convert to a chitchat key string.
    /// Format: "counter|{key}"
    pub fn to_chitchat_key(&self) -> String {
        format!("{}{}", COUNTER_PREFIX, self.key)
    }

    /// Parse from a chitchat key string.
    pub fn from_chitchat_key(key: &str) -> Option<Self> {
        let rest = key.strip_prefix(COUNTER_PREFIX)?;
        if rest.is_empty() {
            return None;
        }
        Some(Self::new(rest))
    }
}

/// One node's contribution to a counter, with the instant it stops counting.
///
/// Encoded as `{count}|{expires_at_ms}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Contribution {
    count: u64,
    expires_at_ms: i64,
}

impl Contribution {
    fn encode(&self) -> String {
        format!("{}|{}", self.count, self.expires_at_ms)
    }

    fn decode(raw: &str) -> Option<Self> {
        let (count, expires) = raw.split_once('|')?;
        Some(Self {
            count: count.parse().ok()?,
            expires_at_ms: expires.parse().ok()?,
        })
    }

    fn live_count(raw: &str, now_ms: i64) -> u64 {
        match Self::decode(raw) {
            Some(c) if c.expires_at_ms > now_ms => c.count,
            _ => 0,
        }
    }
}

/// A last-writer-wins register value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterValue {
    /// Write time in epoch milliseconds; the newest write wins.
    pub written_ms: i64,
    /// Expiry in epoch milliseconds, `None` for never.
    pub expires_ms: Option<i64>,
    /// `None` marks a deletion.
    pub value: Option<String>,
}

impl RegisterValue {
    fn is_live(&self, now_ms: i64) -> bool {
        self.value.is_some() && self.expires_ms.map_or(true, |at| now_ms < at)
    }

    fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_ms.map_or(false, |at| now_ms >= at)
    }
}

/// The cluster handle for distributed state management.
pub struct Cluster {
    /// Our node ID.
    node_id: String,
    /// Chitchat handle.
    handle: ChitchatHandle,
    config: ClusterConfig,
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("node_id", &self.node_id)
            .field("config", &self.config)
            .finish()
    }
}

impl Cluster {
    /// Create and start a new cluster node.
    pub async fn start(config: ClusterConfig) -> Result<Self, ClusterError> {
        info!(
            node_id = %config.node_id,
            listen_addr = %config.listen_addr,
            advertise_addr = %config.advertise_addr,
            seed_nodes = ?config.seed_nodes,
            cluster_id = %config.cluster_id,
            "Starting cluster node"
        );

        let chitchat_id = ChitchatId {
            node_id: config.node_id.clone(),
            generation_id: 0,
            gossip_advertise_addr: config.advertise_addr,
        };

        let chitchat_config = ChitchatConfig {
            chitchat_id,
            cluster_id: config.cluster_id.clone(),
            gossip_interval: config.gossip_interval,
            listen_addr: config.listen_addr,
            seed_nodes: config.seed_nodes.clone(),
            failure_detector_config: FailureDetectorConfig {
                initial_interval: config.gossip_interval,
                ..Default::default()
            },
            marked_for_deletion_grace_period: config.dead_node_grace_period,
            catchup_callback: None,
            extra_liveness_predicate: None,
        };

        let transport = UdpTransport;
        let handle = spawn_chitchat(chitchat_config, Vec::new(), &transport)
            .await
            .map_err(|e| ClusterError::StartError(e.to_string()))?;

        info!("Cluster node started successfully");

        Ok(Self {
            node_id: config.node_id.clone(),
            handle,
            config,
        })
    }

    /// Get our node ID.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Get the chitchat handle for direct access.
    pub fn chitchat(&self) -> Arc<Mutex<chitchat::Chitchat>> {
        self.handle.chitchat()
    }

    /// Add to this node's contribution and return the total across live nodes.
    ///
    /// A contribution whose expiry has passed restarts from zero, and
    /// expired contributions of other nodes are not counted.
    pub async fn increment_counter(
        &self,
        key: &CounterKey,
        amount: u64,
        expires_at_ms: i64,
        now_ms: i64,
    ) -> u64 {
        let chitchat_key = key.to_chitchat_key();
        let chitchat_arc = self.handle.chitchat();
        let mut chitchat = chitchat_arc.lock().await;

        let current = chitchat
            .self_node_state()
            .get(&chitchat_key)
            .and_then(Contribution::decode)
            .filter(|c| c.expires_at_ms > now_ms);

        let next = match current {
            Some(c) => Contribution {
                count: c.count + amount,
                expires_at_ms: c.expires_at_ms,
            },
            None => Contribution {
                count: amount,
                expires_at_ms,
            },
        };
        chitchat
            .self_node_state()
            .set(chitchat_key.clone(), next.encode());

        debug!(
            key = %chitchat_key,
            local_value = next.count,
            "Incremented local counter"
        );

        Self::sum_counter(&chitchat, &chitchat_key, now_ms)
    }

    /// Get the total count for a key across all live nodes.
    pub async fn get_count(&self, key: &CounterKey, now_ms: i64) -> u64 {
        let chitchat_key = key.to_chitchat_key();
        let chitchat_arc = self.handle.chitchat();
        let chitchat = chitchat_arc.lock().await;
        Self::sum_counter(&chitchat, &chitchat_key, now_ms)
    }

    fn sum_counter(chitchat: &chitchat::Chitchat, key: &str, now_ms: i64) -> u64 {
        chitchat
            .live_nodes()
            .filter_map(|node_id| chitchat.node_state(node_id))
            .filter_map(|state| state.get(key))
            .map(|raw| Contribution::live_count(raw, now_ms))
            .sum()
    }

    /// Write a register value into this node's state.
    pub async fn set_register(&self, key: &str, value: &RegisterValue) {
        let encoded = match serde_json::to_string(value) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to encode register value");
                return;
            }
        };
        let chitchat_arc = self.handle.chitchat();
        let mut chitchat = chitchat_arc.lock().await;
        chitchat
            .self_node_state()
            .set(format!("{}{}", REGISTER_PREFIX, key), encoded);
    }

    /// The newest write for `key` seen on any live node.
    pub async fn get_register(&self, key: &str) -> Option<RegisterValue> {
        self.register_writes(key)
            .await
            .into_iter()
            .max_by_key(|v| v.written_ms)
    }

    /// Every live node's write for `key`, including deletions.
    pub async fn register_writes(&self, key: &str) -> Vec<RegisterValue> {
        let chitchat_key = format!("{}{}", REGISTER_PREFIX, key);
        let chitchat_arc = self.handle.chitchat();
        let chitchat = chitchat_arc.lock().await;

        chitchat
            .live_nodes()
            .filter_map(|node_id| chitchat.node_state(node_id))
            .filter_map(|state| state.get(&chitchat_key))
            .filter_map(|raw| serde_json::from_str::<RegisterValue>(raw).ok())
            .collect()
    }

    /// Newest live register values whose key starts with `prefix`.
    pub async fn scan_registers(&self, prefix: &str, now_ms: i64) -> Vec<(String, RegisterValue)> {
        let chitchat_prefix = format!("{}{}", REGISTER_PREFIX, prefix);
        let chitchat_arc = self.handle.chitchat();
        let chitchat = chitchat_arc.lock().await;

        let mut newest: std::collections::HashMap<String, RegisterValue> =
            std::collections::HashMap::new();
        for node_id in chitchat.live_nodes() {
            let Some(state) = chitchat.node_state(node_id) else {
                continue;
            };
            for (key, versioned) in state.iter_prefix(&chitchat_prefix) {
                let Ok(value) = serde_json::from_str::<RegisterValue>(&versioned.value) else {
                    continue;
                };
                let key = key[REGISTER_PREFIX.len()..].to_string();
                match newest.get(&key) {
                    Some(existing) if existing.written_ms >= value.written_ms => {}
                    _ => {
                        newest.insert(key, value);
                    }
                }
            }
        }

        newest
            .into_iter()
            .filter(|(_, v)| v.is_live(now_ms))
            .collect()
    }

    /// Delete this node's expired counters and registers.
    ///
    /// Returns the number of keys removed.
    pub async fn gc_expired(&self, now_ms: i64) -> usize {
        let chitchat_arc = self.handle.chitchat();
        let mut chitchat = chitchat_arc.lock().await;
        let state = chitchat.self_node_state();

        let mut expired: Vec<String> = state
            .iter_prefix(COUNTER_PREFIX)
            .filter(|(_, v)| {
                Contribution::decode(&v.value).map_or(false, |c| c.expires_at_ms <= now_ms)
            })
            .map(|(k, _)| k.to_string())
            .collect();
        expired.extend(
            state
                .iter_prefix(REGISTER_PREFIX)
                .filter(|(_, v)| {
                    serde_json::from_str::<RegisterValue>(&v.value)
                        .map_or(false, |r| r.is_expired(now_ms))
                })
                .map(|(k, _)| k.to_string()),
        );

        for key in &expired {
            state.delete(key);
        }
        if !expired.is_empty() {
            debug!(removed = expired.len(), "Collected expired cluster keys");
        }
        expired.len()
    }

    /// Get the number of live nodes in the cluster.
    pub async fn live_node_count(&self) -> usize {
        let chitchat_arc = self.handle.chitchat();
        let chitchat = chitchat_arc.lock().await;
        chitchat.live_nodes().count()
    }

    /// Get the IDs of all live nodes.
    pub async fn live_nodes(&self) -> Vec<String> {
        let chitchat_arc = self.handle.chitchat();
        let chitchat = chitchat_arc.lock().await;
        chitchat
            .live_nodes()
            .map(|id| id.node_id.clone())
            .collect()
    }

    /// Shutdown the cluster node gracefully.
    pub async fn shutdown(self) -> Result<(), ClusterError> {
        info!(node_id = %self.node_id, "Shutting down cluster node");
        self.handle
            .shutdown()
            .await
            .map_err(|e| ClusterError::ShutdownError(format!("{:?}", e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FAR_FUTURE: i64 = i64::MAX;

    fn test_config(port: u16) -> ClusterConfig {
        let addr: SocketAddr = ([127, 0, 0, 1], port).into();
        ClusterConfig {
            node_id: format!("test-node-{}", port),
            listen_addr: addr,
            advertise_addr: addr,
            seed_nodes: Vec::new(),
            cluster_id: "test-cluster".to_string(),
            gossip_interval: Duration::from_millis(50),
            dead_node_grace_period: Duration::from_secs(60),
        }
    }

    #[test]
    fn test_counter_key() {
        let key = CounterKey::new("floodgate:win:user:123:minute:1704067200");
        let chitchat_key = key.to_chitchat_key();
        assert_eq!(chitchat_key, "counter|floodgate:win:user:123:minute:1704067200");

        let parsed = CounterKey::from_chitchat_key(&chitchat_key).unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn test_counter_key_parsing_invalid() {
        assert!(CounterKey::from_chitchat_key("invalid").is_none());
        assert!(CounterKey::from_chitchat_key("counter|").is_none());
        assert!(CounterKey::from_chitchat_key("notcounter|a").is_none());
    }

    #[test]
    fn test_contribution_encoding() {
        let c = Contribution {
            count: 7,
            expires_at_ms: 1_000,
        };
        assert_eq!(Contribution::decode(&c.encode()), Some(c));
        assert_eq!(Contribution::live_count(&c.encode(), 999), 7);
        assert_eq!(Contribution::live_count(&c.encode(), 1_000), 0);
        assert_eq!(Contribution::live_count("garbage", 0), 0);
    }

    #[tokio::test]
    async fn test_cluster_start() {
        let cluster = Cluster::start(test_config(17946)).await.unwrap();

        assert_eq!(cluster.node_id(), "test-node-17946");
        assert_eq!(cluster.live_node_count().await, 1); // Just ourselves

        cluster.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_cluster_increment_counter() {
        let cluster = Cluster::start(test_config(17947)).await.unwrap();
        let key = CounterKey::new("test:key1");

        // Increment should return the new total
        assert_eq!(cluster.increment_counter(&key, 5, FAR_FUTURE, 0).await, 5);
        assert_eq!(cluster.increment_counter(&key, 3, FAR_FUTURE, 0).await, 8);
        assert_eq!(cluster.get_count(&key, 0).await, 8);

        cluster.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_expired_contribution_restarts() {
        let cluster = Cluster::start(test_config(17950)).await.unwrap();
        let key = CounterKey::new("test:expiring");

        cluster.increment_counter(&key, 5, 1_000, 0).await;
        assert_eq!(cluster.get_count(&key, 500).await, 5);
        assert_eq!(cluster.get_count(&key, 1_000).await, 0);

        assert_eq!(cluster.increment_counter(&key, 1, 3_000, 2_000).await, 1);
        assert_eq!(cluster.gc_expired(2_000).await, 0);
        assert_eq!(cluster.gc_expired(3_000).await, 1);

        cluster.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_registers_last_writer_wins() {
        let cluster = Cluster::start(test_config(17951)).await.unwrap();

        cluster
            .set_register(
                "ban:user:a",
                &RegisterValue {
                    written_ms: 10,
                    expires_ms: None,
                    value: Some("first".to_string()),
                },
            )
            .await;
        let stored = cluster.get_register("ban:user:a").await.unwrap();
        assert_eq!(stored.value.as_deref(), Some("first"));

        cluster
            .set_register(
                "ban:user:a",
                &RegisterValue {
                    written_ms: 20,
                    expires_ms: None,
                    value: None,
                },
            )
            .await;
        assert!(cluster.scan_registers("ban:", 0).await.is_empty());

        cluster.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_cluster_two_nodes() {
        // Start first node
        let cluster1 = Cluster::start(test_config(17948)).await.unwrap();

        // Start second node with first as seed
        let mut config2 = test_config(17949);
        config2.seed_nodes = vec!["127.0.0.1:17948".to_string()];
        let cluster2 = Cluster::start(config2).await.unwrap();

        // Give them time to discover each other
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert_eq!(cluster1.live_node_count().await, 2);
        assert_eq!(cluster2.live_node_count().await, 2);

        let key = CounterKey::new("test:shared");
        cluster1.increment_counter(&key, 10, FAR_FUTURE, 0).await;

        // Give time for gossip
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(cluster2.get_count(&key, 0).await, 10);

        cluster2.increment_counter(&key, 5, FAR_FUTURE, 0).await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        // Both should see total of 15
        assert_eq!(cluster1.get_count(&key, 0).await, 15);
        assert_eq!(cluster2.get_count(&key, 0).await, 15);

        cluster1.shutdown().await.unwrap();
        cluster2.shutdown().await.unwrap();
    }
}
