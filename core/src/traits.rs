/// Core trait definitions for the Itinera orchestration system.
///
/// The source system expressed shared behavior through a base-class
/// hierarchy; here it is a set of small capability interfaces composed into
/// each component, plus pluggable seams (`Codec`, `Cipher`, `Replicator`)
/// so tests inject in-memory stand-ins and production supplies real
/// implementations.
use crate::errors::BusResult;
use crate::events::Event;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::Arc;
use uuid::Uuid;

/// Time source. Virtualizable so tests can pin the clock.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time source used in production.
#[derive(Debug, Clone, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Shared lifecycle for core components.
#[async_trait]
pub trait Lifecycle: Send + Sync {
    /// Component name for logging.
    fn name(&self) -> &str;

    /// Start background tasks.
    async fn start(&self) -> Result<(), String>;

    /// Stop background tasks and release resources. Idempotent.
    async fn shutdown(&self) -> Result<(), String>;
}

/// Event handler invoked by the bus on delivery.
/// Failures are caught by the bus and fed into its retry policy.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle a delivered event.
    async fn handle(&self, event: Event) -> Result<(), String>;

    /// Handler name for logging and DLQ records.
    fn name(&self) -> &str;
}

/// Capability to publish events onto the bus.
/// Components hold this interface rather than the concrete bus type so the
/// startup wiring step can hand out references without cycles.
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    async fn publish_event(&self, event: Event) -> BusResult<Uuid>;
}

/// Capability to subscribe to bus topics.
#[async_trait]
pub trait MessageSubscriber: Send + Sync {
    async fn subscribe_topic(
        &self,
        topic: &str,
        handler: Arc<dyn EventHandler>,
        retry: bool,
    ) -> BusResult<Uuid>;

    async fn unsubscribe_topic(&self, subscription_id: Uuid) -> BusResult<bool>;
}

// ============================================================================
// Pluggable state-manager seams
// ============================================================================

/// Compression codec applied to oversized serialized entries.
pub trait Codec: Send + Sync {
    fn encode(&self, data: &[u8]) -> Result<Vec<u8>, String>;
    fn decode(&self, data: &[u8]) -> Result<Vec<u8>, String>;
    fn name(&self) -> &str;
}

/// Gzip codec backed by flate2.
pub struct GzipCodec {
    level: Compression,
}

impl GzipCodec {
    pub fn new() -> Self {
        Self {
            level: Compression::default(),
        }
    }
}

impl Default for GzipCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Codec for GzipCodec {
    fn encode(&self, data: &[u8]) -> Result<Vec<u8>, String> {
        let mut encoder = GzEncoder::new(Vec::new(), self.level);
        encoder
            .write_all(data)
            .and_then(|_| encoder.finish())
            .map_err(|e| format!("gzip encode failed: {}", e))
    }

    fn decode(&self, data: &[u8]) -> Result<Vec<u8>, String> {
        let mut decoder = GzDecoder::new(data);
        let mut out = Vec::new();
        decoder
            .read_to_end(&mut out)
            .map_err(|e| format!("gzip decode failed: {}", e))?;
        Ok(out)
    }

    fn name(&self) -> &str {
        "gzip"
    }
}

/// Encryption seam. Real cryptography is an external collaborator; the core
/// only guarantees that whatever cipher is plugged in round-trips.
pub trait Cipher: Send + Sync {
    fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>, String>;
    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, String>;
    fn name(&self) -> &str;
}

/// Identity cipher used when no real implementation is wired in.
#[derive(Debug, Clone, Default)]
pub struct PassthroughCipher;

impl Cipher for PassthroughCipher {
    fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>, String> {
        Ok(data.to_vec())
    }

    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, String> {
        Ok(data.to_vec())
    }

    fn name(&self) -> &str {
        "passthrough"
    }
}

/// Byte-rotating cipher stand-in for tests that need to observe that stored
/// bytes actually differ from the plaintext. Not cryptography.
#[derive(Debug, Clone)]
pub struct XorCipher {
    key: u8,
}

impl XorCipher {
    pub fn new(key: u8) -> Self {
        Self { key }
    }
}

impl Cipher for XorCipher {
    fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>, String> {
        Ok(data.iter().map(|b| b ^ self.key).collect())
    }

    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, String> {
        Ok(data.iter().map(|b| b ^ self.key).collect())
    }

    fn name(&self) -> &str {
        "xor"
    }
}

// ============================================================================
// Replication seam
// ============================================================================

/// Record shipped to replicas on write and returned on quorum reads.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReplicaRecord {
    pub payload: serde_json::Value,
    pub version: String,
    pub updated_at: DateTime<Utc>,
}

/// Replication transport for namespaces with replication enabled.
///
/// A production deployment backs this with a real node set; the in-memory
/// implementation below simulates one, including injectable node failures,
/// which is all the core's quorum accounting needs.
#[async_trait]
pub trait Replicator: Send + Sync {
    /// Number of replica nodes in the set.
    fn node_count(&self) -> usize;

    /// Ship a write to every node. Returns one result per node, in node
    /// order; callers count the successes against their write quorum.
    async fn replicate_write(
        &self,
        namespace: &str,
        key: &str,
        record: ReplicaRecord,
    ) -> Vec<Result<(), String>>;

    /// Read the record from up to `quorum` nodes.
    async fn quorum_read(
        &self,
        namespace: &str,
        key: &str,
        quorum: usize,
    ) -> Vec<Option<ReplicaRecord>>;

    /// Read from one specific node (session-pinned reads).
    async fn read_node(&self, node: usize, namespace: &str, key: &str) -> Option<ReplicaRecord>;

    /// Remove a key from all nodes.
    async fn replicate_delete(&self, namespace: &str, key: &str) -> Vec<Result<(), String>>;
}

/// In-memory replica set with failure injection.
pub struct InMemoryReplicator {
    nodes: Vec<RwLock<HashMap<String, ReplicaRecord>>>,
    failed: RwLock<Vec<bool>>,
}

impl InMemoryReplicator {
    pub fn new(node_count: usize) -> Self {
        Self {
            nodes: (0..node_count).map(|_| RwLock::new(HashMap::new())).collect(),
            failed: RwLock::new(vec![false; node_count]),
        }
    }

    /// Mark a node as failed; subsequent writes and reads against it error.
    pub fn fail_node(&self, node: usize) {
        if let Some(flag) = self.failed.write().get_mut(node) {
            *flag = true;
        }
    }

    /// Bring a failed node back.
    pub fn recover_node(&self, node: usize) {
        if let Some(flag) = self.failed.write().get_mut(node) {
            *flag = false;
        }
    }

    fn is_failed(&self, node: usize) -> bool {
        self.failed.read().get(node).copied().unwrap_or(true)
    }

    fn entry_key(namespace: &str, key: &str) -> String {
        format!("{}/{}", namespace, key)
    }
}

#[async_trait]
impl Replicator for InMemoryReplicator {
    fn node_count(&self) -> usize {
        self.nodes.len()
    }

    async fn replicate_write(
        &self,
        namespace: &str,
        key: &str,
        record: ReplicaRecord,
    ) -> Vec<Result<(), String>> {
        let full_key = Self::entry_key(namespace, key);
        self.nodes
            .iter()
            .enumerate()
            .map(|(idx, node)| {
                if self.is_failed(idx) {
                    Err(format!("node {} unavailable", idx))
                } else {
                    node.write().insert(full_key.clone(), record.clone());
                    Ok(())
                }
            })
            .collect()
    }

    async fn quorum_read(
        &self,
        namespace: &str,
        key: &str,
        quorum: usize,
    ) -> Vec<Option<ReplicaRecord>> {
        let full_key = Self::entry_key(namespace, key);
        self.nodes
            .iter()
            .enumerate()
            .filter(|(idx, _)| !self.is_failed(*idx))
            .take(quorum)
            .map(|(_, node)| node.read().get(&full_key).cloned())
            .collect()
    }

    async fn read_node(&self, node: usize, namespace: &str, key: &str) -> Option<ReplicaRecord> {
        if self.is_failed(node) {
            return None;
        }
        let full_key = Self::entry_key(namespace, key);
        self.nodes.get(node)?.read().get(&full_key).cloned()
    }

    async fn replicate_delete(&self, namespace: &str, key: &str) -> Vec<Result<(), String>> {
        let full_key = Self::entry_key(namespace, key);
        self.nodes
            .iter()
            .enumerate()
            .map(|(idx, node)| {
                if self.is_failed(idx) {
                    Err(format!("node {} unavailable", idx))
                } else {
                    node.write().remove(&full_key);
                    Ok(())
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gzip_codec_round_trip() {
        let codec = GzipCodec::new();
        let data = b"the same itinerary segment repeated ".repeat(64);
        let encoded = codec.encode(&data).expect("encode");
        assert!(encoded.len() < data.len());
        let decoded = codec.decode(&encoded).expect("decode");
        assert_eq!(decoded, data);
    }

    #[test]
    fn test_xor_cipher_round_trip() {
        let cipher = XorCipher::new(0x5a);
        let data = b"sensitive booking reference".to_vec();
        let encrypted = cipher.encrypt(&data).expect("encrypt");
        assert_ne!(encrypted, data);
        let decrypted = cipher.decrypt(&encrypted).expect("decrypt");
        assert_eq!(decrypted, data);
    }

    #[tokio::test]
    async fn test_replicator_quorum_with_failed_nodes() {
        let replicator = InMemoryReplicator::new(3);
        let record = ReplicaRecord {
            payload: serde_json::json!({"v": 1}),
            version: "v1".to_string(),
            updated_at: Utc::now(),
        };

        let results = replicator.replicate_write("ns", "k", record.clone()).await;
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 3);

        replicator.fail_node(0);
        replicator.fail_node(1);
        let results = replicator.replicate_write("ns", "k", record).await;
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);

        let replies = replicator.quorum_read("ns", "k", 2).await;
        assert_eq!(replies.len(), 1);
        assert!(replies[0].is_some());
    }
}
