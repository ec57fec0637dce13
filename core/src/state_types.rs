/// Types for the namespaced state manager: namespace configuration,
/// consistency classes, conflict strategies, entries, and statistics.
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Consistency class for a namespace. Determines the replication factor
/// and the read/write quorums used by the state manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsistencyClass {
    /// Writes acknowledged only after the write quorum accepts; reads
    /// aggregate the read quorum and return the freshest reply.
    Strong,
    /// Local write, asynchronous fan-out; reads are local.
    Eventual,
    /// Like eventual but without replication.
    Weak,
    /// Like eventual, but a session always observes its own writes.
    Session,
}

impl ConsistencyClass {
    pub fn replication_factor(&self) -> usize {
        match self {
            ConsistencyClass::Strong => 3,
            ConsistencyClass::Eventual | ConsistencyClass::Session => 2,
            ConsistencyClass::Weak => 1,
        }
    }

    pub fn write_quorum(&self) -> usize {
        match self {
            ConsistencyClass::Strong => 2,
            _ => 1,
        }
    }

    pub fn read_quorum(&self) -> usize {
        match self {
            ConsistencyClass::Strong => 2,
            _ => 1,
        }
    }
}

impl fmt::Display for ConsistencyClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsistencyClass::Strong => write!(f, "strong"),
            ConsistencyClass::Eventual => write!(f, "eventual"),
            ConsistencyClass::Weak => write!(f, "weak"),
            ConsistencyClass::Session => write!(f, "session"),
        }
    }
}

/// How a namespace resolves a write whose expected version mismatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictStrategy {
    /// Accept the incoming value.
    LastWriteWins,
    /// Keep the existing value.
    FirstWriteWins,
    /// Shallow object merge (incoming fields overwrite), array concat,
    /// primitives fall back to incoming.
    Merge,
    /// Collect existing and incoming into a list.
    Append,
    /// Do not resolve; record a conflict and fail the write.
    Manual,
}

impl ConflictStrategy {
    /// Resolve a conflict between the stored and the incoming value.
    /// Returns `None` for manual resolution.
    pub fn resolve(
        &self,
        existing: &serde_json::Value,
        incoming: serde_json::Value,
    ) -> Option<serde_json::Value> {
        match self {
            ConflictStrategy::LastWriteWins => Some(incoming),
            ConflictStrategy::FirstWriteWins => Some(existing.clone()),
            ConflictStrategy::Merge => Some(merge_values(existing, incoming)),
            ConflictStrategy::Append => Some(append_values(existing, incoming)),
            ConflictStrategy::Manual => None,
        }
    }
}

fn merge_values(existing: &serde_json::Value, incoming: serde_json::Value) -> serde_json::Value {
    match (existing, incoming) {
        (serde_json::Value::Object(old), serde_json::Value::Object(new)) => {
            let mut merged = old.clone();
            for (k, v) in new {
                merged.insert(k, v);
            }
            serde_json::Value::Object(merged)
        }
        (serde_json::Value::Array(old), serde_json::Value::Array(new)) => {
            let mut merged = old.clone();
            merged.extend(new);
            serde_json::Value::Array(merged)
        }
        (_, incoming) => incoming,
    }
}

fn append_values(existing: &serde_json::Value, incoming: serde_json::Value) -> serde_json::Value {
    match existing {
        serde_json::Value::Array(items) => {
            let mut list = items.clone();
            list.push(incoming);
            serde_json::Value::Array(list)
        }
        other => serde_json::Value::Array(vec![other.clone(), incoming]),
    }
}

/// Per-namespace configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamespaceConfig {
    /// Consistency class (drives replication factor and quorums)
    #[serde(default = "default_consistency")]
    pub consistency: ConsistencyClass,
    /// Default TTL applied to entries without an explicit one, seconds
    #[serde(default)]
    pub default_ttl_secs: Option<i64>,
    /// Entry count ceiling; exceeding it evicts the least-recently-accessed 10%
    #[serde(default = "default_max_size")]
    pub max_size: usize,
    /// Serialized size above which values are compressed, bytes
    #[serde(default = "default_compression_threshold")]
    pub compression_threshold: usize,
    #[serde(default = "default_true")]
    pub compression: bool,
    #[serde(default)]
    pub encryption: bool,
    #[serde(default)]
    pub replication: bool,
    #[serde(default)]
    pub persistence: bool,
    #[serde(default = "default_true")]
    pub indexing: bool,
    #[serde(default)]
    pub versioning: bool,
    #[serde(default = "default_conflict_strategy")]
    pub conflict_strategy: ConflictStrategy,
}

fn default_consistency() -> ConsistencyClass {
    ConsistencyClass::Eventual
}

fn default_max_size() -> usize {
    10_000
}

fn default_compression_threshold() -> usize {
    1024
}

fn default_true() -> bool {
    true
}

fn default_conflict_strategy() -> ConflictStrategy {
    ConflictStrategy::LastWriteWins
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self {
            consistency: default_consistency(),
            default_ttl_secs: None,
            max_size: default_max_size(),
            compression_threshold: default_compression_threshold(),
            compression: true,
            encryption: false,
            replication: false,
            persistence: false,
            indexing: true,
            versioning: false,
            conflict_strategy: default_conflict_strategy(),
        }
    }
}

/// Built-in namespaces created at startup.
pub fn builtin_namespaces() -> Vec<(&'static str, NamespaceConfig)> {
    vec![
        (
            "user-sessions",
            NamespaceConfig {
                consistency: ConsistencyClass::Session,
                default_ttl_secs: Some(1800),
                replication: true,
                ..Default::default()
            },
        ),
        (
            "search-cache",
            NamespaceConfig {
                consistency: ConsistencyClass::Eventual,
                default_ttl_secs: Some(300),
                max_size: 50_000,
                ..Default::default()
            },
        ),
        (
            "booking-data",
            NamespaceConfig {
                consistency: ConsistencyClass::Strong,
                replication: true,
                persistence: true,
                encryption: true,
                versioning: true,
                conflict_strategy: ConflictStrategy::Manual,
                ..Default::default()
            },
        ),
        (
            "candidate-results",
            NamespaceConfig {
                consistency: ConsistencyClass::Eventual,
                default_ttl_secs: Some(600),
                ..Default::default()
            },
        ),
        (
            "user-preferences",
            NamespaceConfig {
                consistency: ConsistencyClass::Eventual,
                persistence: true,
                versioning: true,
                conflict_strategy: ConflictStrategy::Merge,
                ..Default::default()
            },
        ),
        (
            "system-config",
            NamespaceConfig {
                consistency: ConsistencyClass::Strong,
                replication: true,
                versioning: true,
                conflict_strategy: ConflictStrategy::FirstWriteWins,
                ..Default::default()
            },
        ),
        (
            "analytics-data",
            NamespaceConfig {
                consistency: ConsistencyClass::Weak,
                default_ttl_secs: Some(3600),
                max_size: 100_000,
                ..Default::default()
            },
        ),
        (
            "temporary-data",
            NamespaceConfig {
                consistency: ConsistencyClass::Weak,
                default_ttl_secs: Some(60),
                indexing: false,
                ..Default::default()
            },
        ),
    ]
}

/// Stored representation of an entry value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum StoredValue {
    /// Small values are kept as parsed JSON
    Plain(serde_json::Value),
    /// Oversized or protected values are kept as transformed bytes
    Encoded {
        bytes: Vec<u8>,
        compressed: bool,
        encrypted: bool,
    },
}

/// A single key's entry in a namespace.
#[derive(Debug, Clone)]
pub struct StateEntry {
    pub key: String,
    pub stored: StoredValue,
    /// Untransformed value, kept for conflict resolution
    pub original: serde_json::Value,
    pub version: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub access_count: u64,
    pub ttl: Option<Duration>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Serialized size, bytes
    pub size: usize,
    pub tags: Vec<String>,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl StateEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(false, |at| now >= at)
    }
}

/// Options for `get`.
#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    /// Session token for session-consistency namespaces
    pub session: Option<String>,
}

/// Options for `set`.
#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    /// Entry TTL; falls back to the namespace default
    pub ttl: Option<Duration>,
    /// Optimistic concurrency: fail or resolve when the stored version differs
    pub expected_version: Option<String>,
    /// Extra index fields beyond the default projection
    pub indexes: Vec<String>,
    pub metadata: HashMap<String, serde_json::Value>,
    pub tags: Vec<String>,
    /// Lock id held by the caller, when writing under a lock
    pub lock_id: Option<uuid::Uuid>,
    /// Session token for session-consistency namespaces
    pub session: Option<String>,
}

/// Receipt returned by `set`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetReceipt {
    pub version: String,
    pub timestamp: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Value plus entry metadata returned by `get`.
#[derive(Debug, Clone)]
pub struct ValueWithMeta {
    pub value: serde_json::Value,
    pub version: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub tags: Vec<String>,
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Change notification delivered to namespace subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateChange {
    pub namespace: String,
    pub key: String,
    pub kind: StateChangeKind,
    pub value: Option<serde_json::Value>,
    pub version: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateChangeKind {
    Set,
    Delete,
    Expire,
    Evict,
}

/// Per-namespace statistics. Hits and misses are tracked separately so the
/// hit rate is meaningful.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NamespaceStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub expirations: u64,
    pub evictions: u64,
    pub conflicts: u64,
    pub entry_count: usize,
    pub total_size: usize,
}

impl NamespaceStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Health snapshot of the state manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateHealth {
    pub degraded: bool,
    pub reasons: Vec<String>,
    pub namespace_count: usize,
    pub total_entries: usize,
    pub total_size: usize,
    pub active_locks: usize,
    pub active_transactions: usize,
}

/// Operation buffered inside a transaction.
#[derive(Debug, Clone)]
pub enum TxOperation {
    Get {
        namespace: String,
        key: String,
    },
    Set {
        namespace: String,
        key: String,
        value: serde_json::Value,
        options: SetOptions,
    },
    Delete {
        namespace: String,
        key: String,
    },
}

impl TxOperation {
    /// Key touched by a mutating operation, if any.
    pub fn write_key(&self) -> Option<(String, String)> {
        match self {
            TxOperation::Get { .. } => None,
            TxOperation::Set { namespace, key, .. }
            | TxOperation::Delete { namespace, key } => {
                Some((namespace.clone(), key.clone()))
            }
        }
    }
}

/// Result of one committed transaction operation.
#[derive(Debug, Clone)]
pub enum TxResult {
    Value(Option<serde_json::Value>),
    Receipt(SetReceipt),
    Deleted(bool),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_consistency_quorums() {
        assert_eq!(ConsistencyClass::Strong.replication_factor(), 3);
        assert_eq!(ConsistencyClass::Strong.write_quorum(), 2);
        assert_eq!(ConsistencyClass::Weak.replication_factor(), 1);
        assert_eq!(ConsistencyClass::Eventual.write_quorum(), 1);
    }

    #[test]
    fn test_merge_objects_incoming_overwrites() {
        let existing = json!({"a": 1, "b": 2});
        let incoming = json!({"b": 3, "c": 4});
        let merged = ConflictStrategy::Merge.resolve(&existing, incoming).unwrap();
        assert_eq!(merged, json!({"a": 1, "b": 3, "c": 4}));
    }

    #[test]
    fn test_merge_arrays_concatenate() {
        let existing = json!([1, 2]);
        let incoming = json!([3]);
        let merged = ConflictStrategy::Merge.resolve(&existing, incoming).unwrap();
        assert_eq!(merged, json!([1, 2, 3]));
    }

    #[test]
    fn test_merge_primitives_take_incoming() {
        let merged = ConflictStrategy::Merge.resolve(&json!(1), json!(2)).unwrap();
        assert_eq!(merged, json!(2));
    }

    #[test]
    fn test_append_builds_list() {
        let appended = ConflictStrategy::Append.resolve(&json!("x"), json!("y")).unwrap();
        assert_eq!(appended, json!(["x", "y"]));
        let appended = ConflictStrategy::Append
            .resolve(&json!(["x", "y"]), json!("z"))
            .unwrap();
        assert_eq!(appended, json!(["x", "y", "z"]));
    }

    #[test]
    fn test_manual_returns_none() {
        assert!(ConflictStrategy::Manual.resolve(&json!(1), json!(2)).is_none());
    }

    #[test]
    fn test_first_and_last_write_wins() {
        assert_eq!(
            ConflictStrategy::FirstWriteWins.resolve(&json!(1), json!(2)),
            Some(json!(1))
        );
        assert_eq!(
            ConflictStrategy::LastWriteWins.resolve(&json!(1), json!(2)),
            Some(json!(2))
        );
    }

    #[test]
    fn test_hit_rate_separates_hits_and_misses() {
        let stats = NamespaceStats {
            hits: 3,
            misses: 1,
            ..Default::default()
        };
        assert!((stats.hit_rate() - 0.75).abs() < f64::EPSILON);
        assert_eq!(NamespaceStats::default().hit_rate(), 0.0);
    }

    #[test]
    fn test_builtin_namespaces_cover_spec_set() {
        let names: Vec<&str> = builtin_namespaces().iter().map(|(n, _)| *n).collect();
        for expected in [
            "user-sessions",
            "search-cache",
            "booking-data",
            "candidate-results",
            "user-preferences",
            "system-config",
            "analytics-data",
            "temporary-data",
        ] {
            assert!(names.contains(&expected), "missing {}", expected);
        }
    }
}
