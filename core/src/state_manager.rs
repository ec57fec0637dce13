/// Namespaced key/value state manager.
///
/// Each namespace carries its own consistency class, TTL, size ceiling,
/// compression/encryption policy, indexing, versioning, and conflict
/// strategy. Values round-trip through the pluggable `Codec`/`Cipher` seams,
/// replication rides the `Replicator` seam, and namespaces that opt in are
/// made durable through the file-per-key layout in `persistence`.
use crate::errors::{StateError, StateResult};
use crate::events::{topics, Event, EventData};
use crate::lock::LockManager;
use crate::persistence::{NamespacePersistence, PersistedPayload, PersistedRecord};
use crate::state_types::{
    builtin_namespaces, ConsistencyClass, GetOptions, NamespaceConfig, NamespaceStats, SetOptions,
    SetReceipt, StateChange, StateChangeKind, StateEntry, StateHealth, StoredValue, TxOperation,
    TxResult, ValueWithMeta,
};
use crate::traits::{
    Cipher, Clock, Codec, GzipCodec, Lifecycle, MessagePublisher, PassthroughCipher, Replicator,
    SystemClock,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Fields projected into the default index set for object values.
const DEFAULT_INDEX_FIELDS: &[&str] = &["type", "category", "status", "userId", "id"];

/// Share of entries evicted when a namespace exceeds its size ceiling.
const EVICTION_FRACTION: f64 = 0.10;

/// Configuration for the state manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateManagerConfig {
    /// Root directory for namespaces with persistence enabled
    #[serde(default = "default_persistence_root")]
    pub persistence_root: PathBuf,
    /// TTL stamped on acquired locks, ms
    #[serde(default = "default_lock_ttl_ms")]
    pub lock_ttl_ms: u64,
    /// Transaction commit deadline, ms
    #[serde(default = "default_transaction_timeout_ms")]
    pub transaction_timeout_ms: u64,
    /// Lock wait bound used during transaction commit, ms
    #[serde(default = "default_tx_lock_wait_ms")]
    pub tx_lock_wait_ms: u64,
    /// Maintenance sweep interval, ms
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    /// Health: degraded above this total serialized size, bytes
    #[serde(default = "default_memory_high_water")]
    pub memory_high_water_bytes: usize,
    /// Health: degraded above this many live locks
    #[serde(default = "default_max_locks")]
    pub max_locks: usize,
    /// Health: degraded above this many open transactions
    #[serde(default = "default_max_transactions")]
    pub max_transactions: usize,
    /// Create the built-in namespaces at startup
    #[serde(default = "default_true")]
    pub create_builtins: bool,
}

fn default_persistence_root() -> PathBuf {
    PathBuf::from("./data/state")
}

fn default_lock_ttl_ms() -> u64 {
    30_000
}

fn default_transaction_timeout_ms() -> u64 {
    5_000
}

fn default_tx_lock_wait_ms() -> u64 {
    2_000
}

fn default_sweep_interval_ms() -> u64 {
    1_000
}

fn default_memory_high_water() -> usize {
    256 * 1024 * 1024
}

fn default_max_locks() -> usize {
    10_000
}

fn default_max_transactions() -> usize {
    1_000
}

fn default_true() -> bool {
    true
}

impl Default for StateManagerConfig {
    fn default() -> Self {
        Self {
            persistence_root: default_persistence_root(),
            lock_ttl_ms: default_lock_ttl_ms(),
            transaction_timeout_ms: default_transaction_timeout_ms(),
            tx_lock_wait_ms: default_tx_lock_wait_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
            memory_high_water_bytes: default_memory_high_water(),
            max_locks: default_max_locks(),
            max_transactions: default_max_transactions(),
            create_builtins: true,
        }
    }
}

/// One namespace's in-memory state.
struct Namespace {
    name: String,
    config: NamespaceConfig,
    data: RwLock<HashMap<String, StateEntry>>,
    /// "field:value" -> keys
    indexes: RwLock<HashMap<String, HashSet<String>>>,
    stats: parking_lot::RwLock<NamespaceStats>,
    persistence: Option<NamespacePersistence>,
    /// Keys whose async replication fan-out failed; retried by the sweeper
    pending_replication: parking_lot::Mutex<HashSet<String>>,
}

/// An open transaction with buffered operations.
struct Transaction {
    id: Uuid,
    operations: Vec<TxOperation>,
    deadline: std::time::Instant,
}

/// A namespace change subscription.
struct StateSubscription {
    namespace: String,
    pattern: glob::Pattern,
    tx: mpsc::UnboundedSender<StateChange>,
}

/// The state manager.
pub struct StateManager {
    config: StateManagerConfig,
    namespaces: DashMap<String, Arc<Namespace>>,
    locks: LockManager,
    transactions: DashMap<Uuid, Transaction>,
    subscriptions: DashMap<Uuid, StateSubscription>,
    codec: Arc<dyn Codec>,
    cipher: Arc<dyn Cipher>,
    replicator: Arc<dyn Replicator>,
    clock: Arc<dyn Clock>,
    /// Session token -> replica node that served the session's last write
    session_pins: Arc<DashMap<String, usize>>,
    publisher: parking_lot::RwLock<Option<Arc<dyn MessagePublisher>>>,
    shutdown: CancellationToken,
}

impl StateManager {
    /// Create a state manager with the default seams (gzip codec,
    /// passthrough cipher, in-memory replica set sized for strong reads).
    pub fn new(config: StateManagerConfig) -> Arc<Self> {
        let replicator = Arc::new(crate::traits::InMemoryReplicator::new(
            ConsistencyClass::Strong.replication_factor(),
        ));
        Self::with_seams(
            config,
            Arc::new(GzipCodec::new()),
            Arc::new(PassthroughCipher),
            replicator,
            Arc::new(SystemClock),
        )
    }

    /// Create a state manager with explicit seam implementations.
    pub fn with_seams(
        config: StateManagerConfig,
        codec: Arc<dyn Codec>,
        cipher: Arc<dyn Cipher>,
        replicator: Arc<dyn Replicator>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let manager = Arc::new(Self {
            namespaces: DashMap::new(),
            locks: LockManager::new(),
            transactions: DashMap::new(),
            subscriptions: DashMap::new(),
            codec,
            cipher,
            replicator,
            clock,
            session_pins: Arc::new(DashMap::new()),
            publisher: parking_lot::RwLock::new(None),
            shutdown: CancellationToken::new(),
            config,
        });
        if manager.config.create_builtins {
            for (name, ns_config) in builtin_namespaces() {
                if let Err(e) = manager.create_namespace(name, ns_config) {
                    warn!(namespace = name, error = %e, "failed to create builtin namespace");
                }
            }
        }
        manager
    }

    /// Wire in the event bus publisher. Called by the startup wiring step.
    pub fn set_publisher(&self, publisher: Arc<dyn MessagePublisher>) {
        *self.publisher.write() = Some(publisher);
    }

    // ========================================================================
    // Namespace admin
    // ========================================================================

    /// Create a namespace. Namespaces with persistence enabled recover their
    /// key set from disk.
    pub fn create_namespace(&self, name: &str, config: NamespaceConfig) -> StateResult<()> {
        if self.namespaces.contains_key(name) {
            return Err(StateError::NamespaceExists(name.to_string()));
        }

        let persistence = if config.persistence {
            Some(NamespacePersistence::open(
                &self.config.persistence_root,
                name,
            )?)
        } else {
            None
        };

        let namespace = Arc::new(Namespace {
            name: name.to_string(),
            config,
            data: RwLock::new(HashMap::new()),
            indexes: RwLock::new(HashMap::new()),
            stats: parking_lot::RwLock::new(NamespaceStats::default()),
            persistence,
            pending_replication: parking_lot::Mutex::new(HashSet::new()),
        });

        if let Some(persistence) = &namespace.persistence {
            let recovered = persistence.recover()?;
            if !recovered.is_empty() {
                let mut data = namespace.data.try_write().map_err(|_| {
                    StateError::Internal("fresh namespace data map contended".to_string())
                })?;
                let now = self.clock.now();
                for (key, record) in recovered {
                    if let Some(entry) = self.entry_from_record(&key, record, now) {
                        data.insert(key, entry);
                    }
                }
                let mut stats = namespace.stats.write();
                stats.entry_count = data.len();
                stats.total_size = data.values().map(|e| e.size).sum();
            }
        }

        self.namespaces.insert(name.to_string(), namespace);
        info!(namespace = name, "namespace created");
        Ok(())
    }

    /// Delete a namespace and all of its entries.
    pub fn delete_namespace(&self, name: &str) -> bool {
        let removed = self.namespaces.remove(name).is_some();
        if removed {
            info!(namespace = name, "namespace deleted");
        }
        removed
    }

    /// Names of all namespaces.
    pub fn list_namespaces(&self) -> Vec<String> {
        self.namespaces.iter().map(|ns| ns.key().clone()).collect()
    }

    fn namespace(&self, name: &str) -> StateResult<Arc<Namespace>> {
        self.namespaces
            .get(name)
            .map(|ns| Arc::clone(&ns))
            .ok_or_else(|| StateError::NamespaceNotFound(name.to_string()))
    }

    // ========================================================================
    // Value transforms
    // ========================================================================

    fn encode_value(
        &self,
        config: &NamespaceConfig,
        value: &serde_json::Value,
    ) -> StateResult<(StoredValue, usize)> {
        let serialized = serde_json::to_vec(value)?;
        let size = serialized.len();

        let compress = config.compression && size > config.compression_threshold;
        if !compress && !config.encryption {
            return Ok((StoredValue::Plain(value.clone()), size));
        }

        let mut bytes = serialized;
        if compress {
            bytes = self
                .codec
                .encode(&bytes)
                .map_err(StateError::CodecError)?;
        }
        if config.encryption {
            bytes = self
                .cipher
                .encrypt(&bytes)
                .map_err(StateError::CipherError)?;
        }
        Ok((
            StoredValue::Encoded {
                bytes,
                compressed: compress,
                encrypted: config.encryption,
            },
            size,
        ))
    }

    fn decode_value(&self, stored: &StoredValue) -> StateResult<serde_json::Value> {
        match stored {
            StoredValue::Plain(value) => Ok(value.clone()),
            StoredValue::Encoded {
                bytes,
                compressed,
                encrypted,
            } => {
                let mut data = bytes.clone();
                if *encrypted {
                    data = self.cipher.decrypt(&data).map_err(StateError::CipherError)?;
                }
                if *compressed {
                    data = self.codec.decode(&data).map_err(StateError::CodecError)?;
                }
                Ok(serde_json::from_slice(&data)?)
            }
        }
    }

    fn entry_from_record(
        &self,
        key: &str,
        record: PersistedRecord,
        now: DateTime<Utc>,
    ) -> Option<StateEntry> {
        let ttl = record.ttl_secs.map(ChronoDuration::seconds);
        let expires_at = ttl.map(|t| record.created_at + t);
        if let Some(at) = expires_at {
            if now >= at {
                return None;
            }
        }
        let (stored, size) = match record.payload {
            PersistedPayload::Plain { value } => {
                let size = serde_json::to_vec(&value).map(|b| b.len()).unwrap_or(0);
                (StoredValue::Plain(value), size)
            }
            PersistedPayload::Bytes { .. } => {
                let bytes = record.payload.as_bytes().ok()?;
                let size = bytes.len();
                (
                    StoredValue::Encoded {
                        bytes,
                        compressed: record.compressed,
                        encrypted: record.encrypted,
                    },
                    size,
                )
            }
        };
        let original = self.decode_value(&stored).unwrap_or(serde_json::Value::Null);
        Some(StateEntry {
            key: key.to_string(),
            stored,
            original,
            version: record.version,
            created_at: record.created_at,
            updated_at: record.updated_at,
            last_accessed: now,
            access_count: 0,
            ttl,
            expires_at,
            size,
            tags: Vec::new(),
            metadata: HashMap::new(),
        })
    }

    fn record_from_entry(entry: &StateEntry) -> PersistedRecord {
        let payload = match &entry.stored {
            StoredValue::Plain(value) => PersistedPayload::Plain {
                value: value.clone(),
            },
            StoredValue::Encoded { bytes, .. } => PersistedPayload::from_bytes(bytes),
        };
        let (compressed, encrypted) = match &entry.stored {
            StoredValue::Plain(_) => (false, false),
            StoredValue::Encoded {
                compressed,
                encrypted,
                ..
            } => (*compressed, *encrypted),
        };
        PersistedRecord {
            version: entry.version.clone(),
            created_at: entry.created_at,
            updated_at: entry.updated_at,
            ttl_secs: entry.ttl.map(|t| t.num_seconds()),
            compressed,
            encrypted,
            payload,
        }
    }

    // ========================================================================
    // Core operations
    // ========================================================================

    /// Read a key. Expired entries are deleted on sight and read as absent.
    pub async fn get(
        &self,
        namespace: &str,
        key: &str,
        options: GetOptions,
    ) -> StateResult<Option<ValueWithMeta>> {
        let ns = self.namespace(namespace)?;
        let now = self.clock.now();

        // Session consistency: serve from the replica that took the
        // session's last write when it is fresher than local.
        let session_record = match (&options.session, ns.config.consistency) {
            (Some(token), ConsistencyClass::Session) => {
                let pin = self.session_pins.get(token.as_str()).map(|p| *p);
                match pin {
                    Some(pin) => self.replicator.read_node(pin, namespace, key).await,
                    None => None,
                }
            }
            _ => None,
        };

        // Strong consistency: aggregate the read quorum and keep the
        // freshest reply to compare against local.
        let quorum_record = if ns.config.replication
            && ns.config.consistency == ConsistencyClass::Strong
        {
            let replies = self
                .replicator
                .quorum_read(namespace, key, ns.config.consistency.read_quorum())
                .await;
            replies
                .into_iter()
                .flatten()
                .max_by_key(|record| record.updated_at)
        } else {
            None
        };

        let mut data = ns.data.write().await;

        let expired = data.get(key).map_or(false, |entry| entry.is_expired(now));
        if expired {
            let Some(entry) = data.remove(key) else {
                return Ok(None);
            };
            drop(data);
            self.unindex_entry(&ns, &entry).await;
            self.bump_stats(&ns, |s| {
                s.expirations += 1;
                s.misses += 1;
            });
            if let Some(persistence) = &ns.persistence {
                let _ = persistence.record_delete(key);
            }
            self.notify(&ns, key, StateChangeKind::Expire, None, None);
            return Ok(None);
        }

        let local_meta = data.get_mut(key).map(|entry| {
            entry.last_accessed = now;
            entry.access_count += 1;
            (
                entry.stored.clone(),
                entry.version.clone(),
                entry.created_at,
                entry.updated_at,
                entry.expires_at,
                entry.tags.clone(),
                entry.metadata.clone(),
            )
        });
        drop(data);

        // Pick the freshest view among local, session replica, and quorum.
        let replica_best = match (session_record, quorum_record) {
            (Some(a), Some(b)) => Some(if a.updated_at >= b.updated_at { a } else { b }),
            (a, b) => a.or(b),
        };

        if let Some((stored, version, created_at, updated_at, expires_at, tags, metadata)) =
            local_meta
        {
            let use_replica = replica_best
                .as_ref()
                .map_or(false, |record| record.updated_at > updated_at);
            self.bump_stats(&ns, |s| s.hits += 1);
            if let Some(record) = replica_best.filter(|_| use_replica) {
                return Ok(Some(ValueWithMeta {
                    value: record.payload,
                    version: record.version,
                    created_at,
                    updated_at: record.updated_at,
                    expires_at,
                    tags,
                    metadata,
                }));
            }
            let value = self.decode_value(&stored)?;
            return Ok(Some(ValueWithMeta {
                value,
                version,
                created_at,
                updated_at,
                expires_at,
                tags,
                metadata,
            }));
        }

        if let Some(record) = replica_best {
            self.bump_stats(&ns, |s| s.hits += 1);
            return Ok(Some(ValueWithMeta {
                value: record.payload,
                version: record.version,
                created_at: record.updated_at,
                updated_at: record.updated_at,
                expires_at: None,
                tags: Vec::new(),
                metadata: HashMap::new(),
            }));
        }

        self.bump_stats(&ns, |s| s.misses += 1);
        Ok(None)
    }

    /// Write a key, honoring locks, optimistic versions, the namespace's
    /// transform pipeline, indexing, replication, and subscriber
    /// notification.
    pub async fn set(
        &self,
        namespace: &str,
        key: &str,
        value: serde_json::Value,
        options: SetOptions,
    ) -> StateResult<SetReceipt> {
        let ns = self.namespace(namespace)?;
        let now = self.clock.now();

        if self.locks.is_locked_by_other(namespace, key, options.lock_id) {
            return Err(StateError::Locked {
                namespace: namespace.to_string(),
                key: key.to_string(),
            });
        }

        let mut data = ns.data.write().await;
        let existing = data.get(key).filter(|entry| !entry.is_expired(now));

        // Optimistic versioning: a mismatched expected version routes
        // through the namespace's conflict strategy.
        let mut effective = value;
        if let (Some(expected), Some(entry)) = (&options.expected_version, existing) {
            if &entry.version != expected {
                self.bump_stats(&ns, |s| s.conflicts += 1);
                match ns.config.conflict_strategy.resolve(&entry.original, effective) {
                    Some(resolved) => {
                        debug!(
                            namespace,
                            key,
                            strategy = ?ns.config.conflict_strategy,
                            "version conflict resolved"
                        );
                        effective = resolved;
                    }
                    None => {
                        let actual = entry.version.clone();
                        drop(data);
                        self.emit_conflict(namespace, key, expected, &actual);
                        return Err(StateError::ManualConflict(format!(
                            "{}/{}",
                            namespace, key
                        )));
                    }
                }
            }
        }

        let (stored, size) = self.encode_value(&ns.config, &effective)?;
        let version = Uuid::new_v4().to_string();
        let ttl = options
            .ttl
            .or_else(|| ns.config.default_ttl_secs.map(ChronoDuration::seconds));
        let previous = data.get(key).cloned();
        let created_at = previous
            .as_ref()
            .filter(|p| !p.is_expired(now))
            .map(|p| p.created_at)
            .unwrap_or(now);
        let expires_at = ttl.map(|t| created_at + t);

        let entry = StateEntry {
            key: key.to_string(),
            stored,
            original: effective.clone(),
            version: version.clone(),
            created_at,
            updated_at: now,
            last_accessed: now,
            access_count: previous.as_ref().map(|p| p.access_count).unwrap_or(0),
            ttl,
            expires_at,
            size,
            tags: options.tags.clone(),
            metadata: options.metadata.clone(),
        };

        // Replication happens before the local apply for strong namespaces
        // so a failed quorum leaves the pre-write value untouched.
        if ns.config.replication && ns.config.consistency == ConsistencyClass::Strong {
            let record = crate::traits::ReplicaRecord {
                payload: effective.clone(),
                version: version.clone(),
                updated_at: now,
            };
            let results = self
                .replicator
                .replicate_write(namespace, key, record)
                .await;
            let acks = results.iter().filter(|r| r.is_ok()).count();
            let required = ns.config.consistency.write_quorum();
            if acks < required {
                return Err(StateError::QuorumNotReached { acks, required });
            }
        }

        // Versioning: retain the superseded entry under key:oldVersion.
        if ns.config.versioning {
            if let Some(prev) = previous.as_ref().filter(|p| !p.is_expired(now)) {
                let history_key = format!("{}:{}", key, prev.version);
                let mut historic = prev.clone();
                historic.key = history_key.clone();
                data.insert(history_key, historic);
            }
        }

        data.insert(key.to_string(), entry.clone());
        let over_capacity = data.len() > ns.config.max_size;
        drop(data);

        if let Some(prev) = previous.as_ref() {
            self.unindex_entry(&ns, prev).await;
        }
        self.index_entry(&ns, key, &effective, &options.indexes).await;

        if ns.config.replication && ns.config.consistency != ConsistencyClass::Strong {
            self.fan_out(&ns, namespace, key, &effective, &version, now, &options);
        }

        if let Some(persistence) = &ns.persistence {
            persistence.record_set(key, &Self::record_from_entry(&entry))?;
        }

        self.bump_stats(&ns, |s| {
            s.sets += 1;
            s.total_size = s.total_size.saturating_add(size);
        });
        self.notify(
            &ns,
            key,
            StateChangeKind::Set,
            Some(effective),
            Some(version.clone()),
        );

        if over_capacity {
            self.evict_lru(&ns).await;
        }

        Ok(SetReceipt {
            version,
            timestamp: now,
            expires_at,
        })
    }

    /// Asynchronous replica fan-out for eventual/session namespaces.
    fn fan_out(
        &self,
        ns: &Arc<Namespace>,
        namespace: &str,
        key: &str,
        value: &serde_json::Value,
        version: &str,
        now: DateTime<Utc>,
        options: &SetOptions,
    ) {
        let record = crate::traits::ReplicaRecord {
            payload: value.clone(),
            version: version.to_string(),
            updated_at: now,
        };
        let replicator = Arc::clone(&self.replicator);
        let ns = Arc::clone(ns);
        let namespace = namespace.to_string();
        let key = key.to_string();
        let session = options.session.clone();
        let pins = Arc::clone(&self.session_pins);
        tokio::spawn(async move {
            let results = replicator.replicate_write(&namespace, &key, record).await;
            if let Some(token) = session {
                // Pin the session to the first replica that took the write.
                if let Some(node) = results.iter().position(|r| r.is_ok()) {
                    pins.insert(token, node);
                }
            }
            if results.iter().all(|r| r.is_err()) {
                ns.pending_replication.lock().insert(key);
            }
        });
    }

    /// Delete a key. Returns whether it existed.
    pub async fn delete(
        &self,
        namespace: &str,
        key: &str,
        lock_id: Option<Uuid>,
    ) -> StateResult<bool> {
        let ns = self.namespace(namespace)?;
        if self.locks.is_locked_by_other(namespace, key, lock_id) {
            return Err(StateError::Locked {
                namespace: namespace.to_string(),
                key: key.to_string(),
            });
        }

        let removed = ns.data.write().await.remove(key);
        let Some(entry) = removed else {
            return Ok(false);
        };

        self.unindex_entry(&ns, &entry).await;
        if ns.config.replication {
            let _ = self.replicator.replicate_delete(namespace, key).await;
        }
        if let Some(persistence) = &ns.persistence {
            persistence.record_delete(key)?;
        }
        self.bump_stats(&ns, |s| {
            s.deletes += 1;
            s.total_size = s.total_size.saturating_sub(entry.size);
        });
        self.notify(&ns, key, StateChangeKind::Delete, None, None);
        Ok(true)
    }

    /// Whether a key currently exists (and is unexpired).
    pub async fn exists(&self, namespace: &str, key: &str) -> StateResult<bool> {
        let ns = self.namespace(namespace)?;
        let now = self.clock.now();
        let data = ns.data.read().await;
        Ok(data.get(key).map_or(false, |entry| !entry.is_expired(now)))
    }

    /// Keys matching a glob pattern, capped at `limit`.
    pub async fn keys(
        &self,
        namespace: &str,
        pattern: &str,
        limit: Option<usize>,
    ) -> StateResult<Vec<String>> {
        let ns = self.namespace(namespace)?;
        let matcher = glob::Pattern::new(pattern)
            .map_err(|e| StateError::Internal(format!("invalid pattern: {}", e)))?;
        let now = self.clock.now();
        let data = ns.data.read().await;
        let mut matched: Vec<String> = data
            .values()
            .filter(|entry| !entry.is_expired(now) && matcher.matches(&entry.key))
            .map(|entry| entry.key.clone())
            .collect();
        matched.sort();
        if let Some(limit) = limit {
            matched.truncate(limit);
        }
        Ok(matched)
    }

    /// Read several keys at once.
    pub async fn mget(
        &self,
        namespace: &str,
        keys: &[&str],
    ) -> StateResult<Vec<Option<ValueWithMeta>>> {
        let mut results = Vec::with_capacity(keys.len());
        for key in keys {
            results.push(self.get(namespace, key, GetOptions::default()).await?);
        }
        Ok(results)
    }

    /// Write several keys at once.
    pub async fn mset(
        &self,
        namespace: &str,
        pairs: Vec<(String, serde_json::Value)>,
    ) -> StateResult<Vec<SetReceipt>> {
        let mut receipts = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            receipts.push(
                self.set(namespace, &key, value, SetOptions::default())
                    .await?,
            );
        }
        Ok(receipts)
    }

    /// Add `delta` to an integer value, creating it at `delta` from zero.
    /// Returns the new value.
    pub async fn increment(&self, namespace: &str, key: &str, delta: i64) -> StateResult<i64> {
        let current = self.get(namespace, key, GetOptions::default()).await?;
        let base = match current {
            Some(meta) => meta
                .value
                .as_i64()
                .ok_or_else(|| StateError::NotAnInteger(key.to_string()))?,
            None => 0,
        };
        let next = base + delta;
        self.set(
            namespace,
            key,
            serde_json::Value::from(next),
            SetOptions::default(),
        )
        .await?;
        Ok(next)
    }

    /// Reset a key's TTL. Returns false when the key is absent.
    pub async fn expire(&self, namespace: &str, key: &str, ttl: Duration) -> StateResult<bool> {
        let ns = self.namespace(namespace)?;
        let now = self.clock.now();
        let mut data = ns.data.write().await;
        match data.get_mut(key) {
            Some(entry) if !entry.is_expired(now) => {
                let ttl = ChronoDuration::from_std(ttl)
                    .map_err(|e| StateError::Internal(e.to_string()))?;
                entry.ttl = Some(ttl);
                entry.expires_at = Some(now + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Remove a key's TTL. Returns false when the key is absent.
    pub async fn persist(&self, namespace: &str, key: &str) -> StateResult<bool> {
        let ns = self.namespace(namespace)?;
        let now = self.clock.now();
        let mut data = ns.data.write().await;
        match data.get_mut(key) {
            Some(entry) if !entry.is_expired(now) => {
                entry.ttl = None;
                entry.expires_at = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Remaining TTL for a key, if any.
    pub async fn ttl(&self, namespace: &str, key: &str) -> StateResult<Option<Duration>> {
        let ns = self.namespace(namespace)?;
        let now = self.clock.now();
        let data = ns.data.read().await;
        Ok(data
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .and_then(|entry| entry.expires_at)
            .and_then(|at| (at - now).to_std().ok()))
    }

    // ========================================================================
    // Indexing
    // ========================================================================

    fn index_terms(value: &serde_json::Value, extra_fields: &[String]) -> Vec<String> {
        let mut terms = Vec::new();
        if let serde_json::Value::Object(map) = value {
            for field in DEFAULT_INDEX_FIELDS {
                if let Some(v) = map.get(*field) {
                    if let Some(text) = scalar_text(v) {
                        terms.push(format!("{}:{}", field, text));
                    }
                }
            }
            for field in extra_fields {
                if DEFAULT_INDEX_FIELDS.contains(&field.as_str()) {
                    continue;
                }
                if let Some(v) = map.get(field.as_str()) {
                    if let Some(text) = scalar_text(v) {
                        terms.push(format!("{}:{}", field, text));
                    }
                }
            }
        }
        terms
    }

    async fn index_entry(
        &self,
        ns: &Arc<Namespace>,
        key: &str,
        value: &serde_json::Value,
        extra_fields: &[String],
    ) {
        if !ns.config.indexing {
            return;
        }
        let terms = Self::index_terms(value, extra_fields);
        if terms.is_empty() {
            return;
        }
        let mut indexes = ns.indexes.write().await;
        for term in terms {
            indexes.entry(term).or_default().insert(key.to_string());
        }
    }

    async fn unindex_entry(&self, ns: &Arc<Namespace>, entry: &StateEntry) {
        if !ns.config.indexing {
            return;
        }
        let mut indexes = ns.indexes.write().await;
        indexes.retain(|_, keys| {
            keys.remove(&entry.key);
            !keys.is_empty()
        });
    }

    /// Equality-index lookup: current values of keys whose `field` equals
    /// `value`.
    pub async fn query(
        &self,
        namespace: &str,
        field: &str,
        value: &serde_json::Value,
        limit: Option<usize>,
    ) -> StateResult<Vec<(String, serde_json::Value)>> {
        let ns = self.namespace(namespace)?;
        let Some(text) = scalar_text(value) else {
            return Ok(Vec::new());
        };
        let term = format!("{}:{}", field, text);
        let keys: Vec<String> = {
            let indexes = ns.indexes.read().await;
            indexes
                .get(&term)
                .map(|keys| keys.iter().cloned().collect())
                .unwrap_or_default()
        };
        let mut results = Vec::new();
        for key in keys {
            if let Some(meta) = self.get(namespace, &key, GetOptions::default()).await? {
                results.push((key, meta.value));
                if limit.map_or(false, |l| results.len() >= l) {
                    break;
                }
            }
        }
        Ok(results)
    }

    // ========================================================================
    // Locks
    // ========================================================================

    /// Acquire a per-key lock, waiting up to `timeout`. The lock also
    /// expires after `timeout` so a dead holder cannot wedge the key.
    pub async fn lock(&self, namespace: &str, key: &str, timeout: Duration) -> StateResult<Uuid> {
        self.namespace(namespace)?;
        self.locks
            .acquire(namespace, key, Uuid::new_v4(), timeout, timeout)
            .await
    }

    /// Release a lock.
    pub fn unlock(&self, namespace: &str, key: &str, lock_id: Option<Uuid>) -> bool {
        self.locks.release(namespace, key, lock_id)
    }

    /// Whether the key is currently locked.
    pub fn is_locked(&self, namespace: &str, key: &str) -> bool {
        self.locks.is_locked(namespace, key)
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    /// Open a transaction. Operations are buffered until commit.
    pub fn begin(&self) -> Uuid {
        let id = Uuid::new_v4();
        let now = std::time::Instant::now();
        self.transactions.insert(
            id,
            Transaction {
                id,
                operations: Vec::new(),
                deadline: now + Duration::from_millis(self.config.transaction_timeout_ms),
            },
        );
        id
    }

    /// Buffer an operation into an open transaction.
    pub fn add_operation(&self, tx_id: Uuid, operation: TxOperation) -> StateResult<()> {
        let mut tx = self
            .transactions
            .get_mut(&tx_id)
            .ok_or(StateError::TransactionNotFound(tx_id.to_string()))?;
        tx.operations.push(operation);
        Ok(())
    }

    /// Commit: take every write lock in canonical order, run the buffered
    /// operations, release. Any mid-flight failure undoes the applied
    /// operations, so other readers only ever observe all or none of them.
    pub async fn commit(&self, tx_id: Uuid) -> StateResult<Vec<TxResult>> {
        let (_, tx) = self
            .transactions
            .remove(&tx_id)
            .ok_or(StateError::TransactionNotFound(tx_id.to_string()))?;

        if std::time::Instant::now() >= tx.deadline {
            return Err(StateError::TransactionTimeout(tx_id.to_string()));
        }

        // Canonical (namespace, key) order prevents lock-order deadlock
        // between concurrent commits.
        let mut write_keys: Vec<(String, String)> = tx
            .operations
            .iter()
            .filter_map(|op| op.write_key())
            .collect();
        write_keys.sort();
        write_keys.dedup();

        let lock_ttl = Duration::from_millis(self.config.lock_ttl_ms);
        let lock_wait = Duration::from_millis(self.config.tx_lock_wait_ms);
        for (namespace, key) in &write_keys {
            if let Err(e) = self
                .locks
                .acquire(namespace, key, tx.id, lock_ttl, lock_wait)
                .await
            {
                self.locks.release_owner(tx.id);
                return Err(e);
            }
        }

        let mut results = Vec::with_capacity(tx.operations.len());
        let mut undo: Vec<(String, String, Option<StateEntry>)> = Vec::new();
        let mut failed: Option<StateError> = None;

        for operation in &tx.operations {
            if std::time::Instant::now() >= tx.deadline {
                failed = Some(StateError::TransactionTimeout(tx_id.to_string()));
                break;
            }
            match operation {
                TxOperation::Get { namespace, key } => {
                    match self.get(namespace, key, GetOptions::default()).await {
                        Ok(meta) => results.push(TxResult::Value(meta.map(|m| m.value))),
                        Err(e) => {
                            failed = Some(e);
                            break;
                        }
                    }
                }
                TxOperation::Set {
                    namespace,
                    key,
                    value,
                    options,
                } => {
                    let snapshot = self.snapshot(namespace, key).await;
                    let mut options = options.clone();
                    options.lock_id = self.locks.get(namespace, key).map(|l| l.id);
                    match self.set(namespace, key, value.clone(), options).await {
                        Ok(receipt) => {
                            undo.push((namespace.clone(), key.clone(), snapshot));
                            results.push(TxResult::Receipt(receipt));
                        }
                        Err(e) => {
                            failed = Some(e);
                            break;
                        }
                    }
                }
                TxOperation::Delete { namespace, key } => {
                    let snapshot = self.snapshot(namespace, key).await;
                    let lock_id = self.locks.get(namespace, key).map(|l| l.id);
                    match self.delete(namespace, key, lock_id).await {
                        Ok(deleted) => {
                            undo.push((namespace.clone(), key.clone(), snapshot));
                            results.push(TxResult::Deleted(deleted));
                        }
                        Err(e) => {
                            failed = Some(e);
                            break;
                        }
                    }
                }
            }
        }

        if let Some(error) = failed {
            // Restore snapshots in reverse apply order, indexes included.
            for (namespace, key, snapshot) in undo.into_iter().rev() {
                if let Ok(ns) = self.namespace(&namespace) {
                    let current = {
                        let mut data = ns.data.write().await;
                        let current = data.get(&key).cloned();
                        match &snapshot {
                            Some(entry) => {
                                data.insert(key.clone(), entry.clone());
                            }
                            None => {
                                data.remove(&key);
                            }
                        }
                        current
                    };
                    if let Some(current) = current {
                        self.unindex_entry(&ns, &current).await;
                    }
                    if let Some(entry) = snapshot {
                        self.index_entry(&ns, &key, &entry.original, &[]).await;
                    }
                }
            }
            self.locks.release_owner(tx.id);
            return Err(error);
        }

        self.locks.release_owner(tx.id);
        Ok(results)
    }

    /// Discard a transaction. Buffered operations are never applied, so the
    /// store is left unchanged.
    pub fn rollback(&self, tx_id: Uuid) -> StateResult<()> {
        self.transactions
            .remove(&tx_id)
            .map(|_| ())
            .ok_or(StateError::TransactionNotFound(tx_id.to_string()))?;
        self.locks.release_owner(tx_id);
        Ok(())
    }

    async fn snapshot(&self, namespace: &str, key: &str) -> Option<StateEntry> {
        let ns = self.namespace(namespace).ok()?;
        let data = ns.data.read().await;
        data.get(key).cloned()
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    /// Subscribe to set/delete changes on keys matching a glob pattern.
    pub fn subscribe(
        &self,
        namespace: &str,
        pattern: &str,
    ) -> StateResult<(Uuid, mpsc::UnboundedReceiver<StateChange>)> {
        self.namespace(namespace)?;
        let pattern = glob::Pattern::new(pattern)
            .map_err(|e| StateError::Internal(format!("invalid pattern: {}", e)))?;
        let (tx, rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        self.subscriptions.insert(
            id,
            StateSubscription {
                namespace: namespace.to_string(),
                pattern,
                tx,
            },
        );
        Ok((id, rx))
    }

    /// Remove a change subscription.
    pub fn unsubscribe(&self, subscription_id: Uuid) -> bool {
        self.subscriptions.remove(&subscription_id).is_some()
    }

    fn notify(
        &self,
        ns: &Arc<Namespace>,
        key: &str,
        kind: StateChangeKind,
        value: Option<serde_json::Value>,
        version: Option<String>,
    ) {
        let change = StateChange {
            namespace: ns.name.clone(),
            key: key.to_string(),
            kind,
            value,
            version,
            timestamp: self.clock.now(),
        };
        let mut dead = Vec::new();
        for sub in self.subscriptions.iter() {
            if sub.namespace == ns.name && sub.pattern.matches(key) {
                if sub.tx.send(change.clone()).is_err() {
                    dead.push(*sub.key());
                }
            }
        }
        for id in dead {
            self.subscriptions.remove(&id);
        }

        // Mirror set/delete changes onto the bus for remote observers.
        if matches!(kind, StateChangeKind::Set | StateChangeKind::Delete) {
            if let Some(publisher) = self.publisher.read().clone() {
                let event = Event::new(
                    topics::STATE_SUBSCRIPTION_EVENT,
                    EventData::Signal {
                        detail: serde_json::json!({
                            "namespace": change.namespace,
                            "key": change.key,
                            "kind": change.kind,
                            "version": change.version,
                        }),
                    },
                )
                .with_source("state-manager");
                tokio::spawn(async move {
                    let _ = publisher.publish_event(event).await;
                });
            }
        }
    }

    fn emit_conflict(&self, namespace: &str, key: &str, expected: &str, actual: &str) {
        warn!(namespace, key, expected, actual, "manual conflict recorded");
        if let Some(publisher) = self.publisher.read().clone() {
            let event = Event::new(
                topics::POLICY_VIOLATION,
                EventData::Signal {
                    detail: serde_json::json!({
                        "kind": "state_conflict",
                        "namespace": namespace,
                        "key": key,
                        "expected_version": expected,
                        "actual_version": actual,
                    }),
                },
            )
            .with_source("state-manager");
            tokio::spawn(async move {
                let _ = publisher.publish_event(event).await;
            });
        }
    }

    fn bump_stats(&self, ns: &Arc<Namespace>, update: impl FnOnce(&mut NamespaceStats)) {
        update(&mut ns.stats.write());
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Evict the least-recently-accessed tenth of an over-capacity
    /// namespace.
    async fn evict_lru(&self, ns: &Arc<Namespace>) {
        let victims: Vec<StateEntry> = {
            let data = ns.data.read().await;
            if data.len() <= ns.config.max_size {
                return;
            }
            let mut entries: Vec<&StateEntry> = data.values().collect();
            entries.sort_by_key(|entry| entry.last_accessed);
            let count = ((ns.config.max_size as f64 * EVICTION_FRACTION).ceil() as usize).max(1);
            entries.into_iter().take(count).cloned().collect()
        };

        if victims.is_empty() {
            return;
        }
        let count = victims.len();
        {
            let mut data = ns.data.write().await;
            for victim in &victims {
                data.remove(&victim.key);
            }
        }
        for victim in &victims {
            self.unindex_entry(ns, victim).await;
            if let Some(persistence) = &ns.persistence {
                let _ = persistence.record_delete(&victim.key);
            }
            self.notify(ns, &victim.key, StateChangeKind::Evict, None, None);
        }
        self.bump_stats(ns, |s| s.evictions += count as u64);
        debug!(namespace = %ns.name, count, "evicted least-recently-accessed entries");
    }

    /// One maintenance pass: TTL expiry, eviction, metric refresh, lock and
    /// transaction expiry, and replication catch-up.
    pub async fn sweep(&self) {
        let now = self.clock.now();
        let namespaces: Vec<Arc<Namespace>> = self
            .namespaces
            .iter()
            .map(|ns| Arc::clone(&ns))
            .collect();

        for ns in namespaces {
            // Expire.
            let expired: Vec<StateEntry> = {
                let mut data = ns.data.write().await;
                let keys: Vec<String> = data
                    .values()
                    .filter(|entry| entry.is_expired(now))
                    .map(|entry| entry.key.clone())
                    .collect();
                keys.iter().filter_map(|key| data.remove(key)).collect()
            };
            for entry in &expired {
                self.unindex_entry(&ns, entry).await;
                if let Some(persistence) = &ns.persistence {
                    let _ = persistence.record_delete(&entry.key);
                }
                self.notify(&ns, &entry.key, StateChangeKind::Expire, None, None);
            }
            if !expired.is_empty() {
                self.bump_stats(&ns, |s| s.expirations += expired.len() as u64);
            }

            // Evict.
            self.evict_lru(&ns).await;

            // Metrics.
            {
                let data = ns.data.read().await;
                let mut stats = ns.stats.write();
                stats.entry_count = data.len();
                stats.total_size = data.values().map(|e| e.size).sum();
            }

            // Replication catch-up.
            if ns.config.replication {
                let pending: Vec<String> = ns.pending_replication.lock().drain().collect();
                for key in pending {
                    let record = {
                        let data = ns.data.read().await;
                        data.get(&key).map(|entry| crate::traits::ReplicaRecord {
                            payload: entry.original.clone(),
                            version: entry.version.clone(),
                            updated_at: entry.updated_at,
                        })
                    };
                    if let Some(record) = record {
                        let results = self
                            .replicator
                            .replicate_write(&ns.name, &key, record)
                            .await;
                        if results.iter().all(|r| r.is_err()) {
                            ns.pending_replication.lock().insert(key);
                        }
                    }
                }
            }
        }

        self.locks.sweep_expired();

        // Expire stale transactions.
        let now_instant = std::time::Instant::now();
        let stale: Vec<Uuid> = self
            .transactions
            .iter()
            .filter(|tx| now_instant >= tx.deadline)
            .map(|tx| tx.id)
            .collect();
        for id in stale {
            warn!(transaction = %id, "transaction expired before commit");
            self.transactions.remove(&id);
            self.locks.release_owner(id);
        }
    }

    /// Health snapshot across all namespaces.
    pub async fn health(&self) -> StateHealth {
        let mut total_entries = 0;
        let mut total_size = 0;
        for ns in self.namespaces.iter() {
            let stats = ns.stats.read();
            total_entries += stats.entry_count;
            total_size += stats.total_size;
        }
        let active_locks = self.locks.active_count();
        let active_transactions = self.transactions.len();

        let mut reasons = Vec::new();
        if total_size > self.config.memory_high_water_bytes {
            reasons.push(format!("memory above high water: {} bytes", total_size));
        }
        if active_locks > self.config.max_locks {
            reasons.push(format!("excess locks: {}", active_locks));
        }
        if active_transactions > self.config.max_transactions {
            reasons.push(format!("excess transactions: {}", active_transactions));
        }

        StateHealth {
            degraded: !reasons.is_empty(),
            reasons,
            namespace_count: self.namespaces.len(),
            total_entries,
            total_size,
            active_locks,
            active_transactions,
        }
    }

    /// Statistics for one namespace.
    pub fn stats(&self, namespace: &str) -> StateResult<NamespaceStats> {
        let ns = self.namespace(namespace)?;
        let stats = ns.stats.read().clone();
        Ok(stats)
    }

    /// Spawn the periodic maintenance task.
    fn spawn_sweeper(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let shutdown = self.shutdown.clone();
        let interval = Duration::from_millis(self.config.sweep_interval_ms);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => manager.sweep().await,
                    _ = shutdown.cancelled() => break,
                }
            }
        });
    }
}

#[async_trait]
impl Lifecycle for Arc<StateManager> {
    fn name(&self) -> &str {
        "state-manager"
    }

    async fn start(&self) -> Result<(), String> {
        self.spawn_sweeper();
        info!("state manager started");
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), String> {
        self.shutdown.cancel();
        info!("state manager shut down");
        Ok(())
    }
}

fn scalar_text(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::{InMemoryReplicator, XorCipher};
    use serde_json::json;

    fn manager() -> Arc<StateManager> {
        StateManager::new(StateManagerConfig {
            create_builtins: false,
            ..Default::default()
        })
    }

    fn plain_namespace() -> NamespaceConfig {
        NamespaceConfig {
            replication: false,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_set_get_round_trip() {
        let sm = manager();
        sm.create_namespace("ns", plain_namespace()).unwrap();

        let receipt = sm
            .set("ns", "k", json!({"city": "Porto"}), SetOptions::default())
            .await
            .unwrap();
        let got = sm.get("ns", "k", GetOptions::default()).await.unwrap().unwrap();
        assert_eq!(got.value, json!({"city": "Porto"}));
        assert_eq!(got.version, receipt.version);
    }

    #[tokio::test]
    async fn test_compression_and_encryption_round_trip() {
        let config = StateManagerConfig {
            create_builtins: false,
            ..Default::default()
        };
        let sm = StateManager::with_seams(
            config,
            Arc::new(GzipCodec::new()),
            Arc::new(XorCipher::new(0x42)),
            Arc::new(InMemoryReplicator::new(3)),
            Arc::new(SystemClock),
        );
        sm.create_namespace(
            "ns",
            NamespaceConfig {
                encryption: true,
                compression_threshold: 64,
                replication: false,
                ..Default::default()
            },
        )
        .unwrap();

        let big = json!({"legs": vec!["Lisbon-Madrid"; 50]});
        sm.set("ns", "trip", big.clone(), SetOptions::default())
            .await
            .unwrap();

        let got = sm.get("ns", "trip", GetOptions::default()).await.unwrap().unwrap();
        assert_eq!(got.value, big);
    }

    #[tokio::test]
    async fn test_ttl_expiry_deletes_on_read() {
        let sm = manager();
        sm.create_namespace("ns", plain_namespace()).unwrap();

        sm.set(
            "ns",
            "k",
            json!("v"),
            SetOptions {
                ttl: Some(ChronoDuration::milliseconds(40)),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        assert!(sm.get("ns", "k", GetOptions::default()).await.unwrap().is_some());
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(sm.get("ns", "k", GetOptions::default()).await.unwrap().is_none());

        let stats = sm.stats("ns").unwrap();
        assert!(stats.expirations >= 1);
        assert!(!sm.exists("ns", "k").await.unwrap());
    }

    #[tokio::test]
    async fn test_increment_inverse_law() {
        let sm = manager();
        sm.create_namespace("ns", plain_namespace()).unwrap();

        sm.set("ns", "count", json!(10), SetOptions::default())
            .await
            .unwrap();
        sm.increment("ns", "count", 7).await.unwrap();
        let back = sm.increment("ns", "count", -7).await.unwrap();
        assert_eq!(back, 10);
    }

    #[tokio::test]
    async fn test_increment_rejects_non_integer() {
        let sm = manager();
        sm.create_namespace("ns", plain_namespace()).unwrap();
        sm.set("ns", "k", json!("text"), SetOptions::default())
            .await
            .unwrap();
        assert!(matches!(
            sm.increment("ns", "k", 1).await,
            Err(StateError::NotAnInteger(_))
        ));
    }

    #[tokio::test]
    async fn test_expected_version_conflict_resolution() {
        let sm = manager();
        sm.create_namespace(
            "ns",
            NamespaceConfig {
                conflict_strategy: crate::state_types::ConflictStrategy::Merge,
                replication: false,
                ..Default::default()
            },
        )
        .unwrap();

        let first = sm
            .set("ns", "k", json!({"a": 1}), SetOptions::default())
            .await
            .unwrap();
        sm.set("ns", "k", json!({"a": 2, "b": 2}), SetOptions::default())
            .await
            .unwrap();

        // Stale writer: expected version no longer matches, merge resolves.
        sm.set(
            "ns",
            "k",
            json!({"c": 3}),
            SetOptions {
                expected_version: Some(first.version),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let got = sm.get("ns", "k", GetOptions::default()).await.unwrap().unwrap();
        assert_eq!(got.value, json!({"a": 2, "b": 2, "c": 3}));
        assert_eq!(sm.stats("ns").unwrap().conflicts, 1);
    }

    #[tokio::test]
    async fn test_manual_conflict_fails_write() {
        let sm = manager();
        sm.create_namespace(
            "ns",
            NamespaceConfig {
                conflict_strategy: crate::state_types::ConflictStrategy::Manual,
                replication: false,
                ..Default::default()
            },
        )
        .unwrap();

        let first = sm.set("ns", "k", json!(1), SetOptions::default()).await.unwrap();
        sm.set("ns", "k", json!(2), SetOptions::default()).await.unwrap();

        let result = sm
            .set(
                "ns",
                "k",
                json!(3),
                SetOptions {
                    expected_version: Some(first.version),
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(result, Err(StateError::ManualConflict(_))));
        let got = sm.get("ns", "k", GetOptions::default()).await.unwrap().unwrap();
        assert_eq!(got.value, json!(2));
    }

    #[tokio::test]
    async fn test_versioning_keeps_previous_entry() {
        let sm = manager();
        sm.create_namespace(
            "ns",
            NamespaceConfig {
                versioning: true,
                replication: false,
                ..Default::default()
            },
        )
        .unwrap();

        let first = sm.set("ns", "k", json!(1), SetOptions::default()).await.unwrap();
        sm.set("ns", "k", json!(2), SetOptions::default()).await.unwrap();

        let history_key = format!("k:{}", first.version);
        let old = sm
            .get("ns", &history_key, GetOptions::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(old.value, json!(1));
    }

    #[tokio::test]
    async fn test_index_query() {
        let sm = manager();
        sm.create_namespace("ns", plain_namespace()).unwrap();

        sm.set(
            "ns",
            "c1",
            json!({"type": "hotel", "status": "open"}),
            SetOptions::default(),
        )
        .await
        .unwrap();
        sm.set(
            "ns",
            "c2",
            json!({"type": "hotel", "status": "closed"}),
            SetOptions::default(),
        )
        .await
        .unwrap();
        sm.set("ns", "c3", json!({"type": "flight"}), SetOptions::default())
            .await
            .unwrap();

        let hotels = sm.query("ns", "type", &json!("hotel"), None).await.unwrap();
        assert_eq!(hotels.len(), 2);

        let open = sm.query("ns", "status", &json!("open"), None).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].0, "c1");

        // Updates re-index.
        sm.set("ns", "c3", json!({"type": "hotel"}), SetOptions::default())
            .await
            .unwrap();
        let hotels = sm.query("ns", "type", &json!("hotel"), None).await.unwrap();
        assert_eq!(hotels.len(), 3);
        let flights = sm.query("ns", "type", &json!("flight"), None).await.unwrap();
        assert!(flights.is_empty());
    }

    #[tokio::test]
    async fn test_locked_key_rejects_other_writers() {
        let sm = manager();
        sm.create_namespace("ns", plain_namespace()).unwrap();

        let lock_id = sm.lock("ns", "k", Duration::from_secs(5)).await.unwrap();
        let result = sm.set("ns", "k", json!(1), SetOptions::default()).await;
        assert!(matches!(result, Err(StateError::Locked { .. })));

        // Holder writes fine.
        sm.set(
            "ns",
            "k",
            json!(2),
            SetOptions {
                lock_id: Some(lock_id),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        assert!(sm.unlock("ns", "k", Some(lock_id)));
        sm.set("ns", "k", json!(3), SetOptions::default()).await.unwrap();
    }

    #[tokio::test]
    async fn test_transaction_commit_applies_all() {
        let sm = manager();
        sm.create_namespace("ns", plain_namespace()).unwrap();

        let tx = sm.begin();
        sm.add_operation(
            tx,
            TxOperation::Set {
                namespace: "ns".to_string(),
                key: "a".to_string(),
                value: json!(1),
                options: SetOptions::default(),
            },
        )
        .unwrap();
        sm.add_operation(
            tx,
            TxOperation::Set {
                namespace: "ns".to_string(),
                key: "b".to_string(),
                value: json!(2),
                options: SetOptions::default(),
            },
        )
        .unwrap();
        sm.add_operation(
            tx,
            TxOperation::Get {
                namespace: "ns".to_string(),
                key: "a".to_string(),
            },
        )
        .unwrap();

        let results = sm.commit(tx).await.unwrap();
        assert_eq!(results.len(), 3);
        assert!(matches!(&results[2], TxResult::Value(Some(v)) if *v == json!(1)));
        assert!(!sm.is_locked("ns", "a"));
    }

    #[tokio::test]
    async fn test_transaction_rollback_leaves_store_unchanged() {
        let sm = manager();
        sm.create_namespace("ns", plain_namespace()).unwrap();

        let tx = sm.begin();
        sm.add_operation(
            tx,
            TxOperation::Set {
                namespace: "ns".to_string(),
                key: "k".to_string(),
                value: json!("buffered"),
                options: SetOptions::default(),
            },
        )
        .unwrap();
        sm.rollback(tx).unwrap();

        assert!(sm.get("ns", "k", GetOptions::default()).await.unwrap().is_none());
        assert!(matches!(
            sm.commit(tx).await,
            Err(StateError::TransactionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_transaction_failure_restores_applied_ops() {
        let sm = manager();
        sm.create_namespace("ns", plain_namespace()).unwrap();
        sm.set("ns", "a", json!("before"), SetOptions::default())
            .await
            .unwrap();

        let tx = sm.begin();
        sm.add_operation(
            tx,
            TxOperation::Set {
                namespace: "ns".to_string(),
                key: "a".to_string(),
                value: json!("after"),
                options: SetOptions::default(),
            },
        )
        .unwrap();
        // Second op targets a missing namespace and fails the commit.
        sm.add_operation(
            tx,
            TxOperation::Set {
                namespace: "missing".to_string(),
                key: "x".to_string(),
                value: json!(1),
                options: SetOptions::default(),
            },
        )
        .unwrap();

        assert!(sm.commit(tx).await.is_err());
        let a = sm.get("ns", "a", GetOptions::default()).await.unwrap().unwrap();
        assert_eq!(a.value, json!("before"));
    }

    #[tokio::test]
    async fn test_strong_write_quorum_failure() {
        let replicator = Arc::new(InMemoryReplicator::new(3));
        let sm = StateManager::with_seams(
            StateManagerConfig {
                create_builtins: false,
                ..Default::default()
            },
            Arc::new(GzipCodec::new()),
            Arc::new(PassthroughCipher),
            replicator.clone(),
            Arc::new(SystemClock),
        );
        sm.create_namespace(
            "ns",
            NamespaceConfig {
                consistency: ConsistencyClass::Strong,
                replication: true,
                ..Default::default()
            },
        )
        .unwrap();

        sm.set("ns", "k", json!("pre"), SetOptions::default())
            .await
            .unwrap();

        replicator.fail_node(0);
        replicator.fail_node(1);

        let result = sm.set("ns", "k", json!("post"), SetOptions::default()).await;
        assert!(matches!(
            result,
            Err(StateError::QuorumNotReached { acks: 1, required: 2 })
        ));

        replicator.recover_node(0);
        replicator.recover_node(1);
        let got = sm.get("ns", "k", GetOptions::default()).await.unwrap().unwrap();
        assert_eq!(got.value, json!("pre"));
    }

    #[tokio::test]
    async fn test_eviction_drops_least_recently_accessed() {
        let sm = manager();
        sm.create_namespace(
            "ns",
            NamespaceConfig {
                max_size: 10,
                replication: false,
                indexing: false,
                ..Default::default()
            },
        )
        .unwrap();

        for i in 0..10 {
            sm.set("ns", &format!("k{}", i), json!(i), SetOptions::default())
                .await
                .unwrap();
        }
        // Touch everything except k0 so k0 is the coldest.
        for i in 1..10 {
            sm.get("ns", &format!("k{}", i), GetOptions::default())
                .await
                .unwrap();
        }
        sm.set("ns", "overflow", json!("x"), SetOptions::default())
            .await
            .unwrap();

        assert!(sm.get("ns", "k0", GetOptions::default()).await.unwrap().is_none());
        assert!(sm.stats("ns").unwrap().evictions >= 1);
    }

    #[tokio::test]
    async fn test_subscription_receives_set_and_delete() {
        let sm = manager();
        sm.create_namespace("ns", plain_namespace()).unwrap();
        let (_id, mut rx) = sm.subscribe("ns", "user:*").unwrap();

        sm.set("ns", "user:1", json!("a"), SetOptions::default())
            .await
            .unwrap();
        sm.set("ns", "other:1", json!("b"), SetOptions::default())
            .await
            .unwrap();
        sm.delete("ns", "user:1", None).await.unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.key, "user:1");
        assert_eq!(first.kind, StateChangeKind::Set);
        let second = rx.recv().await.unwrap();
        assert_eq!(second.kind, StateChangeKind::Delete);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_keys_glob_and_limit() {
        let sm = manager();
        sm.create_namespace("ns", plain_namespace()).unwrap();
        for i in 0..5 {
            sm.set("ns", &format!("trip:{}", i), json!(i), SetOptions::default())
                .await
                .unwrap();
        }
        sm.set("ns", "other", json!(0), SetOptions::default())
            .await
            .unwrap();

        let keys = sm.keys("ns", "trip:*", None).await.unwrap();
        assert_eq!(keys.len(), 5);
        let capped = sm.keys("ns", "trip:*", Some(2)).await.unwrap();
        assert_eq!(capped.len(), 2);
    }

    #[tokio::test]
    async fn test_expire_and_persist() {
        let sm = manager();
        sm.create_namespace("ns", plain_namespace()).unwrap();
        sm.set("ns", "k", json!(1), SetOptions::default()).await.unwrap();

        assert!(sm.ttl("ns", "k").await.unwrap().is_none());
        assert!(sm.expire("ns", "k", Duration::from_secs(60)).await.unwrap());
        let remaining = sm.ttl("ns", "k").await.unwrap().unwrap();
        assert!(remaining <= Duration::from_secs(60));
        assert!(sm.persist("ns", "k").await.unwrap());
        assert!(sm.ttl("ns", "k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_namespace_admin() {
        let sm = manager();
        sm.create_namespace("ns", plain_namespace()).unwrap();
        assert!(matches!(
            sm.create_namespace("ns", plain_namespace()),
            Err(StateError::NamespaceExists(_))
        ));
        assert!(sm.list_namespaces().contains(&"ns".to_string()));
        assert!(sm.delete_namespace("ns"));
        assert!(!sm.delete_namespace("ns"));
        assert!(matches!(
            sm.get("ns", "k", GetOptions::default()).await,
            Err(StateError::NamespaceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_persistence_recovery() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = StateManagerConfig {
            persistence_root: dir.path().to_path_buf(),
            create_builtins: false,
            ..Default::default()
        };
        let ns_config = NamespaceConfig {
            persistence: true,
            replication: false,
            ..Default::default()
        };

        {
            let sm = StateManager::new(config.clone());
            sm.create_namespace("durable", ns_config.clone()).unwrap();
            sm.set("durable", "k", json!({"kept": true}), SetOptions::default())
                .await
                .unwrap();
            sm.set("durable", "gone", json!(1), SetOptions::default())
                .await
                .unwrap();
            sm.delete("durable", "gone", None).await.unwrap();
        }

        let sm = StateManager::new(config);
        sm.create_namespace("durable", ns_config).unwrap();
        let got = sm
            .get("durable", "k", GetOptions::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.value, json!({"kept": true}));
        assert!(sm.get("durable", "gone", GetOptions::default()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_mget_mset() {
        let sm = manager();
        sm.create_namespace("ns", plain_namespace()).unwrap();
        sm.mset(
            "ns",
            vec![
                ("a".to_string(), json!(1)),
                ("b".to_string(), json!(2)),
            ],
        )
        .await
        .unwrap();

        let values = sm.mget("ns", &["a", "b", "c"]).await.unwrap();
        assert_eq!(values[0].as_ref().unwrap().value, json!(1));
        assert_eq!(values[1].as_ref().unwrap().value, json!(2));
        assert!(values[2].is_none());
    }

    #[tokio::test]
    async fn test_hit_and_miss_counted_separately() {
        let sm = manager();
        sm.create_namespace("ns", plain_namespace()).unwrap();
        sm.set("ns", "k", json!(1), SetOptions::default()).await.unwrap();

        sm.get("ns", "k", GetOptions::default()).await.unwrap();
        sm.get("ns", "k", GetOptions::default()).await.unwrap();
        sm.get("ns", "absent", GetOptions::default()).await.unwrap();

        let stats = sm.stats("ns").unwrap();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate() - 2.0 / 3.0).abs() < 1e-9);
    }
}
