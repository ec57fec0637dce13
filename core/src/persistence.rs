/// File-backed durability for namespaces that opt in.
///
/// Layout: one directory per namespace, one JSON file per key under `keys/`,
/// and an append-only `ops.log` of set/delete operations. Recovery loads the
/// key files and then replays the log over them, so a crash between the log
/// append and the key-file write loses nothing.
use crate::errors::{StateError, StateResult};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::hash::{Hash, Hasher};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use tracing::{debug, warn};

/// Durable record for one key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistedRecord {
    pub version: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub ttl_secs: Option<i64>,
    pub compressed: bool,
    pub encrypted: bool,
    /// Plain JSON payload, or base64 bytes when compressed/encrypted
    pub payload: PersistedPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "form", rename_all = "lowercase")]
pub enum PersistedPayload {
    Plain { value: serde_json::Value },
    Bytes { base64: String },
}

impl PersistedPayload {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        PersistedPayload::Bytes {
            base64: BASE64.encode(bytes),
        }
    }

    pub fn as_bytes(&self) -> StateResult<Vec<u8>> {
        match self {
            PersistedPayload::Bytes { base64 } => BASE64
                .decode(base64)
                .map_err(|e| StateError::PersistenceError(format!("invalid base64: {}", e))),
            PersistedPayload::Plain { .. } => Err(StateError::PersistenceError(
                "payload is not binary".to_string(),
            )),
        }
    }
}

/// One line in the append-only op log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum LogOp {
    Set {
        key: String,
        at: DateTime<Utc>,
        record: PersistedRecord,
    },
    Delete {
        key: String,
        at: DateTime<Utc>,
    },
}

/// Durability handle for one namespace.
pub struct NamespacePersistence {
    namespace: String,
    keys_dir: PathBuf,
    log_path: PathBuf,
    log: parking_lot::Mutex<File>,
}

impl NamespacePersistence {
    /// Open (or create) the on-disk layout for a namespace.
    pub fn open(root: &PathBuf, namespace: &str) -> StateResult<Self> {
        let dir = root.join(sanitize(namespace));
        let keys_dir = dir.join("keys");
        fs::create_dir_all(&keys_dir)?;
        let log_path = dir.join("ops.log");
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;
        Ok(Self {
            namespace: namespace.to_string(),
            keys_dir,
            log_path,
            log: parking_lot::Mutex::new(log),
        })
    }

    /// Persist a set: append to the log, then write the key file.
    pub fn record_set(&self, key: &str, record: &PersistedRecord) -> StateResult<()> {
        self.append(&LogOp::Set {
            key: key.to_string(),
            at: Utc::now(),
            record: record.clone(),
        })?;
        let keyed = KeyedRecord {
            key: key.to_string(),
            record: record.clone(),
        };
        let json = serde_json::to_vec_pretty(&keyed)?;
        fs::write(self.key_path(key), json)?;
        Ok(())
    }

    /// Persist a delete: append to the log, then remove the key file.
    pub fn record_delete(&self, key: &str) -> StateResult<()> {
        self.append(&LogOp::Delete {
            key: key.to_string(),
            at: Utc::now(),
        })?;
        let path = self.key_path(key);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    /// Rebuild the key set: key files first, then the op log replayed on top.
    pub fn recover(&self) -> StateResult<HashMap<String, PersistedRecord>> {
        let mut recovered = HashMap::new();

        for entry in fs::read_dir(&self.keys_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            match fs::read(entry.path())
                .map_err(StateError::from)
                .and_then(|bytes| serde_json::from_slice::<KeyedRecord>(&bytes).map_err(Into::into))
            {
                Ok(keyed) => {
                    recovered.insert(keyed.key, keyed.record);
                }
                Err(e) => {
                    warn!(
                        namespace = %self.namespace,
                        path = %entry.path().display(),
                        error = %e,
                        "skipping unreadable key file during recovery"
                    );
                }
            }
        }

        if self.log_path.exists() {
            let reader = BufReader::new(File::open(&self.log_path)?);
            for line in reader.lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<LogOp>(&line) {
                    Ok(LogOp::Set { key, record, .. }) => {
                        recovered.insert(key, record);
                    }
                    Ok(LogOp::Delete { key, .. }) => {
                        recovered.remove(&key);
                    }
                    Err(e) => {
                        // A torn tail line from a crash mid-append.
                        warn!(namespace = %self.namespace, error = %e, "skipping corrupt log line");
                    }
                }
            }
        }

        debug!(
            namespace = %self.namespace,
            keys = recovered.len(),
            "namespace recovered from disk"
        );
        Ok(recovered)
    }

    fn append(&self, op: &LogOp) -> StateResult<()> {
        let mut line = serde_json::to_vec(op)?;
        line.push(b'\n');
        let mut log = self.log.lock();
        log.write_all(&line)?;
        log.flush()?;
        Ok(())
    }

    fn key_path(&self, key: &str) -> PathBuf {
        self.keys_dir.join(format!("{}.json", sanitize(key)))
    }
}

/// Key file wrapper so recovery can restore the original key string.
#[derive(Debug, Serialize, Deserialize)]
struct KeyedRecord {
    key: String,
    #[serde(flatten)]
    record: PersistedRecord,
}

/// Make an arbitrary key or namespace name filesystem-safe, keeping it
/// readable and collision-free via a hash suffix.
fn sanitize(raw: &str) -> String {
    let safe: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .take(64)
        .collect();
    let mut hasher = DefaultHasher::new();
    raw.hash(&mut hasher);
    format!("{}-{:08x}", safe, hasher.finish() as u32)
}
