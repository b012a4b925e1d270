//! Content-addressed change tracking
//!
//! Every artifact the agent produces (a file, an environment variable or an
//! opaque data blob) has a stable identity derived from where it goes, not
//! from what it contains. The store remembers the content hash last written
//! for each identity, so the loop only rewrites artifacts whose content
//! changed, and sweeps the records of artifacts that are no longer produced.
//!
//! A tracking generation spans one [`Store::check`] ... [`Store::clear`]
//! pair: `check` opens a new generation, [`Store::check_update`] stamps each
//! produced record with it and `clear` deletes every record left with an
//! older stamp.
//!
//! Records whose identity was produced in the current generation are never
//! swept, whichever backend holds them. Shared backends only sweep identities
//! this process produced itself, so cooperating agents leave each other's
//! records alone.

pub mod files;
pub mod memcached;
pub mod memory;

use crate::config::{AgentSettings, StoreKind};
use crate::error::SurokError;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha1::{Digest, Sha1};
use std::collections::HashSet;
use tracing::{debug, info, instrument, warn};

/// Stored state of one artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreRecord {
    /// Content hash of the value last written
    pub hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<String>,
    /// Backend the record was written to
    pub store: StoreKind,
    /// Generation of the last cycle that produced the artifact
    pub generation: i64,
}

/// A candidate artifact handed to the change gate
#[derive(Debug, Clone, PartialEq)]
pub enum Artifact {
    File { dest: String, value: String },
    Env { name: String, value: String },
    Data { id: String, value: Value },
}

pub fn sha1_hex(data: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

impl Artifact {
    /// Stable hash of the artifact's logical address
    pub fn identity(&self) -> String {
        match self {
            Artifact::File { dest, .. } => sha1_hex(dest.as_bytes()),
            Artifact::Env { name, .. } => sha1_hex(format!("env:{}", name).as_bytes()),
            Artifact::Data { id, .. } => sha1_hex(format!("data:{}", id).as_bytes()),
        }
    }

    /// Hash of the current value; data blobs hash their key-sorted JSON
    pub fn content_hash(&self) -> String {
        match self {
            Artifact::File { value, .. } | Artifact::Env { value, .. } => {
                sha1_hex(value.as_bytes())
            }
            Artifact::Data { value, .. } => {
                sha1_hex(serde_json::to_string(value).unwrap_or_default().as_bytes())
            }
        }
    }

    fn record(&self, store: StoreKind, generation: i64) -> StoreRecord {
        let (dest, env) = match self {
            Artifact::File { dest, .. } => (Some(dest.clone()), None),
            Artifact::Env { name, .. } => (None, Some(name.clone())),
            Artifact::Data { .. } => (None, None),
        };
        StoreRecord {
            hash: self.content_hash(),
            dest,
            env,
            store,
            generation,
        }
    }
}

/// Uniform CRUD over one storage backend, keyed by identity
#[async_trait::async_trait]
pub trait ContentStore: Send + Sync {
    fn kind(&self) -> StoreKind;

    fn enabled(&self) -> bool;

    /// Whether other agents read and write the same records
    fn shared(&self) -> bool {
        false
    }

    /// Re-read settings and validate the backend; returns whether it is enabled
    async fn check(&mut self, settings: &AgentSettings, cache_hosts: &[String]) -> bool;

    async fn get(&self, identity: &str) -> Result<Option<StoreRecord>>;

    async fn set(&mut self, identity: &str, record: &StoreRecord) -> Result<()>;

    async fn delete(&mut self, identity: &str) -> Result<()>;

    async fn keys(&self) -> Result<Vec<String>>;
}

/// Change-detection facade over every backend
pub struct Store {
    backends: Vec<Box<dyn ContentStore>>,
    generation: i64,
    /// Identities stamped or touched in the current generation
    produced: HashSet<String>,
    /// Every identity this process has stamped and not yet swept
    owned: HashSet<String>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    pub fn new() -> Self {
        Self::with_backends(vec![
            Box::new(memory::MemoryStore::new()),
            Box::new(files::FilesStore::new()),
            Box::new(memcached::MemcachedStore::new()),
        ])
    }

    pub fn with_backends(backends: Vec<Box<dyn ContentStore>>) -> Self {
        Self {
            backends,
            generation: 0,
            produced: HashSet::new(),
            owned: HashSet::new(),
        }
    }

    pub fn generation(&self) -> i64 {
        self.generation
    }

    /// Validate backends against the settings and open a new generation
    #[instrument(skip_all)]
    pub async fn check(&mut self, settings: &AgentSettings, cache_hosts: &[String]) {
        // generations never repeat across restarts, persisted records included
        let now = chrono::Utc::now().timestamp_millis();
        self.generation = now.max(self.generation + 1);
        self.produced.clear();
        for backend in self.backends.iter_mut() {
            let enabled = backend.check(settings, cache_hosts).await;
            debug!("Store {} enabled={}", backend.kind().as_str(), enabled);
        }
    }

    fn select(&mut self, kind: StoreKind) -> Option<&mut Box<dyn ContentStore>> {
        let enabled = self
            .backends
            .iter()
            .any(|b| b.kind() == kind && b.enabled());
        let kind = if enabled {
            kind
        } else {
            if kind != StoreKind::Memory {
                warn!("Store {} is disabled, using memory", kind.as_str());
            }
            StoreKind::Memory
        };
        self.backends.iter_mut().find(|b| b.kind() == kind)
    }

    /// Record the artifact in this generation; true when it is new or changed
    pub async fn check_update(&mut self, kind: StoreKind, artifact: &Artifact) -> bool {
        let generation = self.generation;
        let identity = artifact.identity();
        self.produced.insert(identity.clone());
        self.owned.insert(identity.clone());
        let Some(backend) = self.select(kind) else {
            warn!("No store backend available for {}", kind.as_str());
            return true;
        };
        let record = artifact.record(backend.kind(), generation);

        let prior = match backend.get(&identity).await {
            Ok(prior) => prior,
            Err(e) => {
                warn!("{}", SurokError::backend(backend.kind().as_str(), format!("{:#}", e)));
                None
            }
        };
        let changed = prior.map(|p| p.hash != record.hash).unwrap_or(true);

        if let Err(e) = backend.set(&identity, &record).await {
            warn!("{}", SurokError::backend(backend.kind().as_str(), format!("{:#}", e)));
        }
        changed
    }

    /// Carry an existing record into this generation without changing its hash
    pub async fn touch(&mut self, kind: StoreKind, identity: &str) {
        let generation = self.generation;
        self.produced.insert(identity.to_string());
        let Some(backend) = self.select(kind) else {
            return;
        };
        let result = match backend.get(identity).await {
            Ok(Some(mut record)) => {
                record.generation = generation;
                backend.set(identity, &record).await
            }
            Ok(None) => Ok(()),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!("{}", SurokError::backend(backend.kind().as_str(), format!("{:#}", e)));
        }
    }

    /// Drop a record so the artifact counts as changed next cycle
    pub async fn invalidate(&mut self, kind: StoreKind, identity: &str) {
        let Some(backend) = self.select(kind) else {
            return;
        };
        if let Err(e) = backend.delete(identity).await {
            warn!("{}", SurokError::backend(backend.kind().as_str(), format!("{:#}", e)));
        }
    }

    /// Look up a record in the backend `kind` resolves to
    pub async fn get(&mut self, kind: StoreKind, identity: &str) -> Option<StoreRecord> {
        let backend = self.select(kind)?;
        match backend.get(identity).await {
            Ok(record) => record,
            Err(e) => {
                warn!("{}", SurokError::backend(backend.kind().as_str(), format!("{:#}", e)));
                None
            }
        }
    }

    /// Delete every record not produced in the current generation and return them
    ///
    /// A stale record whose identity was produced this generation through
    /// another backend is deleted but not returned, since the artifact is live.
    #[instrument(skip_all)]
    pub async fn clear(&mut self) -> Vec<StoreRecord> {
        let generation = self.generation;
        let mut swept = Vec::new();
        for backend in self.backends.iter_mut().filter(|b| b.enabled()) {
            let shared = backend.shared();
            let keys = match backend.keys().await {
                Ok(keys) => keys,
                Err(e) => {
                    warn!("{}", SurokError::backend(backend.kind().as_str(), format!("{:#}", e)));
                    continue;
                }
            };
            for identity in keys {
                let live = self.produced.contains(&identity);
                if shared && (live || !self.owned.contains(&identity)) {
                    continue;
                }
                let record = match backend.get(&identity).await {
                    Ok(Some(record)) => record,
                    Ok(None) => continue,
                    Err(e) => {
                        warn!("{}", SurokError::backend(backend.kind().as_str(), format!("{:#}", e)));
                        continue;
                    }
                };
                if record.generation == generation {
                    continue;
                }
                match backend.delete(&identity).await {
                    Ok(()) if live => {
                        debug!(
                            "Dropped stale {} record {}, tracked in another store",
                            backend.kind().as_str(),
                            identity
                        );
                    }
                    Ok(()) => {
                        self.owned.remove(&identity);
                        info!(
                            "Swept {} record {}",
                            backend.kind().as_str(),
                            record.dest.as_deref().or(record.env.as_deref()).unwrap_or(&identity)
                        );
                        swept.push(record);
                    }
                    Err(e) => warn!(
                        "{}",
                        SurokError::backend(backend.kind().as_str(), format!("{:#}", e))
                    ),
                }
            }
        }
        swept
    }
}
