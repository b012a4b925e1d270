//! Agent configuration
//!
//! The agent's own settings are described by a declarative schema and
//! normalized by [`normalize::Normalizer`]. Raw sources (a file path or an
//! in-memory object) are applied in order onto an environment-augmented
//! default tree; the result is exposed both as a [`ConfigTree`] and as the
//! typed [`AgentSettings`] view.
//!
//! # Examples
//!
//! **JSON Format:**
//! ```json
//! {
//!   "version": "0.8",
//!   "confd": "/etc/surok/conf.d",
//!   "wait_time": 20,
//!   "defaults": {
//!     "discovery": "mesos_dns",
//!     "store": "memory",
//!     "group": "xxx.yyy"
//!   },
//!   "mesos": {
//!     "enabled": true,
//!     "domain": "marathon.mesos"
//!   }
//! }
//! ```
//!
//! **YAML Format:**
//! ```yaml
//! version: "0.8"
//! confd: /etc/surok/conf.d
//! defaults:
//!   discovery: marathon_api
//! marathon:
//!   enabled: true
//!   host: http://marathon.mesos:8080
//! ```

pub mod app;
pub mod group;
pub mod normalize;
pub mod schema;

pub use app::{discover_applications, AppDeclaration, ServiceDeclaration};
pub use normalize::{ConfigTree, Environ, Normalized, Normalizer, SideEffects};
pub use schema::{ScalarType, SchemaNode};

use crate::error::SurokError;
use crate::logging::SET_LOG_LEVEL;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, error, warn};

/// Environment variable overriding the DNS discovery domain
pub const ENV_MESOS_DOMAIN: &str = "SUROK_MESOS_DOMAIN";
/// Environment variable overriding the default discovery group
pub const ENV_DISCOVERY_GROUP: &str = "SUROK_DISCOVERY_GROUP";
/// Environment variable overriding the log level
pub const ENV_LOGLEVEL: &str = "SUROK_LOGLEVEL";
/// Application id the orchestrator hands to the running container
pub const ENV_MARATHON_APP_ID: &str = "MARATHON_APP_ID";

/// Declaration wire format generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SchemaVersion {
    #[default]
    #[serde(rename = "0.7")]
    Legacy,
    #[serde(rename = "0.8")]
    Current,
}

impl SchemaVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchemaVersion::Legacy => "0.7",
            SchemaVersion::Current => "0.8",
        }
    }
}

/// Discovery backend selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryKind {
    #[default]
    None,
    MesosDns,
    MarathonApi,
}

impl DiscoveryKind {
    pub const ALL: [&'static str; 3] = ["none", "mesos_dns", "marathon_api"];

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "none" => Some(DiscoveryKind::None),
            "mesos_dns" => Some(DiscoveryKind::MesosDns),
            "marathon_api" => Some(DiscoveryKind::MarathonApi),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DiscoveryKind::None => "none",
            DiscoveryKind::MesosDns => "mesos_dns",
            DiscoveryKind::MarathonApi => "marathon_api",
        }
    }
}

/// Store backend selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    #[default]
    Memory,
    Files,
    Memcached,
}

impl StoreKind {
    pub const ALL: [&'static str; 3] = ["memory", "files", "memcached"];

    pub fn as_str(&self) -> &'static str {
        match self {
            StoreKind::Memory => "memory",
            StoreKind::Files => "files",
            StoreKind::Memcached => "memcached",
        }
    }
}

/// Agent-wide defaults inherited by every declaration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DefaultsSection {
    #[serde(default)]
    pub discovery: DiscoveryKind,
    #[serde(default)]
    pub store: StoreKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
}

/// DNS-SRV discovery settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MesosSection {
    #[serde(default = "default_domain")]
    pub domain: String,
    #[serde(default)]
    pub enabled: bool,
}

impl Default for MesosSection {
    fn default() -> Self {
        Self {
            domain: default_domain(),
            enabled: false,
        }
    }
}

/// Orchestrator API settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarathonSection {
    #[serde(default = "default_marathon_host")]
    pub host: String,
    #[serde(default)]
    pub enabled: bool,
    /// Restart this agent's own container instead of running `reload_cmd`
    #[serde(default)]
    pub restart: bool,
    #[serde(default = "default_true")]
    pub force: bool,
}

impl Default for MarathonSection {
    fn default() -> Self {
        Self {
            host: default_marathon_host(),
            enabled: false,
            restart: false,
            force: true,
        }
    }
}

/// Discovery of the cache service itself
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheDiscoverySection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
}

/// Distributed cache store settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemcachedSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub discovery: CacheDiscoverySection,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hosts: Option<Vec<String>>,
}

impl MemcachedSection {
    /// Configured cache hosts, `hosts` taking precedence over `host`
    pub fn configured_hosts(&self) -> Vec<String> {
        match (&self.hosts, &self.host) {
            (Some(hosts), _) if !hosts.is_empty() => hosts.clone(),
            (_, Some(host)) => vec![host.clone()],
            _ => Vec::new(),
        }
    }
}

/// Filesystem store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilesSection {
    #[serde(default = "default_files_path")]
    pub path: PathBuf,
    #[serde(default)]
    pub enabled: bool,
}

impl Default for FilesSection {
    fn default() -> Self {
        Self {
            path: default_files_path(),
            enabled: false,
        }
    }
}

/// Typed view of the normalized agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSettings {
    #[serde(default)]
    pub defaults: DefaultsSection,
    #[serde(default)]
    pub mesos: MesosSection,
    #[serde(default)]
    pub marathon: MarathonSection,
    #[serde(default)]
    pub memcached: MemcachedSection,
    #[serde(default)]
    pub files: FilesSection,
    #[serde(default = "default_confd")]
    pub confd: PathBuf,
    #[serde(default = "default_modules")]
    pub modules: PathBuf,
    #[serde(default = "default_wait_time")]
    pub wait_time: u64,
    #[serde(default = "default_loglevel")]
    pub loglevel: String,
    #[serde(default)]
    pub version: SchemaVersion,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            defaults: DefaultsSection::default(),
            mesos: MesosSection::default(),
            marathon: MarathonSection::default(),
            memcached: MemcachedSection::default(),
            files: FilesSection::default(),
            confd: default_confd(),
            modules: default_modules(),
            wait_time: default_wait_time(),
            loglevel: default_loglevel(),
            version: SchemaVersion::default(),
            lock_dir: None,
            domain: None,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_domain() -> String {
    "marathon.mesos".to_string()
}

fn default_marathon_host() -> String {
    "http://marathon.mesos:8080".to_string()
}

fn default_files_path() -> PathBuf {
    PathBuf::from("/var/tmp")
}

fn default_confd() -> PathBuf {
    PathBuf::from("/etc/surok/conf.d")
}

fn default_modules() -> PathBuf {
    PathBuf::from("/opt/surok/modules")
}

fn default_wait_time() -> u64 {
    20
}

fn default_loglevel() -> String {
    "info".to_string()
}

/// Schema of the agent configuration
pub fn agent_schema() -> SchemaNode {
    SchemaNode::object([
        (
            "marathon",
            SchemaNode::object([
                ("force", SchemaNode::boolean().default_value(true)),
                (
                    "host",
                    SchemaNode::string().default_value(default_marathon_host()),
                ),
                ("enabled", SchemaNode::boolean().default_value(false)),
                ("restart", SchemaNode::boolean().default_value(false)),
            ]),
        ),
        (
            "mesos",
            SchemaNode::object([
                (
                    "domain",
                    SchemaNode::string()
                        .default_value(default_domain())
                        .env(ENV_MESOS_DOMAIN),
                ),
                ("enabled", SchemaNode::boolean().default_value(false)),
            ]),
        ),
        (
            "files",
            SchemaNode::object([
                ("path", SchemaNode::string().default_value("/var/tmp").directory()),
                ("enabled", SchemaNode::boolean().default_value(false)),
            ]),
        ),
        (
            "memcached",
            SchemaNode::object([
                ("enabled", SchemaNode::boolean().default_value(false)),
                (
                    "discovery",
                    SchemaNode::object([
                        ("enabled", SchemaNode::boolean().default_value(false)),
                        ("service", SchemaNode::string()),
                        ("group", SchemaNode::string().group_path()),
                    ]),
                ),
                ("host", SchemaNode::string()),
                ("hosts", SchemaNode::list(ScalarType::String)),
            ]),
        ),
        (
            "defaults",
            SchemaNode::object([
                (
                    "discovery",
                    SchemaNode::string()
                        .default_value("none")
                        .allowed(DiscoveryKind::ALL),
                ),
                (
                    "store",
                    SchemaNode::string()
                        .default_value("memory")
                        .allowed(StoreKind::ALL),
                ),
                (
                    "group",
                    SchemaNode::string().group_path().env(ENV_DISCOVERY_GROUP),
                ),
            ]),
        ),
        (
            "version",
            SchemaNode::string().default_value("0.7").allowed(["0.7", "0.8"]),
        ),
        (
            "confd",
            SchemaNode::string()
                .default_value("/etc/surok/conf.d")
                .directory(),
        ),
        (
            "modules",
            SchemaNode::string()
                .default_value("/opt/surok/modules")
                .directory(),
        ),
        ("wait_time", SchemaNode::integer().non_negative().default_value(20)),
        ("lock_dir", SchemaNode::string().directory()),
        (
            "loglevel",
            SchemaNode::string()
                .default_value("info")
                .side_effect(SET_LOG_LEVEL)
                .env(ENV_LOGLEVEL),
        ),
        ("domain", SchemaNode::string()),
    ])
}

/// A raw configuration input
#[derive(Debug, Clone)]
pub enum ConfigSource {
    File(PathBuf),
    Value(Value),
}

/// Parse a configuration file by extension (JSON unless `.yml`, `.yaml` or `.toml`)
pub fn read_source_file(path: &Path) -> Result<Value> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let value = match path.extension().and_then(|e| e.to_str()) {
        Some("yml") | Some("yaml") => serde_yaml::from_str::<Value>(&contents)
            .with_context(|| format!("Failed to parse YAML config {}", path.display()))?,
        Some("toml") => {
            let table: toml::Value = toml::from_str(&contents)
                .with_context(|| format!("Failed to parse TOML config {}", path.display()))?;
            serde_json::to_value(table)?
        }
        _ => serde_json::from_str::<Value>(&contents)
            .with_context(|| format!("Failed to parse JSON config {}", path.display()))?,
    };
    Ok(value)
}

/// Normalized agent configuration
#[derive(Debug, Clone)]
pub struct Config {
    schema: SchemaNode,
    normalizer: Normalizer,
    tree: ConfigTree,
    settings: AgentSettings,
    legacy_migrated: bool,
}

impl Config {
    /// Build the default configuration for the given environment
    pub fn new(normalizer: Normalizer) -> Self {
        let schema = agent_schema();
        let tree = normalizer.default_tree(&schema);
        let mut config = Self {
            schema,
            normalizer,
            tree,
            settings: AgentSettings::default(),
            legacy_migrated: false,
        };
        config.resolve_default_group();
        let _ = config.refresh_settings();
        config
    }

    /// Apply raw sources in order
    pub fn with_sources(normalizer: Normalizer, sources: &[ConfigSource]) -> Self {
        let mut config = Self::new(normalizer);
        for source in sources {
            config.apply(source);
        }
        config
    }

    /// Apply one source; failures to read a file are logged and leave the tree untouched
    pub fn apply(&mut self, source: &ConfigSource) -> Vec<SurokError> {
        match source {
            ConfigSource::File(path) => {
                debug!("Open file {}", path.display());
                match read_source_file(path) {
                    Ok(value) => self.apply_value(&value),
                    Err(e) => {
                        error!("Load config file failed: {:#}", e);
                        Vec::new()
                    }
                }
            }
            ConfigSource::Value(value) => self.apply_value(value),
        }
    }

    /// Merge an in-memory object onto the current tree
    pub fn apply_value(&mut self, input: &Value) -> Vec<SurokError> {
        let Normalized { tree, mut issues } =
            self.normalizer.normalize(&self.schema, Some(&self.tree), input);
        let previous = std::mem::replace(&mut self.tree, tree);
        let migrated = self.legacy_migrated;
        self.migrate_legacy();
        self.resolve_default_group();
        if let Err(issue) = self.refresh_settings() {
            // keep the tree and the typed view in step
            self.tree = previous;
            self.legacy_migrated = migrated;
            issues.push(issue);
        }
        debug!("Conf={}", self.tree.dump());
        issues
    }

    /// Set a key directly, bypassing schema validation
    pub fn set(&mut self, path: &[&str], value: Value) {
        let previous = self.tree.clone();
        self.tree.set(path, value);
        if self.refresh_settings().is_err() {
            self.tree = previous;
        }
    }

    pub fn get(&self, path: &[&str], default: Value) -> Value {
        self.tree.get_or(path, default)
    }

    pub fn tree(&self) -> &ConfigTree {
        &self.tree
    }

    pub fn settings(&self) -> &AgentSettings {
        &self.settings
    }

    pub fn normalizer(&self) -> &Normalizer {
        &self.normalizer
    }

    pub fn normalizer_mut(&mut self) -> &mut Normalizer {
        &mut self.normalizer
    }

    pub fn hash(&self) -> String {
        self.tree.hash()
    }

    pub fn dump(&self) -> String {
        self.tree.dump()
    }

    /// Load every declaration from the configured declarations directory
    pub fn discover_applications(&self) -> BTreeMap<String, AppDeclaration> {
        discover_applications(&self.settings.confd, &self.normalizer, &self.settings)
    }

    /// Hoist legacy flat keys into their nested sections
    fn migrate_legacy(&mut self) {
        if self.tree.get(&["version"]) != Some(&json!(SchemaVersion::Legacy.as_str())) {
            return;
        }
        if let Some(domain) = self.tree.get(&["domain"]).cloned() {
            self.tree
                .set(&["mesos"], json!({"domain": domain, "enabled": true}));
            self.tree
                .set(&["defaults", "discovery"], json!(DiscoveryKind::MesosDns.as_str()));
        }
        if let Some(path) = self.tree.get(&["lock_dir"]).cloned() {
            self.tree.set(&["files"], json!({"path": path, "enabled": true}));
        }
        if !self.legacy_migrated {
            let enabled = self.tree.get_or(&["marathon", "enabled"], json!(false));
            self.tree.set(&["marathon", "restart"], enabled);
            self.legacy_migrated = true;
        }
        self.tree.set(&["marathon", "enabled"], json!(true));
    }

    /// Drop relative default groups, then fall back to the orchestrator app id
    fn resolve_default_group(&mut self) {
        let relative = self
            .tree
            .get(&["defaults", "group"])
            .and_then(Value::as_str)
            .is_some_and(|group| !group::is_absolute(group));
        if relative {
            warn!("Default group must be absolute, ignoring it");
            self.tree.remove(&["defaults", "group"]);
        }
        if self.tree.get(&["defaults", "group"]).is_none() {
            let derived = self
                .normalizer
                .env()
                .get(ENV_MARATHON_APP_ID)
                .and_then(group::group_from_app_id);
            if let Some(group) = derived {
                self.tree.set(&["defaults", "group"], json!(group));
            }
        }
    }

    fn refresh_settings(&mut self) -> Result<(), SurokError> {
        match serde_json::from_value::<AgentSettings>(self.tree.to_value()) {
            Ok(settings) => {
                self.settings = settings;
                Ok(())
            }
            Err(e) => {
                let issue = SurokError::validation("configuration", e.to_string());
                error!("{}", issue);
                Err(issue)
            }
        }
    }
}
