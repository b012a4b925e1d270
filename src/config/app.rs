//! Application declarations
//!
//! Each file in the declarations directory describes one application: the
//! services it depends on, the file and environment artifacts rendered from
//! the discovered topology, and how to reload it. Declarations are rebuilt
//! from scratch every cycle.
//!
//! # Examples
//!
//! ```json
//! {
//!   "services": [
//!     {"name": "zzy0", "tcp": ["tname_aa", "tname_ab"]},
//!     {"name": "zzz1", "group": "backend*"}
//!   ],
//!   "files": {"/etc/app/upstream.conf": "{{ mod.from_file('/usr/share/app/upstream.j2') }}"},
//!   "environments": {"UPSTREAM": "{{ my.services.zzy0[0].name }}"},
//!   "reload_cmd": "/usr/bin/killall -HUP app",
//!   "discovery": "mesos_dns"
//! }
//! ```

use super::group::resolve_group;
use super::normalize::{ConfigTree, Normalizer};
use super::schema::{ScalarType, SchemaNode};
use super::{read_source_file, AgentSettings, DiscoveryKind, SchemaVersion, StoreKind};
use crate::error::SurokError;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, error};

/// Schema of one application declaration
pub fn app_schema() -> SchemaNode {
    SchemaNode::object([
        ("conf_name", SchemaNode::string()),
        (
            "services",
            SchemaNode::object_list([
                ("name", SchemaNode::string()),
                ("ports", SchemaNode::list(ScalarType::String)),
                ("tcp", SchemaNode::list(ScalarType::String)),
                ("udp", SchemaNode::list(ScalarType::String)),
                ("discovery", SchemaNode::string()),
                ("group", SchemaNode::string().group_path()),
            ])
            .default_value(json!([])),
        ),
        (
            "files",
            SchemaNode::any_keys(SchemaNode::string()).default_value(json!({})),
        ),
        (
            "environments",
            SchemaNode::any_keys(SchemaNode::string()).default_value(json!({})),
        ),
        ("reload_cmd", SchemaNode::string()),
        (
            "discovery",
            SchemaNode::string().allowed(DiscoveryKind::ALL),
        ),
        ("store", SchemaNode::string().allowed(StoreKind::ALL)),
        ("group", SchemaNode::string().group_path()),
        ("template", SchemaNode::string()),
        ("dest", SchemaNode::string()),
    ])
}

/// One service an application depends on
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceDeclaration {
    pub name: String,
    /// Resolved absolute group path
    pub group: String,
    #[serde(default)]
    pub tcp: Vec<String>,
    #[serde(default)]
    pub udp: Vec<String>,
    /// Port names declared with the legacy `ports` key
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<String>,
    /// Discovery backend override for this service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discovery: Option<String>,
}

impl ServiceDeclaration {
    /// Whether the service restricts which port names it wants
    pub fn has_named_ports(&self) -> bool {
        !self.tcp.is_empty() || !self.udp.is_empty()
    }

    /// Declared only through the legacy `ports` key
    pub fn is_flat_ports(&self) -> bool {
        !self.ports.is_empty() && self.tcp == self.ports && self.udp.is_empty()
    }

    /// Port names requested for a protocol
    pub fn port_names(&self, protocol: &str) -> &[String] {
        match protocol {
            "udp" => &self.udp,
            _ => &self.tcp,
        }
    }
}

/// One application's normalized declaration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppDeclaration {
    pub conf_name: String,
    #[serde(default)]
    pub services: Vec<ServiceDeclaration>,
    /// Destination path to template source
    #[serde(default)]
    pub files: BTreeMap<String, String>,
    /// Variable name to template source
    #[serde(default)]
    pub environments: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reload_cmd: Option<String>,
    #[serde(default)]
    pub discovery: DiscoveryKind,
    #[serde(default)]
    pub store: StoreKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(skip)]
    pub tree: ConfigTree,
}

impl AppDeclaration {
    /// Normalize a declaration object against the agent settings
    pub fn from_value(
        input: &Value,
        conf_name: Option<&str>,
        normalizer: &Normalizer,
        settings: &AgentSettings,
    ) -> Result<Self> {
        let normalized = normalizer.normalize(&app_schema(), None, input);
        let mut tree = normalized.tree;
        resolve_app_group(&mut tree, settings);
        apply_defaults(&mut tree, settings);
        fold_legacy_template(&mut tree);
        resolve_services(&mut tree, settings.version);

        if tree.get(&["conf_name"]).is_none() {
            if let Some(name) = conf_name {
                tree.set(&["conf_name"], json!(name));
            }
        }
        if tree.get(&["conf_name"]).is_none() {
            return Err(SurokError::validation("conf_name", "declaration has no name").into());
        }

        let mut declaration: AppDeclaration = serde_json::from_value(tree.to_value())
            .context("Declaration does not match the application layout")?;
        declaration.tree = tree;
        Ok(declaration)
    }

    /// Load a declaration file; `conf_name` falls back to the file name
    pub fn from_file(
        path: &Path,
        normalizer: &Normalizer,
        settings: &AgentSettings,
    ) -> Result<Self> {
        let value = read_source_file(path)?;
        let file_name = path.file_name().and_then(|n| n.to_str());
        Self::from_value(&value, file_name, normalizer, settings)
            .with_context(|| format!("Invalid declaration {}", path.display()))
    }

    pub fn hash(&self) -> String {
        self.tree.hash()
    }

    pub fn dump(&self) -> String {
        self.tree.dump()
    }
}

/// Load every regular file in `dir` as a declaration keyed by `conf_name`.
///
/// Unreadable or invalid files are logged and skipped.
pub fn discover_applications(
    dir: &Path,
    normalizer: &Normalizer,
    settings: &AgentSettings,
) -> BTreeMap<String, AppDeclaration> {
    let mut apps = BTreeMap::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            let issue = SurokError::Io {
                path: dir.to_path_buf(),
                source: e,
            };
            error!("Declarations directory unavailable: {}", issue);
            return apps;
        }
    };

    let mut paths: Vec<_> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file())
        .collect();
    paths.sort();

    for path in paths {
        match AppDeclaration::from_file(&path, normalizer, settings) {
            Ok(app) => {
                debug!("Loaded declaration {} from {}", app.conf_name, path.display());
                apps.insert(app.conf_name.clone(), app);
            }
            Err(e) => error!("Skipping declaration {}: {:#}", path.display(), e),
        }
    }
    apps
}

fn resolve_app_group(tree: &mut ConfigTree, settings: &AgentSettings) {
    let own = tree.get(&["group"]).and_then(Value::as_str).map(str::to_string);
    let Some(own) = own else {
        return;
    };
    match resolve_group(settings.defaults.group.as_deref(), Some(&own)) {
        Some(group) => tree.set(&["group"], json!(group)),
        None => {
            tree.remove(&["group"]);
        }
    }
}

fn apply_defaults(tree: &mut ConfigTree, settings: &AgentSettings) {
    if tree.get(&["discovery"]).is_none() {
        tree.set(&["discovery"], json!(settings.defaults.discovery.as_str()));
    }
    if tree.get(&["store"]).is_none() {
        tree.set(&["store"], json!(settings.defaults.store.as_str()));
    }
    if tree.get(&["group"]).is_none() {
        if let Some(group) = &settings.defaults.group {
            tree.set(&["group"], json!(group));
        }
    }
}

/// Fold the single-file `template` + `dest` pair into `files`
fn fold_legacy_template(tree: &mut ConfigTree) {
    let dest = tree.get(&["dest"]).and_then(Value::as_str).map(str::to_string);
    let template = tree
        .get(&["template"])
        .and_then(Value::as_str)
        .map(str::to_string);
    if let (Some(dest), Some(template)) = (dest, template) {
        tree.set(
            &["files", dest.as_str()],
            json!(format!(
                "{{{{ mod.template(mod.from_file(\"{}\")) }}}}",
                template
            )),
        );
    }
}

fn resolve_services(tree: &mut ConfigTree, version: SchemaVersion) {
    let app_group = tree.get(&["group"]).and_then(Value::as_str).map(str::to_string);
    let services = match tree.get(&["services"]) {
        Some(Value::Array(services)) => services.clone(),
        _ => Vec::new(),
    };

    let mut resolved = Vec::with_capacity(services.len());
    for service in services {
        let Value::Object(mut service) = service else {
            continue;
        };
        let Some(name) = service.get("name").and_then(Value::as_str).map(str::to_string) else {
            error!("{}", SurokError::validation("services.name", "service has no name"));
            continue;
        };
        let own = service.get("group").and_then(Value::as_str);
        let Some(group) = resolve_group(app_group.as_deref(), own) else {
            error!(
                "{}",
                SurokError::validation(
                    format!("services.{}.group", name),
                    "no group can be resolved"
                )
            );
            continue;
        };
        service.insert("group".to_string(), json!(group));
        append_ports(&mut service, version);
        resolved.push(Value::Object(service));
    }
    tree.set(&["services"], Value::Array(resolved));
}

fn append_ports(service: &mut Map<String, Value>, version: SchemaVersion) {
    let ports = match service.get("ports") {
        Some(Value::Array(ports)) => ports.clone(),
        _ => Vec::new(),
    };
    if !service.contains_key("ports") && version != SchemaVersion::Legacy {
        return;
    }
    let tcp = service
        .entry("tcp".to_string())
        .or_insert_with(|| Value::Array(Vec::new()));
    if let Value::Array(tcp) = tcp {
        tcp.extend(ports);
    }
}
