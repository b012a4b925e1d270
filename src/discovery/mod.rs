//! Service discovery
//!
//! Discovery turns the services declared by an application into concrete
//! endpoints. Each backend implements [`DiscoveryBackend`]; the
//! [`Discovery`] registry picks the backend per service, falls back to the
//! `none` backend when the selected one is disabled or unknown, and shapes
//! the result for the configured declaration generation.
//!
//! Current generation output, one entry per host:
//!
//! ```json
//! {"zzy0": [{"name": "test.zzz1.test", "ip": ["10.0.1.1"], "tcp": {"tname_aa": 12341}}]}
//! ```
//!
//! Legacy generation output, one entry per port, keyed by port name when the
//! service declared port names:
//!
//! ```json
//! {"zzy0": {"tname_aa": [{"name": "test.zzz1.test", "ip": ["10.0.1.1"], "port": "12341"}]}}
//! ```

pub mod dns;
pub mod marathon_api;
pub mod mask;
pub mod mesos_dns;
pub mod none;

use crate::config::{
    AgentSettings, AppDeclaration, Config, DiscoveryKind, SchemaVersion, ServiceDeclaration,
};
use anyhow::Result;
use dns::{DnsResolver, SystemResolver};
use marathon_api::MarathonApi;
use mesos_dns::MesosDns;
use none::NoneBackend;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Ports of one endpoint for one protocol
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PortSet {
    /// Port name to port
    Named(BTreeMap<String, u16>),
    /// Ports in answer order, for services without port names
    Ordered(Vec<u16>),
}

impl PortSet {
    pub fn is_empty(&self) -> bool {
        match self {
            PortSet::Named(ports) => ports.is_empty(),
            PortSet::Ordered(ports) => ports.is_empty(),
        }
    }

    /// Ports paired with their names, if any
    pub fn entries(&self) -> Vec<(Option<&str>, u16)> {
        match self {
            PortSet::Named(ports) => ports
                .iter()
                .map(|(name, port)| (Some(name.as_str()), *port))
                .collect(),
            PortSet::Ordered(ports) => ports.iter().map(|port| (None, *port)).collect(),
        }
    }
}

/// One resolved host of a service
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Endpoint {
    /// Host name
    pub name: String,
    pub ip: Vec<String>,
    #[serde(skip_serializing_if = "PortSet::is_empty")]
    pub tcp: PortSet,
    #[serde(skip_serializing_if = "PortSet::is_empty")]
    pub udp: PortSet,
}

impl Endpoint {
    pub fn named(host: &str) -> Self {
        Self {
            name: host.to_string(),
            ip: Vec::new(),
            tcp: PortSet::Named(BTreeMap::new()),
            udp: PortSet::Named(BTreeMap::new()),
        }
    }

    pub fn ordered(host: &str) -> Self {
        Self {
            name: host.to_string(),
            ip: Vec::new(),
            tcp: PortSet::Ordered(Vec::new()),
            udp: PortSet::Ordered(Vec::new()),
        }
    }

    pub fn insert_named(&mut self, protocol: &str, name: &str, port: u16) {
        let ports = match protocol {
            "udp" => &mut self.udp,
            _ => &mut self.tcp,
        };
        if let PortSet::Named(ports) = ports {
            ports.insert(name.to_string(), port);
        }
    }

    pub fn push_ordered(&mut self, port: u16) {
        if let PortSet::Ordered(ports) = &mut self.tcp {
            ports.push(port);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tcp.is_empty() && self.udp.is_empty()
    }

    /// Address used to reach the first port: first ip, else the host name
    pub fn address(&self) -> &str {
        self.ip.first().map(String::as_str).unwrap_or(&self.name)
    }
}

/// Resolved endpoints keyed by service name
pub type Topology = BTreeMap<String, Vec<Endpoint>>;

#[async_trait::async_trait]
pub trait DiscoveryBackend: Send + Sync {
    fn kind(&self) -> DiscoveryKind;

    fn enabled(&self, settings: &AgentSettings) -> bool;

    /// Reload cached backend data for the coming cycle
    async fn refresh(&mut self, settings: &AgentSettings);

    /// Resolve services; failures degrade to empty or partial results
    async fn resolve(&self, settings: &AgentSettings, services: &[ServiceDeclaration]) -> Topology;
}

/// How a service declared its ports, which decides its result layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServiceShape {
    /// No port names at all
    Unnamed,
    /// Port names given through the flat `ports` list
    Flat,
    ByPortName,
}

impl ServiceShape {
    fn of(service: &ServiceDeclaration) -> Self {
        if !service.has_named_ports() {
            ServiceShape::Unnamed
        } else if service.is_flat_ports() {
            ServiceShape::Flat
        } else {
            ServiceShape::ByPortName
        }
    }
}

/// Registry of discovery backends
pub struct Discovery {
    backends: Vec<Box<dyn DiscoveryBackend>>,
    none: NoneBackend,
}

impl Discovery {
    pub fn new(resolver: Arc<dyn DnsResolver>, client: reqwest::Client) -> Self {
        Self::with_backends(vec![
            Box::new(MesosDns::new(resolver.clone())),
            Box::new(MarathonApi::new(client, resolver)),
        ])
    }

    /// Registry using the host resolver configuration
    pub fn from_system() -> Result<Self> {
        Ok(Self::new(
            Arc::new(SystemResolver::new()),
            marathon_api::http_client()?,
        ))
    }

    pub fn with_backends(backends: Vec<Box<dyn DiscoveryBackend>>) -> Self {
        Self {
            backends,
            none: NoneBackend,
        }
    }

    fn backend(&self, kind: DiscoveryKind) -> Option<&dyn DiscoveryBackend> {
        if kind == DiscoveryKind::None {
            return Some(&self.none);
        }
        self.backends
            .iter()
            .find(|b| b.kind() == kind)
            .map(|b| b.as_ref())
    }

    fn select(
        &self,
        settings: &AgentSettings,
        app: &AppDeclaration,
        service: &ServiceDeclaration,
    ) -> &dyn DiscoveryBackend {
        let name = service
            .discovery
            .as_deref()
            .unwrap_or(app.discovery.as_str());
        match DiscoveryKind::parse(name).and_then(|kind| self.backend(kind)) {
            Some(backend) if backend.enabled(settings) => backend,
            Some(_) => {
                debug!(
                    "Discovery {} disabled for service {}, using none",
                    name, service.name
                );
                &self.none
            }
            None => {
                warn!("Unknown discovery {} for service {}", name, service.name);
                &self.none
            }
        }
    }

    /// Reload declarations, then refresh every enabled backend
    #[instrument(skip_all)]
    pub async fn refresh_all(&mut self, config: &Config) -> BTreeMap<String, AppDeclaration> {
        let apps = config.discover_applications();
        let settings = config.settings();
        for backend in self.backends.iter_mut() {
            if backend.enabled(settings) {
                backend.refresh(settings).await;
            }
        }
        apps
    }

    /// Resolve every service of an application into one topology
    pub async fn resolve_topology(&self, settings: &AgentSettings, app: &AppDeclaration) -> Topology {
        self.resolve_with_shapes(settings, app).await.0
    }

    async fn resolve_with_shapes(
        &self,
        settings: &AgentSettings,
        app: &AppDeclaration,
    ) -> (Topology, BTreeMap<String, ServiceShape>) {
        let mut topology = Topology::new();
        let mut shapes = BTreeMap::new();
        for service in &app.services {
            let backend = self.select(settings, app, service);
            let resolved = backend
                .resolve(settings, std::slice::from_ref(service))
                .await;
            for (key, endpoints) in resolved {
                shapes.insert(key.clone(), ServiceShape::of(service));
                topology.insert(key, endpoints);
            }
        }
        (topology, shapes)
    }

    /// Resolve an application and shape the result for the configured generation
    pub async fn resolve(&self, settings: &AgentSettings, app: &AppDeclaration) -> Value {
        let (topology, shapes) = self.resolve_with_shapes(settings, app).await;
        match settings.version {
            SchemaVersion::Current => current_topology(topology, &shapes),
            SchemaVersion::Legacy => legacy_topology(&topology, &shapes),
        }
    }

    /// `host:port` strings of the discovered cache service, if cache discovery is on
    pub async fn cache_hosts(&self, settings: &AgentSettings) -> Vec<String> {
        let discovery = &settings.memcached.discovery;
        if !discovery.enabled {
            return Vec::new();
        }
        let Some(name) = discovery.service.clone() else {
            warn!("Cache discovery enabled without a service name");
            return Vec::new();
        };
        let Some(group) = discovery
            .group
            .clone()
            .or_else(|| settings.defaults.group.clone())
        else {
            warn!("Cache discovery enabled without a group");
            return Vec::new();
        };
        let backend = match self.backend(DiscoveryKind::MesosDns) {
            Some(backend) if backend.enabled(settings) => backend,
            _ => {
                warn!("Cache discovery needs mesos_dns discovery enabled");
                return Vec::new();
            }
        };

        let service = ServiceDeclaration {
            name: name.clone(),
            group,
            ..Default::default()
        };
        let topology = backend.resolve(settings, &[service]).await;
        let hosts: Vec<String> = topology
            .get(&name)
            .into_iter()
            .flatten()
            .flat_map(|endpoint| {
                endpoint
                    .tcp
                    .entries()
                    .into_iter()
                    .map(move |(_, port)| format!("{}:{}", endpoint.address(), port))
            })
            .collect();
        debug!("Discovered cache hosts: {:?}", hosts);
        hosts
    }
}

fn legacy_entry(endpoint: &Endpoint, port: u16) -> Value {
    json!({
        "name": endpoint.name,
        "ip": endpoint.ip,
        "port": port.to_string(),
    })
}

/// Services without port names have no current-layout entries
fn current_topology(mut topology: Topology, shapes: &BTreeMap<String, ServiceShape>) -> Value {
    for (service, endpoints) in topology.iter_mut() {
        if shapes.get(service) == Some(&ServiceShape::Unnamed) {
            endpoints.clear();
        }
    }
    serde_json::to_value(&topology).unwrap_or_default()
}

/// Convert a topology into the legacy per-port layout
fn legacy_topology(topology: &Topology, shapes: &BTreeMap<String, ServiceShape>) -> Value {
    let mut result = Map::new();
    for (service, endpoints) in topology {
        let shape = shapes.get(service).copied().unwrap_or(ServiceShape::Unnamed);
        let value = match shape {
            ServiceShape::Unnamed | ServiceShape::Flat => Value::Array(
                endpoints
                    .iter()
                    .flat_map(|endpoint| {
                        let mut ports = endpoint.tcp.entries();
                        ports.extend(endpoint.udp.entries());
                        ports
                            .into_iter()
                            .map(move |(_, port)| legacy_entry(endpoint, port))
                    })
                    .collect(),
            ),
            ServiceShape::ByPortName => {
                let mut by_name: BTreeMap<String, Vec<Value>> = BTreeMap::new();
                for endpoint in endpoints {
                    for ports in [&endpoint.tcp, &endpoint.udp] {
                        for (name, port) in ports.entries() {
                            let name = name.map(str::to_string).unwrap_or_else(|| port.to_string());
                            by_name
                                .entry(name)
                                .or_default()
                                .push(legacy_entry(endpoint, port));
                        }
                    }
                }
                json!(by_name)
            }
        };
        result.insert(service.clone(), value);
    }
    Value::Object(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Environ, Normalizer};
    use crate::logging;
    use dns::StaticResolver;

    fn resolver() -> StaticResolver {
        let mut resolver = StaticResolver::new();
        resolver.add_srv("_tname_aa._zzz0.xxx.yyy._tcp.marathon.mesos", "test.zzz0.test", 12341);
        resolver.add_srv("_tname_bb._zzz0.xxx.yyy._tcp.marathon.mesos", "test.zzz0.test", 12374);
        resolver.add_srv("_zzz1.xxx.yyy._tcp.marathon.mesos", "test.zzz3.test", 12341);
        resolver.add_srv("_zzz1.xxx.yyy._tcp.marathon.mesos", "test.zzz3.test", 12352);
        resolver.add_srv("_memcached.system._tcp.marathon.mesos", "localhost", 11211);
        resolver.add_a("test.zzz0.test", &["10.0.0.1", "10.1.0.1"]);
        resolver.add_a("test.zzz3.test", &["10.0.3.1", "10.1.3.1"]);
        resolver.add_a("localhost", &["127.0.0.1"]);
        resolver
    }

    fn discovery() -> Discovery {
        Discovery::new(
            Arc::new(resolver()),
            marathon_api::http_client().unwrap(),
        )
    }

    fn config(input: Value) -> Config {
        let normalizer = Normalizer::new(Environ::default(), logging::side_effects(None));
        let mut config = Config::new(normalizer);
        config.apply_value(&input);
        config
    }

    fn app(config: &Config) -> AppDeclaration {
        AppDeclaration::from_value(
            &json!({"services": [
                {"name": "zzz0", "tcp": ["tname_aa", "tname_bb"]},
                {"name": "zzz1"}
            ]}),
            Some("self_check.json"),
            config.normalizer(),
            config.settings(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_legacy_layout() {
        let config = config(json!({
            "version": "0.7",
            "domain": "marathon.mesos",
            "defaults": {"group": "xxx.yyy"}
        }));
        let result = discovery().resolve(config.settings(), &app(&config)).await;
        assert_eq!(
            result["zzz0"]["tname_aa"],
            json!([{"name": "test.zzz0.test", "ip": ["10.0.0.1", "10.1.0.1"], "port": "12341"}])
        );
        assert_eq!(result["zzz0"]["tname_bb"][0]["port"], json!("12374"));
        assert_eq!(
            result["zzz1"],
            json!([
                {"name": "test.zzz3.test", "ip": ["10.0.3.1", "10.1.3.1"], "port": "12341"},
                {"name": "test.zzz3.test", "ip": ["10.0.3.1", "10.1.3.1"], "port": "12352"}
            ])
        );
    }

    #[tokio::test]
    async fn test_current_layout() {
        let config = config(json!({
            "version": "0.8",
            "mesos": {"enabled": true},
            "defaults": {"group": "xxx.yyy", "discovery": "mesos_dns"}
        }));
        let result = discovery().resolve(config.settings(), &app(&config)).await;
        assert_eq!(
            result["zzz0"],
            json!([{
                "name": "test.zzz0.test",
                "ip": ["10.0.0.1", "10.1.0.1"],
                "tcp": {"tname_aa": 12341, "tname_bb": 12374}
            }])
        );
        assert_eq!(result["zzz1"], json!([]));
    }

    #[tokio::test]
    async fn test_disabled_backend_falls_back_to_none() {
        let config = config(json!({
            "version": "0.8",
            "defaults": {"group": "xxx.yyy", "discovery": "mesos_dns"}
        }));
        let result = discovery().resolve(config.settings(), &app(&config)).await;
        assert_eq!(result, json!({}));
    }

    #[tokio::test]
    async fn test_service_override_selects_backend() {
        let config = config(json!({
            "version": "0.8",
            "mesos": {"enabled": true},
            "defaults": {"group": "xxx.yyy"}
        }));
        let app = AppDeclaration::from_value(
            &json!({"services": [
                {"name": "zzz1", "discovery": "mesos_dns"},
                {"name": "zzz0", "tcp": ["tname_aa"]},
                {"name": "zzz0b", "discovery": "consul"}
            ]}),
            Some("override.json"),
            config.normalizer(),
            config.settings(),
        )
        .unwrap();
        let topology = discovery().resolve_topology(config.settings(), &app).await;
        assert_eq!(topology.len(), 1);
        assert_eq!(topology["zzz1"].len(), 1);
    }

    #[tokio::test]
    async fn test_cache_hosts() {
        let config = config(json!({
            "version": "0.8",
            "mesos": {"enabled": true},
            "memcached": {
                "enabled": true,
                "discovery": {"enabled": true, "service": "memcached", "group": "system"}
            }
        }));
        let hosts = discovery().cache_hosts(config.settings()).await;
        assert_eq!(hosts, vec!["127.0.0.1:11211"]);

        let disabled = self::config(json!({"version": "0.8"}));
        assert!(discovery().cache_hosts(disabled.settings()).await.is_empty());
    }
}
