//! Orchestrator API discovery
//!
//! `refresh` fetches the running applications (for their port mapping
//! names) and the running tasks, and keeps both for the cycle. A failed
//! fetch keeps the previous cache. `resolve` matches service masks against
//! application ids and maps each task's allocated ports back to port names
//! through the service port recorded in the application's port mappings.

use super::dns::{DnsResolver, QUERY_TIMEOUT};
use super::{mask, DiscoveryBackend, Endpoint, Topology};
use crate::config::{AgentSettings, DiscoveryKind, MarathonSection, ServiceDeclaration};
use crate::error::SurokError;
use anyhow::{anyhow, Context, Result};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Client timeout for orchestrator API calls
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Deserialize)]
pub struct PortMapping {
    #[serde(rename = "servicePort", alias = "port", default)]
    pub service_port: Option<u16>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_protocol")]
    pub protocol: String,
}

fn default_protocol() -> String {
    "tcp".to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
struct Docker {
    #[serde(rename = "portMappings", default)]
    port_mappings: Option<Vec<PortMapping>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct Container {
    #[serde(default)]
    docker: Option<Docker>,
    #[serde(rename = "portMappings", default)]
    port_mappings: Option<Vec<PortMapping>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MarathonApp {
    pub id: String,
    #[serde(default)]
    container: Option<Container>,
    #[serde(rename = "portDefinitions", default)]
    port_definitions: Option<Vec<PortMapping>>,
}

impl MarathonApp {
    /// Port mappings from the docker section, the container or the port definitions
    pub fn port_mappings(&self) -> &[PortMapping] {
        let container = self.container.as_ref();
        container
            .and_then(|c| c.docker.as_ref())
            .and_then(|d| d.port_mappings.as_deref())
            .or_else(|| container.and_then(|c| c.port_mappings.as_deref()))
            .or(self.port_definitions.as_deref())
            .unwrap_or(&[])
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MarathonTask {
    #[serde(rename = "appId")]
    pub app_id: String,
    pub host: String,
    #[serde(default)]
    pub ports: Vec<u16>,
    #[serde(rename = "servicePorts", default)]
    pub service_ports: Vec<u16>,
}

#[derive(Debug, Deserialize)]
struct AppsResponse {
    apps: Vec<MarathonApp>,
}

#[derive(Debug, Deserialize)]
struct TasksResponse {
    tasks: Vec<MarathonTask>,
}

/// Port name and protocols of one service port
#[derive(Debug, Clone, PartialEq)]
struct NamedPort {
    name: String,
    protocols: Vec<String>,
}

/// Build the HTTP client used for orchestrator calls
pub fn http_client() -> Result<Client> {
    Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .context("Failed to create HTTP client")
}

/// Prefix `http://` when the configured host has no scheme
pub fn base_url(host: &str) -> String {
    let host = host.trim_end_matches('/');
    if host.contains("://") {
        host.to_string()
    } else {
        format!("http://{}", host)
    }
}

/// Ask the orchestrator to restart an application
pub async fn restart_app(client: &Client, marathon: &MarathonSection, app_id: &str) -> Result<()> {
    let url = format!(
        "{}/v2/apps/{}/restart?force={}",
        base_url(&marathon.host),
        app_id.trim_start_matches('/'),
        marathon.force
    );
    info!("Restarting container {}", app_id);
    let response = client
        .post(&url)
        .send()
        .await
        .with_context(|| format!("Restart request to {}", url))?;
    let status = response.status();
    if !status.is_success() {
        return Err(anyhow!("Restart container {} failed with status {}", app_id, status));
    }
    Ok(())
}

pub struct MarathonApi {
    client: Client,
    resolver: Arc<dyn DnsResolver>,
    tasks: Vec<MarathonTask>,
    // app id -> service port -> port name
    ports: HashMap<String, HashMap<u16, NamedPort>>,
}

impl MarathonApi {
    pub fn new(client: Client, resolver: Arc<dyn DnsResolver>) -> Self {
        Self {
            client,
            resolver,
            tasks: Vec::new(),
            ports: HashMap::new(),
        }
    }

    pub fn tasks(&self) -> &[MarathonTask] {
        &self.tasks
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("GET {}", url))?
            .error_for_status()
            .with_context(|| format!("GET {}", url))?;
        response
            .json::<T>()
            .await
            .with_context(|| format!("Failed to decode response from {}", url))
    }

    fn index_ports(apps: &[MarathonApp]) -> HashMap<String, HashMap<u16, NamedPort>> {
        let mut index = HashMap::new();
        for app in apps {
            let mut ports: HashMap<u16, NamedPort> = HashMap::new();
            for mapping in app.port_mappings() {
                let Some(service_port) = mapping.service_port else {
                    continue;
                };
                let name = mapping
                    .name
                    .clone()
                    .unwrap_or_else(|| service_port.to_string());
                let entry = ports.entry(service_port).or_insert_with(|| NamedPort {
                    name,
                    protocols: Vec::new(),
                });
                for protocol in mapping.protocol.split(',') {
                    let protocol = protocol.trim().to_string();
                    if !entry.protocols.contains(&protocol) {
                        entry.protocols.push(protocol);
                    }
                }
            }
            index.insert(app.id.clone(), ports);
        }
        index
    }

    async fn host_ips(&self, host: &str) -> Vec<String> {
        match timeout(QUERY_TIMEOUT, self.resolver.lookup_a(host)).await {
            Ok(Ok(ips)) => ips,
            Ok(Err(e)) => {
                warn!("{}", SurokError::resolution(host, format!("{:#}", e)));
                Vec::new()
            }
            Err(_) => {
                warn!("{}", SurokError::resolution(host, "timed out"));
                Vec::new()
            }
        }
    }

    fn task_endpoint(&self, task: &MarathonTask, service: &ServiceDeclaration) -> Endpoint {
        let index = self.ports.get(&task.app_id);
        let mut endpoint = if service.has_named_ports() {
            Endpoint::named(&task.host)
        } else {
            Endpoint::ordered(&task.host)
        };

        for (port, service_port) in task.ports.iter().zip(task.service_ports.iter()) {
            let fallback;
            let named = match index.and_then(|ports| ports.get(service_port)) {
                Some(named) => named,
                None => {
                    fallback = NamedPort {
                        name: service_port.to_string(),
                        protocols: vec![default_protocol()],
                    };
                    &fallback
                }
            };
            for protocol in &named.protocols {
                if !service.has_named_ports() {
                    if protocol == "tcp" {
                        endpoint.push_ordered(*port);
                    }
                    continue;
                }
                let wanted = service
                    .port_names(protocol)
                    .iter()
                    .any(|pattern| mask::matches(pattern, &named.name));
                if wanted {
                    endpoint.insert_named(protocol, &named.name, *port);
                }
            }
        }
        endpoint
    }
}

#[async_trait::async_trait]
impl DiscoveryBackend for MarathonApi {
    fn kind(&self) -> DiscoveryKind {
        DiscoveryKind::MarathonApi
    }

    fn enabled(&self, settings: &AgentSettings) -> bool {
        settings.marathon.enabled
    }

    async fn refresh(&mut self, settings: &AgentSettings) {
        let base = base_url(&settings.marathon.host);

        match self.get_json::<AppsResponse>(&format!("{}/v2/apps", base)).await {
            Ok(response) => self.ports = Self::index_ports(&response.apps),
            Err(e) => warn!(
                "{}",
                SurokError::resolution(format!("{}/v2/apps", base), format!("{:#}", e))
            ),
        }
        match self.get_json::<TasksResponse>(&format!("{}/v2/tasks", base)).await {
            Ok(response) => self.tasks = response.tasks,
            Err(e) => warn!(
                "{}",
                SurokError::resolution(format!("{}/v2/tasks", base), format!("{:#}", e))
            ),
        }
        debug!(
            "Orchestrator cache holds {} app(s), {} task(s)",
            self.ports.len(),
            self.tasks.len()
        );
    }

    async fn resolve(&self, _settings: &AgentSettings, services: &[ServiceDeclaration]) -> Topology {
        let mut topology = Topology::new();
        for service in services {
            let app_mask = format!("{}{}", service.group, service.name);
            let wildcard = service.name.ends_with('*');
            if !wildcard {
                topology.entry(service.name.clone()).or_default();
            }

            let mut ips: BTreeMap<&str, Vec<String>> = BTreeMap::new();
            for task in self.tasks.iter().filter(|t| mask::matches(&app_mask, &t.app_id)) {
                let mut endpoint = self.task_endpoint(task, service);
                if endpoint.is_empty() {
                    continue;
                }
                if !ips.contains_key(task.host.as_str()) {
                    let resolved = self.host_ips(&task.host).await;
                    ips.insert(&task.host, resolved);
                }
                endpoint.ip = ips.get(task.host.as_str()).cloned().unwrap_or_default();

                let key = if wildcard {
                    task.app_id
                        .rsplit('/')
                        .next()
                        .unwrap_or(&task.app_id)
                        .to_string()
                } else {
                    service.name.clone()
                };
                topology.entry(key).or_default().push(endpoint);
            }
        }
        topology
    }
}
