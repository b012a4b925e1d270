//! DNS-SRV discovery
//!
//! Services are looked up with SRV queries built from the service name, the
//! requested port names, the service group and the configured domain:
//!
//! - named port: `_<port>._<service>.<labels>._<proto>.<domain>`
//! - no port names: `_<service>.<labels>._tcp.<domain>`
//!
//! Every distinct SRV target of a service is then resolved once with an A
//! query. A failed or timed out query counts as zero answers.

use super::dns::{DnsResolver, SrvAnswer, QUERY_TIMEOUT};
use super::{DiscoveryBackend, Endpoint, Topology};
use crate::config::group::group_to_labels;
use crate::config::{AgentSettings, DiscoveryKind, ServiceDeclaration};
use crate::error::SurokError;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::time::timeout;
use tracing::{debug, warn};

pub struct MesosDns {
    resolver: Arc<dyn DnsResolver>,
}

impl MesosDns {
    pub fn new(resolver: Arc<dyn DnsResolver>) -> Self {
        Self { resolver }
    }

    async fn query_srv(&self, name: &str) -> Vec<SrvAnswer> {
        match timeout(QUERY_TIMEOUT, self.resolver.lookup_srv(name)).await {
            Ok(Ok(answers)) => answers,
            Ok(Err(e)) => {
                warn!("{}", SurokError::resolution(name, format!("{:#}", e)));
                Vec::new()
            }
            Err(_) => {
                warn!("{}", SurokError::resolution(name, "timed out"));
                Vec::new()
            }
        }
    }

    async fn query_a(&self, name: &str) -> Vec<String> {
        match timeout(QUERY_TIMEOUT, self.resolver.lookup_a(name)).await {
            Ok(Ok(ips)) => ips,
            Ok(Err(e)) => {
                warn!("{}", SurokError::resolution(name, format!("{:#}", e)));
                Vec::new()
            }
            Err(_) => {
                warn!("{}", SurokError::resolution(name, "timed out"));
                Vec::new()
            }
        }
    }

    async fn resolve_service(&self, domain: &str, service: &ServiceDeclaration) -> Vec<Endpoint> {
        let labels = group_to_labels(&service.group);
        // host name -> endpoint, ip filled in afterwards
        let mut hosts: BTreeMap<String, Endpoint> = BTreeMap::new();

        if service.has_named_ports() {
            for protocol in ["tcp", "udp"] {
                for port_name in service.port_names(protocol) {
                    let name = srv_name(
                        &[port_name.as_str(), service.name.as_str()],
                        &labels,
                        protocol,
                        domain,
                    );
                    for answer in self.query_srv(&name).await {
                        hosts
                            .entry(answer.target.clone())
                            .or_insert_with(|| Endpoint::named(&answer.target))
                            .insert_named(protocol, port_name, answer.port);
                    }
                }
            }
        } else {
            let name = srv_name(&[service.name.as_str()], &labels, "tcp", domain);
            for answer in self.query_srv(&name).await {
                hosts
                    .entry(answer.target.clone())
                    .or_insert_with(|| Endpoint::ordered(&answer.target))
                    .push_ordered(answer.port);
            }
        }

        let mut endpoints = Vec::with_capacity(hosts.len());
        for (host, mut endpoint) in hosts {
            endpoint.ip = self.query_a(&host).await;
            endpoints.push(endpoint);
        }
        endpoints
    }
}

/// Build an SRV query name, skipping empty label sets
pub fn srv_name(names: &[&str], labels: &str, protocol: &str, domain: &str) -> String {
    let mut parts: Vec<String> = names.iter().map(|n| format!("_{}", n)).collect();
    if !labels.is_empty() {
        parts.push(labels.to_string());
    }
    parts.push(format!("_{}", protocol));
    parts.push(domain.to_string());
    parts.join(".")
}

#[async_trait::async_trait]
impl DiscoveryBackend for MesosDns {
    fn kind(&self) -> DiscoveryKind {
        DiscoveryKind::MesosDns
    }

    fn enabled(&self, settings: &AgentSettings) -> bool {
        settings.mesos.enabled
    }

    async fn refresh(&mut self, _settings: &AgentSettings) {}

    async fn resolve(&self, settings: &AgentSettings, services: &[ServiceDeclaration]) -> Topology {
        let mut topology = Topology::new();
        for service in services {
            let endpoints = self.resolve_service(&settings.mesos.domain, service).await;
            debug!(
                "Service {} resolved to {} endpoint(s)",
                service.name,
                endpoints.len()
            );
            topology.insert(service.name.clone(), endpoints);
        }
        topology
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::dns::StaticResolver;
    use crate::discovery::PortSet;

    fn service(name: &str, tcp: &[&str]) -> ServiceDeclaration {
        ServiceDeclaration {
            name: name.to_string(),
            group: "/yyy/xxx/".to_string(),
            tcp: tcp.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    fn settings() -> AgentSettings {
        let mut settings = AgentSettings::default();
        settings.mesos.enabled = true;
        settings
    }

    fn resolver() -> StaticResolver {
        let mut resolver = StaticResolver::new();
        resolver.add_srv("_tname_aa._zzz0.xxx.yyy._tcp.marathon.mesos", "test.zzz0.test.", 12341);
        resolver.add_srv("_tname_bb._zzz0.xxx.yyy._tcp.marathon.mesos", "test.zzz0.test.", 12374);
        resolver.add_srv("_zzz1.xxx.yyy._tcp.marathon.mesos", "test.zzz3.test", 12341);
        resolver.add_srv("_zzz1.xxx.yyy._tcp.marathon.mesos", "test.zzz3.test", 12352);
        resolver.add_a("test.zzz0.test", &["10.0.0.1", "10.1.0.1"]);
        resolver.add_a("test.zzz3.test", &["10.0.3.1", "10.1.3.1"]);
        resolver
    }

    #[test]
    fn test_srv_name() {
        assert_eq!(
            srv_name(&["tname_aa", "zzz0"], "xxx.yyy", "tcp", "marathon.mesos"),
            "_tname_aa._zzz0.xxx.yyy._tcp.marathon.mesos"
        );
        assert_eq!(
            srv_name(&["memcached"], "system", "tcp", "marathon.mesos"),
            "_memcached.system._tcp.marathon.mesos"
        );
        assert_eq!(srv_name(&["web"], "", "udp", "dc1"), "_web._udp.dc1");
    }

    #[tokio::test]
    async fn test_named_ports_share_one_endpoint_per_host() {
        let backend = MesosDns::new(Arc::new(resolver()));
        let topology = backend
            .resolve(&settings(), &[service("zzz0", &["tname_aa", "tname_bb", "tname_e"])])
            .await;
        let endpoints = &topology["zzz0"];
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].name, "test.zzz0.test");
        assert_eq!(endpoints[0].ip, vec!["10.0.0.1", "10.1.0.1"]);
        let expected: BTreeMap<String, u16> =
            [("tname_aa".to_string(), 12341), ("tname_bb".to_string(), 12374)].into();
        assert_eq!(endpoints[0].tcp, PortSet::Named(expected));
    }

    #[tokio::test]
    async fn test_unnamed_service_yields_ordered_ports() {
        let backend = MesosDns::new(Arc::new(resolver()));
        let topology = backend.resolve(&settings(), &[service("zzz1", &[])]).await;
        let endpoints = &topology["zzz1"];
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].tcp, PortSet::Ordered(vec![12341, 12352]));
    }

    #[tokio::test]
    async fn test_failed_queries_yield_empty_results() {
        let backend = MesosDns::new(Arc::new(StaticResolver::new()));
        let topology = backend.resolve(&settings(), &[service("missing", &["p"])]).await;
        assert!(topology["missing"].is_empty());
    }
}
