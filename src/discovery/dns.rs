//! DNS lookups used by discovery
//!
//! Discovery only needs two primitives: SRV and A record lookups. They sit
//! behind [`DnsResolver`] so the system resolver can be swapped for a
//! static record table.

use anyhow::{anyhow, Context, Result};
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use std::collections::HashMap;
use std::time::Duration;
use tracing::warn;

/// Per-query timeout for every DNS lookup
pub const QUERY_TIMEOUT: Duration = Duration::from_secs(1);

/// One SRV answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrvAnswer {
    /// Target host name without the trailing root dot
    pub target: String,
    pub port: u16,
}

#[async_trait::async_trait]
pub trait DnsResolver: Send + Sync {
    async fn lookup_srv(&self, name: &str) -> Result<Vec<SrvAnswer>>;
    async fn lookup_a(&self, name: &str) -> Result<Vec<String>>;
}

fn strip_root(name: &str) -> String {
    name.strip_suffix('.').unwrap_or(name).to_string()
}

/// Resolver backed by the host's resolver configuration
pub struct SystemResolver {
    inner: TokioAsyncResolver,
}

impl SystemResolver {
    /// Read `/etc/resolv.conf`, falling back to the public default configuration
    pub fn new() -> Self {
        let (config, mut opts) = match hickory_resolver::system_conf::read_system_conf() {
            Ok(conf) => conf,
            Err(e) => {
                warn!("Failed to read system resolver configuration: {}", e);
                (ResolverConfig::default(), ResolverOpts::default())
            }
        };
        opts.timeout = QUERY_TIMEOUT;
        opts.attempts = 1;
        Self {
            inner: TokioAsyncResolver::tokio(config, opts),
        }
    }
}

impl Default for SystemResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl DnsResolver for SystemResolver {
    async fn lookup_srv(&self, name: &str) -> Result<Vec<SrvAnswer>> {
        let lookup = self
            .inner
            .srv_lookup(name)
            .await
            .with_context(|| format!("SRV lookup for {}", name))?;
        Ok(lookup
            .iter()
            .map(|srv| SrvAnswer {
                target: strip_root(&srv.target().to_utf8()),
                port: srv.port(),
            })
            .collect())
    }

    async fn lookup_a(&self, name: &str) -> Result<Vec<String>> {
        let lookup = self
            .inner
            .ipv4_lookup(name)
            .await
            .with_context(|| format!("A lookup for {}", name))?;
        Ok(lookup.iter().map(|a| a.to_string()).collect())
    }
}

/// Fixed record table, for static environments and tests
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    srv: HashMap<String, Vec<SrvAnswer>>,
    a: HashMap<String, Vec<String>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_srv(&mut self, name: &str, target: &str, port: u16) {
        self.srv.entry(name.to_string()).or_default().push(SrvAnswer {
            target: strip_root(target),
            port,
        });
    }

    pub fn add_a(&mut self, name: &str, ips: &[&str]) {
        self.a
            .entry(name.to_string())
            .or_default()
            .extend(ips.iter().map(|ip| ip.to_string()));
    }
}

#[async_trait::async_trait]
impl DnsResolver for StaticResolver {
    async fn lookup_srv(&self, name: &str) -> Result<Vec<SrvAnswer>> {
        self.srv
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow!("no SRV records for {}", name))
    }

    async fn lookup_a(&self, name: &str) -> Result<Vec<String>> {
        self.a
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow!("no A records for {}", name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_resolver() {
        let mut resolver = StaticResolver::new();
        resolver.add_srv("_web.xxx.yyy._tcp.marathon.mesos", "test.zzz0.test.", 31000);
        resolver.add_a("test.zzz0.test", &["10.0.0.1", "10.1.0.1"]);

        let answers = resolver
            .lookup_srv("_web.xxx.yyy._tcp.marathon.mesos")
            .await
            .unwrap();
        assert_eq!(
            answers,
            vec![SrvAnswer {
                target: "test.zzz0.test".to_string(),
                port: 31000
            }]
        );
        assert_eq!(
            resolver.lookup_a("test.zzz0.test").await.unwrap(),
            vec!["10.0.0.1", "10.1.0.1"]
        );
        assert!(resolver.lookup_a("missing.test").await.is_err());
    }
}
