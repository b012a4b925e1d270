//! Memcached store over the text protocol
//!
//! Records are stored as JSON under their identity. Memcached cannot list
//! its keys, so the identities written through this store are kept in a JSON
//! array under [`INDEX_KEY`].

use super::{ContentStore, StoreRecord};
use crate::config::{AgentSettings, StoreKind};
use crate::error::SurokError;
use anyhow::{bail, Context, Result};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, warn};

pub const INDEX_KEY: &str = "surok:keys";
const IO_TIMEOUT: Duration = Duration::from_secs(1);

/// Minimal memcached client, one connection per request
#[derive(Debug, Clone)]
pub struct MemcachedClient {
    hosts: Vec<String>,
}

impl MemcachedClient {
    pub fn new(hosts: Vec<String>) -> Self {
        Self { hosts }
    }

    pub fn hosts(&self) -> &[String] {
        &self.hosts
    }

    async fn connect(&self) -> Result<BufReader<TcpStream>> {
        for host in &self.hosts {
            match tokio::time::timeout(IO_TIMEOUT, TcpStream::connect(host.as_str())).await {
                Ok(Ok(stream)) => return Ok(BufReader::new(stream)),
                Ok(Err(e)) => debug!("Memcached host {} unreachable: {}", host, e),
                Err(_) => debug!("Memcached host {} timed out", host),
            }
        }
        bail!("no memcached host reachable in [{}]", self.hosts.join(", "))
    }

    async fn request<T, F, Fut>(&self, command: Vec<u8>, read: F) -> Result<T>
    where
        F: FnOnce(BufReader<TcpStream>) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let exchange = async {
            let mut conn = self.connect().await?;
            conn.get_mut().write_all(&command).await?;
            conn.get_mut().flush().await?;
            read(conn).await
        };
        tokio::time::timeout(IO_TIMEOUT, exchange)
            .await
            .context("memcached request timed out")?
    }

    pub async fn version(&self) -> Result<String> {
        self.request(b"version\r\n".to_vec(), |mut conn| async move {
            let line = read_line(&mut conn).await?;
            match line.strip_prefix("VERSION ") {
                Some(version) => Ok(version.to_string()),
                None => bail!("unexpected reply to version: {}", line),
            }
        })
        .await
    }

    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let command = format!("get {}\r\n", key).into_bytes();
        self.request(command, |mut conn| async move {
            let line = read_line(&mut conn).await?;
            if line == "END" {
                return Ok(None);
            }
            let parts: Vec<&str> = line.split_whitespace().collect();
            let len = match parts.as_slice() {
                ["VALUE", _, _, len, ..] => len
                    .parse::<usize>()
                    .with_context(|| format!("bad value length in {}", line))?,
                _ => bail!("unexpected reply to get: {}", line),
            };
            let mut data = vec![0u8; len + 2];
            conn.read_exact(&mut data).await?;
            data.truncate(len);
            let end = read_line(&mut conn).await?;
            if end != "END" {
                bail!("unexpected trailer after value: {}", end);
            }
            Ok(Some(data))
        })
        .await
    }

    pub async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        let mut command = format!("set {} 0 0 {}\r\n", key, value.len()).into_bytes();
        command.extend_from_slice(value);
        command.extend_from_slice(b"\r\n");
        self.request(command, |mut conn| async move {
            let line = read_line(&mut conn).await?;
            if line != "STORED" {
                bail!("unexpected reply to set: {}", line);
            }
            Ok(())
        })
        .await
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        let command = format!("delete {}\r\n", key).into_bytes();
        self.request(command, |mut conn| async move {
            let line = read_line(&mut conn).await?;
            match line.as_str() {
                "DELETED" | "NOT_FOUND" => Ok(()),
                _ => bail!("unexpected reply to delete: {}", line),
            }
        })
        .await
    }
}

async fn read_line(conn: &mut BufReader<TcpStream>) -> Result<String> {
    let mut line = String::new();
    if conn.read_line(&mut line).await? == 0 {
        bail!("connection closed");
    }
    Ok(line.trim_end().to_string())
}

#[derive(Debug, Default)]
pub struct MemcachedStore {
    client: Option<MemcachedClient>,
}

impl MemcachedStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn client(&self) -> Result<&MemcachedClient> {
        self.client.as_ref().context("memcached store is disabled")
    }

    async fn index(&self) -> Result<Vec<String>> {
        match self.client()?.get(INDEX_KEY).await? {
            Some(raw) => serde_json::from_slice(&raw).context("corrupt memcached key index"),
            None => Ok(Vec::new()),
        }
    }

    async fn write_index(&self, keys: &[String]) -> Result<()> {
        let raw = serde_json::to_vec(keys)?;
        self.client()?.set(INDEX_KEY, &raw).await
    }
}

#[async_trait::async_trait]
impl ContentStore for MemcachedStore {
    fn kind(&self) -> StoreKind {
        StoreKind::Memcached
    }

    fn enabled(&self) -> bool {
        self.client.is_some()
    }

    fn shared(&self) -> bool {
        true
    }

    async fn check(&mut self, settings: &AgentSettings, cache_hosts: &[String]) -> bool {
        self.client = None;
        if !settings.memcached.enabled {
            return false;
        }
        let mut hosts = settings.memcached.configured_hosts();
        if hosts.is_empty() {
            hosts = cache_hosts.to_vec();
        }
        if hosts.is_empty() {
            warn!(
                "{}",
                SurokError::backend(StoreKind::Memcached.as_str(), "no hosts configured or discovered")
            );
            return false;
        }

        let client = MemcachedClient::new(hosts);
        match client.version().await {
            Ok(version) => {
                debug!("Memcached {} at [{}]", version, client.hosts().join(", "));
                self.client = Some(client);
                true
            }
            Err(e) => {
                warn!("{}", SurokError::backend(StoreKind::Memcached.as_str(), format!("{:#}", e)));
                false
            }
        }
    }

    async fn get(&self, identity: &str) -> Result<Option<StoreRecord>> {
        match self.client()?.get(identity).await? {
            Some(raw) => Ok(Some(
                serde_json::from_slice(&raw)
                    .with_context(|| format!("corrupt memcached record {}", identity))?,
            )),
            None => Ok(None),
        }
    }

    async fn set(&mut self, identity: &str, record: &StoreRecord) -> Result<()> {
        let raw = serde_json::to_vec(record)?;
        self.client()?.set(identity, &raw).await?;
        let mut keys = self.index().await?;
        if !keys.iter().any(|k| k == identity) {
            keys.push(identity.to_string());
            self.write_index(&keys).await?;
        }
        Ok(())
    }

    async fn delete(&mut self, identity: &str) -> Result<()> {
        self.client()?.delete(identity).await?;
        let mut keys = self.index().await?;
        let before = keys.len();
        keys.retain(|k| k != identity);
        if keys.len() != before {
            self.write_index(&keys).await?;
        }
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        self.index().await
    }
}
