//! In-process store, always enabled

use super::{ContentStore, StoreRecord};
use crate::config::{AgentSettings, StoreKind};
use anyhow::Result;
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct MemoryStore {
    records: HashMap<String, StoreRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl ContentStore for MemoryStore {
    fn kind(&self) -> StoreKind {
        StoreKind::Memory
    }

    fn enabled(&self) -> bool {
        true
    }

    async fn check(&mut self, _settings: &AgentSettings, _cache_hosts: &[String]) -> bool {
        true
    }

    async fn get(&self, identity: &str) -> Result<Option<StoreRecord>> {
        Ok(self.records.get(identity).cloned())
    }

    async fn set(&mut self, identity: &str, record: &StoreRecord) -> Result<()> {
        self.records.insert(identity.to_string(), record.clone());
        Ok(())
    }

    async fn delete(&mut self, identity: &str) -> Result<()> {
        self.records.remove(identity);
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self.records.keys().cloned().collect())
    }
}
