//! Terminal discovery backend

use super::{DiscoveryBackend, Topology};
use crate::config::{AgentSettings, DiscoveryKind, ServiceDeclaration};

/// Always enabled, resolves nothing
#[derive(Debug, Default)]
pub struct NoneBackend;

#[async_trait::async_trait]
impl DiscoveryBackend for NoneBackend {
    fn kind(&self) -> DiscoveryKind {
        DiscoveryKind::None
    }

    fn enabled(&self, _settings: &AgentSettings) -> bool {
        true
    }

    async fn refresh(&mut self, _settings: &AgentSettings) {}

    async fn resolve(
        &self,
        _settings: &AgentSettings,
        _services: &[ServiceDeclaration],
    ) -> Topology {
        Topology::new()
    }
}
