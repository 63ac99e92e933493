use crate::error::{AppError, Result};
use crate::models::HostSpec;
use async_trait::async_trait;
use std::collections::HashMap;

/// Read-only source of host connection parameters.
#[async_trait]
pub trait HostDirectory: Send + Sync {
    async fn resolve(&self, host_id: &str) -> Result<HostSpec>;
}

/// Hosts declared in the configuration file.
#[derive(Debug, Clone, Default)]
pub struct StaticHostDirectory {
    hosts: HashMap<String, HostSpec>,
}

impl StaticHostDirectory {
    pub fn new(hosts: impl IntoIterator<Item = HostSpec>) -> Self {
        Self {
            hosts: hosts.into_iter().map(|h| (h.id.clone(), h)).collect(),
        }
    }
}

#[async_trait]
impl HostDirectory for StaticHostDirectory {
    async fn resolve(&self, host_id: &str) -> Result<HostSpec> {
        self.hosts
            .get(host_id)
            .cloned()
            .ok_or_else(|| AppError::HostNotFound(host_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_known_hosts_only() {
        let directory = StaticHostDirectory::new([HostSpec {
            id: "web".to_string(),
            hostname: "10.0.0.5".to_string(),
            port: 22,
            user: "deploy".to_string(),
            identity: "deploy".to_string(),
            active: false,
        }]);

        let host = directory.resolve("web").await.unwrap();
        assert_eq!(host.hostname, "10.0.0.5");
        assert!(!host.active);
        assert!(matches!(
            directory.resolve("db").await,
            Err(AppError::HostNotFound(_))
        ));
    }
}
