use crate::models::HostSpec;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database_url: String,
    pub host: String,
    pub port: u16,
    pub ssh: SshConfig,
    pub execution: ExecutionConfig,
    pub hosts: Vec<HostSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshConfig {
    pub ssh_path: PathBuf,
    pub control_dir: PathBuf,
    pub connect_timeout_secs: u64,
    pub control_persist_secs: u64,
    pub max_connection_age_secs: u64,
    pub pool_max_size: usize,
    pub pool_store: PoolStoreKind,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PoolStoreKind {
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    pub default_timeout_secs: u64,
    pub max_timeout_secs: u64,
    pub kill_grace_secs: u64,
    pub handle_ttl_secs: u64,
    pub event_buffer: usize,
    pub batch_window_ms: u64,
    pub noise_filters: Vec<String>,
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,
}

fn default_max_line_bytes() -> usize {
    crate::executor::DEFAULT_MAX_LINE_BYTES
}

impl Default for SshConfig {
    fn default() -> Self {
        let control_dir = crate::paths::run_dir().unwrap_or_else(|_| PathBuf::from("run"));
        Self {
            ssh_path: PathBuf::from("ssh"),
            control_dir,
            connect_timeout_secs: 10,
            control_persist_secs: 600,
            max_connection_age_secs: 3600,
            pool_max_size: 10,
            pool_store: PoolStoreKind::Sqlite,
        }
    }
}

impl SshConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn max_connection_age(&self) -> Duration {
        Duration::from_secs(self.max_connection_age_secs)
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: 3600,
            max_timeout_secs: 3600,
            kill_grace_secs: 5,
            handle_ttl_secs: 2 * 60 * 60,
            event_buffer: 1024,
            batch_window_ms: 10,
            noise_filters: crate::executor::DEFAULT_NOISE_FILTERS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            max_line_bytes: default_max_line_bytes(),
        }
    }
}

impl ExecutionConfig {
    /// Requested timeout clamped to the configured ceiling; zero means "use the default".
    pub fn timeout_for(&self, requested_secs: Option<u64>) -> Duration {
        let secs = match requested_secs {
            Some(secs) if secs > 0 => secs.min(self.max_timeout_secs),
            _ => self.default_timeout_secs,
        };
        Duration::from_secs(secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_secs)
    }

    pub fn handle_ttl(&self) -> Duration {
        Duration::from_secs(self.handle_ttl_secs)
    }

    pub fn batch_window(&self) -> Duration {
        Duration::from_millis(self.batch_window_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        let database_url = crate::paths::data_dir()
            .map(|dir| format!("sqlite:{}", dir.join("ssh_relay.db").display()))
            .unwrap_or_else(|_| "sqlite:ssh_relay.db".to_string());
        Self {
            database_url,
            host: "127.0.0.1".to_string(),
            port: 6702,
            ssh: SshConfig::default(),
            execution: ExecutionConfig::default(),
            hosts: Vec::new(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(file_config) = Self::from_conf_file()? {
            config.apply_file(file_config);
        }

        if let Ok(db_url) = std::env::var("DATABASE_URL") {
            config.database_url = db_url;
        }

        if let Ok(host) = std::env::var("HOST") {
            config.host = host;
        }

        if let Ok(port) = std::env::var("PORT") {
            config.port = port.parse().unwrap_or(6702);
        }

        if let Ok(ssh_path) = std::env::var("SSH_PATH") {
            config.ssh.ssh_path = PathBuf::from(ssh_path);
        }

        if let Ok(max) = std::env::var("POOL_MAX_SIZE") {
            config.ssh.pool_max_size = max
                .parse()
                .with_context(|| format!("Invalid POOL_MAX_SIZE: {max}"))?;
        }

        config.normalize_database_url()?;
        config.validate()?;
        Ok(config)
    }

    fn from_conf_file() -> Result<Option<FileConfig>> {
        let path = crate::paths::conf_dir()?.join("config.json");
        if !path.is_file() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let file_config = serde_json::from_str(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        Ok(Some(file_config))
    }

    fn apply_file(&mut self, file_config: FileConfig) {
        if let Some(database_url) = file_config.database_url {
            self.database_url = database_url;
        }
        if let Some(host) = file_config.host {
            self.host = host;
        }
        if let Some(port) = file_config.port {
            self.port = port;
        }
        if let Some(ssh) = file_config.ssh {
            self.ssh = ssh;
        }
        if let Some(execution) = file_config.execution {
            self.execution = execution;
        }
        if let Some(hosts) = file_config.hosts {
            self.hosts = hosts;
        }
    }

    fn normalize_database_url(&mut self) -> Result<()> {
        let Some(path_str) = self.database_url.strip_prefix("sqlite:") else {
            return Ok(());
        };
        if path_str.starts_with(":memory:") {
            return Ok(());
        }

        let path = Path::new(path_str);
        if path.is_absolute() {
            return Ok(());
        }

        if path
            .components()
            .any(|component| matches!(component, std::path::Component::ParentDir))
        {
            anyhow::bail!("SQLite database path cannot contain '..'");
        }

        let root = crate::paths::install_root()?;
        self.database_url = format!("sqlite:{}", root.join(path).display());
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.ssh.pool_max_size == 0 {
            anyhow::bail!("ssh.pool_max_size must be at least 1");
        }
        if self.execution.event_buffer == 0 {
            anyhow::bail!("execution.event_buffer must be at least 1");
        }
        if self.execution.max_timeout_secs == 0 {
            anyhow::bail!("execution.max_timeout_secs must be at least 1");
        }
        if self.execution.max_line_bytes == 0 {
            anyhow::bail!("execution.max_line_bytes must be at least 1");
        }
        // A handle must outlive the longest run it can describe.
        if self.execution.handle_ttl_secs <= self.execution.max_timeout_secs {
            anyhow::bail!(
                "execution.handle_ttl_secs ({}) must exceed execution.max_timeout_secs ({})",
                self.execution.handle_ttl_secs,
                self.execution.max_timeout_secs
            );
        }

        let mut seen = std::collections::HashSet::new();
        for host in &self.hosts {
            if host.id.trim().is_empty() {
                anyhow::bail!("Host id cannot be empty");
            }
            if !seen.insert(host.id.as_str()) {
                anyhow::bail!("Duplicate host id: {}", host.id);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct FileConfig {
    database_url: Option<String>,
    host: Option<String>,
    port: Option<u16>,
    ssh: Option<SshConfig>,
    execution: Option<ExecutionConfig>,
    hosts: Option<Vec<HostSpec>>,
}
