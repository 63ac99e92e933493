use serde::{Deserialize, Serialize};

/// Connection parameters for one remote host.
///
/// `identity` is a reference resolved by a [`KeyMaterialProvider`], never the
/// key bytes themselves.
///
/// [`KeyMaterialProvider`]: crate::repository::KeyMaterialProvider
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HostSpec {
    pub id: String,
    pub hostname: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub user: String,
    pub identity: String,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_port() -> u16 {
    22
}

fn default_active() -> bool {
    true
}

impl HostSpec {
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.hostname)
    }
}
