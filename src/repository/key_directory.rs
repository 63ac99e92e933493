use crate::error::{AppError, Result};
use std::path::{Component, Path, PathBuf};

/// Maps an identity reference to a private key file usable by `ssh -i`.
pub trait KeyMaterialProvider: Send + Sync {
    fn key_path(&self, identity: &str) -> Result<PathBuf>;
}

/// Keys stored as files named after their identity under one directory.
#[derive(Debug, Clone)]
pub struct KeyDirectory {
    root: PathBuf,
}

impl KeyDirectory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl KeyMaterialProvider for KeyDirectory {
    fn key_path(&self, identity: &str) -> Result<PathBuf> {
        let name = identity.trim();
        if name.is_empty() {
            return Err(AppError::KeyMaterial("identity is empty".to_string()));
        }
        let mut components = Path::new(name).components();
        if !matches!(
            (components.next(), components.next()),
            (Some(Component::Normal(_)), None)
        ) {
            return Err(AppError::KeyMaterial(format!(
                "identity '{}' must be a plain file name",
                name
            )));
        }

        let path = self.root.join(name);
        if !path.is_file() {
            return Err(AppError::KeyMaterial(format!(
                "no key registered for identity '{}'",
                name
            )));
        }
        Ok(path)
    }
}
