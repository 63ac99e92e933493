use crate::error::{AppError, Result};
use std::path::{Path, PathBuf};

const BIN_DIR: &str = "bin";
const CONF_DIR: &str = "conf";
const DATA_DIR: &str = "data";
const KEYS_DIR: &str = "keys";
const RUN_DIR: &str = "run";
const HOME_ENV: &str = "SSH_RELAY_HOME";

/// `SSH_RELAY_HOME` if set, otherwise the directory holding the binary
/// (or its parent when installed under `bin/`).
pub fn install_root() -> Result<PathBuf> {
    if let Ok(home) = std::env::var(HOME_ENV) {
        if home.trim().is_empty() {
            return Err(AppError::InvalidRequest(format!(
                "{HOME_ENV} is set but empty"
            )));
        }
        return Ok(PathBuf::from(home));
    }

    let exe_path = std::env::current_exe()?;
    root_for_exe(&exe_path).ok_or_else(|| {
        AppError::InvalidRequest(format!(
            "Cannot derive install root from {}",
            exe_path.display()
        ))
    })
}

fn root_for_exe(exe_path: &Path) -> Option<PathBuf> {
    let exe_dir = exe_path.parent()?;
    if exe_dir.file_name().and_then(|name| name.to_str()) == Some(BIN_DIR) {
        return exe_dir.parent().map(Path::to_path_buf);
    }
    Some(exe_dir.to_path_buf())
}

pub fn conf_dir() -> Result<PathBuf> {
    Ok(install_root()?.join(CONF_DIR))
}

pub fn data_dir() -> Result<PathBuf> {
    Ok(install_root()?.join(DATA_DIR))
}

/// Private keys referenced by host identities.
pub fn keys_dir() -> Result<PathBuf> {
    Ok(install_root()?.join(KEYS_DIR))
}

/// Control sockets of multiplexed ssh transports.
pub fn run_dir() -> Result<PathBuf> {
    Ok(install_root()?.join(RUN_DIR))
}

/// Creates `dir` if needed and restricts it to the current user.
/// ssh refuses control sockets in group- or world-writable directories.
pub fn ensure_private_dir(dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bin_directory_is_stripped() {
        assert_eq!(
            root_for_exe(Path::new("/opt/ssh_relay/bin/ssh_relay")),
            Some(PathBuf::from("/opt/ssh_relay"))
        );
        assert_eq!(
            root_for_exe(Path::new("/srv/relay/ssh_relay")),
            Some(PathBuf::from("/srv/relay"))
        );
    }

    #[cfg(unix)]
    #[test]
    fn private_dir_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("run").join("nested");
        ensure_private_dir(&dir).unwrap();
        ensure_private_dir(&dir).unwrap();

        let mode = std::fs::metadata(&dir).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }
}
