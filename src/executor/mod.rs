mod line_splitter;
mod multiplexer;
mod ssh_executor;

pub use line_splitter::{DEFAULT_MAX_LINE_BYTES, DEFAULT_NOISE_FILTERS, LineSplitter};
pub use multiplexer::{Multiplexer, SshMultiplexer};
pub use ssh_executor::{
    ExecError, ExecOptions, ExecutionResult, RunningProcess, ShellMode, SshExecutor, Termination,
    Transport, is_alive, signal_process,
};

#[cfg(all(test, unix))]
pub(crate) mod test_support {
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};

    /// Writes an `ssh` stand-in that runs its final argument locally.
    pub fn fake_ssh(dir: &Path) -> PathBuf {
        let path = dir.join("fake-ssh");
        std::fs::write(&path, "#!/bin/sh\nfor last; do :; done\nexec sh -c \"$last\"\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }
}
