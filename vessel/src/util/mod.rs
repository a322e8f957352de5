//! Small helpers shared across the runtime.

use std::path::{Path, PathBuf};
use std::process::ExitStatus;

use vessel_shared::errors::{VesselError, VesselResult};

/// Locates a helper binary on the configured search path.
///
/// `search_path` uses the usual colon-separated form from the `binary path`
/// configuration key.
pub fn find_binary(name: &str, search_path: &str) -> VesselResult<PathBuf> {
    for dir in search_path.split(':').filter(|d| !d.is_empty()) {
        let candidate = Path::new(dir).join(name);
        if candidate.is_file() {
            return Ok(candidate);
        }
    }
    Err(VesselError::Setup(format!(
        "{name} not found on binary path {search_path}"
    )))
}

/// Maps a child exit status to the launcher's own exit code: the child's
/// code when it exited, 128+signal when it was killed.
pub fn status_to_exit_code(status: &ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;

    if let Some(code) = status.code() {
        code
    } else if let Some(sig) = status.signal() {
        128 + sig
    } else {
        1
    }
}

/// Same mapping for a raw wait status (monitor loop reaps with waitpid).
pub fn wait_status_to_exit_code(status: nix::sys::wait::WaitStatus) -> Option<i32> {
    use nix::sys::wait::WaitStatus;

    match status {
        WaitStatus::Exited(_, code) => Some(code),
        WaitStatus::Signaled(_, sig, _) => Some(128 + sig as i32),
        _ => None,
    }
}

/// Joins a container-absolute path onto a host-side root without letting
/// `..` components escape it.
pub fn join_rooted(root: &Path, inner: &Path) -> PathBuf {
    let mut out = root.to_path_buf();
    for comp in inner.components() {
        use std::path::Component;
        match comp {
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
            Component::ParentDir => {
                if out != root {
                    out.pop();
                }
            }
            Component::Normal(part) => out.push(part),
        }
    }
    out
}
