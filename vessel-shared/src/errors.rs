//! Error taxonomy for the launcher.
//!
//! Every failure the runtime can surface is a typed variant here. Module-level
//! error enums in the `vessel` crate convert into [`VesselError`] at the seam
//! where they stop being module-internal. The executor in MASTER decides per
//! mount tag whether a variant aborts setup or is logged and skipped; cleanup
//! errors are collected and logged without changing the exit status.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub type VesselResult<T> = Result<T, VesselError>;

#[derive(Debug, Error)]
pub enum VesselError {
    /// The requested launch violates the administrator configuration.
    /// Fatal in STAGE1.
    #[error("configuration disallows this: {0}")]
    ConfigRejected(String),

    /// The invoking user is not authorized for a requested capability,
    /// network, image owner, path, or group. Fatal in STAGE1.
    #[error("not authorized by configuration: {0}")]
    AuthorizationDenied(String),

    #[error("could not open image {path}: {source}")]
    ImageOpenFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("image format not recognized: {0}")]
    ImageUnrecognized(PathBuf),

    /// Mount source absent. Fatal for rootfs/kernel tags, skippable for
    /// best-effort tags.
    #[error("mount source {0} does not exist")]
    MountSourceMissing(PathBuf),

    /// Mount destination absent and no session layer can create it.
    #[error("destination {0} does not exist in container")]
    MountDestinationMissing(PathBuf),

    /// Kernel overlay kept returning EINVAL after the option-mutation
    /// retries were exhausted.
    #[error("kernel overlay mount failed with EINVAL at {0}")]
    MountKernelEinval(PathBuf),

    /// Kernel overlay returned ESTALE again after the index=off retry.
    #[error("kernel overlay mount failed with ESTALE at {0}")]
    MountKernelEstale(PathBuf),

    #[error("could not start {helper}: {detail}")]
    FuseHelperStartFailed { helper: String, detail: String },

    #[error("{helper} did not mount {target} within the deadline")]
    FuseHelperTimeout { helper: String, target: PathBuf },

    #[error("{helper} exited unexpectedly: {detail}")]
    FuseHelperExited { helper: String, detail: String },

    /// Escalation was attempted without a saved-set-uid of 0, i.e. the
    /// binary is not installed setuid.
    #[error("privilege escalation requires a setuid installation")]
    PrivilegeEscalationDenied,

    /// `set_effective` asked for a capability outside the permitted set.
    #[error("capability {0} is not in the permitted set")]
    NotInPermitted(String),

    /// The socket to the RPC sibling closed or desynchronized. Fatal; the
    /// container is terminated.
    #[error("rpc transport lost")]
    RpcTransportLost,

    /// A privileged operation failed on the RPC side. The errno survives so
    /// the executor can drive its retry ladders (overlay ESTALE/EINVAL,
    /// EPERM-in-user-namespace).
    #[error("{op} failed: {detail}")]
    RpcOperation {
        op: String,
        errno: Option<i32>,
        detail: String,
    },

    #[error("failed to decrypt, ensure you have supplied appropriate key material")]
    CryptBadKey,

    #[error("no loop device available: {0}")]
    LoopDevice(String),

    #[error("session layout: {0}")]
    Session(String),

    /// Stage bootstrap failure (shared memory, socketpairs, fd table, fork).
    /// Always fatal for the whole pipeline.
    #[error("stage setup: {0}")]
    Setup(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl VesselError {
    /// Whether the executor may log this error and continue with the next
    /// mount entry. Only mount-shaped errors are ever skippable; the final
    /// decision also depends on the entry's tag and flags.
    pub fn is_skippable(&self) -> bool {
        matches!(
            self,
            VesselError::MountSourceMissing(_) | VesselError::MountDestinationMissing(_)
        )
    }

    /// The errno of a failed RPC operation, if one was recorded.
    pub fn rpc_errno(&self) -> Option<i32> {
        match self {
            VesselError::RpcOperation { errno, .. } => *errno,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crypt_message_names_key_material() {
        // The wording is load-bearing: user-facing guidance for a wrong
        // passphrase.
        let msg = VesselError::CryptBadKey.to_string();
        assert!(msg.contains("failed to decrypt"));
        assert!(msg.contains("key material"));
    }

    #[test]
    fn test_skippable_classification() {
        assert!(VesselError::MountSourceMissing(PathBuf::from("/etc/hosts")).is_skippable());
        assert!(!VesselError::RpcTransportLost.is_skippable());
        assert!(!VesselError::PrivilegeEscalationDenied.is_skippable());
    }

    #[test]
    fn test_io_conversion() {
        let err: VesselError = io::Error::new(io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(err, VesselError::Io(_)));
    }
}
