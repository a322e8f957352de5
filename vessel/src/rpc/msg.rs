//! Typed request/reply vocabulary of the RPC link.
//!
//! Every privileged method has one request variant and every reply is either
//! a typed success payload or an [`RpcFailure`]. Flags cross the wire as raw
//! bits: `MsFlags`/`MntFlags` are not serde types and the kernel speaks bits
//! anyway.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use vessel_shared::errors::VesselError;

use crate::mounts::ops::{ChrootMethod, FileStat, LoopAttach};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "kebab-case")]
pub enum Request {
    Mount {
        source: Option<PathBuf>,
        target: PathBuf,
        fs_type: Option<String>,
        flags: u64,
        data: String,
    },
    Unmount {
        target: PathBuf,
        flags: i32,
    },
    Chroot {
        method: ChrootMethod,
    },
    LoopDevice(LoopAttach),
    Decrypt {
        loop_device: u32,
        key: Vec<u8>,
        /// Join the host IPC namespace for the duration of the call; set
        /// when the container requested its own IPC namespace.
        host_ipc: bool,
    },
    CryptClose {
        device: PathBuf,
    },
    Mkdir {
        path: PathBuf,
        mode: u32,
    },
    Chown {
        path: PathBuf,
        uid: u32,
        gid: u32,
    },
    Lchown {
        path: PathBuf,
        uid: u32,
        gid: u32,
    },
    Symlink {
        target: PathBuf,
        link: PathBuf,
    },
    ReadDir {
        path: PathBuf,
    },
    Stat {
        path: PathBuf,
    },
    Lstat {
        path: PathBuf,
    },
    Readlink {
        path: PathBuf,
    },
    Access {
        path: PathBuf,
        mode: u32,
    },
    WriteFile {
        path: PathBuf,
        mode: u32,
        content: Vec<u8>,
    },
    Umask {
        mask: u32,
    },
    EvalRelative {
        path: PathBuf,
        root: PathBuf,
    },
    Chdir {
        path: PathBuf,
    },
    SetHostname {
        name: String,
    },
    /// Open /dev/fuse on the RPC side and ship the descriptor over the
    /// fd-passing socket.
    OpenSendFuseFd,
    /// Duplicate the given (server-side) descriptors back to the caller,
    /// appending one for /proc/self/ns/user.
    SendFuseFd {
        fds: Vec<i32>,
    },
    /// Run the GPU configuration helper with the escalated set.
    NvCcli {
        binary: PathBuf,
        args: Vec<String>,
        env: Vec<(String, String)>,
    },
}

impl Request {
    /// Method name for logs and failure reports.
    pub fn method(&self) -> &'static str {
        match self {
            Request::Mount { .. } => "mount",
            Request::Unmount { .. } => "unmount",
            Request::Chroot { .. } => "chroot",
            Request::LoopDevice(_) => "loop-device",
            Request::Decrypt { .. } => "decrypt",
            Request::CryptClose { .. } => "crypt-close",
            Request::Mkdir { .. } => "mkdir",
            Request::Chown { .. } => "chown",
            Request::Lchown { .. } => "lchown",
            Request::Symlink { .. } => "symlink",
            Request::ReadDir { .. } => "read-dir",
            Request::Stat { .. } => "stat",
            Request::Lstat { .. } => "lstat",
            Request::Readlink { .. } => "readlink",
            Request::Access { .. } => "access",
            Request::WriteFile { .. } => "write-file",
            Request::Umask { .. } => "umask",
            Request::EvalRelative { .. } => "eval-relative",
            Request::Chdir { .. } => "chdir",
            Request::SetHostname { .. } => "set-hostname",
            Request::OpenSendFuseFd => "open-send-fuse-fd",
            Request::SendFuseFd { .. } => "send-fuse-fd",
            Request::NvCcli { .. } => "nvccli",
        }
    }
}

/// Failure class, so the client can map back to the error taxonomy without
/// string matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RpcFailureKind {
    Errno,
    BadKey,
    NotPrivileged,
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcFailure {
    pub op: String,
    pub kind: RpcFailureKind,
    pub errno: Option<i32>,
    pub message: String,
}

impl RpcFailure {
    pub fn errno(op: &str, errno: nix::errno::Errno) -> Self {
        Self {
            op: op.to_string(),
            kind: RpcFailureKind::Errno,
            errno: Some(errno as i32),
            message: errno.desc().to_string(),
        }
    }

    pub fn other(op: &str, message: impl Into<String>) -> Self {
        Self {
            op: op.to_string(),
            kind: RpcFailureKind::Other,
            errno: None,
            message: message.into(),
        }
    }
}

impl From<RpcFailure> for VesselError {
    fn from(failure: RpcFailure) -> Self {
        match failure.kind {
            RpcFailureKind::BadKey => VesselError::CryptBadKey,
            RpcFailureKind::NotPrivileged => VesselError::PrivilegeEscalationDenied,
            _ => VesselError::RpcOperation {
                op: failure.op,
                errno: failure.errno,
                detail: match failure.errno {
                    Some(errno) => format!("{} (errno {errno})", failure.message),
                    None => failure.message,
                },
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", content = "value", rename_all = "kebab-case")]
pub enum Reply {
    Ok,
    Number(u64),
    Bool(bool),
    Path(PathBuf),
    Text(String),
    Entries(Vec<String>),
    Stat(Option<FileStat>),
    /// A descriptor is in flight on the fd-passing socket; the value is the
    /// count of descriptors sent.
    Fds(u32),
    Err(RpcFailure),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_json_shape() {
        let req = Request::Mount {
            source: Some(PathBuf::from("/proc/self/fd/3")),
            target: PathBuf::from("/session/root"),
            fs_type: Some("squashfs".into()),
            flags: libc::MS_RDONLY,
            data: String::new(),
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains(r#""method":"mount""#));

        let back: Request = serde_json::from_str(&json).unwrap();
        assert_eq!(back, req);
    }

    #[test]
    fn test_reply_round_trip() {
        for reply in [
            Reply::Ok,
            Reply::Number(7),
            Reply::Bool(true),
            Reply::Path(PathBuf::from("/dev/mapper/vessel-crypt")),
            Reply::Entries(vec!["bin".into(), "etc".into()]),
            Reply::Stat(None),
            Reply::Fds(2),
            Reply::Err(RpcFailure::errno("mount", nix::errno::Errno::EINVAL)),
        ] {
            let json = serde_json::to_string(&reply).unwrap();
            let back: Reply = serde_json::from_str(&json).unwrap();
            assert_eq!(back, reply);
        }
    }

    #[test]
    fn test_failure_maps_to_taxonomy() {
        let bad_key = RpcFailure {
            op: "decrypt".into(),
            kind: RpcFailureKind::BadKey,
            errno: None,
            message: String::new(),
        };
        assert!(matches!(
            VesselError::from(bad_key),
            VesselError::CryptBadKey
        ));

        let denied = RpcFailure {
            op: "mount".into(),
            kind: RpcFailureKind::NotPrivileged,
            errno: None,
            message: String::new(),
        };
        assert!(matches!(
            VesselError::from(denied),
            VesselError::PrivilegeEscalationDenied
        ));

        let failure = RpcFailure::errno("mount", nix::errno::Errno::EPERM);
        match VesselError::from(failure) {
            VesselError::RpcOperation { op, errno, detail } => {
                assert_eq!(op, "mount");
                assert_eq!(errno, Some(libc::EPERM));
                assert!(detail.contains("errno 1"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_method_names() {
        assert_eq!(Request::OpenSendFuseFd.method(), "open-send-fuse-fd");
        assert_eq!(
            Request::Umask { mask: 0o22 }.method(),
            "umask"
        );
    }
}
