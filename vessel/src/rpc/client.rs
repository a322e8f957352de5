//! Client side of the RPC link: the production [`MountOps`] implementation.
//!
//! Each call writes one request frame and blocks on the reply. Operations
//! that only need MASTER's own view of the world (statfs, reading our
//! mountinfo) stay local; everything that mutates kernel state crosses the
//! socket.

use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

use nix::mount::{MntFlags, MsFlags};

use vessel_shared::errors::{VesselError, VesselResult};

use crate::mounts::ops::{ChrootMethod, FileStat, LoopAttach, MountOps};

use super::fdpass;
use super::msg::{Reply, Request};
use super::wire;

pub struct RpcOps {
    stream: UnixStream,
    fd_socket: UnixStream,
    /// The container requested its own IPC namespace, so decrypt calls must
    /// temporarily join the host's.
    host_ipc: bool,
}

impl RpcOps {
    pub fn new(stream: UnixStream, fd_socket: UnixStream) -> Self {
        Self {
            stream,
            fd_socket,
            host_ipc: false,
        }
    }

    pub fn set_host_ipc(&mut self, host_ipc: bool) {
        self.host_ipc = host_ipc;
    }

    fn call(&mut self, request: Request) -> VesselResult<Reply> {
        wire::write_frame(&mut self.stream, &request)?;
        let reply: Reply = wire::read_frame(&mut self.stream)?;
        match reply {
            Reply::Err(failure) => Err(failure.into()),
            other => Ok(other),
        }
    }

    fn expect_ok(&mut self, request: Request) -> VesselResult<()> {
        match self.call(request)? {
            Reply::Ok => Ok(()),
            other => Err(VesselError::RpcOperation {
                op: "reply".into(),
                errno: None,
                detail: format!("unexpected reply {other:?}"),
            }),
        }
    }

    /// Asks the server to open /dev/fuse and pass the descriptor over.
    pub fn open_fuse_fd(&mut self) -> VesselResult<OwnedFd> {
        match self.call(Request::OpenSendFuseFd)? {
            Reply::Fds(1) => {
                let mut fds = fdpass::recv_fds(&self.fd_socket, 1)?;
                Ok(fds.pop().unwrap())
            }
            other => Err(VesselError::RpcOperation {
                op: "open-send-fuse-fd".into(),
                errno: None,
                detail: format!("unexpected reply {other:?}"),
            }),
        }
    }

    /// Asks the server to duplicate `fds` back to us, with the server's
    /// /proc/self/ns/user descriptor appended.
    pub fn request_fds(&mut self, fds: Vec<i32>) -> VesselResult<Vec<OwnedFd>> {
        let expected = fds.len() + 1;
        match self.call(Request::SendFuseFd { fds })? {
            Reply::Fds(count) if count as usize == expected => {
                fdpass::recv_fds(&self.fd_socket, expected)
            }
            other => Err(VesselError::RpcOperation {
                op: "send-fuse-fd".into(),
                errno: None,
                detail: format!("unexpected reply {other:?}"),
            }),
        }
    }

    pub fn nvccli(
        &mut self,
        binary: &Path,
        args: &[String],
        env: &[(String, String)],
    ) -> VesselResult<()> {
        self.expect_ok(Request::NvCcli {
            binary: binary.to_path_buf(),
            args: args.to_vec(),
            env: env.to_vec(),
        })
    }

    pub fn readdir(&mut self, path: &Path) -> VesselResult<Vec<String>> {
        match self.call(Request::ReadDir {
            path: path.to_path_buf(),
        })? {
            Reply::Entries(entries) => Ok(entries),
            other => Err(VesselError::RpcOperation {
                op: "read-dir".into(),
                errno: None,
                detail: format!("unexpected reply {other:?}"),
            }),
        }
    }

    pub fn umask(&mut self, mask: u32) -> VesselResult<u32> {
        match self.call(Request::Umask { mask })? {
            Reply::Number(previous) => Ok(previous as u32),
            other => Err(VesselError::RpcOperation {
                op: "umask".into(),
                errno: None,
                detail: format!("unexpected reply {other:?}"),
            }),
        }
    }

    pub fn access(&mut self, path: &Path, mode: u32) -> VesselResult<bool> {
        match self.call(Request::Access {
            path: path.to_path_buf(),
            mode,
        })? {
            Reply::Bool(ok) => Ok(ok),
            other => Err(VesselError::RpcOperation {
                op: "access".into(),
                errno: None,
                detail: format!("unexpected reply {other:?}"),
            }),
        }
    }

    pub fn readlink(&mut self, path: &Path) -> VesselResult<PathBuf> {
        match self.call(Request::Readlink {
            path: path.to_path_buf(),
        })? {
            Reply::Path(target) => Ok(target),
            other => Err(VesselError::RpcOperation {
                op: "readlink".into(),
                errno: None,
                detail: format!("unexpected reply {other:?}"),
            }),
        }
    }

    pub fn chown(&mut self, path: &Path, uid: u32, gid: u32) -> VesselResult<()> {
        self.expect_ok(Request::Chown {
            path: path.to_path_buf(),
            uid,
            gid,
        })
    }

    pub fn lchown(&mut self, path: &Path, uid: u32, gid: u32) -> VesselResult<()> {
        self.expect_ok(Request::Lchown {
            path: path.to_path_buf(),
            uid,
            gid,
        })
    }
}

impl MountOps for RpcOps {
    fn mount(
        &mut self,
        source: Option<&Path>,
        target: &Path,
        fs_type: Option<&str>,
        flags: MsFlags,
        data: &str,
    ) -> VesselResult<()> {
        self.expect_ok(Request::Mount {
            source: source.map(Path::to_path_buf),
            target: target.to_path_buf(),
            fs_type: fs_type.map(str::to_string),
            flags: flags.bits(),
            data: data.to_string(),
        })
    }

    fn unmount(&mut self, target: &Path, flags: MntFlags) -> VesselResult<()> {
        self.expect_ok(Request::Unmount {
            target: target.to_path_buf(),
            flags: flags.bits(),
        })
    }

    fn mkdir_all(&mut self, path: &Path, mode: u32) -> VesselResult<()> {
        self.expect_ok(Request::Mkdir {
            path: path.to_path_buf(),
            mode,
        })
    }

    fn symlink(&mut self, target: &Path, link: &Path) -> VesselResult<()> {
        self.expect_ok(Request::Symlink {
            target: target.to_path_buf(),
            link: link.to_path_buf(),
        })
    }

    fn write_file(&mut self, path: &Path, mode: u32, content: &[u8]) -> VesselResult<()> {
        self.expect_ok(Request::WriteFile {
            path: path.to_path_buf(),
            mode,
            content: content.to_vec(),
        })
    }

    fn chdir(&mut self, path: &Path) -> VesselResult<()> {
        self.expect_ok(Request::Chdir {
            path: path.to_path_buf(),
        })
    }

    fn chroot(&mut self, method: ChrootMethod) -> VesselResult<()> {
        self.expect_ok(Request::Chroot { method })
    }

    fn loop_attach(&mut self, request: &LoopAttach) -> VesselResult<u32> {
        match self.call(Request::LoopDevice(request.clone()))? {
            Reply::Number(device) => Ok(device as u32),
            other => Err(VesselError::RpcOperation {
                op: "loop-device".into(),
                errno: None,
                detail: format!("unexpected reply {other:?}"),
            }),
        }
    }

    fn crypt_open(&mut self, loop_device: u32, key: &[u8]) -> VesselResult<PathBuf> {
        let host_ipc = self.host_ipc;
        match self.call(Request::Decrypt {
            loop_device,
            key: key.to_vec(),
            host_ipc,
        })? {
            Reply::Path(device) => Ok(device),
            other => Err(VesselError::RpcOperation {
                op: "decrypt".into(),
                errno: None,
                detail: format!("unexpected reply {other:?}"),
            }),
        }
    }

    fn crypt_close(&mut self, device: &Path) -> VesselResult<()> {
        self.expect_ok(Request::CryptClose {
            device: device.to_path_buf(),
        })
    }

    fn set_hostname(&mut self, name: &str) -> VesselResult<()> {
        self.expect_ok(Request::SetHostname {
            name: name.to_string(),
        })
    }

    fn stat(&mut self, path: &Path) -> VesselResult<Option<FileStat>> {
        match self.call(Request::Stat {
            path: path.to_path_buf(),
        })? {
            Reply::Stat(stat) => Ok(stat),
            other => Err(VesselError::RpcOperation {
                op: "stat".into(),
                errno: None,
                detail: format!("unexpected reply {other:?}"),
            }),
        }
    }

    fn lstat(&mut self, path: &Path) -> VesselResult<Option<FileStat>> {
        match self.call(Request::Lstat {
            path: path.to_path_buf(),
        })? {
            Reply::Stat(stat) => Ok(stat),
            other => Err(VesselError::RpcOperation {
                op: "lstat".into(),
                errno: None,
                detail: format!("unexpected reply {other:?}"),
            }),
        }
    }

    fn statfs_flags(&mut self, path: &Path) -> VesselResult<u64> {
        // Local: reconciliation reads MASTER's own view of the source.
        let st = nix::sys::statfs::statfs(path)
            .map_err(|e| VesselError::Setup(format!("statfs {}: {e}", path.display())))?;
        Ok(st.flags().bits() as u64)
    }

    fn statfs_type(&mut self, path: &Path) -> VesselResult<String> {
        let st = nix::sys::statfs::statfs(path)
            .map_err(|e| VesselError::Setup(format!("statfs {}: {e}", path.display())))?;
        Ok(fs_type_name(st.filesystem_type().0 as i64))
    }

    fn read_mountinfo(&mut self) -> VesselResult<String> {
        Ok(std::fs::read_to_string("/proc/self/mountinfo")?)
    }

    fn eval_relative(&mut self, path: &Path, root: &Path) -> VesselResult<PathBuf> {
        match self.call(Request::EvalRelative {
            path: path.to_path_buf(),
            root: root.to_path_buf(),
        })? {
            Reply::Path(resolved) => Ok(resolved),
            other => Err(VesselError::RpcOperation {
                op: "eval-relative".into(),
                errno: None,
                detail: format!("unexpected reply {other:?}"),
            }),
        }
    }
}

/// Decodes the statfs f_type magic into the name the planner compares
/// against. Unknown magics come back as hex so logs stay useful.
pub fn fs_type_name(magic: i64) -> String {
    match magic as u64 {
        0xEF53 => "ext".into(),
        0x73717368 => "squashfs".into(),
        0x01021994 => "tmpfs".into(),
        0x858458F6 => "ramfs".into(),
        0x794C7630 => "overlay".into(),
        0x65735546 => "fuse".into(),
        0x65735543 => "fusectl".into(),
        0x9FA0 => "proc".into(),
        0x62656572 => "sysfs".into(),
        0x1CD1 => "devpts".into(),
        0x9123683E => "btrfs".into(),
        0x58465342 => "xfs".into(),
        0x6969 => "nfs".into(),
        other => format!("0x{other:x}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fs_type_names() {
        assert_eq!(fs_type_name(0xEF53), "ext");
        assert_eq!(fs_type_name(0x65735546), "fuse");
        assert_eq!(fs_type_name(0x794C7630), "overlay");
        assert_eq!(fs_type_name(0x1234), "0x1234");
    }

    #[test]
    fn test_statfs_local_paths() {
        let (a, b) = UnixStream::pair().unwrap();
        let (c, _d) = UnixStream::pair().unwrap();
        let mut ops = RpcOps::new(a, c);
        drop(b);

        // Local operations answer without the (dead) server.
        assert!(ops.statfs_flags(Path::new("/")).is_ok());
        assert!(ops.read_mountinfo().unwrap().contains(" / "));
    }

    #[test]
    fn test_remote_call_on_dead_server_is_transport_lost() {
        let (a, b) = UnixStream::pair().unwrap();
        let (c, _d) = UnixStream::pair().unwrap();
        let mut ops = RpcOps::new(a, c);
        drop(b);

        let err = ops.chdir(Path::new("/")).unwrap_err();
        assert!(matches!(err, VesselError::RpcTransportLost));
    }
}
