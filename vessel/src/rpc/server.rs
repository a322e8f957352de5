//! Server side of the RPC link.
//!
//! Runs in the RPC_SERVER stage copy, which shares its filesystem root with
//! STAGE2 (`CLONE_FS`), so the Chroot handler changes the container's root
//! too. The loop is strictly sequential: handlers perform per-thread
//! privilege transitions that must never interleave, and a single-threaded
//! server makes the thread-lock requirement structural instead of
//! discretionary.
//!
//! Every handler follows the same shape: compute the capability mask,
//! escalate, perform the one operation, drop. In user-namespace mode there
//! is nothing to escalate to (the process is already root in its namespace)
//! and the guard degrades to a no-op.

use std::collections::VecDeque;
use std::fs::File;
use std::os::fd::AsRawFd;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt, symlink};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use caps::{Capability, CapsHashSet};
use nix::errno::Errno;
use nix::fcntl::{OFlag, open};
use nix::mount::{MntFlags, MsFlags, mount, umount2};
use nix::sys::stat::Mode;
use nix::unistd::{fchdir, pivot_root};
use tracing::{debug, warn};

use vessel_shared::errors::{VesselError, VesselResult};

use crate::loopdev;
use crate::mounts::ops::{ChrootMethod, FileStat};
use crate::privilege;

use super::fdpass;
use super::msg::{Reply, Request, RpcFailure, RpcFailureKind};
use super::wire;

type HandlerResult = Result<Reply, RpcFailure>;

pub struct RpcServer {
    stream: UnixStream,
    fd_socket: UnixStream,
    /// Saved uid 0 available, i.e. launched through the setuid helper.
    setuid_mode: bool,
}

impl RpcServer {
    pub fn new(stream: UnixStream, fd_socket: UnixStream) -> Self {
        let setuid_mode = nix::unistd::getresuid()
            .map(|r| r.saved.as_raw() == 0 || r.effective.as_raw() == 0)
            .unwrap_or(false);
        Self {
            stream,
            fd_socket,
            setuid_mode,
        }
    }

    /// Serves requests until the peer closes the socket.
    pub fn serve(&mut self) -> VesselResult<()> {
        loop {
            let request: Request = match wire::read_frame(&mut self.stream) {
                Ok(request) => request,
                // MASTER closing the link is the normal shutdown path.
                Err(VesselError::RpcTransportLost) => return Ok(()),
                Err(e) => return Err(e),
            };

            let method = request.method();
            debug!(method, "rpc request");
            let reply = match self.dispatch(request) {
                Ok(reply) => reply,
                Err(failure) => Reply::Err(failure),
            };
            wire::write_frame(&mut self.stream, &reply)?;
        }
    }

    /// Escalates for the duration of `f` with `mask` effective. The mask is
    /// advisory in user-namespace mode.
    fn with_privilege<T>(
        &self,
        mask: &CapsHashSet,
        op: &str,
        f: impl FnOnce() -> Result<T, RpcFailure>,
    ) -> Result<T, RpcFailure> {
        if !self.setuid_mode {
            return f();
        }

        let _uid_guard = privilege::escalate().map_err(|_| RpcFailure {
            op: op.to_string(),
            kind: RpcFailureKind::NotPrivileged,
            errno: None,
            message: "escalation requires a setuid installation".into(),
        })?;

        let previous = privilege::set_effective(mask)
            .map_err(|e| RpcFailure::other(op, e.to_string()))?;
        let out = f();
        if let Err(e) = privilege::set_effective(&previous) {
            // Leaving extra effective caps around is worse than dying.
            panic!("failed to restore effective capabilities: {e}");
        }
        out
    }

    fn dispatch(&mut self, request: Request) -> HandlerResult {
        let op = request.method();
        match request {
            Request::Mount {
                source,
                target,
                fs_type,
                flags,
                data,
            } => {
                let mut mask = cap_set(&[Capability::CAP_SYS_ADMIN]);
                if fs_type.as_deref() == Some("overlay") {
                    // Overlay validates upper/work ownership against the
                    // mounting credentials.
                    mask.insert(Capability::CAP_FOWNER);
                    mask.insert(Capability::CAP_DAC_OVERRIDE);
                    mask.insert(Capability::CAP_DAC_READ_SEARCH);
                    mask.insert(Capability::CAP_CHOWN);
                }
                self.with_privilege(&mask, op, || {
                    mount(
                        source.as_deref(),
                        &target,
                        fs_type.as_deref(),
                        MsFlags::from_bits_truncate(flags),
                        Some(data.as_str()),
                    )
                    .map_err(|e| RpcFailure::errno(op, e))?;
                    Ok(Reply::Ok)
                })
            }

            Request::Unmount { target, flags } => self.with_privilege(
                &cap_set(&[Capability::CAP_SYS_ADMIN]),
                op,
                || {
                    umount2(&target, MntFlags::from_bits_truncate(flags))
                        .map_err(|e| RpcFailure::errno(op, e))?;
                    Ok(Reply::Ok)
                },
            ),

            Request::Chroot { method } => self.with_privilege(
                &cap_set(&[Capability::CAP_SYS_CHROOT, Capability::CAP_SYS_ADMIN]),
                op,
                || {
                    chroot_here(method).map_err(|e| RpcFailure::errno(op, e))?;
                    Ok(Reply::Ok)
                },
            ),

            Request::LoopDevice(attach) => self.with_privilege(
                &cap_set(&[Capability::CAP_MKNOD, Capability::CAP_SYS_ADMIN]),
                op,
                || match loopdev::attach(&attach) {
                    Ok(number) => Ok(Reply::Number(number as u64)),
                    Err(e) => Err(RpcFailure::other(op, e.to_string())),
                },
            ),

            Request::Decrypt {
                loop_device,
                key,
                host_ipc,
            } => self.with_privilege(
                &cap_set(&[Capability::CAP_SYS_ADMIN]),
                op,
                || decrypt(loop_device, &key, host_ipc),
            ),

            Request::CryptClose { device } => self.with_privilege(
                &cap_set(&[Capability::CAP_SYS_ADMIN]),
                op,
                || crypt_close(&device),
            ),

            Request::Mkdir { path, mode } => self.simple(op, || {
                std::fs::create_dir_all(&path).map_err(io_failure(op))?;
                std::fs::set_permissions(&path, PermissionsExt::from_mode(mode))
                    .map_err(io_failure(op))?;
                Ok(Reply::Ok)
            }),

            Request::Chown { path, uid, gid } => self.with_privilege(
                &cap_set(&[Capability::CAP_CHOWN]),
                op,
                || {
                    nix::unistd::chown(
                        &path,
                        Some(nix::unistd::Uid::from_raw(uid)),
                        Some(nix::unistd::Gid::from_raw(gid)),
                    )
                    .map_err(|e| RpcFailure::errno(op, e))?;
                    Ok(Reply::Ok)
                },
            ),

            Request::Lchown { path, uid, gid } => self.with_privilege(
                &cap_set(&[Capability::CAP_CHOWN]),
                op,
                || {
                    let c_path = std::ffi::CString::new(path.as_os_str().as_encoded_bytes())
                        .map_err(|_| RpcFailure::other(op, "path contains NUL"))?;
                    let rc = unsafe { libc::lchown(c_path.as_ptr(), uid, gid) };
                    Errno::result(rc).map_err(|e| RpcFailure::errno(op, e))?;
                    Ok(Reply::Ok)
                },
            ),

            Request::Symlink { target, link } => self.simple(op, || {
                symlink(&target, &link).map_err(io_failure(op))?;
                Ok(Reply::Ok)
            }),

            Request::ReadDir { path } => self.simple(op, || {
                let mut entries = Vec::new();
                for entry in std::fs::read_dir(&path).map_err(io_failure(op))? {
                    entries.push(
                        entry
                            .map_err(io_failure(op))?
                            .file_name()
                            .to_string_lossy()
                            .into_owned(),
                    );
                }
                entries.sort();
                Ok(Reply::Entries(entries))
            }),

            Request::Stat { path } => self.simple(op, || Ok(Reply::Stat(stat_of(&path, true)))),

            Request::Lstat { path } => self.simple(op, || Ok(Reply::Stat(stat_of(&path, false)))),

            Request::Readlink { path } => self.simple(op, || {
                let target = std::fs::read_link(&path).map_err(io_failure(op))?;
                Ok(Reply::Path(target))
            }),

            Request::Access { path, mode } => self.simple(op, || {
                let flags = nix::unistd::AccessFlags::from_bits_truncate(mode as i32);
                Ok(Reply::Bool(nix::unistd::access(&path, flags).is_ok()))
            }),

            Request::WriteFile {
                path,
                mode,
                content,
            } => self.simple(op, || {
                use std::io::Write;
                let mut file = std::fs::OpenOptions::new()
                    .create(true)
                    .truncate(true)
                    .write(true)
                    .mode(mode)
                    .open(&path)
                    .map_err(io_failure(op))?;
                file.write_all(&content).map_err(io_failure(op))?;
                Ok(Reply::Ok)
            }),

            Request::Umask { mask } => self.simple(op, || {
                let previous = nix::sys::stat::umask(Mode::from_bits_truncate(mask));
                Ok(Reply::Number(previous.bits() as u64))
            }),

            Request::EvalRelative { path, root } => self.simple(op, || {
                Ok(Reply::Path(eval_relative(&path, &root)))
            }),

            Request::Chdir { path } => self.simple(op, || {
                nix::unistd::chdir(&path).map_err(|e| RpcFailure::errno(op, e))?;
                Ok(Reply::Ok)
            }),

            Request::SetHostname { name } => self.with_privilege(
                &cap_set(&[Capability::CAP_SYS_ADMIN]),
                op,
                || {
                    nix::unistd::sethostname(&name).map_err(|e| RpcFailure::errno(op, e))?;
                    Ok(Reply::Ok)
                },
            ),

            Request::OpenSendFuseFd => {
                let fuse = self.with_privilege(
                    &cap_set(&[Capability::CAP_SYS_ADMIN]),
                    op,
                    || {
                        open(Path::new("/dev/fuse"), OFlag::O_RDWR, Mode::empty())
                            .map_err(|e| RpcFailure::errno(op, e))
                    },
                )?;
                fdpass::send_fds(&self.fd_socket, &[fuse.as_raw_fd()])
                    .map_err(|e| RpcFailure::other(op, e.to_string()))?;
                Ok(Reply::Fds(1))
            }

            Request::SendFuseFd { fds } => {
                // Duplicate the requested descriptors plus our user
                // namespace handle, so the receiver can enter it for
                // privileged mount setup.
                let userns = File::open("/proc/self/ns/user").map_err(io_failure(op))?;
                let mut to_send: Vec<i32> = fds;
                to_send.push(userns.as_raw_fd());
                fdpass::send_fds(&self.fd_socket, &to_send)
                    .map_err(|e| RpcFailure::other(op, e.to_string()))?;
                Ok(Reply::Fds(to_send.len() as u32))
            }

            Request::NvCcli { binary, args, env } => {
                let mut mask = cap_set(&[Capability::CAP_SYS_ADMIN]);
                if !in_user_namespace() {
                    mask.insert(Capability::CAP_CHOWN);
                }
                self.with_privilege(&mask, op, || {
                    let status = Command::new(&binary)
                        .args(&args)
                        .envs(env.iter().cloned())
                        .status()
                        .map_err(io_failure(op))?;
                    if status.success() {
                        Ok(Reply::Ok)
                    } else {
                        Err(RpcFailure::other(
                            op,
                            format!("{} exited with {status}", binary.display()),
                        ))
                    }
                })
            }
        }
    }

    /// Unprivileged delegation; still escalates uid so files land with the
    /// right ownership in setuid mode.
    fn simple(&self, op: &str, f: impl FnOnce() -> HandlerResult) -> HandlerResult {
        self.with_privilege(&CapsHashSet::new(), op, f)
    }
}

fn cap_set(caps: &[Capability]) -> CapsHashSet {
    caps.iter().copied().collect()
}

fn io_failure(op: &str) -> impl Fn(std::io::Error) -> RpcFailure + '_ {
    move |e| match e.raw_os_error() {
        Some(errno) => RpcFailure::errno(op, Errno::from_raw(errno)),
        None => RpcFailure::other(op, e.to_string()),
    }
}

fn stat_of(path: &Path, follow: bool) -> Option<FileStat> {
    let result = if follow {
        nix::sys::stat::stat(path)
    } else {
        nix::sys::stat::lstat(path)
    };
    match result {
        Ok(st) => Some(FileStat {
            dev: st.st_dev as u64,
            ino: st.st_ino,
            mode: st.st_mode,
            uid: st.st_uid,
            gid: st.st_gid,
            size: st.st_size,
            is_dir: st.st_mode & libc::S_IFMT == libc::S_IFDIR,
            is_symlink: st.st_mode & libc::S_IFMT == libc::S_IFLNK,
        }),
        Err(_) => None,
    }
}

/// Switches the root of this process (and of STAGE2, which shares fs state)
/// to the current working directory.
fn chroot_here(method: ChrootMethod) -> nix::Result<()> {
    match method {
        ChrootMethod::Pivot => {
            let old_root = open(
                Path::new("/"),
                OFlag::O_DIRECTORY | OFlag::O_RDONLY,
                Mode::empty(),
            )?;
            // Stacking new root over old at the same path: the held
            // descriptor is the only way back, and we detach it below.
            pivot_root(".", ".")?;
            fchdir(&old_root)?;
            mount(
                Some(""),
                ".",
                Some(""),
                MsFlags::MS_SLAVE | MsFlags::MS_REC,
                Some(""),
            )?;
            umount2(".", MntFlags::MNT_DETACH)?;
        }
        ChrootMethod::Move => {
            mount(Some("."), "/", Some(""), MsFlags::MS_MOVE, Some(""))?;
            nix::unistd::chroot(".")?;
        }
        ChrootMethod::Chroot => {
            nix::unistd::chroot(".")?;
        }
    }
    nix::unistd::chdir("/")
}

fn in_user_namespace() -> bool {
    // A non-initial user namespace maps at most a slice of the uid space.
    match std::fs::read_to_string("/proc/self/uid_map") {
        Ok(map) => !map.split_whitespace().eq(["0", "0", "4294967295"]),
        Err(_) => false,
    }
}

/// Opens the device-mapper crypt mapping over an attached loop device via
/// the block-layer crypt tool, returning the mapper node.
fn decrypt(loop_device: u32, key: &[u8], host_ipc: bool) -> HandlerResult {
    use std::io::Write;

    let op = "decrypt";
    let name = format!("vessel-crypt-{}", std::process::id());
    let loop_path = format!("/dev/loop{loop_device}");

    let _ipc_guard = if host_ipc {
        Some(join_host_ipc().map_err(|e| RpcFailure::other(op, e.to_string()))?)
    } else {
        None
    };

    let mut child = Command::new("cryptsetup")
        .args(["open", "--type", "luks", &loop_path, &name, "--key-file", "-"])
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(io_failure(op))?;

    child
        .stdin
        .take()
        .expect("stdin piped")
        .write_all(key)
        .map_err(io_failure(op))?;

    let output = child.wait_with_output().map_err(io_failure(op))?;
    if !output.status.success() {
        // Exit code 2 is cryptsetup's "no usable key"; anything touching the
        // passphrase surfaces as the bad-key error per the taxonomy.
        return Err(RpcFailure {
            op: op.into(),
            kind: RpcFailureKind::BadKey,
            errno: None,
            message: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }

    Ok(Reply::Path(PathBuf::from(format!("/dev/mapper/{name}"))))
}

fn crypt_close(device: &Path) -> HandlerResult {
    let op = "crypt-close";
    let name = device
        .file_name()
        .ok_or_else(|| RpcFailure::other(op, "bad mapper path"))?;
    let status = Command::new("cryptsetup")
        .arg("close")
        .arg(name)
        .status()
        .map_err(io_failure(op))?;
    if status.success() {
        Ok(Reply::Ok)
    } else {
        Err(RpcFailure::other(op, format!("cryptsetup close: {status}")))
    }
}

/// Enters the host IPC namespace, restoring our own on drop.
struct IpcNsGuard {
    own: File,
}

impl Drop for IpcNsGuard {
    fn drop(&mut self) {
        if let Err(e) = nix::sched::setns(&self.own, nix::sched::CloneFlags::CLONE_NEWIPC) {
            warn!("failed to restore ipc namespace: {e}");
        }
    }
}

fn join_host_ipc() -> VesselResult<IpcNsGuard> {
    let own = File::open("/proc/self/ns/ipc")?;
    let host = File::open("/proc/1/ns/ipc")?;
    nix::sched::setns(&host, nix::sched::CloneFlags::CLONE_NEWIPC)
        .map_err(|e| VesselError::Setup(format!("setns(host ipc): {e}")))?;
    Ok(IpcNsGuard { own })
}

/// Resolves `path` inside `root` following symlinks without ever escaping
/// the root: absolute link targets restart from the root, `..` cannot climb
/// past it.
fn eval_relative(path: &Path, root: &Path) -> PathBuf {
    const MAX_LINKS: u32 = 40;

    let mut resolved = PathBuf::from("/");
    let mut queue: VecDeque<PathBuf> = VecDeque::new();
    queue.push_back(path.to_path_buf());
    let mut links = 0;

    while let Some(current) = queue.pop_front() {
        let mut components: VecDeque<_> = current
            .components()
            .map(|c| c.as_os_str().to_owned())
            .collect();

        while let Some(part) = components.pop_front() {
            if part == "/" {
                resolved = PathBuf::from("/");
                continue;
            }
            if part == "." {
                continue;
            }
            if part == ".." {
                resolved.pop();
                continue;
            }

            resolved.push(&part);
            let real = crate::util::join_rooted(root, &resolved);
            if let Ok(target) = std::fs::read_link(&real) {
                links += 1;
                if links > MAX_LINKS {
                    return resolved;
                }
                if target.is_absolute() {
                    resolved = PathBuf::from("/");
                } else {
                    resolved.pop();
                }
                // Splice the link target in front of what is left.
                let mut rest = PathBuf::from(target);
                for part in components.drain(..) {
                    rest.push(part);
                }
                queue.push_front(rest);
                break;
            }
        }
    }

    resolved
}
