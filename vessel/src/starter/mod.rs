//! Stage bootstrap: shared memory, socketpairs, fd table, namespace entry,
//! and the forks that turn one invocation into the MASTER / RPC_SERVER /
//! STAGE2 process tree.

pub mod fdtable;
pub mod shm;

pub use fdtable::FdTable;
pub use shm::{SharedRegion, StageKind};

use std::os::unix::net::UnixStream;

use nix::sched::CloneFlags;
use tracing::debug;

use vessel_shared::config::EngineConfig;
use vessel_shared::errors::{VesselError, VesselResult};

use crate::privilege;

/// The three socketpairs created before any stage fork. Each role keeps the
/// ends it needs and drops the rest.
pub struct StageSockets {
    /// MASTER end, RPC_SERVER end.
    pub rpc: (UnixStream, UnixStream),
    /// MASTER end, STAGE2 end.
    pub stage2: (UnixStream, UnixStream),
    /// MASTER end, RPC_SERVER end, for SCM_RIGHTS only.
    pub fdpass: (UnixStream, UnixStream),
}

impl StageSockets {
    pub fn create() -> VesselResult<Self> {
        let make = || {
            UnixStream::pair().map_err(|e| VesselError::Setup(format!("socketpair: {e}")))
        };
        Ok(Self {
            rpc: make()?,
            stage2: make()?,
            fdpass: make()?,
        })
    }
}

/// Stage selection happens before any mount or privilege transition, and it
/// must happen before this process grows threads: a second thread would
/// share (or not share) namespace and credential state in ways the stage
/// contract does not allow.
pub fn ensure_single_threaded() -> VesselResult<()> {
    let status = std::fs::read_to_string("/proc/self/status")?;
    let threads: u32 = status
        .lines()
        .find_map(|line| line.strip_prefix("Threads:"))
        .and_then(|v| v.trim().parse().ok())
        .ok_or_else(|| VesselError::Setup("cannot read thread count".into()))?;

    if threads != 1 {
        return Err(VesselError::Setup(format!(
            "stage selection requires a single-threaded process, found {threads} threads"
        )));
    }
    Ok(())
}

/// Enters the namespaces the launch requests, in dependency order: user
/// first (it grants the privilege for the rest when unprivileged), then
/// mount and the optional ones, PID last (it only affects children).
///
/// In setuid mode there is no user namespace and the mount/PID unshares run
/// under temporary escalation instead.
pub fn enter_namespaces(config: &EngineConfig, setuid_mode: bool) -> VesselResult<()> {
    let uid = nix::unistd::getuid().as_raw();
    let gid = nix::unistd::getgid().as_raw();

    if config.namespaces.user {
        nix::sched::unshare(CloneFlags::CLONE_NEWUSER)
            .map_err(|e| VesselError::Setup(format!("unshare(user): {e}")))?;
        write_self_maps(config, uid, gid)?;
        debug!("entered user namespace");
    }

    let mut flags = CloneFlags::CLONE_NEWNS;
    if config.namespaces.uts {
        flags |= CloneFlags::CLONE_NEWUTS;
    }
    if config.namespaces.ipc {
        flags |= CloneFlags::CLONE_NEWIPC;
    }
    if config.namespaces.net {
        flags |= CloneFlags::CLONE_NEWNET;
    }
    if config.namespaces.pid {
        flags |= CloneFlags::CLONE_NEWPID;
    }

    let enter = || -> VesselResult<()> {
        nix::sched::unshare(flags)
            .map_err(|e| VesselError::Setup(format!("unshare({flags:?}): {e}")))?;
        // Nothing we mount from here on may leak into the host namespace.
        nix::mount::mount(
            Some(""),
            "/",
            Some(""),
            nix::mount::MsFlags::MS_SLAVE | nix::mount::MsFlags::MS_REC,
            Some(""),
        )
        .map_err(|e| VesselError::Setup(format!("remount / as rslave: {e}")))
    };

    if setuid_mode && !config.namespaces.user {
        // Without a user namespace both the unshare and the propagation
        // change need host privileges.
        let _guard = privilege::escalate()?;
        enter()?;
    } else {
        enter()?;
    }

    debug!(?flags, "entered namespaces");
    Ok(())
}

/// Installs the single-entry uid/gid maps an unprivileged process may write
/// for itself: fakeroot maps the invoker to 0, otherwise identity.
fn write_self_maps(config: &EngineConfig, uid: u32, gid: u32) -> VesselResult<()> {
    let (container_uid, container_gid) = if config.fakeroot {
        (0, 0)
    } else {
        (uid, gid)
    };

    // Order is mandated by the kernel: setgroups before gid_map.
    std::fs::write("/proc/self/setgroups", b"deny")?;
    std::fs::write("/proc/self/uid_map", format!("{container_uid} {uid} 1"))?;
    std::fs::write("/proc/self/gid_map", format!("{container_gid} {gid} 1"))?;
    Ok(())
}

/// Forks a child sharing this process's filesystem state (root, cwd,
/// umask). Used to split RPC_SERVER off STAGE2: a chroot performed by the
/// RPC side must bind the container process too.
///
/// Returns the child pid in the parent, `None` in the child.
pub fn fork_shared_fs() -> VesselResult<Option<nix::unistd::Pid>> {
    // fork(2) via clone with CLONE_FS; the raw syscall is the only way to
    // combine fork semantics with a shared fs struct.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_clone,
            (libc::CLONE_FS | libc::SIGCHLD) as libc::c_ulong,
            std::ptr::null_mut::<libc::c_void>(),
            std::ptr::null_mut::<libc::c_void>(),
            std::ptr::null_mut::<libc::c_void>(),
            std::ptr::null_mut::<libc::c_void>(),
        )
    };
    match rc {
        -1 => Err(VesselError::Setup(format!(
            "clone(CLONE_FS): {}",
            std::io::Error::last_os_error()
        ))),
        0 => Ok(None),
        pid => Ok(Some(nix::unistd::Pid::from_raw(pid as i32))),
    }
}
