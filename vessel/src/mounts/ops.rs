//! The operation seam between the mount machinery and whoever executes
//! privileged syscalls.
//!
//! In production the implementation is [`crate::rpc::RpcOps`], which forwards
//! each call to the RPC sibling. Tests substitute a recording fake so plan
//! execution runs unprivileged and the emitted syscall stream can be
//! asserted. Nothing else in the process tree is allowed to call mount(2):
//! this trait is the single choke point.

use std::path::{Path, PathBuf};

use nix::mount::{MntFlags, MsFlags};
use serde::{Deserialize, Serialize};

use vessel_shared::errors::VesselResult;

/// How to switch the container root. Preference order is pivot_root, then
/// move+chroot, then plain chroot; the caller picks based on namespace
/// ownership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChrootMethod {
    Pivot,
    Move,
    Chroot,
}

/// Request to attach a backing file to a loop device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopAttach {
    pub file: PathBuf,
    /// Filesystem offset inside the file (SIF partition start).
    pub offset: u64,
    /// Size limit; 0 means to end of file.
    pub size_limit: u64,
    pub read_only: bool,
    /// Re-use an existing loop whose backing (dev, ino) matches.
    pub shared: bool,
    pub max_devices: u32,
}

/// Subset of stat(2) the planner and executor consume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStat {
    pub dev: u64,
    pub ino: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: i64,
    pub is_dir: bool,
    pub is_symlink: bool,
}

/// Privileged operations the mount executor may issue.
pub trait MountOps {
    fn mount(
        &mut self,
        source: Option<&Path>,
        target: &Path,
        fs_type: Option<&str>,
        flags: MsFlags,
        data: &str,
    ) -> VesselResult<()>;

    fn unmount(&mut self, target: &Path, flags: MntFlags) -> VesselResult<()>;

    fn mkdir_all(&mut self, path: &Path, mode: u32) -> VesselResult<()>;

    fn symlink(&mut self, target: &Path, link: &Path) -> VesselResult<()>;

    fn write_file(&mut self, path: &Path, mode: u32, content: &[u8]) -> VesselResult<()>;

    fn chdir(&mut self, path: &Path) -> VesselResult<()>;

    fn chroot(&mut self, method: ChrootMethod) -> VesselResult<()>;

    /// Attaches a backing file, returning the loop device number.
    fn loop_attach(&mut self, request: &LoopAttach) -> VesselResult<u32>;

    /// Opens a device-mapper crypt mapping over an attached loop device and
    /// returns the mapper node path.
    fn crypt_open(&mut self, loop_device: u32, key: &[u8]) -> VesselResult<PathBuf>;

    fn crypt_close(&mut self, device: &Path) -> VesselResult<()>;

    fn set_hostname(&mut self, name: &str) -> VesselResult<()>;

    /// stat(2); `Ok(None)` when the path does not exist.
    fn stat(&mut self, path: &Path) -> VesselResult<Option<FileStat>>;

    /// lstat(2); `Ok(None)` when the path does not exist.
    fn lstat(&mut self, path: &Path) -> VesselResult<Option<FileStat>>;

    /// Raw statfs flag word of the filesystem at `path`.
    fn statfs_flags(&mut self, path: &Path) -> VesselResult<u64>;

    /// The filesystem type name at `path` (statfs f_type, decoded).
    fn statfs_type(&mut self, path: &Path) -> VesselResult<String>;

    /// Full text of the executing side's /proc/self/mountinfo.
    fn read_mountinfo(&mut self) -> VesselResult<String>;

    /// Resolves symlinks of `path` relative to `root` without escaping it.
    fn eval_relative(&mut self, path: &Path, root: &Path) -> VesselResult<PathBuf>;
}
