//! Image drivers: pluggable "mounters" for image filesystems.
//!
//! In setuid mode the kernel mounts SquashFS/ext3 directly (through the RPC
//! Mount method) and the driver's job collapses into invoking that fallback.
//! Unprivileged, the kernel refuses, and the FUSE driver spawns helper
//! processes instead. Both sides present the same interface so the executor
//! routes a mount without caring which world it is in.

pub mod fuse;
pub mod helper;
pub mod kernel;

pub use fuse::FuseDriver;
pub use helper::HelperProcess;
pub use kernel::KernelDriver;

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use nix::mount::MsFlags;
use nix::unistd::Pid;

use vessel_shared::errors::VesselResult;

/// What a driver can mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    Squash,
    Ext3,
    Gocrypt,
    Overlay,
    Fuse,
    Image,
}

pub type Features = HashSet<Feature>;

/// Filesystem families the driver interface distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverFs {
    Squashfs,
    Ext3,
    Overlay,
    GocryptfsSquashfs,
}

/// One mount request handed to a driver.
#[derive(Debug, Clone)]
pub struct MountParams {
    pub source: PathBuf,
    pub target: PathBuf,
    pub fs: DriverFs,
    pub flags: MsFlags,
    pub offset: u64,
    pub size: u64,
    pub key: Option<Vec<u8>>,
    /// Raw mount data (overlay lowerdir/upperdir/workdir string).
    pub data: String,
    /// Session scratch area for multi-stage mounts (gocryptfs staging).
    pub staging: PathBuf,
}

/// The kernel-mount fallback a driver may invoke instead of (or after
/// adjusting) its own handling.
pub type KernelMountFn<'a> = dyn FnMut(&MountParams) -> VesselResult<()> + 'a;

/// A replaceable mount backend.
pub trait ImageDriver {
    fn name(&self) -> &'static str;

    fn features(&self) -> Features;

    /// Performs one mount, either by delegating to `fallback` (kernel path,
    /// possibly with adjusted options) or by spawning a helper and waiting
    /// until the mountpoint appears.
    fn mount(&mut self, params: &MountParams, fallback: &mut KernelMountFn) -> VesselResult<()>;

    /// Called once in MASTER before mounts begin. For hybrid fakeroot the
    /// driver registers an `nsenter` startup prefix targeting the container
    /// process's user namespace.
    fn start(&mut self, container_pid: Option<Pid>, hybrid_fakeroot: bool) -> VesselResult<()>;

    /// Unmounts and terminates helpers, LIFO by mount target. With a target,
    /// only helpers bound to it stop.
    fn stop(&mut self, target: Option<&Path>) -> VesselResult<()>;

    /// Monitor notification: a child with this pid was reaped. Returns an
    /// error iff the pid was one of the driver's helpers — an unexpected
    /// helper death is fatal to the container.
    fn stopped(&mut self, pid: Pid, status: i32) -> VesselResult<()>;
}
