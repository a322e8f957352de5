//! The shared-memory region linking the stage roles.
//!
//! A `memfd` mapped `MAP_SHARED` before any fork, carrying two things: the
//! stage selector (which role a freshly forked copy should assume) and the
//! engine-config JSON blob STAGE1 emits for its siblings. Forked copies see
//! the same pages; a copy that re-execs can recover the region through the
//! inherited descriptor number in the environment.

use std::num::NonZeroUsize;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::ptr::NonNull;

use nix::sys::memfd::{MemFdCreateFlag, memfd_create};
use nix::sys::mman::{MapFlags, ProtFlags, mmap, munmap};

use vessel_shared::constants::ENV_STAGE_SHM_FD;
use vessel_shared::errors::{VesselError, VesselResult};

/// Role selector values stored in the region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum StageKind {
    Stage1 = 1,
    Stage2 = 2,
    Master = 3,
    RpcServer = 4,
}

impl StageKind {
    fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(StageKind::Stage1),
            2 => Some(StageKind::Stage2),
            3 => Some(StageKind::Master),
            4 => Some(StageKind::RpcServer),
            _ => None,
        }
    }
}

/// Byte layout: selector u32 | blob length u32 | blob bytes.
const HEADER: usize = 8;

/// Enough for any realistic engine config.
const DEFAULT_CAPACITY: usize = 1 << 20;

pub struct SharedRegion {
    ptr: NonNull<libc::c_void>,
    len: usize,
    fd: OwnedFd,
}

// The region is only mutated through &mut methods; the raw pointer does not
// make it thread-hostile.
unsafe impl Send for SharedRegion {}

impl SharedRegion {
    /// Creates and maps a fresh region. Must happen before the stage forks.
    pub fn create() -> VesselResult<Self> {
        let fd = memfd_create("vessel-stage", MemFdCreateFlag::empty())
            .map_err(|e| VesselError::Setup(format!("memfd_create: {e}")))?;
        nix::unistd::ftruncate(&fd, DEFAULT_CAPACITY as i64)
            .map_err(|e| VesselError::Setup(format!("ftruncate: {e}")))?;
        Self::map(fd, DEFAULT_CAPACITY)
    }

    /// Recovers the region in a re-exec'd copy from the inherited fd.
    pub fn from_env() -> VesselResult<Self> {
        let raw: i32 = std::env::var(ENV_STAGE_SHM_FD)
            .ok()
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| VesselError::Setup(format!("{ENV_STAGE_SHM_FD} not set")))?;
        // Safety: the starter placed exactly this descriptor in the child.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        Self::map(fd, DEFAULT_CAPACITY)
    }

    fn map(fd: OwnedFd, len: usize) -> VesselResult<Self> {
        let ptr = unsafe {
            mmap(
                None,
                NonZeroUsize::new(len).expect("capacity is non-zero"),
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                fd.as_fd(),
                0,
            )
        }
        .map_err(|e| VesselError::Setup(format!("mmap: {e}")))?;

        Ok(Self { ptr, len, fd })
    }

    pub fn fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    pub fn raw_fd(&self) -> i32 {
        self.fd.as_raw_fd()
    }

    fn bytes(&self) -> &[u8] {
        // Safety: the mapping is live for the lifetime of self.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr() as *const u8, self.len) }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr() as *mut u8, self.len) }
    }

    /// Sets the selector. The surrounding launcher calls this immediately
    /// before each fork so the child knows which role it is.
    pub fn set_stage(&mut self, stage: StageKind) {
        self.bytes_mut()[..4].copy_from_slice(&(stage as u32).to_ne_bytes());
    }

    pub fn stage(&self) -> VesselResult<StageKind> {
        let raw = u32::from_ne_bytes(self.bytes()[..4].try_into().unwrap());
        StageKind::from_u32(raw)
            .ok_or_else(|| VesselError::Setup(format!("invalid stage selector {raw}")))
    }

    /// Stores the engine-config blob.
    pub fn write_config(&mut self, blob: &[u8]) -> VesselResult<()> {
        if HEADER + blob.len() > self.len {
            return Err(VesselError::Setup(format!(
                "engine config of {} bytes exceeds the shared region",
                blob.len()
            )));
        }
        let bytes = self.bytes_mut();
        bytes[4..8].copy_from_slice(&(blob.len() as u32).to_ne_bytes());
        bytes[HEADER..HEADER + blob.len()].copy_from_slice(blob);
        Ok(())
    }

    pub fn read_config(&self) -> VesselResult<Vec<u8>> {
        let bytes = self.bytes();
        let len = u32::from_ne_bytes(bytes[4..8].try_into().unwrap()) as usize;
        if len == 0 || HEADER + len > self.len {
            return Err(VesselError::Setup("no engine config in shared region".into()));
        }
        Ok(bytes[HEADER..HEADER + len].to_vec())
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.ptr, self.len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_selector_round_trip() {
        let mut region = SharedRegion::create().unwrap();
        for stage in [
            StageKind::Stage1,
            StageKind::Stage2,
            StageKind::Master,
            StageKind::RpcServer,
        ] {
            region.set_stage(stage);
            assert_eq!(region.stage().unwrap(), stage);
        }
    }

    #[test]
    fn test_uninitialized_selector_rejected() {
        let region = SharedRegion::create().unwrap();
        assert!(region.stage().is_err());
    }

    #[test]
    fn test_config_blob_round_trip() {
        let mut region = SharedRegion::create().unwrap();
        let blob = br#"{"image":"/images/app.sif"}"#;
        region.write_config(blob).unwrap();
        assert_eq!(region.read_config().unwrap(), blob);
    }

    #[test]
    fn test_empty_config_rejected() {
        let region = SharedRegion::create().unwrap();
        assert!(region.read_config().is_err());
    }

    #[test]
    fn test_oversized_config_rejected() {
        let mut region = SharedRegion::create().unwrap();
        let blob = vec![0u8; DEFAULT_CAPACITY];
        assert!(region.write_config(&blob).is_err());
    }

    #[test]
    fn test_visible_across_fork() {
        use nix::sys::wait::{WaitStatus, waitpid};
        use nix::unistd::{ForkResult, fork};

        let mut region = SharedRegion::create().unwrap();
        region.set_stage(StageKind::Master);
        region.write_config(b"forked").unwrap();

        // Safety: the child only reads the mapping and exits immediately,
        // without allocating.
        match unsafe { fork() }.unwrap() {
            ForkResult::Child => {
                let ok = matches!(region.stage(), Ok(StageKind::Master));
                unsafe { libc::_exit(if ok { 0 } else { 1 }) };
            }
            ForkResult::Parent { child } => {
                let status = waitpid(child, None).unwrap();
                assert_eq!(status, WaitStatus::Exited(child, 0));
            }
        }
    }
}
