//! Inheritable descriptor slots.
//!
//! Image descriptors and /dev/fuse handles opened in STAGE1 must reach every
//! later stage at predictable numbers, because the engine config references
//! them as `/proc/self/fd/N`. Registration assigns the next contiguous slot
//! starting at 3; installation dup2's each descriptor onto its slot (dup2
//! clears CLOEXEC, which is exactly the inheritance we want) and leaves the
//! slots open for the lifetime of the process tree.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use vessel_shared::constants::fdtable::FIRST_SLOT;
use vessel_shared::errors::{VesselError, VesselResult};

#[derive(Default)]
pub struct FdTable {
    pending: Vec<OwnedFd>,
}

impl FdTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a descriptor and returns the slot number it will occupy
    /// after [`FdTable::install`].
    pub fn register(&mut self, fd: OwnedFd) -> i32 {
        self.pending.push(fd);
        FIRST_SLOT + (self.pending.len() as i32 - 1)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Moves every registered descriptor onto its contiguous slot.
    pub fn install(self) -> VesselResult<()> {
        let count = self.pending.len() as RawFd;
        let last_slot = FIRST_SLOT + count;

        // Hop everything above the slot window first, so a source that
        // happens to sit on a target slot is not clobbered by an earlier
        // dup2. The originals close as the OwnedFds drop.
        let mut parked: Vec<RawFd> = Vec::with_capacity(count as usize);
        for fd in self.pending {
            let hopped = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_DUPFD, last_slot) };
            if hopped < 0 {
                return Err(VesselError::Setup(format!(
                    "F_DUPFD: {}",
                    std::io::Error::last_os_error()
                )));
            }
            parked.push(hopped);
        }

        for (index, raw) in parked.into_iter().enumerate() {
            let slot = FIRST_SLOT + index as RawFd;
            let rc = unsafe { libc::dup2(raw, slot) };
            if rc < 0 {
                return Err(VesselError::Setup(format!(
                    "dup2 to slot {slot}: {}",
                    std::io::Error::last_os_error()
                )));
            }
            unsafe { libc::close(raw) };
        }

        Ok(())
    }
}
