//! Loop device acquisition.
//!
//! Attaches image files (or regions of them) to `/dev/loopN` so the kernel
//! can mount them as block devices. Callers receive a device *number*, never
//! a path: the path is trivially derived and handing out numbers keeps the
//! API honest about who owns the device (nobody — `LO_FLAGS_AUTOCLEAR` ties
//! the device lifetime to the last open reference).
//!
//! nix does not wrap the loop ioctls, so the constants and the status struct
//! live here, laid out per `<linux/loop.h>`.

use std::fs::OpenOptions;
use std::os::fd::{AsRawFd, RawFd};
use std::path::PathBuf;

use tracing::debug;

use vessel_shared::errors::{VesselError, VesselResult};

use crate::mounts::ops::LoopAttach;

const LOOP_SET_FD: libc::c_ulong = 0x4C00;
const LOOP_CLR_FD: libc::c_ulong = 0x4C01;
const LOOP_SET_STATUS64: libc::c_ulong = 0x4C04;
const LOOP_GET_STATUS64: libc::c_ulong = 0x4C05;

const LO_FLAGS_READ_ONLY: u32 = 1;
const LO_FLAGS_AUTOCLEAR: u32 = 4;

const LO_NAME_SIZE: usize = 64;
const LO_KEY_SIZE: usize = 32;

/// struct loop_info64 from <linux/loop.h>.
#[repr(C)]
struct LoopInfo64 {
    lo_device: u64,
    lo_inode: u64,
    lo_rdevice: u64,
    lo_offset: u64,
    lo_sizelimit: u64,
    lo_number: u32,
    lo_encrypt_type: u32,
    lo_encrypt_key_size: u32,
    lo_flags: u32,
    lo_file_name: [u8; LO_NAME_SIZE],
    lo_crypt_name: [u8; LO_NAME_SIZE],
    lo_encrypt_key: [u8; LO_KEY_SIZE],
    lo_init: [u64; 2],
}

impl LoopInfo64 {
    fn zeroed() -> Self {
        // Safety: all-zero is a valid value for every field.
        unsafe { std::mem::zeroed() }
    }
}

fn loop_path(number: u32) -> PathBuf {
    PathBuf::from(format!("/dev/loop{number}"))
}

fn ioctl(fd: RawFd, request: libc::c_ulong, arg: usize) -> nix::Result<libc::c_int> {
    let res = unsafe { libc::ioctl(fd, request as _, arg) };
    nix::errno::Errno::result(res)
}

/// Attaches the request's backing file and returns the loop device number.
///
/// With `shared` set, an existing device whose backing `(dev, ino, offset)`
/// matches is re-used so multiple containers running the same image share
/// the page cache. Sharing is refused for writable backings: a read-write
/// attachment must own its device.
pub fn attach(request: &LoopAttach) -> VesselResult<u32> {
    let backing = OpenOptions::new()
        .read(true)
        .write(!request.read_only)
        .open(&request.file)
        .map_err(|e| VesselError::LoopDevice(format!("{}: {e}", request.file.display())))?;

    let meta = nix::sys::stat::fstat(&backing)
        .map_err(|e| VesselError::LoopDevice(format!("fstat: {e}")))?;

    if request.shared && request.read_only
        && let Some(number) = find_shared(meta.st_dev as u64, meta.st_ino, request)?
    {
        debug!(number, "re-using shared loop device");
        return Ok(number);
    }

    // Probe devices in order until one accepts the fd. EBUSY means someone
    // grabbed it between our open and the ioctl, so move on.
    for number in 0..request.max_devices {
        let path = loop_path(number);
        let device = match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(d) => d,
            // Missing nodes end the probe on static-/dev systems.
            Err(e) if e.raw_os_error() == Some(libc::ENOENT) => break,
            Err(_) => continue,
        };

        match ioctl(device.as_raw_fd(), LOOP_SET_FD, backing.as_raw_fd() as usize) {
            Ok(_) => {}
            Err(nix::errno::Errno::EBUSY) => continue,
            Err(e) => {
                return Err(VesselError::LoopDevice(format!(
                    "{}: LOOP_SET_FD: {e}",
                    path.display()
                )));
            }
        }

        let mut info = LoopInfo64::zeroed();
        info.lo_offset = request.offset;
        info.lo_sizelimit = request.size_limit;
        info.lo_flags = LO_FLAGS_AUTOCLEAR;
        if request.read_only {
            info.lo_flags |= LO_FLAGS_READ_ONLY;
        }
        let name = request.file.to_string_lossy();
        let name = name.as_bytes();
        let n = name.len().min(LO_NAME_SIZE - 1);
        info.lo_file_name[..n].copy_from_slice(&name[..n]);

        if let Err(e) = ioctl(
            device.as_raw_fd(),
            LOOP_SET_STATUS64,
            &info as *const _ as usize,
        ) {
            let _ = ioctl(device.as_raw_fd(), LOOP_CLR_FD, 0);
            return Err(VesselError::LoopDevice(format!(
                "{}: LOOP_SET_STATUS64: {e}",
                path.display()
            )));
        }

        debug!(number, file = %request.file.display(), offset = request.offset, "loop device attached");
        return Ok(number);
    }

    Err(VesselError::LoopDevice(format!(
        "no free loop device in 0..{}",
        request.max_devices
    )))
}

/// Scans existing devices for one backed by the same file region.
fn find_shared(dev: u64, ino: u64, request: &LoopAttach) -> VesselResult<Option<u32>> {
    for number in 0..request.max_devices {
        let path = loop_path(number);
        let device = match OpenOptions::new().read(true).open(&path) {
            Ok(d) => d,
            Err(e) if e.raw_os_error() == Some(libc::ENOENT) => break,
            Err(_) => continue,
        };

        let mut info = LoopInfo64::zeroed();
        if ioctl(
            device.as_raw_fd(),
            LOOP_GET_STATUS64,
            &mut info as *mut _ as usize,
        )
        .is_err()
        {
            continue; // not configured
        }

        if info.lo_device == dev && info.lo_inode == ino && info.lo_offset == request.offset {
            return Ok(Some(number));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_loop_info_layout() {
        // The kernel ABI fixes this struct at 232 bytes on 64-bit.
        assert_eq!(std::mem::size_of::<LoopInfo64>(), 232);
    }

    #[test]
    fn test_loop_path_format() {
        assert_eq!(loop_path(0), Path::new("/dev/loop0"));
        assert_eq!(loop_path(17), Path::new("/dev/loop17"));
    }

    #[test]
    fn test_attach_missing_backing_file() {
        let request = LoopAttach {
            file: PathBuf::from("/no/such/backing.img"),
            offset: 0,
            size_limit: 0,
            read_only: true,
            shared: false,
            max_devices: 8,
        };
        let err = attach(&request).unwrap_err();
        assert!(matches!(err, VesselError::LoopDevice(_)));
    }
}
