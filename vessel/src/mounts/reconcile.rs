//! Remount flag reconciliation.
//!
//! A bind mount ignores most flags at bind time; read-only and friends only
//! take hold on a follow-up MS_REMOUNT. That remount must carry every flag
//! the source filesystem already has, or the kernel refuses it (EPERM inside
//! user namespaces, EINVAL elsewhere). The effective flag set is therefore
//!
//! ```text
//! effective = bind.flags ∪ source.statfs_flags ∪ remount.requested_flags
//! ```
//!
//! with `MS_REMOUNT` and `ST_RELATIME` cleared from the union before OR-ing
//! the remount request back in.

use std::path::Path;

use nix::mount::MsFlags;

use vessel_shared::errors::VesselResult;

use super::mountinfo::{self, MountInfoEntry};

/// Bits stripped from the inherited union. 32 is MS_REMOUNT, 4096 is
/// ST_RELATIME in statfs numbering.
const MASKED_BITS: u64 = 32 | 4096;

/// Computes the flag word for a remount at a bound destination.
///
/// `source_fs_flags` are the raw `statfs().f_flags` of the bind source (or
/// the mountinfo-derived equivalent when statfs is unusable).
pub fn remount_flags(bind_flags: MsFlags, source_fs_flags: u64, requested: MsFlags) -> MsFlags {
    let mut bits = bind_flags.bits() | source_fs_flags | requested.bits();
    bits &= !MASKED_BITS;
    // The remount itself still needs MS_REMOUNT (and stays a bind remount).
    bits |= MsFlags::MS_REMOUNT.bits();
    MsFlags::from_bits_truncate(bits)
}

/// statfs-flag lookup with the mountinfo fallback: when statfs on the source
/// fails or the path sits on a filesystem that misreports (overlay lowers,
/// FUSE with hidepid), fall back to the options of the mountinfo entry the
/// path lives on.
pub fn source_fs_flags(
    source: &Path,
    entries_fallback: &[MountInfoEntry],
) -> VesselResult<u64> {
    match nix::sys::statfs::statfs(source) {
        Ok(st) => Ok(st.flags().bits() as u64),
        Err(_) => Ok(mountinfo::owner_of(entries_fallback, source)
            .map(|e| e.option_bits())
            .unwrap_or(0)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_union_of_all_three_inputs() {
        let flags = remount_flags(
            MsFlags::MS_BIND,
            libc::MS_NOSUID | libc::MS_NODEV,
            MsFlags::MS_RDONLY,
        );
        assert!(flags.contains(MsFlags::MS_BIND));
        assert!(flags.contains(MsFlags::MS_NOSUID));
        assert!(flags.contains(MsFlags::MS_NODEV));
        assert!(flags.contains(MsFlags::MS_RDONLY));
        assert!(flags.contains(MsFlags::MS_REMOUNT));
    }

    #[test]
    fn test_relatime_bit_masked() {
        let flags = remount_flags(MsFlags::empty(), 4096, MsFlags::MS_RDONLY);
        assert_eq!(flags.bits() & 4096, 0, "ST_RELATIME must not survive");
    }

    #[test]
    fn test_inherited_remount_bit_masked_then_restored() {
        // A source reporting bit 32 must not poison the union; the final
        // word carries MS_REMOUNT exactly once because the operation is one.
        let flags = remount_flags(MsFlags::empty(), 32, MsFlags::empty());
        assert_eq!(flags, MsFlags::MS_REMOUNT);
    }

    #[test]
    fn test_idempotent() {
        let once = remount_flags(
            MsFlags::MS_BIND,
            libc::MS_NOSUID | 4096,
            MsFlags::MS_RDONLY,
        );
        let twice = remount_flags(once, libc::MS_NOSUID | 4096, MsFlags::MS_RDONLY);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_statfs_on_root_succeeds() {
        // Any live filesystem answers statfs; just prove the plumbing.
        let bits = source_fs_flags(Path::new("/"), &[]).unwrap();
        let _ = bits;
    }

    #[test]
    fn test_fallback_uses_mountinfo_owner() {
        let entries = mountinfo::parse(
            "40 1 0:35 / /proc rw,nosuid,nodev,noexec,relatime - proc proc rw\n",
        )
        .unwrap();
        let bits = source_fs_flags(Path::new("/nonexistent-path-vessel/x"), &entries).unwrap();
        // No entry owns the path, so the fallback reports no flags.
        assert_eq!(bits, 0);

        let bits = source_fs_flags(Path::new("/proc/self-nonexistent-zz/status"), &entries);
        // statfs may succeed on /proc on the host; either path is fine, the
        // call must not error.
        assert!(bits.is_ok());
    }
}
