//! Constants shared across stage roles.

/// Names of the entries created inside the session directory.
pub mod session {
    /// The future chroot target.
    pub const ROOT_DIR: &str = "root";

    /// Upper/work staging for the overlay session layer.
    pub const OVERLAY_DIR: &str = "overlay";

    /// Per-subtree bind sources for the underlay session layer.
    pub const UNDERLAY_DIR: &str = "underlay";

    /// Scratch space for image drivers (gocryptfs ciphertext, inner images).
    pub const DRIVER_DIR: &str = "driver";

    /// FUSE helper mount targets that are not the rootfs itself.
    pub const FUSE_DIR: &str = "fuse";

    /// Bind target for the network namespace handle.
    pub const NETNS_FILE: &str = "netns";

    /// Pinned copy of the RPC side's /proc/self/mountinfo, grabbed before
    /// hidepid can hide it.
    pub const MOUNTINFO_FILE: &str = "mountinfo";
}

/// File-descriptor table layout across stage boundaries.
pub mod fdtable {
    use std::os::fd::RawFd;

    /// First inheritable slot; image and /dev/fuse descriptors are promoted
    /// to contiguous numbers starting here.
    pub const FIRST_SLOT: RawFd = 3;
}

/// Timeouts and polling intervals.
pub mod timeouts {
    use std::time::Duration;

    /// How often the FUSE wait-for-mount loop polls /proc/self/mountinfo.
    pub const FUSE_MOUNT_POLL: Duration = Duration::from_millis(25);

    /// Hard deadline for a FUSE helper to establish its mount.
    pub const FUSE_MOUNT_DEADLINE: Duration = Duration::from_secs(10);

    /// Past this, the wait loop logs that the helper is unexpectedly slow.
    pub const FUSE_MOUNT_SLOW: Duration = Duration::from_secs(2);

    /// Grace period between SIGTERM and SIGKILL when stopping a helper.
    pub const HELPER_TERM_GRACE: Duration = Duration::from_secs(1);

    /// Interval of the SIGURG tick that guards the monitor loop against a
    /// missed SIGCHLD.
    pub const MONITOR_TICK: Duration = Duration::from_secs(1);
}

/// Defaults applied when the system configuration leaves a knob unset.
pub mod defaults {
    /// Upper bound for /dev/loopN probing.
    pub const MAX_LOOP_DEVICES: u32 = 256;

    /// Size cap of the session tmpfs, in MiB.
    pub const SESSIONDIR_MAX_SIZE_MB: u32 = 64;

    /// Search path for helper binaries when `binary path` is unset.
    pub const BINARY_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

    /// Unmount retry attempts on EBUSY before falling back to MNT_DETACH.
    pub const UMOUNT_RETRIES: u32 = 10;
}

/// Environment variable carrying the shared-memory fd number into forked
/// stage copies.
pub const ENV_STAGE_SHM_FD: &str = "VESSEL_STAGE_SHM_FD";
