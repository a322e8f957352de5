//! Ordered teardown.
//!
//! Cleanup always runs on the way out, success or failure, and reads its
//! work list exclusively from the [`ContainerContext`]. Errors here are
//! collected and logged; they do not change the exit status — with one
//! exception handled by the monitor (a helper that died under a live
//! container becomes the primary status before cleanup even starts).

use std::path::Path;
use std::process::Command;

use nix::mount::MntFlags;
use tracing::{debug, warn};

use vessel_shared::constants::defaults;
use vessel_shared::errors::{VesselError, VesselResult};

use crate::drivers::ImageDriver;
use crate::mounts::ops::MountOps;
use crate::privilege;
use crate::stages::context::ContainerContext;

/// CNI boundary, consumed as a service (setup happens elsewhere; cleanup
/// only tears down).
pub trait NetworkTeardown {
    fn teardown(&mut self, name: &str) -> VesselResult<()>;
}

/// Cgroup controller boundary.
pub trait CgroupController {
    fn destroy(&mut self) -> VesselResult<()>;
}

/// Runs the full teardown sequence. Returns the collected (already logged)
/// errors for callers that want to inspect them.
pub fn run(
    context: &mut ContainerContext,
    ops: &mut dyn MountOps,
    driver: &mut dyn ImageDriver,
    network: Option<&mut dyn NetworkTeardown>,
    cgroup: Option<&mut dyn CgroupController>,
    unprivileged: bool,
) -> Vec<VesselError> {
    let mut errors = Vec::new();
    let mut collect = |result: VesselResult<()>| {
        if let Err(e) = result {
            warn!("cleanup: {e}");
            errors.push(e);
        }
    };

    // 1. FUSE helpers first: a helper that dies mid-unmount turns every
    //    later step into EIO noise.
    collect(driver.stop(None));

    // 2. Unmount the session in reverse mount order, then drop the (now
    //    empty) session directory itself.
    collect(unmount_all(context, ops, driver));
    if context.session_base.as_os_str().len() > 1
        && let Err(e) = std::fs::remove_dir_all(&context.session_base)
        && context.session_base.exists()
    {
        collect(Err(e.into()));
    }

    // 3. Temporary image directory.
    if let Some(dir) = context.temp_image_dir.take() {
        collect(remove_image_dir(&dir, context.fakeroot_cleanup));
    }

    // 4. CNI teardown, escalating when we are unprivileged and a network
    //    was actually set up.
    if context.network_active
        && context.network_name != "none"
        && let Some(network) = network
    {
        let name = context.network_name.clone();
        if unprivileged {
            collect(match privilege::escalate() {
                Ok(_guard) => network.teardown(&name),
                Err(e) => Err(e),
            });
        } else {
            collect(network.teardown(&name));
        }
    }

    // 5. Cgroup.
    if context.cgroup_active && let Some(cgroup) = cgroup {
        collect(cgroup.destroy());
    }

    // 6. Device-mapper crypt nodes.
    for device in std::mem::take(&mut context.crypt_devices) {
        collect(ops.crypt_close(&device));
    }

    // 7. Instance state file.
    if let Some(state_file) = context.instance_file.take() {
        collect(std::fs::remove_file(&state_file).map_err(Into::into));
    }

    errors
}

/// Reverse-order unmount walk with EBUSY retries and driver interleaving.
fn unmount_all(
    context: &mut ContainerContext,
    ops: &mut dyn MountOps,
    driver: &mut dyn ImageDriver,
) -> VesselResult<()> {
    let points = std::mem::take(&mut context.umount_points);
    let mut last_error = None;

    for target in points.iter().rev() {
        if let Err(e) = unmount_one(ops, target) {
            last_error = Some(e);
        }
        // Any helper serving this mount point is finished with it now.
        if let Err(e) = driver.stop(Some(target)) {
            warn!(target = %target.display(), "driver stop: {e}");
        }
    }

    match last_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn unmount_one(ops: &mut dyn MountOps, target: &Path) -> VesselResult<()> {
    for attempt in 0..defaults::UMOUNT_RETRIES {
        match ops.unmount(target, MntFlags::empty()) {
            Ok(()) => return Ok(()),
            // Not a mount point (already gone or never established).
            Err(e) if e.rpc_errno() == Some(libc::EINVAL) => return Ok(()),
            Err(e) if e.rpc_errno() == Some(libc::EBUSY) => {
                debug!(target = %target.display(), attempt, "unmount busy, retrying");
                std::thread::sleep(std::time::Duration::from_millis(50));
            }
            Err(e) => return Err(e),
        }
    }

    // Still busy after the retries: detach lazily and move on.
    debug!(target = %target.display(), "unmount falling back to MNT_DETACH");
    match ops.unmount(target, MntFlags::MNT_DETACH) {
        Ok(()) => Ok(()),
        Err(e) if e.rpc_errno() == Some(libc::EINVAL) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Deletes an extracted image directory. Files created under a
/// user-namespace mapping do not belong to our real uid, so the deletion
/// re-enters a namespace with the same mapping through the fakeroot
/// sub-helper (a re-exec of our own binary).
fn remove_image_dir(dir: &Path, fakeroot: bool) -> VesselResult<()> {
    let euid_is_root = nix::unistd::geteuid().is_root();
    if euid_is_root || !fakeroot {
        std::fs::remove_dir_all(dir)?;
        return Ok(());
    }

    let status = Command::new("/proc/self/exe")
        .arg("--fakeroot-cleanup")
        .arg(dir)
        .status()
        .map_err(|e| VesselError::Setup(format!("fakeroot cleanup spawn: {e}")))?;
    if !status.success() {
        return Err(VesselError::Setup(format!(
            "fakeroot cleanup of {} failed: {status}",
            dir.display()
        )));
    }
    Ok(())
}

/// Body of the `--fakeroot-cleanup` re-exec: unshare a user namespace
/// mapping our uid to root, then delete the tree with the mapped identity.
pub fn fakeroot_cleanup_main(dir: &Path) -> VesselResult<()> {
    let uid = nix::unistd::getuid().as_raw();
    let gid = nix::unistd::getgid().as_raw();

    nix::sched::unshare(nix::sched::CloneFlags::CLONE_NEWUSER)
        .map_err(|e| VesselError::Setup(format!("unshare(user): {e}")))?;

    std::fs::write("/proc/self/setgroups", b"deny")?;
    std::fs::write("/proc/self/uid_map", format!("0 {uid} 1"))?;
    std::fs::write("/proc/self/gid_map", format!("0 {gid} 1"))?;

    std::fs::remove_dir_all(dir)?;
    Ok(())
}
