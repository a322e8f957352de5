//! Mount plan execution.
//!
//! Drives the plan tag by tag against the [`MountOps`] seam, routing each
//! entry to the generic mount path, the loop service, or the image driver.
//! The error policies live here: skip-on-error entries log and continue,
//! missing destinations are created when a session layer can carry them,
//! and the kernel-overlay quirks (ESTALE, EINVAL, EPERM inside user
//! namespaces) get their retry ladders.

use std::path::{Path, PathBuf};

use nix::mount::MsFlags;
use tracing::{debug, warn};

use vessel_shared::config::{EngineConfig, SessionLayer};
use vessel_shared::errors::{VesselError, VesselResult};

use crate::drivers::{DriverFs, ImageDriver, MountParams};
use crate::session::Session;
use crate::stages::context::ContainerContext;

use super::mountinfo;
use super::ops::{LoopAttach, MountOps};
use super::plan::{HookContext, MountPlan};
use super::point::{MountPoint, Tag};
use super::reconcile;

/// Overlay retry budget: one ESTALE retry with index=off, one EINVAL retry
/// with xino stripped. A second occurrence of either is fatal.
const OVERLAY_RETRIES: u32 = 1;

pub struct MountExecutor<'a> {
    ops: &'a mut dyn MountOps,
    driver: &'a mut dyn ImageDriver,
    session: &'a mut Session,
    context: &'a mut ContainerContext,
    config: &'a EngineConfig,
    /// Kernel image mounts allowed (setuid mode and `allow setuid-mount`).
    kernel_image_mounts: bool,
}

impl<'a> MountExecutor<'a> {
    pub fn new(
        ops: &'a mut dyn MountOps,
        driver: &'a mut dyn ImageDriver,
        session: &'a mut Session,
        context: &'a mut ContainerContext,
        config: &'a EngineConfig,
        kernel_image_mounts: bool,
    ) -> Self {
        Self {
            ops,
            driver,
            session,
            context,
            config,
            kernel_image_mounts,
        }
    }

    /// Executes the whole plan in tag order. Within a tag: before-hooks,
    /// entries in insertion order, after-hooks.
    pub fn execute(&mut self, plan: &mut MountPlan) -> VesselResult<()> {
        for tag in Tag::ORDER {
            {
                let mut ctx = HookContext {
                    ops: &mut *self.ops,
                    session: &mut *self.session,
                };
                plan.run_before_hooks(tag, &mut ctx)?;
            }

            let entries: Vec<MountPoint> = plan.entries(tag).to_vec();
            for point in &entries {
                match self.execute_entry(tag, point, plan) {
                    Ok(()) => {}
                    // Per-entry skip flag silences any failure; best-effort
                    // tags additionally tolerate missing sources/targets.
                    Err(e) if point.internal.skip_on_error => {
                        warn!(destination = %point.destination.display(), error = %e, "skipping mount");
                    }
                    Err(e) if e.is_skippable() && !tag.missing_is_fatal() => {
                        warn!(destination = %point.destination.display(), error = %e, "skipping mount");
                    }
                    Err(e) => return Err(e),
                }
            }

            {
                let mut ctx = HookContext {
                    ops: &mut *self.ops,
                    session: &mut *self.session,
                };
                plan.run_after_hooks(tag, &mut ctx)?;
            }
        }
        Ok(())
    }

    fn execute_entry(
        &mut self,
        tag: Tag,
        point: &MountPoint,
        plan: &MountPlan,
    ) -> VesselResult<()> {
        if point.internal.propagation {
            return self.ops.mount(None, &point.destination, None, point.flags, "");
        }
        if point.internal.remount {
            return self.execute_remount(point, plan);
        }
        if point.internal.crypt {
            return self.execute_crypt(point);
        }
        if point.internal.image_partition || point.internal.needs_loop {
            return self.execute_image(point);
        }
        if point.fs_type.as_deref() == Some("overlay") {
            return self.execute_overlay(point);
        }
        self.execute_generic(tag, point)
    }

    // ── remount reconciliation ──────────────────────────────────────────

    fn execute_remount(&mut self, point: &MountPoint, plan: &MountPlan) -> VesselResult<()> {
        let primary = plan.primary_for(&point.destination);

        let (bind_flags, source_flags) = match primary {
            Some(primary) => {
                let source_flags = match primary.source.as_deref() {
                    Some(source) => match self.ops.statfs_flags(source) {
                        Ok(flags) => flags,
                        Err(_) => {
                            // statfs unusable: fall back to the mountinfo
                            // entry the source lives on.
                            let text = self.ops.read_mountinfo()?;
                            let entries = mountinfo::parse(&text)?;
                            mountinfo::owner_of(&entries, source)
                                .map(|e| e.option_bits())
                                .unwrap_or(0)
                        }
                    },
                    None => 0,
                };
                (primary.flags, source_flags)
            }
            None => (MsFlags::empty(), 0),
        };

        let flags = reconcile::remount_flags(bind_flags, source_flags, point.flags);
        match self.ops.mount(None, &point.destination, None, flags, "") {
            Ok(()) => Ok(()),
            Err(e) if e.rpc_errno() == Some(libc::EPERM) && self.config.namespaces.user => {
                // Inside a user namespace the kernel refuses to tighten some
                // inherited flags; the read-only intent is advisory there.
                warn!(
                    destination = %point.destination.display(),
                    "remount refused in user namespace, continuing"
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    // ── encrypted images ────────────────────────────────────────────────

    fn execute_crypt(&mut self, point: &MountPoint) -> VesselResult<()> {
        let key = point.key.as_deref().ok_or(VesselError::CryptBadKey)?;
        let source = point.source.as_deref().ok_or(VesselError::CryptBadKey)?;

        if point.fs_type.as_deref() == Some("gocryptfs-squashfs") {
            // Userspace encryption runs entirely through the FUSE driver.
            return self.driver_mount(point, DriverFs::GocryptfsSquashfs);
        }

        // LUKS: loop-attach the region, open the mapping, mount the mapper
        // node as the target filesystem.
        let request = self.loop_request(source, point);
        let device = self.ops.loop_attach(&request)?;
        self.context.record_loop(device);

        let mapper = self.ops.crypt_open(device, key)?;
        self.context.record_crypt(&mapper);

        self.ops.mount(
            Some(&mapper),
            &point.destination,
            point.fs_type.as_deref(),
            point.flags,
            &point.data,
        )?;
        self.context.record_mount(&point.destination);
        Ok(())
    }

    // ── image mounts (loop or driver) ───────────────────────────────────

    fn execute_image(&mut self, point: &MountPoint) -> VesselResult<()> {
        if self.kernel_image_mounts {
            let source = point
                .source
                .clone()
                .ok_or_else(|| VesselError::MountSourceMissing(point.destination.clone()))?;
            let request = self.loop_request(&source, point);
            let device = self.ops.loop_attach(&request)?;
            self.context.record_loop(device);

            let loop_path = PathBuf::from(format!("/dev/loop{device}"));
            self.ops.mount(
                Some(&loop_path),
                &point.destination,
                point.fs_type.as_deref(),
                point.flags,
                &point.data,
            )?;
            self.context.record_mount(&point.destination);
            return Ok(());
        }

        let fs = match point.fs_type.as_deref() {
            Some("ext3") | Some("ext4") => DriverFs::Ext3,
            Some("gocryptfs-squashfs") => DriverFs::GocryptfsSquashfs,
            _ => DriverFs::Squashfs,
        };
        self.driver_mount(point, fs)
    }

    fn driver_mount(&mut self, point: &MountPoint, fs: DriverFs) -> VesselResult<()> {
        let params = MountParams {
            source: point.source.clone().unwrap_or_default(),
            target: point.destination.clone(),
            fs,
            flags: point.flags,
            offset: point.offset.unwrap_or(0),
            size: point.size.unwrap_or(0),
            key: point.key.clone(),
            data: point.data.clone(),
            staging: self
                .session
                .area(vessel_shared::constants::session::DRIVER_DIR),
        };

        let ops = &mut *self.ops;
        let max_loop = self.config.sysconf.max_loop_devices;
        let context = &mut *self.context;
        let mut fallback = |p: &MountParams| -> VesselResult<()> {
            // Kernel path on behalf of the driver: loop attach + RPC mount.
            let device = ops.loop_attach(&LoopAttach {
                file: p.source.clone(),
                offset: p.offset,
                size_limit: p.size,
                read_only: p.flags.contains(MsFlags::MS_RDONLY),
                shared: p.flags.contains(MsFlags::MS_RDONLY),
                max_devices: max_loop,
            })?;
            context.record_loop(device);
            let loop_path = PathBuf::from(format!("/dev/loop{device}"));
            let fs_name = match p.fs {
                DriverFs::Ext3 => "ext3",
                _ => "squashfs",
            };
            ops.mount(Some(&loop_path), &p.target, Some(fs_name), p.flags, &p.data)
        };

        self.driver.mount(&params, &mut fallback)?;
        self.context.record_mount(&point.destination);
        Ok(())
    }

    fn loop_request(&self, source: &Path, point: &MountPoint) -> LoopAttach {
        let read_only = point.flags.contains(MsFlags::MS_RDONLY);
        LoopAttach {
            file: source.to_path_buf(),
            offset: point.offset.unwrap_or(0),
            size_limit: point.size.unwrap_or(0),
            read_only,
            // Sharing is only sound for read-only backings.
            shared: read_only,
            max_devices: self.config.sysconf.max_loop_devices,
        }
    }

    // ── overlay ─────────────────────────────────────────────────────────

    fn execute_overlay(&mut self, point: &MountPoint) -> VesselResult<()> {
        // Kernel overlayfs cannot stack on FUSE lowers; route the whole
        // mount to the overlay image driver in that case.
        let lowers = parse_lowerdirs(&point.data);
        let mut any_fuse = false;
        for lower in &lowers {
            if let Ok(fs_name) = self.ops.statfs_type(lower)
                && fs_name.starts_with("fuse")
            {
                any_fuse = true;
                break;
            }
        }

        if any_fuse {
            debug!(destination = %point.destination.display(), "FUSE lower layer, using overlay driver");
            return self.driver_mount(point, DriverFs::Overlay);
        }

        let mut data = point.data.clone();
        let mut estale_retries = OVERLAY_RETRIES;
        let mut einval_retries = OVERLAY_RETRIES;

        loop {
            match self.ops.mount(
                Some(Path::new("overlay")),
                &point.destination,
                Some("overlay"),
                point.flags,
                &data,
            ) {
                Ok(()) => {
                    self.context.record_mount(&point.destination);
                    return Ok(());
                }
                Err(e) if e.rpc_errno() == Some(libc::ESTALE) && estale_retries > 0 => {
                    estale_retries -= 1;
                    warn!("overlay returned ESTALE, retrying with index=off");
                    if !data.contains("index=off") {
                        data.push_str(",index=off");
                    }
                }
                Err(e) if e.rpc_errno() == Some(libc::ESTALE) => {
                    return Err(VesselError::MountKernelEstale(point.destination.clone()));
                }
                Err(e) if e.rpc_errno() == Some(libc::EINVAL) && einval_retries > 0 => {
                    einval_retries -= 1;
                    warn!("overlay returned EINVAL, retrying without xino");
                    data = strip_option(&data, "xino");
                }
                Err(e) if e.rpc_errno() == Some(libc::EINVAL) => {
                    return Err(VesselError::MountKernelEinval(point.destination.clone()));
                }
                Err(e) => return Err(e),
            }
        }
    }

    // ── everything else ─────────────────────────────────────────────────

    fn execute_generic(&mut self, tag: Tag, point: &MountPoint) -> VesselResult<()> {
        let is_bind = point.flags.contains(MsFlags::MS_BIND);

        // Bind sources must exist; filesystem mounts have virtual sources.
        let source_stat = match (&point.source, is_bind) {
            (Some(source), true) => {
                let stat = self.ops.stat(source)?;
                if stat.is_none() {
                    return Err(VesselError::MountSourceMissing(source.clone()));
                }
                stat
            }
            _ => None,
        };

        // The cwd mount is elided when the directory is already reachable
        // inside the container with the same identity.
        if tag == Tag::Cwd
            && let (Some(source_stat), Some(dest_stat)) =
                (source_stat, self.ops.stat(&point.destination)?)
            && source_stat.dev == dest_stat.dev
            && source_stat.ino == dest_stat.ino
        {
            debug!(cwd = ?point.source, "cwd already reachable, not mounting");
            return Ok(());
        }

        self.ensure_destination(point, source_stat.map(|s| s.is_dir).unwrap_or(true))?;

        self.ops.mount(
            point.source.as_deref(),
            &point.destination,
            point.fs_type.as_deref(),
            point.flags,
            &point.data,
        )?;
        self.context.record_mount(&point.destination);
        Ok(())
    }

    /// Creates a missing destination when a session layer (or a writable
    /// image) can absorb it; otherwise reports it per the tag policy.
    fn ensure_destination(&mut self, point: &MountPoint, source_is_dir: bool) -> VesselResult<()> {
        if self.ops.stat(&point.destination)?.is_some() {
            return Ok(());
        }

        let can_create = self.config.session_layer != SessionLayer::Default
            || self.config.writable_image
            || point.destination.starts_with(self.session.base());

        if !can_create {
            return Err(VesselError::MountDestinationMissing(
                point.destination.clone(),
            ));
        }

        if source_is_dir {
            self.ops.mkdir_all(&point.destination, 0o755)?;
        } else {
            if let Some(parent) = point.destination.parent() {
                self.ops.mkdir_all(parent, 0o755)?;
            }
            self.ops.write_file(&point.destination, 0o644, b"")?;
        }
        Ok(())
    }
}

fn parse_lowerdirs(data: &str) -> Vec<PathBuf> {
    data.split(',')
        .find_map(|opt| opt.strip_prefix("lowerdir="))
        .map(|dirs| dirs.split(':').map(PathBuf::from).collect())
        .unwrap_or_default()
}

/// Removes `key=...` from a mount data string.
fn strip_option(data: &str, key: &str) -> String {
    data.split(',')
        .filter(|opt| !opt.starts_with(&format!("{key}=")))
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_lowerdirs() {
        let lowers = parse_lowerdirs("lowerdir=/a:/b,upperdir=/u,workdir=/w");
        assert_eq!(lowers, vec![PathBuf::from("/a"), PathBuf::from("/b")]);
        assert!(parse_lowerdirs("upperdir=/u").is_empty());
    }

    #[test]
    fn test_strip_option() {
        assert_eq!(
            strip_option("lowerdir=/a,xino=on,upperdir=/u", "xino"),
            "lowerdir=/a,upperdir=/u"
        );
        assert_eq!(strip_option("xino=auto", "xino"), "");
        assert_eq!(strip_option("lowerdir=/a", "xino"), "lowerdir=/a");
    }
}
