//! Builds the mount plan from the engine configuration.
//!
//! One method per tag, called in tag order by [`Planner::plan`]. The planner
//! only decides *what* to mount; existence checks that depend on mounts
//! having happened (bind destinations inside the rootfs, cwd reachability)
//! are deferred to the executor or to tag hooks.

use std::path::{Path, PathBuf};

use nix::mount::MsFlags;
use tracing::debug;

use vessel_shared::config::{
    EngineConfig, ImageKind, PartitionFs, PartitionUsage, ResolvedImage, SessionLayer,
};
use vessel_shared::constants::session as names;
use vessel_shared::errors::{VesselError, VesselResult};
use vessel_shared::sysconf::MountMode;

use crate::image::Image;
use crate::session::Session;
use crate::util::join_rooted;

use super::mountinfo::MountInfoEntry;
use super::plan::MountPlan;
use super::point::{MountPoint, Tag};

/// Host directories never rec-bound by the hostfs sweep.
const HOSTFS_EXCLUDED: &[&str] = &["/proc", "/sys", "/dev", "/run", "/boot", "/var"];

/// Host directories a cwd mount never reaches into.
const CWD_RESERVED: &[&str] = &["/proc", "/sys", "/dev", "/run"];

pub struct Planner<'a> {
    config: &'a EngineConfig,
    session: &'a mut Session,
    host_mounts: &'a [MountInfoEntry],
}

impl<'a> Planner<'a> {
    pub fn new(
        config: &'a EngineConfig,
        session: &'a mut Session,
        host_mounts: &'a [MountInfoEntry],
    ) -> Self {
        Self {
            config,
            session,
            host_mounts,
        }
    }

    /// Assembles the complete plan in tag order.
    pub fn plan(mut self) -> VesselResult<MountPlan> {
        let mut plan = MountPlan::new();

        self.add_rootfs(&mut plan)?;
        self.add_layer(&mut plan)?;
        self.add_session_hooks(&mut plan);
        self.add_image_binds(&mut plan)?;
        self.add_kernel(&mut plan)?;
        self.add_hostfs(&mut plan)?;
        self.add_binds(&mut plan)?;
        self.add_cwd(&mut plan)?;
        self.add_home(&mut plan)?;
        self.add_userbinds(&mut plan)?;
        self.add_tmp(&mut plan)?;
        self.add_scratch(&mut plan)?;
        self.add_files(&mut plan)?;
        self.add_dev(&mut plan)?;
        self.add_shared(&mut plan)?;
        self.add_final(&mut plan);

        debug!(entries = plan.len(), "mount plan assembled");
        Ok(plan)
    }

    /// Container-absolute path realized under the final (post-layer) root.
    fn in_final(&self, inner: &Path) -> PathBuf {
        join_rooted(self.session.final_path(), inner)
    }

    // ── RootFs ──────────────────────────────────────────────────────────

    fn add_rootfs(&mut self, plan: &mut MountPlan) -> VesselResult<()> {
        let image = self
            .config
            .primary_image()
            .ok_or_else(|| VesselError::Session("no resolved image".into()))?;
        let rootfs = self.session.rootfs_path();
        let source = Image::proc_fd_path(image.fd_slot);

        match image.kind {
            ImageKind::Sandbox => {
                let flags = if image.writable {
                    MsFlags::empty()
                } else {
                    MsFlags::MS_RDONLY
                };
                plan.add(Tag::RootFs, MountPoint::bind(&image.path, &rootfs, flags))?;
                plan.add(
                    Tag::RootFs,
                    MountPoint::remount(&rootfs, flags | MsFlags::MS_BIND),
                )?;
                if image.writable {
                    plan.add(
                        Tag::RootFs,
                        MountPoint::propagation(&rootfs, MsFlags::MS_UNBINDABLE),
                    )?;
                }
            }
            ImageKind::Squashfs => {
                let key = if image.encrypted {
                    self.config.key_material.clone()
                } else {
                    None
                };
                let point = MountPoint::image(
                    &source,
                    &rootfs,
                    "squashfs",
                    MsFlags::MS_RDONLY | MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
                    0,
                    0,
                )
                .with_key(key);
                plan.add(Tag::RootFs, point)?;
            }
            ImageKind::Ext3 => {
                let mut flags = MsFlags::MS_NOSUID | MsFlags::MS_NODEV;
                if !image.writable {
                    flags |= MsFlags::MS_RDONLY;
                }
                plan.add(
                    Tag::RootFs,
                    MountPoint::image(&source, &rootfs, "ext3", flags, 0, 0),
                )?;
            }
            ImageKind::Sif => {
                let part = image.rootfs_partition().ok_or_else(|| {
                    VesselError::ImageUnrecognized(image.path.clone())
                })?;
                let (fs_name, key) = match part.fs {
                    PartitionFs::Squashfs => ("squashfs", None),
                    PartitionFs::Ext3 => ("ext3", None),
                    PartitionFs::EncryptSquashfs => {
                        ("squashfs", self.config.key_material.clone())
                    }
                    PartitionFs::GocryptfsSquashfs => {
                        ("gocryptfs-squashfs", self.config.key_material.clone())
                    }
                    PartitionFs::OverlayExt3 => {
                        return Err(VesselError::ImageUnrecognized(image.path.clone()));
                    }
                };
                let mut flags = MsFlags::MS_NOSUID | MsFlags::MS_NODEV;
                if !(image.writable && part.fs == PartitionFs::Ext3) {
                    flags |= MsFlags::MS_RDONLY;
                }
                plan.add(
                    Tag::RootFs,
                    MountPoint::image(&source, &rootfs, fs_name, flags, part.offset, part.size)
                        .with_key(key),
                )?;
            }
        }
        Ok(())
    }

    // ── PreLayer / Layer ────────────────────────────────────────────────

    fn add_layer(&mut self, plan: &mut MountPlan) -> VesselResult<()> {
        match self.config.session_layer {
            SessionLayer::Overlay => self.add_overlay_layer(plan),
            SessionLayer::Underlay => self.add_underlay_layer(plan),
            SessionLayer::Default => Ok(()),
        }
    }

    fn add_overlay_layer(&mut self, plan: &mut MountPlan) -> VesselResult<()> {
        let overlay_area = self.session.area(names::OVERLAY_DIR);

        // Mount each overlay image as its own lower (or upper) directory.
        let mut lower_dirs: Vec<PathBuf> = Vec::new();
        let mut upper_from_image: Option<PathBuf> = None;

        for (i, overlay) in self.config.overlay_images.iter().enumerate() {
            let target = overlay_area.join(format!("lower-{i}"));
            std::fs::create_dir_all(&target)?;

            let image = self
                .config
                .images
                .iter()
                .find(|img| img.path == overlay.path)
                .ok_or_else(|| {
                    VesselError::Session(format!(
                        "overlay image {} was not resolved",
                        overlay.path.display()
                    ))
                })?;

            let source = Image::proc_fd_path(image.fd_slot);
            let mut flags = MsFlags::MS_NOSUID | MsFlags::MS_NODEV;
            if !overlay.writable {
                flags |= MsFlags::MS_RDONLY;
            }
            let (fs_name, offset, size) = overlay_region(image);
            plan.add(
                Tag::PreLayer,
                MountPoint::image(&source, &target, fs_name, flags, offset, size),
            )?;

            if overlay.writable {
                // A writable overlay image carries the upper/work pair.
                upper_from_image = Some(target.clone());
            } else {
                lower_dirs.push(target);
            }
        }

        // SIF overlay partitions behave like writable overlay images.
        if let Some(image) = self.config.primary_image() {
            for part in image.overlay_partitions() {
                let target = overlay_area.join(format!("part-{}", part.id));
                std::fs::create_dir_all(&target)?;
                let source = Image::proc_fd_path(image.fd_slot);
                let writable = image.writable && part.fs == PartitionFs::OverlayExt3;
                let mut flags = MsFlags::MS_NOSUID | MsFlags::MS_NODEV;
                if !writable {
                    flags |= MsFlags::MS_RDONLY;
                }
                plan.add(
                    Tag::PreLayer,
                    MountPoint::image(&source, &target, "ext3", flags, part.offset, part.size),
                )?;
                if writable {
                    upper_from_image = Some(target);
                } else {
                    lower_dirs.push(target);
                }
            }
        }

        // Upper/work: from a writable image, or tmpfs-backed in the session.
        let (upper, work) = match upper_from_image {
            Some(base) => (base.join("upper"), base.join("work")),
            None if self.config.writable_tmpfs => {
                (overlay_area.join("upper"), overlay_area.join("work"))
            }
            None => {
                // Read-only overlay: no upper at all.
                (PathBuf::new(), PathBuf::new())
            }
        };

        let final_dir = overlay_area.join("final");
        std::fs::create_dir_all(&final_dir)?;
        if !upper.as_os_str().is_empty() {
            std::fs::create_dir_all(&upper)?;
            std::fs::create_dir_all(&work)?;
        }

        // Lower order: overlay images first, rootfs last (least precedence
        // is listed last in overlayfs options).
        let mut lowers: Vec<String> = lower_dirs
            .iter()
            .map(|p| p.display().to_string())
            .collect();
        lowers.push(self.session.rootfs_path().display().to_string());

        let mut data = format!("lowerdir={}", lowers.join(":"));
        if !upper.as_os_str().is_empty() {
            data.push_str(&format!(
                ",upperdir={},workdir={}",
                upper.display(),
                work.display()
            ));
        }

        plan.add(
            Tag::Layer,
            MountPoint::filesystem("overlay", &final_dir, MsFlags::MS_NOSUID | MsFlags::MS_NODEV, &data),
        )?;

        self.session.set_final_path(final_dir);
        Ok(())
    }

    fn add_underlay_layer(&mut self, plan: &mut MountPlan) -> VesselResult<()> {
        let underlay_final = self.session.area(names::UNDERLAY_DIR).join("final");
        std::fs::create_dir_all(&underlay_final)?;

        let rootfs = self.session.rootfs_path();
        let bind_dests: Vec<PathBuf> = self
            .config
            .binds
            .iter()
            .map(|b| b.destination.clone())
            .collect();

        // Everything under the image rootfs is visible in the final dir via
        // per-entry binds; missing bind destinations get real directories in
        // the session instead. The walk must run after RootFs mounted, so it
        // lives in a Layer before-hook.
        let final_dir = underlay_final.clone();
        plan.add_before_hook(
            Tag::Layer,
            Box::new(move |ctx| {
                let mut top_level: Vec<PathBuf> = Vec::new();
                for entry in std::fs::read_dir(&rootfs)? {
                    top_level.push(entry?.path());
                }

                for path in &top_level {
                    let name = path.file_name().unwrap();
                    let target = final_dir.join(name);
                    let meta = std::fs::symlink_metadata(path)?;
                    if meta.file_type().is_symlink() {
                        let link = std::fs::read_link(path)?;
                        ctx.ops.symlink(&link, &target)?;
                    } else if meta.is_dir() {
                        ctx.ops.mkdir_all(&target, 0o755)?;
                        ctx.ops.mount(
                            Some(path),
                            &target,
                            None,
                            MsFlags::MS_BIND | MsFlags::MS_REC,
                            "",
                        )?;
                    } else {
                        ctx.ops.write_file(&target, 0o644, b"")?;
                        ctx.ops.mount(
                            Some(path),
                            &target,
                            None,
                            MsFlags::MS_BIND,
                            "",
                        )?;
                    }
                }

                // Pre-create missing destination subtrees as real session
                // directories so later binds have somewhere to land.
                for dest in &bind_dests {
                    let top = dest.components().nth(1);
                    let Some(std::path::Component::Normal(top)) = top else {
                        continue;
                    };
                    if !top_level.iter().any(|p| p.file_name() == Some(top)) {
                        let realized = join_rooted(&final_dir, dest);
                        ctx.ops.mkdir_all(&realized, 0o755)?;
                    }
                }
                Ok(())
            }),
        );

        self.session.set_final_path(underlay_final);
        Ok(())
    }

    // ── Session ─────────────────────────────────────────────────────────

    fn add_session_hooks(&mut self, plan: &mut MountPlan) {
        let pin_path = self.session.base().join(names::MOUNTINFO_FILE);
        // Pin the RPC side's mountinfo into the session: a bind of the proc
        // file keeps it readable after hidepid hides /proc from this uid.
        plan.add_after_hook(
            Tag::Session,
            Box::new(move |ctx| {
                ctx.ops.write_file(&pin_path, 0o444, b"")?;
                ctx.ops.mount(
                    Some(Path::new("/proc/self/mountinfo")),
                    &pin_path,
                    None,
                    MsFlags::MS_BIND,
                    "",
                )
            }),
        );
    }

    // ── ImageBind ───────────────────────────────────────────────────────

    fn add_image_binds(&mut self, plan: &mut MountPlan) -> VesselResult<()> {
        let Some(image) = self.config.primary_image() else {
            return Ok(());
        };
        let source = Image::proc_fd_path(image.fd_slot);
        let driver_area = self.session.area(names::DRIVER_DIR);

        for bind in self.config.binds.iter().filter(|b| b.partition_id.is_some()) {
            let id = bind.partition_id.unwrap();
            let Some(part) = image.partitions.iter().find(|p| p.id == id) else {
                return Err(VesselError::Session(format!(
                    "bind references missing partition {id}"
                )));
            };
            if part.usage != PartitionUsage::Data {
                return Err(VesselError::Session(format!(
                    "partition {id} is not a data partition"
                )));
            }

            // Stage the partition inside the session, then an ordinary bind
            // onto the user-facing destination.
            let staging = driver_area.join(format!("data-{id}"));
            std::fs::create_dir_all(&staging)?;
            let fs_name = match part.fs {
                PartitionFs::Ext3 | PartitionFs::OverlayExt3 => "ext3",
                _ => "squashfs",
            };
            plan.add(
                Tag::ImageBind,
                MountPoint::image(
                    &source,
                    &staging,
                    fs_name,
                    MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
                    part.offset,
                    part.size,
                ),
            )?;

            let staged_source = match &bind.image_source {
                Some(sub) => join_rooted(&staging, sub),
                None => staging.clone(),
            };
            let mut point = MountPoint::bind(
                &staged_source,
                &self.in_final(&bind.destination),
                MsFlags::empty(),
            )
            .with_skip_on_error(bind.skip_on_error);
            if bind.read_only {
                point.flags |= MsFlags::MS_RDONLY;
            }
            plan.add(Tag::ImageBind, point)?;
        }
        Ok(())
    }

    // ── Kernel ──────────────────────────────────────────────────────────

    fn add_kernel(&mut self, plan: &mut MountPlan) -> VesselResult<()> {
        let knobs = &self.config.sysconf.mount;

        if knobs.proc != MountMode::No {
            let dest = self.in_final(Path::new("/proc"));
            if self.config.namespaces.pid {
                plan.add(
                    Tag::Kernel,
                    MountPoint::filesystem(
                        "proc",
                        &dest,
                        MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
                        "",
                    )
                    .with_skip_on_error(true),
                )?;
            } else {
                plan.add(
                    Tag::Kernel,
                    MountPoint::bind(Path::new("/proc"), &dest, MsFlags::MS_REC)
                        .with_skip_on_error(true),
                )?;
                plan.add(
                    Tag::Kernel,
                    MountPoint::remount(&dest, MsFlags::MS_NOSUID | MsFlags::MS_NODEV),
                )?;
            }
        }

        if knobs.sys != MountMode::No {
            let dest = self.in_final(Path::new("/sys"));
            if self.config.namespaces.net {
                plan.add(
                    Tag::Kernel,
                    MountPoint::filesystem(
                        "sysfs",
                        &dest,
                        MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
                        "",
                    )
                    .with_skip_on_error(true),
                )?;
            } else {
                plan.add(
                    Tag::Kernel,
                    MountPoint::bind(Path::new("/sys"), &dest, MsFlags::MS_REC)
                        .with_skip_on_error(true),
                )?;
            }
        }
        Ok(())
    }

    // ── Hostfs ──────────────────────────────────────────────────────────

    fn add_hostfs(&mut self, plan: &mut MountPlan) -> VesselResult<()> {
        if self.config.sysconf.mount.hostfs != MountMode::Yes {
            return Ok(());
        }

        for entry in self.host_mounts {
            let mp = &entry.mount_point;
            // Only top-level mounts; nested ones come along via MS_REC.
            if mp.components().count() != 2 {
                continue;
            }
            if HOSTFS_EXCLUDED
                .iter()
                .any(|ex| mp == Path::new(ex))
            {
                continue;
            }
            plan.add(
                Tag::Hostfs,
                MountPoint::bind(mp, &self.in_final(mp), MsFlags::MS_REC)
                    .with_skip_on_error(true),
            )?;
        }
        Ok(())
    }

    // ── Binds (configuration-driven) ────────────────────────────────────

    fn add_binds(&mut self, plan: &mut MountPlan) -> VesselResult<()> {
        for path in &self.config.sysconf.bind_paths {
            plan.add(
                Tag::Binds,
                MountPoint::bind(path, &self.in_final(path), MsFlags::empty())
                    .with_skip_on_error(true),
            )?;
        }
        Ok(())
    }

    // ── Cwd ─────────────────────────────────────────────────────────────

    fn add_cwd(&mut self, plan: &mut MountPlan) -> VesselResult<()> {
        let Some(cwd) = &self.config.cwd else {
            return Ok(());
        };
        if CWD_RESERVED.iter().any(|r| cwd.starts_with(r)) {
            debug!(cwd = %cwd.display(), "cwd inside reserved directory, not mounted");
            return Ok(());
        }
        // The executor skips this entry when the cwd's (dev, ino) is already
        // reachable inside the container.
        plan.add(
            Tag::Cwd,
            MountPoint::bind(cwd, &self.in_final(cwd), MsFlags::empty())
                .with_skip_on_error(true),
        )?;
        Ok(())
    }

    // ── Home ────────────────────────────────────────────────────────────

    fn add_home(&mut self, plan: &mut MountPlan) -> VesselResult<()> {
        if self.config.sysconf.mount.home == MountMode::No {
            return Ok(());
        }
        let Some(home) = &self.config.home else {
            return Ok(());
        };

        // Stage the destination in the session tree so the bind lands on a
        // real directory whichever layer is active.
        self.session.override_dir(&home.destination, &home.source)?;

        let dest = self.in_final(&home.destination);
        let source = home.source.clone();
        plan.add_before_hook(
            Tag::Home,
            Box::new({
                let dest = dest.clone();
                move |ctx| ctx.ops.mkdir_all(&dest, 0o755)
            }),
        );
        plan.add(
            Tag::Home,
            MountPoint::bind(&source, &dest, MsFlags::MS_NOSUID | MsFlags::MS_NODEV),
        )?;
        Ok(())
    }

    // ── Userbinds ───────────────────────────────────────────────────────

    fn add_userbinds(&mut self, plan: &mut MountPlan) -> VesselResult<()> {
        for bind in self.config.binds.iter().filter(|b| b.partition_id.is_none()) {
            let dest = self.in_final(&bind.destination);
            let mut point = MountPoint::bind(&bind.source, &dest, MsFlags::MS_REC)
                .with_skip_on_error(bind.skip_on_error);
            if bind.read_only {
                point.flags |= MsFlags::MS_RDONLY;
            }
            plan.add(Tag::Userbinds, point)?;
            if bind.read_only {
                plan.add(Tag::Userbinds, MountPoint::remount(&dest, MsFlags::MS_RDONLY))?;
            }
        }
        Ok(())
    }

    // ── Tmp / Scratch ───────────────────────────────────────────────────

    fn add_tmp(&mut self, plan: &mut MountPlan) -> VesselResult<()> {
        if self.config.sysconf.mount.tmp == MountMode::No {
            return Ok(());
        }

        let flags = MsFlags::MS_NOSUID | MsFlags::MS_NODEV;
        for tmp in [Path::new("/tmp"), Path::new("/var/tmp")] {
            let dest = self.in_final(tmp);
            if let Some(workdir) = &self.config.workdir {
                // A workdir hosts per-invocation tmp dirs on real storage.
                let source = join_rooted(workdir, tmp);
                std::fs::create_dir_all(&source)?;
                plan.add(
                    Tag::Tmp,
                    MountPoint::bind(&source, &dest, flags).with_skip_on_error(true),
                )?;
            } else if self.config.contain {
                let size = format!("size={}m", self.config.sysconf.sessiondir_max_size);
                plan.add(
                    Tag::Tmp,
                    MountPoint::filesystem("tmpfs", &dest, flags, &size)
                        .with_skip_on_error(true),
                )?;
            } else {
                plan.add(
                    Tag::Tmp,
                    MountPoint::bind(tmp, &dest, flags).with_skip_on_error(true),
                )?;
            }
        }
        Ok(())
    }

    fn add_scratch(&mut self, plan: &mut MountPlan) -> VesselResult<()> {
        for scratch in &self.config.scratch_dirs {
            let source = match &self.config.workdir {
                Some(workdir) => {
                    let source = join_rooted(&join_rooted(workdir, Path::new("/scratch")), scratch);
                    std::fs::create_dir_all(&source)?;
                    source
                }
                None => {
                    // No workdir: scratch is session-backed and vanishes
                    // with it.
                    let virtual_path = join_rooted(Path::new("/scratch"), scratch);
                    self.session.add_dir(&virtual_path)?;
                    self.session.get_path(&virtual_path)
                }
            };
            plan.add(
                Tag::Scratch,
                MountPoint::bind(
                    &source,
                    &self.in_final(scratch),
                    MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
                ),
            )?;
        }
        Ok(())
    }

    // ── Files ───────────────────────────────────────────────────────────

    fn add_files(&mut self, plan: &mut MountPlan) -> VesselResult<()> {
        if self.config.library_binds.is_empty() {
            return Ok(());
        }
        let lib_dir = Path::new("/.vessel/libs");
        let dest_root = self.in_final(lib_dir);
        plan.add_before_hook(
            Tag::Files,
            Box::new({
                let dest_root = dest_root.clone();
                move |ctx| ctx.ops.mkdir_all(&dest_root, 0o755)
            }),
        );
        for lib in &self.config.library_binds {
            let Some(name) = lib.file_name() else {
                continue;
            };
            plan.add(
                Tag::Files,
                MountPoint::bind(lib, &dest_root.join(name), MsFlags::MS_RDONLY)
                    .with_skip_on_error(true),
            )?;
        }
        Ok(())
    }

    // ── Dev ─────────────────────────────────────────────────────────────

    fn add_dev(&mut self, plan: &mut MountPlan) -> VesselResult<()> {
        let knobs = &self.config.sysconf.mount;
        if knobs.dev == MountMode::No {
            return Ok(());
        }

        let dev_root = self.in_final(Path::new("/dev"));

        if knobs.dev == MountMode::Minimal || self.config.contain {
            self.add_minimal_dev(plan, &dev_root)
        } else {
            plan.add(
                Tag::Dev,
                MountPoint::bind(Path::new("/dev"), &dev_root, MsFlags::MS_REC),
            )?;
            Ok(())
        }
    }

    /// Builds /dev entirely from session symlinks and per-device binds.
    fn add_minimal_dev(&mut self, plan: &mut MountPlan, dev_root: &Path) -> VesselResult<()> {
        let devpts = self.config.sysconf.mount.devpts != MountMode::No;

        plan.add_before_hook(
            Tag::Dev,
            Box::new({
                let dev_root = dev_root.to_path_buf();
                let devpts = devpts;
                let ipc = self.config.namespaces.ipc;
                move |ctx| {
                    ctx.ops.mkdir_all(&dev_root, 0o755)?;
                    ctx.ops.mkdir_all(&dev_root.join("shm"), 0o777)?;
                    if devpts {
                        ctx.ops.mkdir_all(&dev_root.join("pts"), 0o755)?;
                    }
                    if ipc {
                        ctx.ops.mkdir_all(&dev_root.join("mqueue"), 0o777)?;
                    }
                    for node in ["null", "zero", "random", "urandom", "tty"] {
                        ctx.ops.write_file(&dev_root.join(node), 0o666, b"")?;
                    }
                    ctx.ops
                        .symlink(Path::new("/proc/self/fd"), &dev_root.join("fd"))?;
                    ctx.ops
                        .symlink(Path::new("/proc/self/fd/0"), &dev_root.join("stdin"))?;
                    ctx.ops
                        .symlink(Path::new("/proc/self/fd/1"), &dev_root.join("stdout"))?;
                    ctx.ops
                        .symlink(Path::new("/proc/self/fd/2"), &dev_root.join("stderr"))?;
                    if devpts {
                        ctx.ops
                            .symlink(Path::new("pts/ptmx"), &dev_root.join("ptmx"))?;
                    }
                    Ok(())
                }
            }),
        );

        for node in ["null", "zero", "random", "urandom", "tty"] {
            let host = PathBuf::from("/dev").join(node);
            plan.add(
                Tag::Dev,
                MountPoint::bind(&host, &dev_root.join(node), MsFlags::empty()),
            )?;
        }

        if devpts {
            plan.add(
                Tag::Dev,
                MountPoint::filesystem(
                    "devpts",
                    &dev_root.join("pts"),
                    MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC,
                    "newinstance,ptmxmode=0666,mode=0620",
                ),
            )?;
        }

        plan.add(
            Tag::Dev,
            MountPoint::filesystem(
                "tmpfs",
                &dev_root.join("shm"),
                MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
                "mode=1777",
            ),
        )?;

        if self.config.namespaces.ipc {
            plan.add(
                Tag::Dev,
                MountPoint::filesystem(
                    "mqueue",
                    &dev_root.join("mqueue"),
                    MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
                    "",
                )
                .with_skip_on_error(true),
            )?;
        }
        Ok(())
    }

    // ── Shared ──────────────────────────────────────────────────────────

    fn add_shared(&mut self, plan: &mut MountPlan) -> VesselResult<()> {
        // Propagation: nothing mounted after this point may leak back.
        plan.add(
            Tag::Shared,
            MountPoint::propagation(
                &self.session.final_path().to_path_buf(),
                MsFlags::MS_SLAVE | MsFlags::MS_REC,
            ),
        )
        .ok();

        // Identity files built from the user database and staged in the
        // session tree; bound over the image copies.
        let passwd = passwd_content(self.config);
        let group = group_content(self.config);
        for (name, content) in [("passwd", passwd), ("group", group)] {
            let virtual_path = Path::new("/files").join(name);
            self.session.add_file(&virtual_path, content.as_bytes())?;
            let staged = self.session.get_path(&virtual_path);
            plan.add(
                Tag::Shared,
                MountPoint::bind(
                    &staged,
                    &self.in_final(&Path::new("/etc").join(name)),
                    MsFlags::empty(),
                )
                .with_skip_on_error(true),
            )?;
        }

        let resolv = Path::new("/etc/resolv.conf");
        plan.add(
            Tag::Shared,
            MountPoint::bind(resolv, &self.in_final(resolv), MsFlags::empty())
                .with_skip_on_error(true),
        )?;

        if self.config.namespaces.uts
            && let Some(name) = self.config.instance_name.clone()
        {
            plan.add_after_hook(
                Tag::Shared,
                Box::new(move |ctx| ctx.ops.set_hostname(&name)),
            );
        }
        Ok(())
    }

    // ── Final ───────────────────────────────────────────────────────────

    fn add_final(&mut self, plan: &mut MountPlan) {
        let final_path = self.session.final_path().to_path_buf();
        plan.add_after_hook(
            Tag::Final,
            Box::new(move |ctx| ctx.ops.chdir(&final_path)),
        );
    }
}

fn overlay_region(image: &ResolvedImage) -> (&'static str, u64, u64) {
    match image.kind {
        ImageKind::Ext3 => ("ext3", 0, 0),
        ImageKind::Squashfs => ("squashfs", 0, 0),
        _ => ("ext3", 0, 0),
    }
}

/// Minimal passwd derived from the launch identity. The container sees the
/// invoking user (or the sudo-as target) plus root.
fn passwd_content(config: &EngineConfig) -> String {
    let uid = config.target_uid.unwrap_or(config.invoker_uid);
    let gid = config.target_gid.unwrap_or(config.invoker_gid);
    let mut out = String::from("root:x:0:0:root:/root:/bin/sh\n");
    if uid != 0 {
        out.push_str(&format!(
            "vessel:x:{uid}:{gid}:vessel user:/home/vessel:/bin/sh\n"
        ));
    }
    out
}

fn group_content(config: &EngineConfig) -> String {
    let gid = config.target_gid.unwrap_or(config.invoker_gid);
    let mut out = String::from("root:x:0:\n");
    if gid != 0 {
        out.push_str(&format!("vessel:x:{gid}:\n"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use vessel_shared::config::{BindPath, Partition};

    fn base_config(session_dir: &Path) -> EngineConfig {
        EngineConfig {
            image: PathBuf::from("/images/app.sqsh"),
            images: vec![ResolvedImage {
                path: PathBuf::from("/images/app.sqsh"),
                kind: ImageKind::Squashfs,
                writable: false,
                encrypted: false,
                fd_slot: 3,
                partitions: vec![],
            }],
            command: vec!["/bin/true".into()],
            session_dir: session_dir.to_path_buf(),
            invoker_uid: 1000,
            invoker_gid: 1000,
            cwd: Some(PathBuf::from("/home/user/work")),
            ..Default::default()
        }
    }

    fn plan_for(config: &EngineConfig) -> (tempfile::TempDir, MountPlan) {
        let dir = tempfile::tempdir().unwrap();
        let mut session = Session::create(dir.path()).unwrap();
        let plan = Planner::new(config, &mut session, &[]).plan().unwrap();
        (dir, plan)
    }

    #[test]
    fn test_squashfs_rootfs_entry() {
        let dir = tempfile::tempdir().unwrap();
        let config = base_config(dir.path());
        let (_dir, plan) = plan_for(&config);

        let rootfs = plan.entries(Tag::RootFs);
        assert_eq!(rootfs.len(), 1);
        assert_eq!(rootfs[0].fs_type.as_deref(), Some("squashfs"));
        assert!(rootfs[0].flags.contains(MsFlags::MS_RDONLY));
        assert!(rootfs[0].internal.needs_loop);
        assert_eq!(
            rootfs[0].source.as_deref(),
            Some(Path::new("/proc/self/fd/3"))
        );
    }

    #[test]
    fn test_sandbox_rootfs_binds_and_remounts() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = base_config(dir.path());
        config.images[0].kind = ImageKind::Sandbox;
        config.images[0].writable = true;
        let (_dir, plan) = plan_for(&config);

        let rootfs = plan.entries(Tag::RootFs);
        assert_eq!(rootfs.len(), 3);
        assert!(rootfs[0].flags.contains(MsFlags::MS_BIND));
        assert!(rootfs[1].internal.remount);
        assert!(rootfs[2].internal.propagation);
        assert!(rootfs[2].flags.contains(MsFlags::MS_UNBINDABLE));
    }

    #[test]
    fn test_sif_encrypted_rootfs_carries_key() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = base_config(dir.path());
        config.images[0].kind = ImageKind::Sif;
        config.images[0].partitions = vec![Partition {
            id: 1,
            offset: 32768,
            size: 1 << 20,
            fs: PartitionFs::EncryptSquashfs,
            usage: PartitionUsage::Rootfs,
        }];
        config.key_material = Some(b"secret".to_vec());
        let (_dir, plan) = plan_for(&config);

        let rootfs = plan.entries(Tag::RootFs);
        assert_eq!(rootfs[0].key.as_deref(), Some(b"secret".as_slice()));
        assert!(rootfs[0].internal.crypt);
        assert!(rootfs[0].internal.image_partition);
        assert_eq!(rootfs[0].offset, Some(32768));
    }

    #[test]
    fn test_proc_fresh_with_pid_ns_bind_without() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = base_config(dir.path());
        config.namespaces.pid = true;
        let (_d, plan) = plan_for(&config);
        let kernel = plan.entries(Tag::Kernel);
        assert_eq!(kernel[0].fs_type.as_deref(), Some("proc"));

        config.namespaces.pid = false;
        let (_d, plan) = plan_for(&config);
        let kernel = plan.entries(Tag::Kernel);
        assert!(kernel[0].flags.contains(MsFlags::MS_BIND));
        assert!(kernel[1].internal.remount);
    }

    #[test]
    fn test_hostfs_excludes_reserved() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = base_config(dir.path());
        config.sysconf.mount.hostfs = MountMode::Yes;

        let host = crate::mounts::mountinfo::parse(
            "\
22 1 8:2 / / rw - ext4 /dev/sda2 rw
30 22 8:3 / /home rw - ext4 /dev/sda3 rw
40 22 0:35 / /proc rw - proc proc rw
50 22 0:40 / /var rw - tmpfs tmpfs rw
60 30 0:41 / /home/sub rw - tmpfs tmpfs rw
",
        )
        .unwrap();

        let mut session = Session::create(dir.path()).unwrap();
        let plan = Planner::new(&config, &mut session, &host).plan().unwrap();
        let hostfs = plan.entries(Tag::Hostfs);
        assert_eq!(hostfs.len(), 1);
        assert_eq!(hostfs[0].source.as_deref(), Some(Path::new("/home")));
        assert!(hostfs[0].internal.skip_on_error);
    }

    #[test]
    fn test_userbind_readonly_gets_remount() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = base_config(dir.path());
        config.binds.push(BindPath {
            source: PathBuf::from("/host/data"),
            destination: PathBuf::from("/data"),
            read_only: true,
            skip_on_error: false,
            image_source: None,
            partition_id: None,
        });
        let (_d, plan) = plan_for(&config);

        let binds = plan.entries(Tag::Userbinds);
        assert_eq!(binds.len(), 2);
        assert!(binds[0].flags.contains(MsFlags::MS_BIND));
        assert!(binds[1].internal.remount);
        assert!(binds[1].flags.contains(MsFlags::MS_RDONLY));
    }

    #[test]
    fn test_cwd_skipped_in_reserved_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = base_config(dir.path());
        config.cwd = Some(PathBuf::from("/proc/1234"));
        let (_d, plan) = plan_for(&config);
        assert!(plan.entries(Tag::Cwd).is_empty());

        config.cwd = Some(PathBuf::from("/home/user"));
        let (_d, plan) = plan_for(&config);
        assert_eq!(plan.entries(Tag::Cwd).len(), 1);
    }

    #[test]
    fn test_minimal_dev_set() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = base_config(dir.path());
        config.contain = true;
        let (_d, plan) = plan_for(&config);

        let dev = plan.entries(Tag::Dev);
        let dests: Vec<String> = dev
            .iter()
            .map(|p| {
                p.destination
                    .file_name()
                    .unwrap()
                    .to_string_lossy()
                    .into_owned()
            })
            .collect();
        for expected in ["null", "zero", "random", "urandom", "tty", "pts", "shm"] {
            assert!(dests.contains(&expected.to_string()), "{expected} missing");
        }
        // No mqueue without an IPC namespace, no full /dev rec-bind.
        assert!(!dests.contains(&"mqueue".to_string()));
        assert!(dev.iter().all(|p| p.destination != Path::new("/dev")));
    }

    #[test]
    fn test_overlay_layer_moves_final_path() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = base_config(dir.path());
        config.session_layer = SessionLayer::Overlay;
        config.writable_tmpfs = true;

        let mut session = Session::create(dir.path()).unwrap();
        let plan = Planner::new(&config, &mut session, &[]).plan().unwrap();

        let layer = plan.entries(Tag::Layer);
        assert_eq!(layer.len(), 1);
        assert_eq!(layer[0].fs_type.as_deref(), Some("overlay"));
        assert!(layer[0].data.contains("lowerdir="));
        assert!(layer[0].data.contains("upperdir="));
        assert!(session.final_path().ends_with("overlay/final"));
    }

    #[test]
    fn test_overlay_readonly_has_no_upper() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = base_config(dir.path());
        config.session_layer = SessionLayer::Overlay;
        config.writable_tmpfs = false;

        let (_d, plan) = plan_for(&config);
        let layer = plan.entries(Tag::Layer);
        assert!(!layer[0].data.contains("upperdir="));
    }

    #[test]
    fn test_underlay_adds_no_layer_mounts() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = base_config(dir.path());
        config.session_layer = SessionLayer::Underlay;
        config.binds.push(BindPath {
            source: PathBuf::from("/host/data"),
            destination: PathBuf::from("/data"),
            read_only: false,
            skip_on_error: false,
            image_source: None,
            partition_id: None,
        });

        let mut session = Session::create(dir.path()).unwrap();
        let plan = Planner::new(&config, &mut session, &[]).plan().unwrap();
        assert!(plan.entries(Tag::Layer).is_empty());
        assert!(session.final_path().ends_with("underlay/final"));
    }

    #[test]
    fn test_shared_identity_files_staged() {
        let dir = tempfile::tempdir().unwrap();
        let config = base_config(dir.path());
        let (dir, plan) = plan_for(&config);

        let staged = dir.path().join("files/passwd");
        let content = std::fs::read_to_string(staged).unwrap();
        assert!(content.starts_with("root:x:0:0:"));
        assert!(content.contains(":1000:1000:"));

        let shared = plan.entries(Tag::Shared);
        assert!(shared
            .iter()
            .any(|p| p.destination.ends_with("etc/passwd")));
        assert!(shared
            .iter()
            .any(|p| p.destination.ends_with("etc/resolv.conf")));
    }

    #[test]
    fn test_image_bind_stages_data_partition() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = base_config(dir.path());
        config.images[0].kind = ImageKind::Sif;
        config.images[0].partitions = vec![
            Partition {
                id: 1,
                offset: 4096,
                size: 1 << 20,
                fs: PartitionFs::Squashfs,
                usage: PartitionUsage::Rootfs,
            },
            Partition {
                id: 2,
                offset: 2 << 20,
                size: 1 << 20,
                fs: PartitionFs::Squashfs,
                usage: PartitionUsage::Data,
            },
        ];
        config.binds.push(BindPath {
            source: PathBuf::new(),
            destination: PathBuf::from("/data"),
            read_only: false,
            skip_on_error: false,
            image_source: Some(PathBuf::from("/inner")),
            partition_id: Some(2),
        });

        let (_d, plan) = plan_for(&config);
        let image_binds = plan.entries(Tag::ImageBind);
        assert_eq!(image_binds.len(), 2);
        assert!(image_binds[0].internal.image_partition);
        assert_eq!(image_binds[0].offset, Some(2 << 20));
        assert!(image_binds[1].flags.contains(MsFlags::MS_BIND));
        assert!(image_binds[1]
            .source
            .as_deref()
            .unwrap()
            .ends_with("data-2/inner"));
    }
}
