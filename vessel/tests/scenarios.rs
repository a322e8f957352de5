//! End-to-end setup scenarios, run against the recording mount backend so
//! they need no privileges: the assertions are on the exact operation
//! stream the executor emits.

use std::path::{Path, PathBuf};

use nix::mount::MsFlags;

use vessel::drivers::KernelDriver;
use vessel::mounts::{MountExecutor, Planner, Tag};
use vessel::session::Session;
use vessel::stages::ContainerContext;
use vessel_shared::VesselError;
use vessel_shared::config::{
    BindPath, EngineConfig, ImageKind, Partition, PartitionFs, PartitionUsage, ResolvedImage,
    SessionLayer,
};
use vessel_test_utils::{Op, RecordingOps, config as config_fixtures};

struct Harness {
    _session_dir: tempfile::TempDir,
    session: Session,
    ops: RecordingOps,
    context: ContainerContext,
}

impl Harness {
    fn new() -> Self {
        let session_dir = tempfile::tempdir().unwrap();
        let session = Session::create(session_dir.path()).unwrap();
        let mut ops = RecordingOps::new();
        // Host paths the default plan touches.
        for dir in ["/proc", "/sys", "/etc", "/host/data", "/home/user/work"] {
            ops.add_dir(Path::new(dir));
        }
        for file in [
            "/etc/hosts",
            "/etc/localtime",
            "/etc/resolv.conf",
            "/dev/null",
            "/dev/zero",
            "/dev/random",
            "/dev/urandom",
            "/dev/tty",
        ] {
            ops.add_file(Path::new(file));
        }
        let context = ContainerContext::new(session_dir.path());
        Self {
            _session_dir: session_dir,
            session,
            ops,
            context,
        }
    }

    fn execute(&mut self, config: &EngineConfig, kernel_mounts: bool) -> Result<(), VesselError> {
        let host_mounts = vessel::mounts::mountinfo::parse(
            "22 1 8:2 / / rw - ext4 /dev/sda2 rw\n",
        )
        .unwrap();
        let mut plan = Planner::new(config, &mut self.session, &host_mounts)
            .plan()
            .unwrap();
        let mut driver = KernelDriver::new();
        MountExecutor::new(
            &mut self.ops,
            &mut driver,
            &mut self.session,
            &mut self.context,
            config,
            kernel_mounts,
        )
        .execute(&mut plan)
    }
}

fn base_config(harness: &Harness) -> EngineConfig {
    let mut config =
        config_fixtures::squashfs_launch(Path::new("/images/app.sqsh"), harness.session.base());
    config.namespaces.pid = true;
    config.namespaces.user = true;
    config
}

// Scenario: plain SquashFS rootfs, no overlay, default session layer.
#[test]
fn test_plain_squashfs_unprivileged() {
    let mut harness = Harness::new();
    let config = base_config(&harness);

    harness.execute(&config, true).unwrap();

    // Exactly one squashfs mount, at the session rootfs, read-only, fed by
    // the loop device that wraps the inherited image descriptor.
    let rootfs = harness.session.rootfs_path();
    let squashfs_mounts: Vec<_> = harness
        .ops
        .mounts()
        .into_iter()
        .filter(|(_, _, fs, _, _)| fs.as_deref() == Some("squashfs"))
        .collect();
    assert_eq!(squashfs_mounts.len(), 1);
    let (source, target, _, flags, _) = &squashfs_mounts[0];
    assert_eq!(target, &rootfs);
    assert_eq!(source.as_deref(), Some(Path::new("/dev/loop0")));
    assert!(flags & libc::MS_RDONLY != 0);

    let loops = harness.ops.loop_requests();
    assert_eq!(loops.len(), 1);
    assert_eq!(loops[0].file, PathBuf::from("/proc/self/fd/3"));
    assert_eq!(loops[0].offset, 0);
    assert!(loops[0].read_only);

    // No overlay mount anywhere.
    assert!(
        harness
            .ops
            .mounts()
            .iter()
            .all(|(_, _, fs, _, _)| fs.as_deref() != Some("overlay"))
    );
}

// Invariant: executed mount order is tag-monotonic.
#[test]
fn test_mount_order_is_tag_monotonic() {
    let mut harness = Harness::new();
    let mut config = base_config(&harness);
    config.binds.push(BindPath {
        source: PathBuf::from("/host/data"),
        destination: PathBuf::from("/data"),
        read_only: false,
        skip_on_error: false,
        image_source: None,
        partition_id: None,
    });
    config.contain = true;

    // Re-plan to map destinations to tags before executing.
    let host_mounts = vessel::mounts::mountinfo::parse(
        "22 1 8:2 / / rw - ext4 /dev/sda2 rw\n",
    )
    .unwrap();
    let mut tag_session = Session::create(harness.session.base()).unwrap();
    let plan = Planner::new(&config, &mut tag_session, &host_mounts)
        .plan()
        .unwrap();
    let tag_of = |target: &Path| -> Option<Tag> {
        plan.iter()
            .find(|(_, p)| p.destination == target)
            .map(|(t, _)| t)
    };

    harness.execute(&config, true).unwrap();

    let mut last_tag: Option<Tag> = None;
    for target in harness.ops.mount_targets() {
        if let Some(tag) = tag_of(&target) {
            if let Some(last) = last_tag {
                assert!(
                    tag >= last,
                    "mount at {} (tag {tag:?}) executed after tag {last:?}",
                    target.display()
                );
            }
            last_tag = Some(tag);
        }
    }
    assert!(last_tag.is_some(), "no planned mounts executed");
}

// Scenario: SIF with a writable ext3 overlay partition.
#[test]
fn test_sif_with_overlay_ext3_partition() {
    let mut harness = Harness::new();
    let mut config = base_config(&harness);
    config.session_layer = SessionLayer::Overlay;
    config.images = vec![ResolvedImage {
        path: PathBuf::from("/images/app.sif"),
        kind: ImageKind::Sif,
        writable: true,
        encrypted: false,
        fd_slot: 3,
        partitions: vec![
            Partition {
                id: 1,
                offset: 32768,
                size: 4 << 20,
                fs: PartitionFs::Squashfs,
                usage: PartitionUsage::Rootfs,
            },
            Partition {
                id: 2,
                offset: (4 << 20) + 32768,
                size: 1 << 20,
                fs: PartitionFs::OverlayExt3,
                usage: PartitionUsage::Overlay,
            },
        ],
    }];

    harness.execute(&config, true).unwrap();

    // The rootfs partition mounted via loop with its offset.
    let loops = harness.ops.loop_requests();
    assert!(loops.iter().any(|l| l.offset == 32768));
    // The overlay partition mounted via loop as ext3, writable.
    assert!(loops.iter().any(|l| l.offset == (4 << 20) + 32768 && !l.read_only));

    // The overlay layer combines them with the partition as upper.
    let overlay: Vec<_> = harness
        .ops
        .mounts()
        .into_iter()
        .filter(|(_, _, fs, _, _)| fs.as_deref() == Some("overlay"))
        .collect();
    assert_eq!(overlay.len(), 1);
    let (_, target, _, _, data) = &overlay[0];
    assert!(data.contains("lowerdir="));
    assert!(data.contains("part-2/upper"), "upper from partition: {data}");
    assert!(data.contains("part-2/work"));
    assert_eq!(target, harness.session.final_path());
}

// Scenario: encrypted image with the wrong passphrase.
#[test]
fn test_encrypted_squashfs_wrong_key() {
    let mut harness = Harness::new();
    let mut config = base_config(&harness);
    config.images[0].encrypted = true;
    config.key_material = Some(b"wrong passphrase".to_vec());
    harness.ops.expect_crypt_key(b"the real key");

    let err = harness.execute(&config, true).unwrap_err();
    assert!(matches!(err, VesselError::CryptBadKey));
    assert!(err.to_string().contains("failed to decrypt"));

    // The loop device was attached and the crypt open attempted before the
    // failure; nothing was mounted over the rootfs.
    assert_eq!(harness.ops.loop_requests().len(), 1);
    assert!(
        harness
            .ops
            .mounts()
            .iter()
            .all(|(_, t, _, _, _)| t != &harness.session.rootfs_path())
    );
}

// Scenario: bind to a missing destination with the underlay layer active.
#[test]
fn test_underlay_creates_missing_destination() {
    let mut harness = Harness::new();
    let mut config = base_config(&harness);
    config.session_layer = SessionLayer::Underlay;
    config.binds.push(BindPath {
        source: PathBuf::from("/host/data"),
        destination: PathBuf::from("/data"),
        read_only: false,
        skip_on_error: false,
        image_source: None,
        partition_id: None,
    });

    // The underlay walk reads the real session rootfs; give the image a
    // top-level /bin so the walk has something to carry over.
    std::fs::create_dir_all(harness.session.rootfs_path().join("bin")).unwrap();

    harness.execute(&config, true).unwrap();

    let final_dir = harness.session.base().join("underlay/final");
    assert_eq!(harness.session.final_path(), final_dir);

    // /data was pre-created inside the session, and the bind landed on it.
    assert!(
        harness
            .ops
            .ops()
            .iter()
            .any(|op| matches!(op, Op::Mkdir(p) if p == &final_dir.join("data")))
    );
    assert!(
        harness
            .ops
            .mounts()
            .iter()
            .any(|(source, target, _, _, _)| source.as_deref()
                == Some(Path::new("/host/data"))
                && target == &final_dir.join("data"))
    );
    // The image's own top level came along as a bind, and no overlay was
    // mounted.
    assert!(
        harness
            .ops
            .mounts()
            .iter()
            .any(|(_, target, _, _, _)| target == &final_dir.join("bin"))
    );
    assert!(
        harness
            .ops
            .mounts()
            .iter()
            .all(|(_, _, fs, _, _)| fs.as_deref() != Some("overlay"))
    );
}

// Scenario: contain mode with a minimal /dev.
#[test]
fn test_contain_minimal_dev() {
    let mut harness = Harness::new();
    let mut config = base_config(&harness);
    config.contain = true;

    harness.execute(&config, true).unwrap();

    let dev_root = harness.session.final_path().join("dev");
    let dev_mounts: Vec<String> = harness
        .ops
        .mounts()
        .into_iter()
        .filter(|(_, target, _, _, _)| target.starts_with(&dev_root))
        .map(|(_, target, _, _, _)| {
            target
                .strip_prefix(&dev_root)
                .unwrap()
                .display()
                .to_string()
        })
        .collect();

    for expected in ["null", "zero", "random", "urandom", "tty", "pts", "shm"] {
        assert!(
            dev_mounts.contains(&expected.to_string()),
            "{expected} missing from {dev_mounts:?}"
        );
    }
    // No mqueue without an IPC namespace, and no recursive host /dev.
    assert!(!dev_mounts.contains(&"mqueue".to_string()));
    assert!(
        harness
            .ops
            .mounts()
            .iter()
            .all(|(source, _, _, _, _)| source.as_deref() != Some(Path::new("/dev")))
    );

    // The symlink farm exists: ptmx, fd, stdin, stdout, stderr.
    let links: Vec<PathBuf> = harness
        .ops
        .ops()
        .iter()
        .filter_map(|op| match op {
            Op::Symlink { link, .. } => Some(link.clone()),
            _ => None,
        })
        .collect();
    for expected in ["ptmx", "fd", "stdin", "stdout", "stderr"] {
        assert!(
            links.iter().any(|l| l.ends_with(expected)),
            "symlink {expected} missing"
        );
    }
}

// Error policy: skip-on-error entries log and continue; fatal tags abort.
#[test]
fn test_skip_on_error_policy() {
    let mut harness = Harness::new();
    let mut config = base_config(&harness);
    // A hostfs-style bind whose source is missing, marked skippable by the
    // planner (config bind paths are skip-on-error).
    config.sysconf.bind_paths = vec![PathBuf::from("/definitely/not/here")];

    harness.execute(&config, true).unwrap();

    // A user bind with a missing source is fatal.
    let mut harness = Harness::new();
    let mut config = base_config(&harness);
    config.binds.push(BindPath {
        source: PathBuf::from("/also/not/here"),
        destination: PathBuf::from("/data"),
        read_only: false,
        skip_on_error: false,
        image_source: None,
        partition_id: None,
    });
    let err = harness.execute(&config, true).unwrap_err();
    assert!(matches!(err, VesselError::MountSourceMissing(_)));
}

// Overlay quirk ladders: ESTALE retries with index=off, a second ESTALE is
// fatal; EINVAL strips xino.
#[test]
fn test_overlay_estale_retry_ladder() {
    let mut harness = Harness::new();
    let mut config = base_config(&harness);
    config.session_layer = SessionLayer::Overlay;
    config.writable_tmpfs = true;

    let overlay_target = harness.session.base().join("overlay/final");
    harness
        .ops
        .fail_mount_seq(&overlay_target, &[libc::ESTALE]);

    harness.execute(&config, true).unwrap();

    // Two attempts at the overlay target; the second carries index=off.
    let attempts: Vec<String> = harness
        .ops
        .mounts()
        .into_iter()
        .filter(|(_, target, _, _, _)| target == &overlay_target)
        .map(|(_, _, _, _, data)| data)
        .collect();
    assert_eq!(attempts.len(), 2);
    assert!(!attempts[0].contains("index=off"));
    assert!(attempts[1].contains("index=off"));
}

#[test]
fn test_overlay_estale_budget_exhausted() {
    let mut harness = Harness::new();
    let mut config = base_config(&harness);
    config.session_layer = SessionLayer::Overlay;
    config.writable_tmpfs = true;

    let overlay_target = harness.session.base().join("overlay/final");
    harness
        .ops
        .fail_mount_seq(&overlay_target, &[libc::ESTALE, libc::ESTALE]);

    let err = harness.execute(&config, true).unwrap_err();
    assert!(matches!(err, VesselError::MountKernelEstale(_)));
}

#[test]
fn test_overlay_einval_strips_xino() {
    let mut harness = Harness::new();
    let mut config = base_config(&harness);
    config.session_layer = SessionLayer::Overlay;
    config.writable_tmpfs = true;

    let overlay_target = harness.session.base().join("overlay/final");
    harness
        .ops
        .fail_mount_seq(&overlay_target, &[libc::EINVAL]);

    harness.execute(&config, true).unwrap();
    let attempts: Vec<String> = harness
        .ops
        .mounts()
        .into_iter()
        .filter(|(_, target, _, _, _)| target == &overlay_target)
        .map(|(_, _, _, _, data)| data)
        .collect();
    assert_eq!(attempts.len(), 2);
    assert!(!attempts[1].contains("xino="));
}

// A FUSE-backed lower layer forces the overlay off the kernel path.
#[test]
fn test_fuse_lower_skips_kernel_overlay() {
    let mut harness = Harness::new();
    let mut config = base_config(&harness);
    config.session_layer = SessionLayer::Overlay;
    config.writable_tmpfs = true;

    // The rootfs (always the last lower) reports as FUSE.
    let rootfs = harness.session.rootfs_path();
    harness.ops.set_statfs_type(&rootfs, "fuse");

    // The kernel driver refuses nothing, so with the FUSE check working the
    // overlay is routed to the driver, whose fallback loop-mounts it; with
    // the check broken it would kernel-mount "overlay" directly. The
    // KernelDriver fallback path loops the (empty) source, so we just
    // assert the direct kernel overlay mount never happened after the check
    // triggers: the mount carries no "overlay" fstype at the final dir.
    let result = harness.execute(&config, true);

    let overlay_target = harness.session.base().join("overlay/final");
    let direct_overlay = harness
        .ops
        .mounts()
        .into_iter()
        .any(|(_, target, fs, _, _)| target == overlay_target && fs.as_deref() == Some("overlay"));
    assert!(!direct_overlay, "kernel overlay used despite FUSE lower");
    // Depending on driver wiring the fallback may fail (no real file); the
    // invariant under test is only the kernel-overlay avoidance.
    let _ = result;
}

// Remount reconciliation: bind flags ∪ source statfs flags ∪ request.
#[test]
fn test_remount_flag_reconciliation() {
    let mut harness = Harness::new();
    let mut config = base_config(&harness);
    config.binds.push(BindPath {
        source: PathBuf::from("/host/data"),
        destination: PathBuf::from("/data"),
        read_only: true,
        skip_on_error: false,
        image_source: None,
        partition_id: None,
    });
    harness
        .ops
        .set_statfs_flags(Path::new("/host/data"), libc::MS_NOSUID | libc::MS_NODEV | 4096);

    harness.execute(&config, true).unwrap();

    let dest = harness.session.final_path().join("data");
    let remounts: Vec<u64> = harness
        .ops
        .mounts()
        .into_iter()
        .filter(|(_, target, _, flags, _)| target == &dest && flags & libc::MS_REMOUNT != 0)
        .map(|(_, _, _, flags, _)| flags)
        .collect();
    assert_eq!(remounts.len(), 1);
    let flags = remounts[0];
    assert!(flags & libc::MS_RDONLY != 0);
    assert!(flags & libc::MS_NOSUID != 0);
    assert!(flags & libc::MS_NODEV != 0);
    assert_eq!(flags & 4096, 0, "ST_RELATIME must be masked");
}
