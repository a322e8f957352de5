//! MASTER: drive container setup, then watch it die.
//!
//! MASTER owns the session directory and the mount plan; every privileged
//! operation goes out over the RPC link. Once the plan is executed and the
//! RPC sibling has pivoted the (shared) root, STAGE2 is released to exec and
//! MASTER drops into the monitor loop. Cleanup runs unconditionally on the
//! way out and never changes the exit status.

use std::io::Write;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;

use nix::unistd::Pid;
use tracing::debug;

use vessel_shared::config::EngineConfig;
use vessel_shared::errors::{VesselError, VesselResult};
use vessel_shared::sysconf::SetuidMountMode;

use crate::cleanup;
use crate::drivers::{FuseDriver, ImageDriver, KernelDriver};
use crate::mounts::ops::{ChrootMethod, MountOps};
use crate::mounts::{MountExecutor, Planner, mountinfo};
use crate::monitor::Monitor;
use crate::rpc::RpcOps;
use crate::session::Session;
use crate::stages::context::ContainerContext;

/// Everything MASTER needs from the starter.
pub struct MasterInput {
    pub config: EngineConfig,
    pub rpc: RpcOps,
    pub stage2: UnixStream,
    pub container_pid: Pid,
    pub setuid_mode: bool,
}

pub fn run(input: MasterInput) -> VesselResult<i32> {
    let MasterInput {
        config,
        mut rpc,
        mut stage2,
        container_pid,
        setuid_mode,
    } = input;

    rpc.set_host_ipc(config.namespaces.ipc);

    let mut context = ContainerContext::new(&config.session_dir);
    context.fakeroot_cleanup = config.fakeroot;
    context.network_active = !config.network.name.is_empty() && config.network.name != "none";
    context.network_name = config.network.name.clone();
    context.cgroup_active = config.cgroups_json.is_some();

    let mut driver = select_driver(&config, setuid_mode);

    let result = setup_and_monitor(
        &config,
        &mut rpc,
        &mut stage2,
        container_pid,
        setuid_mode,
        &mut context,
        driver.as_mut(),
    );

    // Teardown happens whether setup succeeded or the container already
    // exited; collected errors are logged inside.
    let unprivileged = !setuid_mode;
    let _ = cleanup::run(
        &mut context,
        &mut rpc,
        driver.as_mut(),
        None,
        None,
        unprivileged,
    );

    // Closing the RPC socket is what lets the server exit its serve loop.
    drop(rpc);

    result
}

fn setup_and_monitor(
    config: &EngineConfig,
    rpc: &mut RpcOps,
    stage2: &mut UnixStream,
    container_pid: Pid,
    setuid_mode: bool,
    context: &mut ContainerContext,
    driver: &mut dyn ImageDriver,
) -> VesselResult<i32> {
    // The session lives on its own memory-backed filesystem so nothing of
    // the container root ever touches disk.
    let fs_name = config.sysconf.memory_fs_type.fs_name();
    let data = format!("mode=0755,size={}m", config.sysconf.sessiondir_max_size);
    rpc.mount(
        Some(std::path::Path::new(fs_name)),
        &config.session_dir,
        Some(fs_name),
        nix::mount::MsFlags::MS_NOSUID | nix::mount::MsFlags::MS_NODEV,
        &data,
    )?;
    context.record_mount(&config.session_dir);

    // The fresh tmpfs root belongs to uid 0; hand it to the invoker so the
    // unprivileged MASTER can stage files and directories in it directly.
    rpc.chown(&config.session_dir, config.invoker_uid, config.invoker_gid)?;

    let mut session = Session::create(&config.session_dir)?;

    let host_mounts = mountinfo::read_self()?;
    let mut plan = Planner::new(config, &mut session, &host_mounts).plan()?;

    let hybrid = config.fakeroot && setuid_mode;
    driver.start(Some(container_pid), hybrid)?;
    check_driver_features(config, driver)?;

    let kernel_image_mounts = setuid_mode && kernel_mounts_allowed(config);
    MountExecutor::new(
        rpc,
        driver,
        &mut session,
        context,
        config,
        kernel_image_mounts,
    )
    .execute(&mut plan)?;

    mount_user_fuse(config, &session, driver)?;

    write_instance_state(config, context, container_pid)?;

    // The RPC sibling shares its fs state with STAGE2: this pivot is the
    // container's pivot. The executor's Final hook already chdir'd into the
    // session final path.
    rpc.chroot(ChrootMethod::Pivot)?;

    release_stage2(stage2)?;

    let mut monitor = Monitor::new(container_pid, driver, config.signal_propagation);
    monitor.run()
}

/// Kernel image mounts are allowed when every image filesystem in play has
/// a permissive `allow setuid-mount` knob.
fn kernel_mounts_allowed(config: &EngineConfig) -> bool {
    use vessel_shared::config::ImageKind;

    let permissive = |mode: SetuidMountMode| {
        matches!(mode, SetuidMountMode::Yes)
            || (matches!(mode, SetuidMountMode::IfLimited)
                && !config.sysconf.limit_container_paths.is_empty())
    };

    config.images.iter().all(|image| match image.kind {
        ImageKind::Squashfs if image.encrypted => {
            permissive(config.sysconf.allow_setuid_mount.encrypted)
        }
        ImageKind::Squashfs | ImageKind::Sif => permissive(config.sysconf.allow_setuid_mount.squashfs),
        ImageKind::Ext3 => permissive(config.sysconf.allow_setuid_mount.extfs),
        ImageKind::Sandbox => true,
    })
}

/// Fails early when the selected driver cannot mount the image formats this
/// launch needs, instead of half-building the container first.
fn check_driver_features(config: &EngineConfig, driver: &dyn ImageDriver) -> VesselResult<()> {
    use vessel_shared::config::{ImageKind, PartitionFs};

    use crate::drivers::Feature;

    let features = driver.features();
    let mut require = |feature: Feature, what: &str| -> VesselResult<()> {
        if features.contains(&feature) {
            Ok(())
        } else {
            Err(VesselError::FuseHelperStartFailed {
                helper: format!("{feature:?}").to_lowercase(),
                detail: format!("{} driver cannot mount {what}", driver.name()),
            })
        }
    };

    for image in &config.images {
        match image.kind {
            ImageKind::Squashfs => require(Feature::Squash, "squashfs images")?,
            ImageKind::Ext3 => require(Feature::Ext3, "extfs images")?,
            ImageKind::Sandbox => {}
            ImageKind::Sif => {
                for part in &image.partitions {
                    match part.fs {
                        PartitionFs::Squashfs | PartitionFs::EncryptSquashfs => {
                            require(Feature::Squash, "squashfs partitions")?
                        }
                        PartitionFs::Ext3 | PartitionFs::OverlayExt3 => {
                            require(Feature::Ext3, "extfs partitions")?
                        }
                        PartitionFs::GocryptfsSquashfs => {
                            require(Feature::Gocrypt, "gocryptfs partitions")?
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

fn select_driver(config: &EngineConfig, setuid_mode: bool) -> Box<dyn ImageDriver> {
    if setuid_mode && kernel_mounts_allowed(config) && config.sysconf.image_driver.is_none() {
        debug!("using kernel image mounts");
        Box::new(KernelDriver::new())
    } else {
        debug!(driver = ?config.sysconf.image_driver, "using FUSE image driver");
        // Ambient caps only help when we still hold them (setuid mode).
        Box::new(FuseDriver::new(&config.sysconf.binary_path, setuid_mode))
    }
}

/// User-requested FUSE filesystems, mounted inside the future root right
/// before the pivot.
fn mount_user_fuse(
    config: &EngineConfig,
    session: &Session,
    _driver: &mut dyn ImageDriver,
) -> VesselResult<()> {
    use crate::drivers::HelperProcess;
    use crate::util::{find_binary, join_rooted};

    for request in &config.fuse_mounts {
        let binary = find_binary(&request.binary, &config.sysconf.binary_path)?;
        let target = join_rooted(session.final_path(), &request.mountpoint);
        std::fs::create_dir_all(&target)?;

        let mut args = request.args.clone();
        args.push(target.display().to_string());

        let mut helper = HelperProcess::spawn(&binary, &[], &args, &[], &target, false)?;
        helper.wait_for_mount()?;
        // Ownership moves to the driver's reaping domain via the monitor;
        // leak the handle so dropping it does not kill the mount.
        std::mem::forget(helper);
        debug!(binary = %request.binary, target = %target.display(), "user fuse mount established");
    }
    Ok(())
}

/// Per-user instance record, only for named instances.
fn write_instance_state(
    config: &EngineConfig,
    context: &mut ContainerContext,
    container_pid: Pid,
) -> VesselResult<()> {
    let Some(name) = &config.instance_name else {
        return Ok(());
    };

    let state = vessel_shared::config::InstanceState {
        pid: container_pid.as_raw(),
        ppid: std::process::id() as i32,
        user_ns: config.namespaces.user,
        config: config.clone(),
    };

    let dir = instance_state_dir(config.invoker_uid);
    std::fs::create_dir_all(&dir)?;
    let path = dir.join(format!("{name}.json"));
    std::fs::write(&path, serde_json::to_vec_pretty(&state).map_err(|e| {
        VesselError::Setup(format!("serialize instance state: {e}"))
    })?)?;

    context.instance_file = Some(path);
    Ok(())
}

fn instance_state_dir(uid: u32) -> PathBuf {
    match std::env::var_os("XDG_RUNTIME_DIR") {
        Some(dir) => PathBuf::from(dir).join("vessel/instances"),
        None => PathBuf::from(format!("/tmp/vessel-{uid}/instances")),
    }
}

/// One byte over the stage2 socket is the exec permission.
fn release_stage2(stage2: &mut UnixStream) -> VesselResult<()> {
    stage2
        .write_all(&[1])
        .map_err(|_| VesselError::RpcTransportLost)
}

#[cfg(test)]
mod tests {
    use super::*;
    use vessel_shared::config::{ImageKind, ResolvedImage};

    fn config_with(kind: ImageKind, encrypted: bool) -> EngineConfig {
        EngineConfig {
            images: vec![ResolvedImage {
                path: PathBuf::from("/img"),
                kind,
                writable: false,
                encrypted,
                fd_slot: 3,
                partitions: Vec::new(),
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_kernel_mounts_follow_setuid_mount_knobs() {
        let mut config = config_with(ImageKind::Squashfs, false);
        assert!(kernel_mounts_allowed(&config));

        config.sysconf.allow_setuid_mount.squashfs = SetuidMountMode::No;
        assert!(!kernel_mounts_allowed(&config));

        // iflimited only counts with a path limit in place.
        config.sysconf.allow_setuid_mount.squashfs = SetuidMountMode::IfLimited;
        assert!(!kernel_mounts_allowed(&config));
        config.sysconf.limit_container_paths = vec![PathBuf::from("/images")];
        assert!(kernel_mounts_allowed(&config));
    }

    #[test]
    fn test_encrypted_uses_encrypted_knob() {
        let mut config = config_with(ImageKind::Squashfs, true);
        config.sysconf.allow_setuid_mount.encrypted = SetuidMountMode::No;
        assert!(!kernel_mounts_allowed(&config));
        config.sysconf.allow_setuid_mount.encrypted = SetuidMountMode::Yes;
        assert!(kernel_mounts_allowed(&config));
    }

    #[test]
    fn test_driver_selection() {
        let config = config_with(ImageKind::Squashfs, false);
        assert_eq!(select_driver(&config, true).name(), "kernel");
        assert_eq!(select_driver(&config, false).name(), "fuse");

        let mut forced = config_with(ImageKind::Squashfs, false);
        forced.sysconf.image_driver = Some("fuseapp".into());
        assert_eq!(select_driver(&forced, true).name(), "fuse");
    }

    #[test]
    fn test_sandbox_never_blocks_kernel_mounts() {
        let mut config = config_with(ImageKind::Sandbox, false);
        config.sysconf.allow_setuid_mount.squashfs = SetuidMountMode::No;
        assert!(kernel_mounts_allowed(&config));
    }
}
