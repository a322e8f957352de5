//! Teardown ordering and error-collection behavior of `cleanup::run`, run
//! against the recording mount backend so they need no privileges.

use std::path::Path;

use nix::mount::MntFlags;

use vessel::cleanup::run;
use vessel::drivers::KernelDriver;
use vessel::stages::ContainerContext;
use vessel_shared::constants::defaults;
use vessel_test_utils::RecordingOps;

#[test]
fn test_unmounts_run_in_reverse_order() {
    let mut context = ContainerContext::new(Path::new("/session"));
    context.record_mount(Path::new("/session/root"));
    context.record_mount(Path::new("/session/root/proc"));
    context.record_mount(Path::new("/session/root/dev"));

    let mut ops = RecordingOps::new();
    let mut driver = KernelDriver::new();
    let errors = run(&mut context, &mut ops, &mut driver, None, None, true);
    assert!(errors.is_empty());

    let unmounts = ops.unmount_targets();
    assert_eq!(
        unmounts,
        vec![
            Path::new("/session/root/dev"),
            Path::new("/session/root/proc"),
            Path::new("/session/root"),
        ]
    );
}

#[test]
fn test_ebusy_retries_then_detach() {
    let mut context = ContainerContext::new(Path::new("/session"));
    context.record_mount(Path::new("/session/root"));

    let mut ops = RecordingOps::new();
    // Busy forever: the walk must retry and then fall back to a detach.
    ops.fail_unmount_with(Path::new("/session/root"), libc::EBUSY);

    let mut driver = KernelDriver::new();
    let errors = run(&mut context, &mut ops, &mut driver, None, None, true);
    assert!(errors.is_empty(), "detach fallback should succeed: {errors:?}");

    let flagged = ops.unmount_flags(Path::new("/session/root"));
    assert_eq!(flagged.len() as u32, defaults::UMOUNT_RETRIES + 1);
    assert_eq!(*flagged.last().unwrap(), MntFlags::MNT_DETACH.bits());
}

#[test]
fn test_einval_is_ignored() {
    let mut context = ContainerContext::new(Path::new("/session"));
    context.record_mount(Path::new("/session/gone"));

    let mut ops = RecordingOps::new();
    ops.fail_unmount_with(Path::new("/session/gone"), libc::EINVAL);

    let mut driver = KernelDriver::new();
    let errors = run(&mut context, &mut ops, &mut driver, None, None, true);
    assert!(errors.is_empty());
}

#[test]
fn test_crypt_devices_closed() {
    let mut context = ContainerContext::new(Path::new("/session"));
    context.record_crypt(Path::new("/dev/mapper/vessel-crypt-1"));

    let mut ops = RecordingOps::new();
    let mut driver = KernelDriver::new();
    run(&mut context, &mut ops, &mut driver, None, None, true);

    assert_eq!(
        ops.crypt_closed(),
        vec![Path::new("/dev/mapper/vessel-crypt-1").to_path_buf()]
    );
    assert!(context.crypt_devices.is_empty());
}

#[test]
fn test_instance_file_removed() {
    let session = tempfile::tempdir().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let state = dir.path().join("instance.json");
    std::fs::write(&state, b"{}").unwrap();

    let mut context = ContainerContext::new(session.path());
    context.instance_file = Some(state.clone());

    let mut ops = RecordingOps::new();
    let mut driver = KernelDriver::new();
    let errors = run(&mut context, &mut ops, &mut driver, None, None, true);
    assert!(errors.is_empty());
    assert!(!state.exists());
}

#[test]
fn test_cleanup_errors_are_collected_not_fatal() {
    let mut context = ContainerContext::new(Path::new("/session"));
    context.record_mount(Path::new("/session/root"));

    let mut ops = RecordingOps::new();
    ops.fail_unmount_with(Path::new("/session/root"), libc::EIO);

    let mut driver = KernelDriver::new();
    let errors = run(&mut context, &mut ops, &mut driver, None, None, true);
    // The failure is reported but the walk completed.
    assert_eq!(errors.len(), 1);
}
