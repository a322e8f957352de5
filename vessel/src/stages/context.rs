//! Container-wide state threaded from setup into cleanup.
//!
//! Everything cleanup needs to undo lives here and only here; setup records
//! into the context as it goes, cleanup reads from it exclusively. (The
//! predecessor of this record was a pile of per-process globals.)

use std::path::{Path, PathBuf};

/// Mutable record owned by MASTER for the lifetime of one container.
#[derive(Debug, Default)]
pub struct ContainerContext {
    /// Session directory base (the mounted tmpfs).
    pub session_base: PathBuf,

    /// Mount destinations in execution order; unmounted in reverse.
    pub umount_points: Vec<PathBuf>,

    /// Loop devices attached for this container. AUTOCLEAR releases them
    /// with the last reference, recorded here for diagnostics.
    pub loop_devices: Vec<u32>,

    /// Open device-mapper crypt nodes to close.
    pub crypt_devices: Vec<PathBuf>,

    /// A temporary image directory to delete (extracted sandboxes).
    pub temp_image_dir: Option<PathBuf>,

    /// Deletion must run through the fakeroot sub-helper because the files
    /// belong to a user-namespace mapping.
    pub fakeroot_cleanup: bool,

    /// CNI network teardown required.
    pub network_active: bool,
    pub network_name: String,

    /// Cgroup to destroy.
    pub cgroup_active: bool,

    /// Instance state file to delete.
    pub instance_file: Option<PathBuf>,
}

impl ContainerContext {
    pub fn new(session_base: &Path) -> Self {
        Self {
            session_base: session_base.to_path_buf(),
            ..Default::default()
        }
    }

    /// Records an established mount; ordering matters for cleanup.
    pub fn record_mount(&mut self, destination: &Path) {
        self.umount_points.push(destination.to_path_buf());
    }

    pub fn record_loop(&mut self, device: u32) {
        self.loop_devices.push(device);
    }

    pub fn record_crypt(&mut self, device: &Path) {
        self.crypt_devices.push(device.to_path_buf());
    }
}
