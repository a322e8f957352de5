//! Kernel mount backend.
//!
//! Used when the launcher runs setuid and the administrator allows kernel
//! mounts of the image filesystem (`allow setuid-mount`). All the real work
//! happens in the fallback the executor passes in (loop attach + RPC mount);
//! this driver exists so the selection logic has a uniform object either way.

use std::path::Path;

use nix::unistd::Pid;

use vessel_shared::errors::VesselResult;

use super::{Feature, Features, ImageDriver, KernelMountFn, MountParams};

#[derive(Debug, Default)]
pub struct KernelDriver;

impl KernelDriver {
    pub fn new() -> Self {
        Self
    }
}

impl ImageDriver for KernelDriver {
    fn name(&self) -> &'static str {
        "kernel"
    }

    fn features(&self) -> Features {
        [Feature::Squash, Feature::Ext3, Feature::Overlay, Feature::Image]
            .into_iter()
            .collect()
    }

    fn mount(&mut self, params: &MountParams, fallback: &mut KernelMountFn) -> VesselResult<()> {
        fallback(params)
    }

    fn start(&mut self, _container_pid: Option<Pid>, _hybrid_fakeroot: bool) -> VesselResult<()> {
        Ok(())
    }

    fn stop(&mut self, _target: Option<&Path>) -> VesselResult<()> {
        // Kernel mounts are torn down by the cleanup unmount walk.
        Ok(())
    }

    fn stopped(&mut self, _pid: Pid, _status: i32) -> VesselResult<()> {
        // No helpers, so no reaped pid can be ours.
        Ok(())
    }
}
