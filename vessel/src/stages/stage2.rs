//! STAGE2: the container process.
//!
//! Forked before any mount happens, STAGE2 first splits off the RPC server
//! (sharing its filesystem state, so the server's pivot_root re-roots this
//! process too), then parks on the master socket. When MASTER releases it,
//! the root is already the container root: apply the final capability sets,
//! switch to the target identity, and exec the user command. This process
//! never holds a host-privileged uid.

use std::io::Read;
use std::os::unix::net::UnixStream;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::Command;

use caps::CapSet;
use tracing::{debug, warn};

use vessel_shared::config::{CapDefault, EngineConfig};
use vessel_shared::errors::{VesselError, VesselResult};

use crate::privilege::{self, CAPABILITY_FILE, CapabilityFile};

/// Runs the container side. On success this function does not return: the
/// user command replaces the process image. Every error path exits the
/// process non-zero via the caller.
pub fn run(config: &EngineConfig, mut master: UnixStream) -> VesselResult<std::convert::Infallible> {
    wait_for_release(&mut master)?;

    apply_identity(config)?;
    apply_capabilities(config)?;

    let cwd = config
        .cwd
        .clone()
        .filter(|cwd| cwd.is_dir())
        .unwrap_or_else(|| {
            if let Some(cwd) = &config.cwd {
                warn!(cwd = %cwd.display(), "cwd not present in container, starting in /");
            }
            "/".into()
        });

    let argv0 = &config.command[0];
    let mut command = Command::new(argv0);
    command
        .args(&config.command[1..])
        .env_clear()
        .envs(&config.env)
        .current_dir(&cwd);
    if !config.env.contains_key("PATH") {
        command.env("PATH", "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin");
    }

    debug!(command = ?config.command, cwd = %cwd.display(), "exec");
    let err = command.exec();
    Err(VesselError::Setup(format!("exec {argv0}: {err}")))
}

/// Blocks until MASTER writes the release byte. A closed socket means
/// MASTER died during setup, and the container must not run.
fn wait_for_release(master: &mut UnixStream) -> VesselResult<()> {
    let mut byte = [0u8; 1];
    master
        .read_exact(&mut byte)
        .map_err(|_| VesselError::RpcTransportLost)?;
    Ok(())
}

/// Switches to the sudo-as target identity when one was requested.
fn apply_identity(config: &EngineConfig) -> VesselResult<()> {
    if let Some(gid) = config.target_gid {
        nix::unistd::setresgid(
            nix::unistd::Gid::from_raw(gid),
            nix::unistd::Gid::from_raw(gid),
            nix::unistd::Gid::from_raw(gid),
        )
        .map_err(|e| VesselError::Setup(format!("setresgid({gid}): {e}")))?;
    }
    if let Some(uid) = config.target_uid {
        nix::unistd::setresuid(
            nix::unistd::Uid::from_raw(uid),
            nix::unistd::Uid::from_raw(uid),
            nix::unistd::Uid::from_raw(uid),
        )
        .map_err(|e| VesselError::Setup(format!("setresuid({uid}): {e}")))?;
    }
    Ok(())
}

/// Computes and applies the five container capability sets.
fn apply_capabilities(config: &EngineConfig) -> VesselResult<()> {
    let permitted = caps::read(None, CapSet::Permitted)
        .map_err(|e| VesselError::Setup(format!("read permitted: {e}")))?;

    let authorized = if config.capabilities.default == CapDefault::File {
        let file = CapabilityFile::load(Path::new(CAPABILITY_FILE)).unwrap_or_default();
        let user = super::stage1::user_name(config.invoker_uid).unwrap_or_default();
        let groups: Vec<String> = super::stage1::group_name(config.invoker_gid)
            .into_iter()
            .collect();
        file.authorized(&user, &groups).unwrap_or_default()
    } else {
        Default::default()
    };

    let target = privilege::compute_container_caps(&config.capabilities, &permitted, &authorized)?;
    privilege::apply_container_caps(&target)
}
