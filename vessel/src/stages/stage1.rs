//! STAGE1: validate the launch against policy and resolve every image.
//!
//! Runs first, with the invoker's own uid (never euid 0). Its output is the
//! final engine config blob; everything later stages do is derived from it.
//! Policy violations surface here as `ConfigRejected` / `AuthorizationDenied`
//! and abort the pipeline before a single namespace or mount exists.

use std::os::unix::fs::MetadataExt;
use std::path::Path;

use tracing::debug;

use vessel_shared::config::{EngineConfig, ImageKind, PartitionFs, SessionLayer};
use vessel_shared::errors::{VesselError, VesselResult};
use vessel_shared::sysconf::{OverlayMode, UnderlayMode};

use crate::image::Image;
use crate::privilege::{CAPABILITY_FILE, CapabilityFile};
use crate::starter::FdTable;

/// Whether this invocation can use the setuid workflow: the binary is
/// installed setuid root and the administrator allows it.
pub fn setuid_mode(config: &EngineConfig) -> bool {
    if !config.sysconf.allow_setuid {
        return false;
    }
    nix::unistd::getresuid()
        .map(|r| r.saved.as_raw() == 0 || r.effective.as_raw() == 0)
        .unwrap_or(false)
}

/// Validates, resolves and completes the launch record.
pub fn run(mut config: EngineConfig, fdtable: &mut FdTable) -> VesselResult<EngineConfig> {
    config.invoker_uid = nix::unistd::getuid().as_raw();
    config.invoker_gid = nix::unistd::getgid().as_raw();

    if config.command.is_empty() {
        return Err(VesselError::ConfigRejected("no command to execute".into()));
    }

    validate_namespaces(&mut config)?;
    validate_capabilities(&config)?;
    validate_network(&config)?;

    resolve_images(&mut config, fdtable)?;
    decide_session_layer(&mut config);
    pick_session_dir(&mut config)?;

    debug!(
        image = %config.image.display(),
        layer = ?config.session_layer,
        user_ns = config.namespaces.user,
        "stage1 complete"
    );
    Ok(config)
}

fn validate_namespaces(config: &mut EngineConfig) -> VesselResult<()> {
    let sysconf = &config.sysconf;

    if config.namespaces.pid && !sysconf.allow_pid_ns {
        return Err(VesselError::ConfigRejected("allow pid ns = no".into()));
    }
    if config.namespaces.uts && !sysconf.allow_uts_ns {
        return Err(VesselError::ConfigRejected("allow uts ns = no".into()));
    }

    // Without the setuid workflow, every privileged operation depends on
    // owning a user namespace.
    if !setuid_mode(config) {
        config.namespaces.user = true;
    }
    if config.fakeroot {
        config.namespaces.user = true;
    }
    Ok(())
}

fn validate_capabilities(config: &EngineConfig) -> VesselResult<()> {
    if config.capabilities.add.is_empty() {
        return Ok(());
    }
    // Inside a caller-owned user namespace capabilities are namespaced and
    // free; the authorization file governs the setuid workflow only.
    if config.namespaces.user || !setuid_mode(config) {
        return Ok(());
    }

    let file = CapabilityFile::load(Path::new(CAPABILITY_FILE)).unwrap_or_default();
    let user = user_name(config.invoker_uid).unwrap_or_default();
    let groups = group_name(config.invoker_gid).into_iter().collect::<Vec<_>>();
    let authorized = file.authorized(&user, &groups)?;

    for name in &config.capabilities.add {
        let cap = crate::privilege::parse_cap(name)?;
        if !authorized.contains(&cap) {
            return Err(VesselError::AuthorizationDenied(format!(
                "capability {name} is not authorized for user {user}"
            )));
        }
    }
    Ok(())
}

fn validate_network(config: &EngineConfig) -> VesselResult<()> {
    let name = &config.network.name;
    if name.is_empty() || name == "none" {
        return Ok(());
    }
    // Network plumbing happens with host privileges, so the allow lists
    // bind whenever the caller is not real root.
    if config.invoker_uid == 0 {
        return Ok(());
    }

    let sysconf = &config.sysconf;
    let user = user_name(config.invoker_uid).unwrap_or_default();
    let group = group_name(config.invoker_gid).unwrap_or_default();

    let user_allowed = sysconf.allow_net_users.contains(&user)
        || sysconf.allow_net_groups.contains(&group);
    let network_allowed = sysconf.allow_net_networks.contains(name);

    if !user_allowed || !network_allowed {
        return Err(VesselError::AuthorizationDenied(format!(
            "network {name} is not permitted for user {user}"
        )));
    }
    Ok(())
}

fn resolve_images(config: &mut EngineConfig, fdtable: &mut FdTable) -> VesselResult<()> {
    let mut resolved = Vec::new();

    let primary = open_checked(config, &config.image.clone(), config.writable_image)?;
    resolved.push(register(primary, fdtable));

    for overlay in config.overlay_images.clone() {
        let image = open_checked(config, &overlay.path, overlay.writable)?;
        resolved.push(register(image, fdtable));
    }

    config.images = resolved;
    Ok(())
}

fn register(
    image: Image,
    fdtable: &mut FdTable,
) -> vessel_shared::config::ResolvedImage {
    // The slot number is decided now; the actual dup2 happens when the
    // whole table installs, before the stage forks.
    let placeholder = image.resolve(0);
    let slot = fdtable.register(image.into_fd());
    vessel_shared::config::ResolvedImage {
        fd_slot: slot,
        ..placeholder
    }
}

/// Opens one image and applies every image-level policy gate.
fn open_checked(config: &EngineConfig, path: &Path, writable: bool) -> VesselResult<Image> {
    let sysconf = &config.sysconf;
    let image = Image::open(path, writable)?;

    let allowed = match image.kind() {
        ImageKind::Sif => sysconf.allow_container.sif,
        ImageKind::Squashfs => sysconf.allow_container.squashfs,
        ImageKind::Ext3 => sysconf.allow_container.extfs,
        ImageKind::Sandbox => sysconf.allow_container.dir,
    };
    if !allowed {
        return Err(VesselError::ConfigRejected(format!(
            "{:?} containers are disallowed by configuration",
            image.kind()
        )));
    }

    let encrypted = image.encrypted()
        || image
            .partitions()
            .iter()
            .any(|p| matches!(p.fs, PartitionFs::EncryptSquashfs | PartitionFs::GocryptfsSquashfs));
    if encrypted && !sysconf.allow_container.encrypted {
        return Err(VesselError::ConfigRejected(
            "encrypted containers are disallowed by configuration".into(),
        ));
    }

    // Path/owner/group limits only constrain the privileged workflow.
    if setuid_mode(config) && config.invoker_uid != 0 {
        validate_image_limits(config, path)?;
    }

    Ok(image)
}

fn validate_image_limits(config: &EngineConfig, path: &Path) -> VesselResult<()> {
    let sysconf = &config.sysconf;

    if !sysconf.limit_container_paths.is_empty() {
        let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        if !sysconf
            .limit_container_paths
            .iter()
            .any(|prefix| canonical.starts_with(prefix))
        {
            return Err(VesselError::AuthorizationDenied(format!(
                "{} is outside the permitted container paths",
                path.display()
            )));
        }
    }

    let meta = std::fs::metadata(path)?;
    if !sysconf.limit_container_owners.is_empty() {
        let owner = user_name(meta.uid()).unwrap_or_default();
        if owner != "root" && !sysconf.limit_container_owners.contains(&owner) {
            return Err(VesselError::AuthorizationDenied(format!(
                "image owner {owner} is not a permitted container owner"
            )));
        }
    }
    if !sysconf.limit_container_groups.is_empty() {
        let group = group_name(meta.gid()).unwrap_or_default();
        if group != "root" && !sysconf.limit_container_groups.contains(&group) {
            return Err(VesselError::AuthorizationDenied(format!(
                "image group {group} is not a permitted container group"
            )));
        }
    }
    Ok(())
}

fn decide_session_layer(config: &mut EngineConfig) {
    if config.session_layer != SessionLayer::Default {
        return; // explicit request wins
    }
    if config.writable_tmpfs || !config.overlay_images.is_empty() {
        config.session_layer = SessionLayer::Overlay;
        return;
    }
    config.session_layer = match config.sysconf.enable_overlay {
        OverlayMode::Yes | OverlayMode::Try | OverlayMode::Driver => SessionLayer::Overlay,
        OverlayMode::No => match config.sysconf.enable_underlay {
            UnderlayMode::Preferred => SessionLayer::Underlay,
            _ => SessionLayer::Default,
        },
    };
}

fn pick_session_dir(config: &mut EngineConfig) -> VesselResult<()> {
    if config.session_dir.as_os_str().is_empty() {
        let suffix: u32 = rand::random();
        config.session_dir = std::env::temp_dir().join(format!(
            "vessel-session-{}-{suffix:08x}",
            config.invoker_uid
        ));
    }
    std::fs::create_dir_all(&config.session_dir)?;
    Ok(())
}

pub(crate) fn user_name(uid: u32) -> Option<String> {
    name_from_db(Path::new("/etc/passwd"), uid)
}

pub(crate) fn group_name(gid: u32) -> Option<String> {
    name_from_db(Path::new("/etc/group"), gid)
}

/// First column of the /etc/passwd-style line whose id column matches.
fn name_from_db(db: &Path, id: u32) -> Option<String> {
    let text = std::fs::read_to_string(db).ok()?;
    for line in text.lines() {
        let mut fields = line.split(':');
        let name = fields.next()?;
        let _password = fields.next()?;
        let entry_id: u32 = fields.next()?.parse().ok()?;
        if entry_id == id {
            return Some(name.to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn squashfs_file() -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&[0x68, 0x73, 0x71, 0x73, 0, 0, 0, 0]).unwrap();
        f.flush().unwrap();
        f
    }

    fn launch(image: &Path) -> EngineConfig {
        EngineConfig {
            image: image.to_path_buf(),
            command: vec!["/bin/true".into()],
            ..Default::default()
        }
    }

    #[test]
    fn test_run_resolves_squashfs_image() {
        let image = squashfs_file();
        let mut fdtable = FdTable::new();
        let config = run(launch(image.path()), &mut fdtable).unwrap();

        assert_eq!(config.images.len(), 1);
        assert_eq!(config.images[0].kind, ImageKind::Squashfs);
        assert_eq!(config.images[0].fd_slot, 3);
        assert_eq!(fdtable.len(), 1);
        // Unprivileged test run: the user namespace is mandatory.
        assert!(config.namespaces.user);
        assert!(config.session_dir.as_os_str().len() > 0);
        let _ = std::fs::remove_dir_all(&config.session_dir);
    }

    #[test]
    fn test_empty_command_rejected() {
        let image = squashfs_file();
        let mut config = launch(image.path());
        config.command.clear();
        let err = run(config, &mut FdTable::new()).unwrap_err();
        assert!(matches!(err, VesselError::ConfigRejected(_)));
    }

    #[test]
    fn test_disallowed_container_kind() {
        let image = squashfs_file();
        let mut config = launch(image.path());
        config.sysconf.allow_container.squashfs = false;
        let err = run(config, &mut FdTable::new()).unwrap_err();
        assert!(matches!(err, VesselError::ConfigRejected(_)));
    }

    #[test]
    fn test_pid_ns_gate() {
        let image = squashfs_file();
        let mut config = launch(image.path());
        config.sysconf.allow_pid_ns = false;
        config.namespaces.pid = true;
        let err = run(config, &mut FdTable::new()).unwrap_err();
        assert!(matches!(err, VesselError::ConfigRejected(_)));
    }

    #[test]
    fn test_network_authorization() {
        let image = squashfs_file();
        let mut config = launch(image.path());
        config.network.name = "bridge".into();
        // Nothing allow-listed: denied for a non-root invoker.
        if nix::unistd::getuid().as_raw() != 0 {
            let err = run(config, &mut FdTable::new()).unwrap_err();
            assert!(matches!(err, VesselError::AuthorizationDenied(_)));
        }
    }

    #[test]
    fn test_layer_decision_follows_sysconf() {
        let mut config = EngineConfig::default();
        config.sysconf.enable_overlay = OverlayMode::No;
        config.sysconf.enable_underlay = UnderlayMode::Preferred;
        decide_session_layer(&mut config);
        assert_eq!(config.session_layer, SessionLayer::Underlay);

        let mut config = EngineConfig::default();
        config.sysconf.enable_overlay = OverlayMode::Try;
        decide_session_layer(&mut config);
        assert_eq!(config.session_layer, SessionLayer::Overlay);

        let mut config = EngineConfig::default();
        config.sysconf.enable_overlay = OverlayMode::No;
        decide_session_layer(&mut config);
        assert_eq!(config.session_layer, SessionLayer::Default);
    }

    #[test]
    fn test_writable_tmpfs_forces_overlay() {
        let mut config = EngineConfig::default();
        config.sysconf.enable_overlay = OverlayMode::No;
        config.writable_tmpfs = true;
        decide_session_layer(&mut config);
        assert_eq!(config.session_layer, SessionLayer::Overlay);
    }

    #[test]
    fn test_name_lookup() {
        // uid 0 is root everywhere these tests run.
        assert_eq!(user_name(0).as_deref(), Some("root"));
    }
}
