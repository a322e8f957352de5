//! Typed record of the administrator configuration file.
//!
//! vessel.conf is line-oriented `key = value` text. The core only ever sees
//! this record; the loader here is the one place that understands the file
//! syntax. Unknown keys are ignored so older runtimes tolerate newer files.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::constants::defaults;
use crate::errors::{VesselError, VesselResult};

/// `enable overlay` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverlayMode {
    Yes,
    No,
    #[default]
    Try,
    Driver,
}

/// `enable underlay` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnderlayMode {
    #[default]
    Yes,
    No,
    Preferred,
}

/// `mount *` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountMode {
    #[default]
    Yes,
    No,
    Minimal,
}

/// `allow setuid-mount *` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SetuidMountMode {
    #[default]
    Yes,
    No,
    /// Allowed only when `limit container paths` restricts image locations.
    IfLimited,
}

/// `memory fs type` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryFs {
    #[default]
    Tmpfs,
    Ramfs,
}

impl MemoryFs {
    pub fn fs_name(self) -> &'static str {
        match self {
            MemoryFs::Tmpfs => "tmpfs",
            MemoryFs::Ramfs => "ramfs",
        }
    }
}

/// `root default capabilities` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RootDefaultCaps {
    #[default]
    Full,
    File,
    No,
}

/// Which container formats the administrator allows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowedContainers {
    pub sif: bool,
    pub encrypted: bool,
    pub squashfs: bool,
    pub extfs: bool,
    pub dir: bool,
}

impl Default for AllowedContainers {
    fn default() -> Self {
        Self {
            sif: true,
            encrypted: true,
            squashfs: true,
            extfs: true,
            dir: true,
        }
    }
}

/// Which image formats the kernel may mount while setuid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SetuidMounts {
    pub encrypted: SetuidMountMode,
    pub squashfs: SetuidMountMode,
    pub extfs: SetuidMountMode,
}

/// Which virtual filesystems get mounted into the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MountKnobs {
    pub proc: MountMode,
    pub sys: MountMode,
    pub dev: MountMode,
    pub devpts: MountMode,
    pub home: MountMode,
    pub tmp: MountMode,
    pub hostfs: MountMode,
}

/// The complete typed snapshot of vessel.conf.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemConfig {
    pub allow_setuid: bool,
    pub allow_pid_ns: bool,
    pub allow_uts_ns: bool,
    pub allow_container: AllowedContainers,
    pub allow_setuid_mount: SetuidMounts,
    pub mount: MountKnobs,
    pub enable_overlay: OverlayMode,
    pub enable_underlay: UnderlayMode,
    pub bind_paths: Vec<PathBuf>,
    pub limit_container_owners: Vec<String>,
    pub limit_container_groups: Vec<String>,
    pub limit_container_paths: Vec<PathBuf>,
    pub allow_net_users: Vec<String>,
    pub allow_net_groups: Vec<String>,
    pub allow_net_networks: Vec<String>,
    pub root_default_capabilities: RootDefaultCaps,
    pub memory_fs_type: MemoryFs,
    pub max_loop_devices: u32,
    pub sessiondir_max_size: u32,
    pub binary_path: String,
    pub image_driver: Option<String>,
    pub systemd_cgroups: bool,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            allow_setuid: true,
            allow_pid_ns: true,
            allow_uts_ns: false,
            allow_container: AllowedContainers::default(),
            allow_setuid_mount: SetuidMounts::default(),
            mount: MountKnobs::default(),
            enable_overlay: OverlayMode::default(),
            enable_underlay: UnderlayMode::default(),
            bind_paths: vec![
                PathBuf::from("/etc/localtime"),
                PathBuf::from("/etc/hosts"),
            ],
            limit_container_owners: Vec::new(),
            limit_container_groups: Vec::new(),
            limit_container_paths: Vec::new(),
            allow_net_users: Vec::new(),
            allow_net_groups: Vec::new(),
            allow_net_networks: Vec::new(),
            root_default_capabilities: RootDefaultCaps::default(),
            memory_fs_type: MemoryFs::default(),
            max_loop_devices: defaults::MAX_LOOP_DEVICES,
            sessiondir_max_size: defaults::SESSIONDIR_MAX_SIZE_MB,
            binary_path: defaults::BINARY_PATH.to_string(),
            image_driver: None,
            systemd_cgroups: true,
        }
    }
}

fn parse_bool(key: &str, value: &str) -> VesselResult<bool> {
    match value {
        "yes" => Ok(true),
        "no" => Ok(false),
        other => Err(VesselError::ConfigRejected(format!(
            "{key}: expected yes/no, got {other:?}"
        ))),
    }
}

fn parse_mount_mode(key: &str, value: &str) -> VesselResult<MountMode> {
    match value {
        "yes" => Ok(MountMode::Yes),
        "no" => Ok(MountMode::No),
        "minimal" => Ok(MountMode::Minimal),
        other => Err(VesselError::ConfigRejected(format!(
            "{key}: expected yes/no/minimal, got {other:?}"
        ))),
    }
}

fn parse_setuid_mount(key: &str, value: &str) -> VesselResult<SetuidMountMode> {
    match value {
        "yes" => Ok(SetuidMountMode::Yes),
        "no" => Ok(SetuidMountMode::No),
        "iflimited" => Ok(SetuidMountMode::IfLimited),
        other => Err(VesselError::ConfigRejected(format!(
            "{key}: expected yes/no/iflimited, got {other:?}"
        ))),
    }
}

fn push_list(target: &mut Vec<String>, value: &str) {
    target.extend(
        value
            .split([',', ' '])
            .filter(|s| !s.is_empty())
            .map(str::to_string),
    );
}

impl SystemConfig {
    /// Loads the record from file text. Blank lines and `#` comments are
    /// skipped; repeatable keys accumulate.
    pub fn parse(text: &str) -> VesselResult<Self> {
        let mut conf = SystemConfig::default();

        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(VesselError::ConfigRejected(format!(
                    "line {}: missing '=' in {:?}",
                    lineno + 1,
                    line
                )));
            };
            let key = key.trim();
            let value = value.trim();
            conf.apply(key, value)?;
        }

        Ok(conf)
    }

    pub fn load(path: &Path) -> VesselResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    fn apply(&mut self, key: &str, value: &str) -> VesselResult<()> {
        match key {
            "allow setuid" => self.allow_setuid = parse_bool(key, value)?,
            "allow pid ns" => self.allow_pid_ns = parse_bool(key, value)?,
            "allow uts ns" => self.allow_uts_ns = parse_bool(key, value)?,

            "allow container sif" => self.allow_container.sif = parse_bool(key, value)?,
            "allow container encrypted" => {
                self.allow_container.encrypted = parse_bool(key, value)?
            }
            "allow container squashfs" => self.allow_container.squashfs = parse_bool(key, value)?,
            "allow container extfs" => self.allow_container.extfs = parse_bool(key, value)?,
            "allow container dir" => self.allow_container.dir = parse_bool(key, value)?,

            "allow setuid-mount encrypted" => {
                self.allow_setuid_mount.encrypted = parse_setuid_mount(key, value)?
            }
            "allow setuid-mount squashfs" => {
                self.allow_setuid_mount.squashfs = parse_setuid_mount(key, value)?
            }
            "allow setuid-mount extfs" => {
                self.allow_setuid_mount.extfs = parse_setuid_mount(key, value)?
            }

            "mount proc" => self.mount.proc = parse_mount_mode(key, value)?,
            "mount sys" => self.mount.sys = parse_mount_mode(key, value)?,
            "mount dev" => self.mount.dev = parse_mount_mode(key, value)?,
            "mount devpts" => self.mount.devpts = parse_mount_mode(key, value)?,
            "mount home" => self.mount.home = parse_mount_mode(key, value)?,
            "mount tmp" => self.mount.tmp = parse_mount_mode(key, value)?,
            "mount hostfs" => self.mount.hostfs = parse_mount_mode(key, value)?,

            "enable overlay" => {
                self.enable_overlay = match value {
                    "yes" => OverlayMode::Yes,
                    "no" => OverlayMode::No,
                    "try" => OverlayMode::Try,
                    "driver" => OverlayMode::Driver,
                    other => {
                        return Err(VesselError::ConfigRejected(format!(
                            "enable overlay: expected yes/no/try/driver, got {other:?}"
                        )));
                    }
                }
            }
            "enable underlay" => {
                self.enable_underlay = match value {
                    "yes" => UnderlayMode::Yes,
                    "no" => UnderlayMode::No,
                    "preferred" => UnderlayMode::Preferred,
                    other => {
                        return Err(VesselError::ConfigRejected(format!(
                            "enable underlay: expected yes/no/preferred, got {other:?}"
                        )));
                    }
                }
            }

            "bind path" => self.bind_paths.push(PathBuf::from(value)),

            "limit container owners" => push_list(&mut self.limit_container_owners, value),
            "limit container groups" => push_list(&mut self.limit_container_groups, value),
            "limit container paths" => self
                .limit_container_paths
                .extend(value.split([',', ' ']).filter(|s| !s.is_empty()).map(PathBuf::from)),

            "allow net users" => push_list(&mut self.allow_net_users, value),
            "allow net groups" => push_list(&mut self.allow_net_groups, value),
            "allow net networks" => push_list(&mut self.allow_net_networks, value),

            "root default capabilities" => {
                self.root_default_capabilities = match value {
                    "full" => RootDefaultCaps::Full,
                    "file" => RootDefaultCaps::File,
                    "no" => RootDefaultCaps::No,
                    other => {
                        return Err(VesselError::ConfigRejected(format!(
                            "root default capabilities: expected full/file/no, got {other:?}"
                        )));
                    }
                }
            }

            "memory fs type" => {
                self.memory_fs_type = match value {
                    "tmpfs" => MemoryFs::Tmpfs,
                    "ramfs" => MemoryFs::Ramfs,
                    other => {
                        return Err(VesselError::ConfigRejected(format!(
                            "memory fs type: expected tmpfs/ramfs, got {other:?}"
                        )));
                    }
                }
            }

            "max loop devices" => {
                self.max_loop_devices = value.parse().map_err(|_| {
                    VesselError::ConfigRejected(format!("max loop devices: bad uint {value:?}"))
                })?
            }
            "sessiondir max size" => {
                self.sessiondir_max_size = value.parse().map_err(|_| {
                    VesselError::ConfigRejected(format!("sessiondir max size: bad uint {value:?}"))
                })?
            }

            "binary path" => self.binary_path = value.to_string(),
            "image driver" => {
                self.image_driver = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                }
            }
            "systemd cgroups" => self.systemd_cgroups = parse_bool(key, value)?,

            // Unknown keys are tolerated.
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_defaults_from_empty() {
        let conf = SystemConfig::parse("").unwrap();
        assert_eq!(conf, SystemConfig::default());
    }

    #[test]
    fn test_parse_full_file() {
        let text = r#"
# administrator configuration
allow setuid = no
allow pid ns = yes
allow container squashfs = no
allow setuid-mount extfs = iflimited
mount dev = minimal
enable overlay = driver
enable underlay = preferred
bind path = /etc/resolv.conf
bind path = /opt/data
limit container owners = alice, bob
allow net networks = bridge
root default capabilities = file
memory fs type = ramfs
max loop devices = 64
sessiondir max size = 16
binary path = /opt/vessel/bin
image driver = fuseapp
systemd cgroups = no
"#;
        let conf = SystemConfig::parse(text).unwrap();
        assert!(!conf.allow_setuid);
        assert!(!conf.allow_container.squashfs);
        assert_eq!(conf.allow_setuid_mount.extfs, SetuidMountMode::IfLimited);
        assert_eq!(conf.mount.dev, MountMode::Minimal);
        assert_eq!(conf.enable_overlay, OverlayMode::Driver);
        assert_eq!(conf.enable_underlay, UnderlayMode::Preferred);
        assert_eq!(
            conf.bind_paths.last(),
            Some(&PathBuf::from("/opt/data")),
            "bind path must be repeatable"
        );
        assert_eq!(conf.limit_container_owners, vec!["alice", "bob"]);
        assert_eq!(conf.allow_net_networks, vec!["bridge"]);
        assert_eq!(conf.root_default_capabilities, RootDefaultCaps::File);
        assert_eq!(conf.memory_fs_type, MemoryFs::Ramfs);
        assert_eq!(conf.max_loop_devices, 64);
        assert_eq!(conf.sessiondir_max_size, 16);
        assert_eq!(conf.image_driver.as_deref(), Some("fuseapp"));
        assert!(!conf.systemd_cgroups);
    }

    #[test]
    fn test_parse_rejects_bad_values() {
        assert!(SystemConfig::parse("allow setuid = maybe").is_err());
        assert!(SystemConfig::parse("mount proc = sometimes").is_err());
        assert!(SystemConfig::parse("max loop devices = lots").is_err());
        assert!(SystemConfig::parse("no equals sign here").is_err());
    }

    #[test]
    fn test_unknown_keys_ignored() {
        let conf = SystemConfig::parse("future knob = whatever").unwrap();
        assert_eq!(conf, SystemConfig::default());
    }
}
