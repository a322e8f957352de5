//! The engine configuration record.
//!
//! STAGE1 validates the invocation, resolves images, and emits this record as
//! a JSON blob through the shared-memory region. MASTER, RPC_SERVER and
//! STAGE2 deserialize it and treat it as read-only from then on. Open file
//! descriptors are referenced by their promoted slot number, never by path:
//! re-opening an image by path in a later stage would race against the
//! filesystem.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::sysconf::SystemConfig;

/// Strategy used to splice missing paths into the container filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionLayer {
    /// No layer: bind destinations must already exist in the image.
    #[default]
    Default,
    /// Kernel overlay (or driver-backed overlay) over the rootfs.
    Overlay,
    /// Bind mounts only; missing destinations are pre-created per subtree.
    Underlay,
}

/// Root default capability policy for the container process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapDefault {
    /// Copy permitted into effective, no_new_privs off.
    #[default]
    Full,
    /// Union of the caps authorized for the user and their groups in
    /// capability.json.
    File,
    /// Clear everything and set no_new_privs.
    No,
}

/// One uid_map / gid_map line for the user namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMap {
    pub container_id: u32,
    pub host_id: u32,
    pub size: u32,
}

/// Namespaces requested for the container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Namespaces {
    pub user: bool,
    pub pid: bool,
    pub uts: bool,
    pub ipc: bool,
    pub net: bool,
}

/// One entry of the bind path list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindPath {
    pub source: PathBuf,
    pub destination: PathBuf,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub skip_on_error: bool,
    /// Sub-path inside an image to bind from, instead of a host path.
    #[serde(default)]
    pub image_source: Option<PathBuf>,
    /// SIF partition the image-source refers to.
    #[serde(default)]
    pub partition_id: Option<u32>,
}

/// One overlay image layered over the rootfs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverlayImage {
    pub path: PathBuf,
    pub writable: bool,
}

/// A user-requested FUSE mount carried into the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FuseMount {
    pub binary: String,
    pub mountpoint: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Capability request attached to the launch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityRequest {
    /// Capability names to add, e.g. "CAP_NET_RAW".
    #[serde(default)]
    pub add: Vec<String>,
    #[serde(default)]
    pub drop: Vec<String>,
    /// Keep the effective set across the uid transition.
    #[serde(default)]
    pub keep_privs: bool,
    /// Drop everything regardless of the default policy.
    #[serde(default)]
    pub no_privs: bool,
    #[serde(default)]
    pub default: CapDefault,
}

/// Security knobs forwarded to the boundary services.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityOptions {
    #[serde(default)]
    pub selinux_label: Option<String>,
    #[serde(default)]
    pub apparmor_profile: Option<String>,
    #[serde(default)]
    pub seccomp_profile: Option<PathBuf>,
}

/// Network request handed to the CNI boundary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSpec {
    /// Network name; "none" means no setup.
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Custom home directory mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HomeSpec {
    /// True when the user overrode the home mapping.
    #[serde(default)]
    pub custom: bool,
    pub source: PathBuf,
    pub destination: PathBuf,
}

/// Filesystem format of an image or partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PartitionFs {
    Squashfs,
    Ext3,
    EncryptSquashfs,
    GocryptfsSquashfs,
    OverlayExt3,
}

/// What a SIF partition is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionUsage {
    Rootfs,
    Overlay,
    Data,
}

/// One partition of a SIF image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    pub id: u32,
    pub offset: u64,
    pub size: u64,
    pub fs: PartitionFs,
    pub usage: PartitionUsage,
}

/// Container image kind as detected by STAGE1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageKind {
    Sandbox,
    Squashfs,
    Ext3,
    Sif,
}

/// Serializable mirror of an opened image. The descriptor itself is
/// inherited through the fd table; `fd_slot` names its promoted slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedImage {
    pub path: PathBuf,
    pub kind: ImageKind,
    pub writable: bool,
    /// A bare image wrapped in a LUKS container (encrypted SquashFS).
    #[serde(default)]
    pub encrypted: bool,
    pub fd_slot: i32,
    #[serde(default)]
    pub partitions: Vec<Partition>,
}

impl ResolvedImage {
    /// The rootfs partition, if this is a SIF with one.
    pub fn rootfs_partition(&self) -> Option<&Partition> {
        self.partitions
            .iter()
            .find(|p| p.usage == PartitionUsage::Rootfs)
    }

    pub fn overlay_partitions(&self) -> impl Iterator<Item = &Partition> {
        self.partitions
            .iter()
            .filter(|p| p.usage == PartitionUsage::Overlay)
    }

    pub fn data_partitions(&self) -> impl Iterator<Item = &Partition> {
        self.partitions
            .iter()
            .filter(|p| p.usage == PartitionUsage::Data)
    }
}

/// The complete launch record. Built once in STAGE1, read-only thereafter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Primary image path as requested.
    pub image: PathBuf,
    /// Primary image plus every overlay/data image, resolved and opened.
    #[serde(default)]
    pub images: Vec<ResolvedImage>,

    pub namespaces: Namespaces,
    #[serde(default)]
    pub uid_maps: Vec<IdMap>,
    #[serde(default)]
    pub gid_maps: Vec<IdMap>,

    #[serde(default)]
    pub capabilities: CapabilityRequest,

    #[serde(default)]
    pub binds: Vec<BindPath>,
    #[serde(default)]
    pub overlay_images: Vec<OverlayImage>,

    #[serde(default)]
    pub scratch_dirs: Vec<PathBuf>,
    #[serde(default)]
    pub workdir: Option<PathBuf>,

    #[serde(default)]
    pub home: Option<HomeSpec>,

    #[serde(default)]
    pub fuse_mounts: Vec<FuseMount>,

    /// Host libraries and binaries injected file-by-file under
    /// `/.vessel/libs` (GPU stacks, debugging tools).
    #[serde(default)]
    pub library_binds: Vec<PathBuf>,

    /// Passphrase or key bytes for encrypted images. Zeroed after the
    /// decrypt call.
    #[serde(default)]
    pub key_material: Option<Vec<u8>>,

    #[serde(default)]
    pub security: SecurityOptions,

    #[serde(default)]
    pub network: NetworkSpec,

    /// Opaque cgroups resource document, handed to the cgroup controller.
    #[serde(default)]
    pub cgroups_json: Option<String>,

    /// Run as this uid/gid instead of the invoking user (sudo-as).
    #[serde(default)]
    pub target_uid: Option<u32>,
    #[serde(default)]
    pub target_gid: Option<u32>,

    #[serde(default)]
    pub fakeroot: bool,
    #[serde(default)]
    pub session_layer: SessionLayer,
    #[serde(default)]
    pub contain: bool,
    #[serde(default)]
    pub writable_tmpfs: bool,
    #[serde(default)]
    pub writable_image: bool,

    /// Command to exec inside the container, argv[0] first.
    pub command: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,

    /// Set when the launch is a named instance; drives the state file.
    #[serde(default)]
    pub instance_name: Option<String>,

    #[serde(default)]
    pub signal_propagation: bool,

    /// Snapshot of vessel.conf at launch time.
    pub sysconf: SystemConfig,

    /// Session directory root chosen by STAGE1.
    pub session_dir: PathBuf,

    /// Invoking user identity, recorded before any transition.
    pub invoker_uid: u32,
    pub invoker_gid: u32,
}

impl EngineConfig {
    /// The resolved primary image.
    pub fn primary_image(&self) -> Option<&ResolvedImage> {
        self.images.first()
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_json(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

/// Per-user instance state, persisted as JSON while an instance runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceState {
    pub pid: i32,
    pub ppid: i32,
    pub user_ns: bool,
    pub config: EngineConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> EngineConfig {
        EngineConfig {
            image: PathBuf::from("/images/app.sif"),
            images: vec![ResolvedImage {
                path: PathBuf::from("/images/app.sif"),
                kind: ImageKind::Sif,
                writable: false,
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
                        fs: PartitionFs::Ext3,
                        usage: PartitionUsage::Overlay,
                    },
                ],
            }],
            command: vec!["/bin/echo".into(), "hi".into()],
            session_dir: PathBuf::from("/run/user/1000/vessel"),
            invoker_uid: 1000,
            invoker_gid: 1000,
            ..Default::default()
        }
    }

    #[test]
    fn test_json_round_trip_preserves_partitions() {
        let config = sample_config();
        let blob = config.to_json().unwrap();
        let back = EngineConfig::from_json(&blob).unwrap();
        assert_eq!(back.images, config.images);
        assert_eq!(back.command, config.command);
    }

    #[test]
    fn test_rootfs_partition_lookup() {
        let config = sample_config();
        let image = config.primary_image().unwrap();
        assert_eq!(image.rootfs_partition().unwrap().id, 1);
        assert_eq!(image.overlay_partitions().count(), 1);
        assert_eq!(image.data_partitions().count(), 0);
    }

    #[test]
    fn test_defaults_are_inert() {
        let config = EngineConfig::default();
        assert_eq!(config.session_layer, SessionLayer::Default);
        assert!(!config.contain);
        assert!(config.binds.is_empty());
        assert_eq!(config.capabilities.default, CapDefault::Full);
    }
}
