//! Mount-plan vocabulary: tags and mount points.

use std::path::{Path, PathBuf};

use nix::mount::MsFlags;

/// Position of a mount group in the plan's total order. Declaration order is
/// execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Tag {
    RootFs,
    PreLayer,
    Layer,
    Session,
    ImageBind,
    Kernel,
    Hostfs,
    Binds,
    Cwd,
    Home,
    Userbinds,
    Tmp,
    Scratch,
    Files,
    Dev,
    Shared,
    Other,
    Final,
}

impl Tag {
    /// All tags in execution order.
    pub const ORDER: [Tag; 18] = [
        Tag::RootFs,
        Tag::PreLayer,
        Tag::Layer,
        Tag::Session,
        Tag::ImageBind,
        Tag::Kernel,
        Tag::Hostfs,
        Tag::Binds,
        Tag::Cwd,
        Tag::Home,
        Tag::Userbinds,
        Tag::Tmp,
        Tag::Scratch,
        Tag::Files,
        Tag::Dev,
        Tag::Shared,
        Tag::Other,
        Tag::Final,
    ];

    /// Whether a missing source/destination aborts setup for entries of this
    /// tag. Best-effort tags log and continue instead.
    pub fn missing_is_fatal(self) -> bool {
        !matches!(
            self,
            Tag::Kernel | Tag::Hostfs | Tag::Binds | Tag::Cwd | Tag::Files | Tag::Tmp
        )
    }
}

/// Routing and policy bits attached to an entry, never handed to the kernel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InternalFlags {
    /// Log and continue when this entry fails.
    pub skip_on_error: bool,
    /// Entry mounts a region of an image file; routed to the image driver.
    pub image_partition: bool,
    /// Source is a plain file that needs a loop device first.
    pub needs_loop: bool,
    /// Flag-only remount attaching to the prior entry at this destination.
    pub remount: bool,
    /// Propagation change (MS_SLAVE/MS_SHARED/...) at this destination.
    pub propagation: bool,
    /// The source must be decrypted through device-mapper before mounting.
    pub crypt: bool,
}

/// One planned mount operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPoint {
    pub source: Option<PathBuf>,
    pub destination: PathBuf,
    pub fs_type: Option<String>,
    pub flags: MsFlags,
    pub data: String,
    /// Byte offset of the filesystem inside the source file (SIF partition).
    pub offset: Option<u64>,
    pub size: Option<u64>,
    /// Key material for encrypted sources.
    pub key: Option<Vec<u8>>,
    pub internal: InternalFlags,
}

impl MountPoint {
    /// Filesystem mount (`proc`, `tmpfs`, `sysfs`, ...).
    pub fn filesystem(fs_type: &str, destination: &Path, flags: MsFlags, data: &str) -> Self {
        Self {
            source: Some(PathBuf::from(fs_type)),
            destination: destination.to_path_buf(),
            fs_type: Some(fs_type.to_string()),
            flags,
            data: data.to_string(),
            offset: None,
            size: None,
            key: None,
            internal: InternalFlags::default(),
        }
    }

    /// Bind mount.
    pub fn bind(source: &Path, destination: &Path, flags: MsFlags) -> Self {
        Self {
            source: Some(source.to_path_buf()),
            destination: destination.to_path_buf(),
            fs_type: None,
            flags: flags | MsFlags::MS_BIND,
            data: String::new(),
            offset: None,
            size: None,
            key: None,
            internal: InternalFlags::default(),
        }
    }

    /// Flag-only remount of an existing mount.
    pub fn remount(destination: &Path, flags: MsFlags) -> Self {
        Self {
            source: None,
            destination: destination.to_path_buf(),
            fs_type: None,
            flags: flags | MsFlags::MS_REMOUNT,
            data: String::new(),
            offset: None,
            size: None,
            key: None,
            internal: InternalFlags {
                remount: true,
                ..Default::default()
            },
        }
    }

    /// Propagation change at an existing mount.
    pub fn propagation(destination: &Path, flags: MsFlags) -> Self {
        Self {
            source: None,
            destination: destination.to_path_buf(),
            fs_type: None,
            flags,
            data: String::new(),
            offset: None,
            size: None,
            key: None,
            internal: InternalFlags {
                propagation: true,
                ..Default::default()
            },
        }
    }

    /// Image mount: a filesystem at `offset` inside the source file.
    pub fn image(
        source: &Path,
        destination: &Path,
        fs_type: &str,
        flags: MsFlags,
        offset: u64,
        size: u64,
    ) -> Self {
        Self {
            source: Some(source.to_path_buf()),
            destination: destination.to_path_buf(),
            fs_type: Some(fs_type.to_string()),
            flags,
            data: String::new(),
            offset: Some(offset),
            size: Some(size),
            key: None,
            internal: InternalFlags {
                image_partition: offset > 0,
                needs_loop: offset == 0,
                ..Default::default()
            },
        }
    }

    pub fn with_skip_on_error(mut self, skip: bool) -> Self {
        self.internal.skip_on_error = skip;
        self
    }

    pub fn with_key(mut self, key: Option<Vec<u8>>) -> Self {
        self.internal.crypt = key.is_some();
        self.key = key;
        self
    }

    pub fn with_data(mut self, data: &str) -> Self {
        self.data = data.to_string();
        self
    }

    /// True for entries that attach to a prior mount instead of creating one.
    pub fn is_attached(&self) -> bool {
        self.internal.remount || self.internal.propagation
    }
}
