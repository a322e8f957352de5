//! Image opening and format detection.
//!
//! STAGE1 opens every image exactly once; the descriptor is then inherited
//! through the fd table by every later stage. Nothing in the pipeline is
//! allowed to re-open an image by path, so a swap of the file underneath the
//! launcher cannot change what ends up mounted.

mod sif;

pub use sif::{SifError, read_partition_table};

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::{Path, PathBuf};

use vessel_shared::config::{ImageKind, Partition, ResolvedImage};
use vessel_shared::errors::{VesselError, VesselResult};

/// Magic of a SquashFS superblock ("hsqs", little-endian).
const SQUASHFS_MAGIC: [u8; 4] = [0x68, 0x73, 0x71, 0x73];

/// ext2/3/4 superblock magic at offset 1024 + 56.
const EXT_MAGIC: [u8; 2] = [0x53, 0xEF];

/// LUKS header magic, the signature of an encrypted SquashFS image file.
const LUKS_MAGIC: [u8; 6] = [b'L', b'U', b'K', b'S', 0xBA, 0xBE];

/// An opened container image. The descriptor outlives every stage; partition
/// data is parsed once here and serialized into the engine config.
#[derive(Debug)]
pub struct Image {
    path: PathBuf,
    kind: ImageKind,
    writable: bool,
    encrypted: bool,
    fd: OwnedFd,
    partitions: Vec<Partition>,
}

impl Image {
    /// Opens and identifies an image. `writable` requests write access and
    /// is honored only for formats that support it (sandbox dirs, ext3).
    pub fn open(path: &Path, writable: bool) -> VesselResult<Self> {
        let meta = std::fs::metadata(path).map_err(|source| VesselError::ImageOpenFailed {
            path: path.to_path_buf(),
            source,
        })?;

        if meta.is_dir() {
            let fd = open_path_fd(path)?;
            return Ok(Self {
                path: path.to_path_buf(),
                kind: ImageKind::Sandbox,
                writable,
                encrypted: false,
                fd,
                partitions: Vec::new(),
            });
        }

        let mut file = std::fs::OpenOptions::new()
            .read(true)
            .write(writable)
            .open(path)
            .map_err(|source| VesselError::ImageOpenFailed {
                path: path.to_path_buf(),
                source,
            })?;

        let (kind, encrypted) = detect_file_kind(&mut file)
            .map_err(|source| VesselError::ImageOpenFailed {
                path: path.to_path_buf(),
                source,
            })?
            .ok_or_else(|| VesselError::ImageUnrecognized(path.to_path_buf()))?;

        let partitions = match kind {
            ImageKind::Sif => read_partition_table(&mut file)
                .map_err(|e| VesselError::Session(format!("{}: {e}", path.display())))?,
            _ => Vec::new(),
        };

        Ok(Self {
            path: path.to_path_buf(),
            kind,
            writable,
            encrypted,
            fd: OwnedFd::from(file),
            partitions,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn kind(&self) -> ImageKind {
        self.kind
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    /// True for a bare image wrapped in a LUKS container.
    pub fn encrypted(&self) -> bool {
        self.encrypted
    }

    pub fn fd(&self) -> &OwnedFd {
        &self.fd
    }

    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    /// Serializable mirror referencing the promoted fd slot.
    pub fn resolve(&self, fd_slot: i32) -> ResolvedImage {
        ResolvedImage {
            path: self.path.clone(),
            kind: self.kind,
            writable: self.writable,
            encrypted: self.encrypted,
            fd_slot,
            partitions: self.partitions.clone(),
        }
    }

    /// Consumes the image, handing the descriptor to the fd table.
    pub fn into_fd(self) -> OwnedFd {
        self.fd
    }

    /// The path later stages use to address the inherited descriptor.
    pub fn proc_fd_path(fd_slot: i32) -> PathBuf {
        PathBuf::from(format!("/proc/self/fd/{fd_slot}"))
    }
}

fn open_path_fd(path: &Path) -> VesselResult<OwnedFd> {
    let file = File::open(path).map_err(|source| VesselError::ImageOpenFailed {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(OwnedFd::from(file))
}

/// Probes the on-disk format by magic numbers. Returns the kind plus an
/// encrypted bit; `None` when nothing matched, which callers surface as
/// `ImageUnrecognized`.
fn detect_file_kind(file: &mut File) -> std::io::Result<Option<(ImageKind, bool)>> {
    let mut head = [0u8; 32];
    file.seek(SeekFrom::Start(0))?;
    let n = read_up_to(file, &mut head)?;

    if n >= sif::MAGIC.len() && head.starts_with(sif::MAGIC) {
        return Ok(Some((ImageKind::Sif, false)));
    }
    if n >= 4 && head[..4] == SQUASHFS_MAGIC {
        return Ok(Some((ImageKind::Squashfs, false)));
    }
    // An encrypted SquashFS is a LUKS container around the filesystem.
    if n >= 6 && head[..6] == LUKS_MAGIC {
        return Ok(Some((ImageKind::Squashfs, true)));
    }

    // ext superblock lives at offset 1024.
    let mut sb = [0u8; 64];
    file.seek(SeekFrom::Start(1024))?;
    let n = read_up_to(file, &mut sb)?;
    if n >= 58 && sb[56..58] == EXT_MAGIC {
        return Ok(Some((ImageKind::Ext3, false)));
    }

    Ok(None)
}

/// Reads as many bytes as the file has, without erroring on short files.
fn read_up_to(file: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        let n = file.read(&mut buf[total..])?;
        if n == 0 {
            break;
        }
        total += n;
    }
    Ok(total)
}
