//! SIF container parsing: just enough of the descriptor table to drive
//! mounting.
//!
//! A SIF file is a header plus a table of object descriptors; the launcher
//! only cares about partition descriptors (rootfs, overlay, data) and reads
//! their offset, length, filesystem and usage. Everything else (definition
//! files, signatures, labels) belongs to the packaging tools and is skipped.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};

use thiserror::Error;

use vessel_shared::config::{Partition, PartitionFs, PartitionUsage};

/// Leading file magic.
pub(crate) const MAGIC: &[u8] = b"SIF_MAGIC\0";

/// Supported descriptor-table layout version.
const LAYOUT_VERSION: u32 = 2;

/// Header field offsets.
const OFF_VERSION: u64 = 12;
const OFF_NDESCR: u64 = 16;
const OFF_DESCROFF: u64 = 24;

/// Fixed size of one descriptor record.
const DESCR_SIZE: usize = 64;

/// Descriptor datatype for a partition object.
const DTYPE_PARTITION: u32 = 0x4002;

/// Descriptor record field offsets.
const D_OFF_DTYPE: usize = 0;
const D_OFF_USED: usize = 4;
const D_OFF_ID: usize = 8;
const D_OFF_FILEOFF: usize = 16;
const D_OFF_FILELEN: usize = 24;
const D_OFF_FSTYPE: usize = 32;
const D_OFF_PARTTYPE: usize = 36;

#[derive(Debug, Error)]
pub enum SifError {
    #[error("not a SIF file")]
    BadMagic,
    #[error("unsupported SIF layout version {0}")]
    BadVersion(u32),
    #[error("descriptor table truncated")]
    Truncated,
    #[error("descriptor {id}: unknown filesystem code {code}")]
    UnknownFs { id: u32, code: u32 },
    #[error("descriptor {id}: unknown partition usage code {code}")]
    UnknownUsage { id: u32, code: u32 },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn u32_at(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(buf[off..off + 4].try_into().unwrap())
}

fn u64_at(buf: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(buf[off..off + 8].try_into().unwrap())
}

fn fs_from_code(id: u32, code: u32) -> Result<PartitionFs, SifError> {
    match code {
        1 => Ok(PartitionFs::Squashfs),
        2 => Ok(PartitionFs::Ext3),
        3 => Ok(PartitionFs::EncryptSquashfs),
        4 => Ok(PartitionFs::GocryptfsSquashfs),
        5 => Ok(PartitionFs::OverlayExt3),
        code => Err(SifError::UnknownFs { id, code }),
    }
}

fn usage_from_code(id: u32, code: u32) -> Result<PartitionUsage, SifError> {
    match code {
        1 => Ok(PartitionUsage::Rootfs),
        2 => Ok(PartitionUsage::Overlay),
        3 => Ok(PartitionUsage::Data),
        code => Err(SifError::UnknownUsage { id, code }),
    }
}

/// Reads the partition descriptors of an already-opened SIF file. The
/// returned list preserves descriptor order, which is also mount order for
/// overlay partitions.
pub fn read_partition_table(file: &mut File) -> Result<Vec<Partition>, SifError> {
    let mut header = [0u8; 32];
    file.seek(SeekFrom::Start(0))?;
    file.read_exact(&mut header).map_err(|_| SifError::BadMagic)?;

    if &header[..MAGIC.len()] != MAGIC {
        return Err(SifError::BadMagic);
    }
    let version = u32_at(&header, OFF_VERSION as usize);
    if version != LAYOUT_VERSION {
        return Err(SifError::BadVersion(version));
    }

    let ndescr = u64_at(&header, OFF_NDESCR as usize);
    let descroff = u64_at(&header, OFF_DESCROFF as usize);

    let mut partitions = Vec::new();
    let mut record = [0u8; DESCR_SIZE];

    file.seek(SeekFrom::Start(descroff))?;
    for _ in 0..ndescr {
        file.read_exact(&mut record).map_err(|_| SifError::Truncated)?;

        if u32_at(&record, D_OFF_DTYPE) != DTYPE_PARTITION || record[D_OFF_USED] == 0 {
            continue;
        }

        let id = u32_at(&record, D_OFF_ID);
        partitions.push(Partition {
            id,
            offset: u64_at(&record, D_OFF_FILEOFF),
            size: u64_at(&record, D_OFF_FILELEN),
            fs: fs_from_code(id, u32_at(&record, D_OFF_FSTYPE))?,
            usage: usage_from_code(id, u32_at(&record, D_OFF_PARTTYPE))?,
        });
    }

    Ok(partitions)
}

/// Serializes a descriptor table; used by packaging tools and tests to build
/// images the reader understands.
pub fn write_sif(partitions: &[(Partition, &[u8])]) -> Vec<u8> {
    let header_len = 32usize;
    let table_len = partitions.len() * DESCR_SIZE;
    let data_start = header_len + table_len;

    let mut out = vec![0u8; data_start];
    out[..MAGIC.len()].copy_from_slice(MAGIC);
    out[OFF_VERSION as usize..OFF_VERSION as usize + 4]
        .copy_from_slice(&LAYOUT_VERSION.to_le_bytes());
    out[OFF_NDESCR as usize..OFF_NDESCR as usize + 8]
        .copy_from_slice(&(partitions.len() as u64).to_le_bytes());
    out[OFF_DESCROFF as usize..OFF_DESCROFF as usize + 8]
        .copy_from_slice(&(header_len as u64).to_le_bytes());

    let mut cursor = data_start as u64;
    for (i, (part, data)) in partitions.iter().enumerate() {
        let base = header_len + i * DESCR_SIZE;
        let rec = &mut out[base..base + DESCR_SIZE];
        rec[D_OFF_DTYPE..D_OFF_DTYPE + 4].copy_from_slice(&DTYPE_PARTITION.to_le_bytes());
        rec[D_OFF_USED] = 1;
        rec[D_OFF_ID..D_OFF_ID + 4].copy_from_slice(&part.id.to_le_bytes());
        rec[D_OFF_FILEOFF..D_OFF_FILEOFF + 8].copy_from_slice(&cursor.to_le_bytes());
        rec[D_OFF_FILELEN..D_OFF_FILELEN + 8].copy_from_slice(&(data.len() as u64).to_le_bytes());
        let fs_code: u32 = match part.fs {
            PartitionFs::Squashfs => 1,
            PartitionFs::Ext3 => 2,
            PartitionFs::EncryptSquashfs => 3,
            PartitionFs::GocryptfsSquashfs => 4,
            PartitionFs::OverlayExt3 => 5,
        };
        let usage_code: u32 = match part.usage {
            PartitionUsage::Rootfs => 1,
            PartitionUsage::Overlay => 2,
            PartitionUsage::Data => 3,
        };
        rec[D_OFF_FSTYPE..D_OFF_FSTYPE + 4].copy_from_slice(&fs_code.to_le_bytes());
        rec[D_OFF_PARTTYPE..D_OFF_PARTTYPE + 4].copy_from_slice(&usage_code.to_le_bytes());
        cursor += data.len() as u64;
    }

    for (_, data) in partitions {
        out.extend_from_slice(data);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn part(id: u32, fs: PartitionFs, usage: PartitionUsage) -> Partition {
        Partition {
            id,
            offset: 0,
            size: 0,
            fs,
            usage,
        }
    }

    fn open_bytes(bytes: &[u8]) -> File {
        let mut f = tempfile::tempfile().unwrap();
        f.write_all(bytes).unwrap();
        f
    }

    #[test]
    fn test_round_trip_partition_table() {
        let rootfs = vec![0xAAu8; 128];
        let overlay = vec![0xBBu8; 64];
        let bytes = write_sif(&[
            (part(1, PartitionFs::Squashfs, PartitionUsage::Rootfs), rootfs.as_slice()),
            (part(2, PartitionFs::Ext3, PartitionUsage::Overlay), overlay.as_slice()),
        ]);

        let mut f = open_bytes(&bytes);
        let table = read_partition_table(&mut f).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table[0].fs, PartitionFs::Squashfs);
        assert_eq!(table[0].usage, PartitionUsage::Rootfs);
        assert_eq!(table[0].size, 128);
        assert_eq!(table[1].offset, table[0].offset + 128);

        // Offsets point at the payload we wrote.
        assert_eq!(bytes[table[0].offset as usize], 0xAA);
        assert_eq!(bytes[table[1].offset as usize], 0xBB);
    }

    #[test]
    fn test_rejects_bad_magic() {
        let mut f = open_bytes(&[0u8; 64]);
        assert!(matches!(
            read_partition_table(&mut f),
            Err(SifError::BadMagic)
        ));
    }

    #[test]
    fn test_rejects_wrong_version() {
        let mut bytes = write_sif(&[]);
        bytes[OFF_VERSION as usize] = 9;
        let mut f = open_bytes(&bytes);
        assert!(matches!(
            read_partition_table(&mut f),
            Err(SifError::BadVersion(9))
        ));
    }

    #[test]
    fn test_truncated_table() {
        let payload = [0u8; 16];
        let mut bytes = write_sif(&[(
            part(1, PartitionFs::Squashfs, PartitionUsage::Rootfs),
            payload.as_slice(),
        )]);
        bytes.truncate(40); // header survives, table does not
        let mut f = open_bytes(&bytes);
        assert!(matches!(
            read_partition_table(&mut f),
            Err(SifError::Truncated)
        ));
    }

    #[test]
    fn test_encrypted_fs_codes() {
        let payload = [0u8; 8];
        let bytes = write_sif(&[(
            part(3, PartitionFs::GocryptfsSquashfs, PartitionUsage::Rootfs),
            payload.as_slice(),
        )]);
        let mut f = open_bytes(&bytes);
        let table = read_partition_table(&mut f).unwrap();
        assert_eq!(table[0].fs, PartitionFs::GocryptfsSquashfs);
    }
}
