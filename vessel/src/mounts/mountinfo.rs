//! /proc/self/mountinfo parsing.
//!
//! Used by the FUSE wait-for-mount loop (has the target appeared yet), the
//! hostfs planner (which top-level mounts exist), and the remount
//! reconciliation fallback (parent entry flags when statfs is unusable).

use std::path::{Path, PathBuf};

use vessel_shared::errors::{VesselError, VesselResult};

/// One line of mountinfo, fields per proc(5).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountInfoEntry {
    pub mount_id: u32,
    pub parent_id: u32,
    pub root: PathBuf,
    pub mount_point: PathBuf,
    /// Per-mount options ("rw,nosuid,relatime").
    pub options: Vec<String>,
    pub fs_type: String,
    pub source: String,
    /// Superblock options.
    pub super_options: Vec<String>,
}

impl MountInfoEntry {
    /// Mount-flag bits equivalent to this entry's option list, in the raw
    /// MS_*/ST_* numbering shared by mount(2) and statfs(2).
    pub fn option_bits(&self) -> u64 {
        let mut bits = 0u64;
        for opt in self.options.iter().chain(self.super_options.iter()) {
            bits |= match opt.as_str() {
                "ro" => libc::MS_RDONLY,
                "nosuid" => libc::MS_NOSUID,
                "nodev" => libc::MS_NODEV,
                "noexec" => libc::MS_NOEXEC,
                "sync" => libc::MS_SYNCHRONOUS,
                "mand" => libc::MS_MANDLOCK,
                "noatime" => libc::MS_NOATIME,
                "nodiratime" => libc::MS_NODIRATIME,
                "relatime" => libc::MS_RELATIME,
                _ => 0,
            };
        }
        bits
    }
}

fn unescape(field: &str) -> String {
    // mountinfo octal-escapes spaces, tabs, newlines and backslashes.
    let mut out = String::with_capacity(field.len());
    let mut chars = field.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            let digits: String = chars.clone().take(3).collect();
            if digits.len() == 3
                && let Ok(code) = u8::from_str_radix(&digits, 8)
            {
                out.push(code as char);
                chars.nth(2);
                continue;
            }
        }
        out.push(c);
    }
    out
}

/// Parses full mountinfo text.
pub fn parse(text: &str) -> VesselResult<Vec<MountInfoEntry>> {
    let mut entries = Vec::new();
    for line in text.lines() {
        if line.trim().is_empty() {
            continue;
        }
        entries.push(parse_line(line)?);
    }
    Ok(entries)
}

fn parse_line(line: &str) -> VesselResult<MountInfoEntry> {
    let corrupt = || VesselError::Session(format!("corrupt mountinfo line: {line:?}"));

    let mut fields = line.split(' ');
    let mount_id = fields
        .next()
        .and_then(|f| f.parse().ok())
        .ok_or_else(corrupt)?;
    let parent_id = fields
        .next()
        .and_then(|f| f.parse().ok())
        .ok_or_else(corrupt)?;
    let _major_minor = fields.next().ok_or_else(corrupt)?;
    let root = PathBuf::from(unescape(fields.next().ok_or_else(corrupt)?));
    let mount_point = PathBuf::from(unescape(fields.next().ok_or_else(corrupt)?));
    let options = fields
        .next()
        .ok_or_else(corrupt)?
        .split(',')
        .map(str::to_string)
        .collect();

    // Optional fields run until the "-" separator.
    for field in fields.by_ref() {
        if field == "-" {
            break;
        }
    }

    let fs_type = fields.next().ok_or_else(corrupt)?.to_string();
    let source = unescape(fields.next().ok_or_else(corrupt)?);
    let super_options = fields
        .next()
        .map(|f| f.split(',').map(str::to_string).collect())
        .unwrap_or_default();

    Ok(MountInfoEntry {
        mount_id,
        parent_id,
        root,
        mount_point,
        options,
        fs_type,
        source,
        super_options,
    })
}

/// Reads and parses the current process's mountinfo.
pub fn read_self() -> VesselResult<Vec<MountInfoEntry>> {
    let text = std::fs::read_to_string("/proc/self/mountinfo")?;
    parse(&text)
}

/// Whether `target` is a mount point according to `entries`.
pub fn is_mounted(entries: &[MountInfoEntry], target: &Path) -> bool {
    entries.iter().any(|e| e.mount_point == target)
}

/// The deepest entry whose mount point is a prefix of `path` — the mount the
/// path lives on.
pub fn owner_of<'a>(entries: &'a [MountInfoEntry], path: &Path) -> Option<&'a MountInfoEntry> {
    entries
        .iter()
        .filter(|e| path.starts_with(&e.mount_point))
        .max_by_key(|e| e.mount_point.as_os_str().len())
}
