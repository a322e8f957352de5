//! Test fixtures for the vessel workspace.
//!
//! The centerpiece is [`RecordingOps`], a [`MountOps`] implementation backed
//! by a simulated filesystem: plan execution and cleanup run unprivileged
//! and the emitted operation stream can be asserted syscall by syscall.
//! Failures are injectable per target so the error-policy ladders (overlay
//! ESTALE/EINVAL, unmount EBUSY, skip-on-error) are testable.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};

use nix::mount::{MntFlags, MsFlags};

use vessel::mounts::ops::{ChrootMethod, FileStat, LoopAttach, MountOps};
use vessel_shared::errors::{VesselError, VesselResult};

/// One recorded operation, in issue order.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Mount {
        source: Option<PathBuf>,
        target: PathBuf,
        fs_type: Option<String>,
        flags: u64,
        data: String,
    },
    Unmount {
        target: PathBuf,
        flags: i32,
    },
    Mkdir(PathBuf),
    Symlink {
        target: PathBuf,
        link: PathBuf,
    },
    WriteFile(PathBuf),
    Chdir(PathBuf),
    Chroot(ChrootMethod),
    LoopAttach(LoopAttach),
    CryptOpen {
        loop_device: u32,
    },
    CryptClose(PathBuf),
    SetHostname(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeKind {
    Dir,
    File,
    Symlink,
}

/// Simulated-filesystem mount backend.
#[derive(Default)]
pub struct RecordingOps {
    ops: Vec<Op>,
    nodes: HashMap<PathBuf, NodeKind>,
    stat_overrides: HashMap<PathBuf, (u64, u64)>,
    statfs_flags: HashMap<PathBuf, u64>,
    statfs_types: HashMap<PathBuf, String>,
    mountinfo_text: String,
    /// Per-target errno sequences for mount; popped per attempt, then the
    /// mount succeeds.
    mount_failures: HashMap<PathBuf, VecDeque<i32>>,
    /// Per-target errno for non-detach unmounts; applied on every attempt.
    unmount_failures: HashMap<PathBuf, i32>,
    /// Expected crypt key; a mismatch is a bad-key failure.
    crypt_key: Option<Vec<u8>>,
    next_loop: u32,
    next_ino: u64,
    assigned_identity: HashMap<PathBuf, (u64, u64)>,
}

impl RecordingOps {
    pub fn new() -> Self {
        Self {
            mountinfo_text: "22 1 8:2 / / rw - ext4 /dev/sda2 rw\n".to_string(),
            next_ino: 100,
            ..Default::default()
        }
    }

    // ── fixture setup ───────────────────────────────────────────────────

    /// Registers an existing directory (with all ancestors).
    pub fn add_dir(&mut self, path: &Path) {
        let mut current = PathBuf::new();
        for comp in path.components() {
            current.push(comp);
            self.nodes.entry(current.clone()).or_insert(NodeKind::Dir);
        }
    }

    /// Registers an existing file (ancestors become directories).
    pub fn add_file(&mut self, path: &Path) {
        if let Some(parent) = path.parent() {
            self.add_dir(parent);
        }
        self.nodes.insert(path.to_path_buf(), NodeKind::File);
    }

    /// Pins the (dev, ino) identity a stat of `path` reports.
    pub fn set_stat_identity(&mut self, path: &Path, dev: u64, ino: u64) {
        self.stat_overrides.insert(path.to_path_buf(), (dev, ino));
    }

    pub fn set_statfs_flags(&mut self, path: &Path, flags: u64) {
        self.statfs_flags.insert(path.to_path_buf(), flags);
    }

    pub fn set_statfs_type(&mut self, path: &Path, fs: &str) {
        self.statfs_types.insert(path.to_path_buf(), fs.to_string());
    }

    pub fn set_mountinfo(&mut self, text: &str) {
        self.mountinfo_text = text.to_string();
    }

    /// Queues errnos for successive mount attempts at `target`; once the
    /// queue drains, mounts succeed.
    pub fn fail_mount_seq(&mut self, target: &Path, errnos: &[i32]) {
        self.mount_failures
            .insert(target.to_path_buf(), errnos.iter().copied().collect());
    }

    /// Makes every plain unmount of `target` fail with `errno` (lazy
    /// detach still succeeds).
    pub fn fail_unmount_with(&mut self, target: &Path, errno: i32) {
        self.unmount_failures.insert(target.to_path_buf(), errno);
    }

    /// Sets the only key the simulated crypt layer accepts.
    pub fn expect_crypt_key(&mut self, key: &[u8]) {
        self.crypt_key = Some(key.to_vec());
    }

    // ── assertions ──────────────────────────────────────────────────────

    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    /// Mount targets in issue order.
    pub fn mount_targets(&self) -> Vec<PathBuf> {
        self.ops
            .iter()
            .filter_map(|op| match op {
                Op::Mount { target, .. } => Some(target.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn mounts(&self) -> Vec<(Option<PathBuf>, PathBuf, Option<String>, u64, String)> {
        self.ops
            .iter()
            .filter_map(|op| match op {
                Op::Mount {
                    source,
                    target,
                    fs_type,
                    flags,
                    data,
                } => Some((
                    source.clone(),
                    target.clone(),
                    fs_type.clone(),
                    *flags,
                    data.clone(),
                )),
                _ => None,
            })
            .collect()
    }

    pub fn unmount_targets(&self) -> Vec<PathBuf> {
        self.ops
            .iter()
            .filter_map(|op| match op {
                Op::Unmount { target, .. } => Some(target.clone()),
                _ => None,
            })
            .collect()
    }

    /// Flags of every unmount issued against `target`, in order.
    pub fn unmount_flags(&self, target: &Path) -> Vec<i32> {
        self.ops
            .iter()
            .filter_map(|op| match op {
                Op::Unmount { target: t, flags } if t == target => Some(*flags),
                _ => None,
            })
            .collect()
    }

    pub fn crypt_closed(&self) -> Vec<PathBuf> {
        self.ops
            .iter()
            .filter_map(|op| match op {
                Op::CryptClose(device) => Some(device.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn loop_requests(&self) -> Vec<LoopAttach> {
        self.ops
            .iter()
            .filter_map(|op| match op {
                Op::LoopAttach(request) => Some(request.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn exists(&self, path: &Path) -> bool {
        self.nodes.contains_key(path)
    }

    fn fail(op: &str, errno: i32) -> VesselError {
        VesselError::RpcOperation {
            op: op.to_string(),
            errno: Some(errno),
            detail: format!("simulated errno {errno}"),
        }
    }

    fn synth_stat(&mut self, path: &Path, kind: NodeKind) -> FileStat {
        let (dev, ino) = match self.stat_overrides.get(path) {
            Some(&identity) => identity,
            None => *self
                .assigned_identity
                .entry(path.to_path_buf())
                .or_insert_with(|| {
                    self.next_ino += 1;
                    (1, self.next_ino)
                }),
        };
        FileStat {
            dev,
            ino,
            mode: match kind {
                NodeKind::Dir => libc::S_IFDIR | 0o755,
                NodeKind::File => libc::S_IFREG | 0o644,
                NodeKind::Symlink => libc::S_IFLNK | 0o777,
            },
            uid: 1000,
            gid: 1000,
            size: 0,
            is_dir: kind == NodeKind::Dir,
            is_symlink: kind == NodeKind::Symlink,
        }
    }
}

impl MountOps for RecordingOps {
    fn mount(
        &mut self,
        source: Option<&Path>,
        target: &Path,
        fs_type: Option<&str>,
        flags: MsFlags,
        data: &str,
    ) -> VesselResult<()> {
        self.ops.push(Op::Mount {
            source: source.map(Path::to_path_buf),
            target: target.to_path_buf(),
            fs_type: fs_type.map(str::to_string),
            flags: flags.bits(),
            data: data.to_string(),
        });

        if let Some(queue) = self.mount_failures.get_mut(target)
            && let Some(errno) = queue.pop_front()
        {
            return Err(Self::fail("mount", errno));
        }

        // A successful mount materializes the target.
        self.add_dir(target);
        Ok(())
    }

    fn unmount(&mut self, target: &Path, flags: MntFlags) -> VesselResult<()> {
        self.ops.push(Op::Unmount {
            target: target.to_path_buf(),
            flags: flags.bits(),
        });

        if !flags.contains(MntFlags::MNT_DETACH)
            && let Some(&errno) = self.unmount_failures.get(target)
        {
            return Err(Self::fail("unmount", errno));
        }
        Ok(())
    }

    fn mkdir_all(&mut self, path: &Path, _mode: u32) -> VesselResult<()> {
        self.ops.push(Op::Mkdir(path.to_path_buf()));
        self.add_dir(path);
        Ok(())
    }

    fn symlink(&mut self, target: &Path, link: &Path) -> VesselResult<()> {
        self.ops.push(Op::Symlink {
            target: target.to_path_buf(),
            link: link.to_path_buf(),
        });
        if let Some(parent) = link.parent() {
            self.add_dir(parent);
        }
        self.nodes.insert(link.to_path_buf(), NodeKind::Symlink);
        Ok(())
    }

    fn write_file(&mut self, path: &Path, _mode: u32, _content: &[u8]) -> VesselResult<()> {
        self.ops.push(Op::WriteFile(path.to_path_buf()));
        self.add_file(path);
        Ok(())
    }

    fn chdir(&mut self, path: &Path) -> VesselResult<()> {
        self.ops.push(Op::Chdir(path.to_path_buf()));
        Ok(())
    }

    fn chroot(&mut self, method: ChrootMethod) -> VesselResult<()> {
        self.ops.push(Op::Chroot(method));
        Ok(())
    }

    fn loop_attach(&mut self, request: &LoopAttach) -> VesselResult<u32> {
        self.ops.push(Op::LoopAttach(request.clone()));
        let device = self.next_loop;
        self.next_loop += 1;
        Ok(device)
    }

    fn crypt_open(&mut self, loop_device: u32, key: &[u8]) -> VesselResult<PathBuf> {
        self.ops.push(Op::CryptOpen { loop_device });
        if let Some(expected) = &self.crypt_key
            && expected != key
        {
            return Err(VesselError::CryptBadKey);
        }
        Ok(PathBuf::from(format!("/dev/mapper/vessel-crypt-{loop_device}")))
    }

    fn crypt_close(&mut self, device: &Path) -> VesselResult<()> {
        self.ops.push(Op::CryptClose(device.to_path_buf()));
        Ok(())
    }

    fn set_hostname(&mut self, name: &str) -> VesselResult<()> {
        self.ops.push(Op::SetHostname(name.to_string()));
        Ok(())
    }

    fn stat(&mut self, path: &Path) -> VesselResult<Option<FileStat>> {
        match self.nodes.get(path).copied() {
            Some(kind) => Ok(Some(self.synth_stat(path, kind))),
            None => Ok(None),
        }
    }

    fn lstat(&mut self, path: &Path) -> VesselResult<Option<FileStat>> {
        self.stat(path)
    }

    fn statfs_flags(&mut self, path: &Path) -> VesselResult<u64> {
        Ok(self.statfs_flags.get(path).copied().unwrap_or(0))
    }

    fn statfs_type(&mut self, path: &Path) -> VesselResult<String> {
        Ok(self
            .statfs_types
            .get(path)
            .cloned()
            .unwrap_or_else(|| "ext".to_string()))
    }

    fn read_mountinfo(&mut self) -> VesselResult<String> {
        Ok(self.mountinfo_text.clone())
    }

    fn eval_relative(&mut self, path: &Path, _root: &Path) -> VesselResult<PathBuf> {
        Ok(path.to_path_buf())
    }
}

/// Builds an engine config with the boilerplate tests never care about.
pub mod config {
    use std::path::Path;

    use vessel_shared::config::{EngineConfig, ImageKind, ResolvedImage};

    pub fn squashfs_launch(image: &Path, session_dir: &Path) -> EngineConfig {
        EngineConfig {
            image: image.to_path_buf(),
            images: vec![ResolvedImage {
                path: image.to_path_buf(),
                kind: ImageKind::Squashfs,
                writable: false,
                encrypted: false,
                fd_slot: 3,
                partitions: Vec::new(),
            }],
            command: vec!["/bin/echo".into(), "hi".into()],
            session_dir: session_dir.to_path_buf(),
            invoker_uid: 1000,
            invoker_gid: 1000,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_and_simulated_tree() {
        let mut ops = RecordingOps::new();
        ops.mkdir_all(Path::new("/a/b"), 0o755).unwrap();
        assert!(ops.exists(Path::new("/a/b")));
        assert!(ops.exists(Path::new("/a")));

        let stat = ops.stat(Path::new("/a/b")).unwrap().unwrap();
        assert!(stat.is_dir);
        assert!(ops.stat(Path::new("/c")).unwrap().is_none());
    }

    #[test]
    fn test_mount_failure_queue_drains() {
        let mut ops = RecordingOps::new();
        let target = Path::new("/mnt");
        ops.fail_mount_seq(target, &[libc::ESTALE]);

        let err = ops
            .mount(None, target, Some("overlay"), MsFlags::empty(), "")
            .unwrap_err();
        assert_eq!(err.rpc_errno(), Some(libc::ESTALE));

        ops.mount(None, target, Some("overlay"), MsFlags::empty(), "")
            .unwrap();
        assert_eq!(ops.mount_targets().len(), 2);
    }

    #[test]
    fn test_crypt_key_check() {
        let mut ops = RecordingOps::new();
        ops.expect_crypt_key(b"sesame");
        assert!(ops.crypt_open(0, b"sesame").is_ok());
        assert!(matches!(
            ops.crypt_open(0, b"wrong").unwrap_err(),
            VesselError::CryptBadKey
        ));
    }

    #[test]
    fn test_stat_identity_override() {
        let mut ops = RecordingOps::new();
        ops.add_dir(Path::new("/data"));
        ops.set_stat_identity(Path::new("/data"), 8, 42);
        let stat = ops.stat(Path::new("/data")).unwrap().unwrap();
        assert_eq!((stat.dev, stat.ino), (8, 42));
    }
}
