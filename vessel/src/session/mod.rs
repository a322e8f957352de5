//! Session directory layout.
//!
//! The session is a memory-backed directory (tmpfs or ramfs) that holds the
//! evolving container root until STAGE2 pivots into it. MASTER owns it; the
//! virtual tree below maps container-absolute paths to realized paths inside
//! the session, so planning code can talk about `/etc/hosts` without caring
//! where that lands on the host until execution time.

use std::collections::BTreeMap;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use vessel_shared::constants::session as names;
use vessel_shared::errors::{VesselError, VesselResult};

use crate::util::join_rooted;

/// What a virtual path resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Entry {
    Dir,
    File,
    Symlink(PathBuf),
    /// Lookups of the virtual path return this real host path instead of a
    /// session-realized one.
    OverrideDir(PathBuf),
}

/// The session tree. Operations realize entries immediately under the
/// session base; the map is kept so resolution and teardown stay exact.
#[derive(Debug)]
pub struct Session {
    base: PathBuf,
    final_dir: PathBuf,
    entries: BTreeMap<PathBuf, Entry>,
}

impl Session {
    /// Builds the canonical sub-layout inside an (already mounted) session
    /// directory: `root/`, `overlay/`, `underlay/`, `driver/`, `fuse/`.
    pub fn create(base: &Path) -> VesselResult<Self> {
        for sub in [
            names::ROOT_DIR,
            names::OVERLAY_DIR,
            names::UNDERLAY_DIR,
            names::DRIVER_DIR,
            names::FUSE_DIR,
        ] {
            std::fs::create_dir_all(base.join(sub))?;
        }

        Ok(Self {
            base: base.to_path_buf(),
            final_dir: base.join(names::ROOT_DIR),
            entries: BTreeMap::new(),
        })
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// The path the container process will see as `/` after pivot_root.
    pub fn final_path(&self) -> &Path {
        &self.final_dir
    }

    /// Where the image rootfs itself is mounted. With a session layer the
    /// final path sits above this; without one they coincide.
    pub fn rootfs_path(&self) -> PathBuf {
        self.base.join(names::ROOT_DIR)
    }

    /// Redirects the final path, used when a layer mounts the merged view
    /// somewhere other than `root/`.
    pub fn set_final_path(&mut self, path: PathBuf) {
        self.final_dir = path;
    }

    /// Resolves a virtual path to a realized host path. Idempotent: paths
    /// already under the session come back unchanged, so
    /// `get_path(final_path()) == final_path()`.
    pub fn get_path(&self, virtual_path: &Path) -> PathBuf {
        if virtual_path.starts_with(&self.base) {
            return virtual_path.to_path_buf();
        }

        // Longest-prefix override wins; entries iterate in path order so the
        // last match is the longest.
        let mut best: Option<(&PathBuf, &PathBuf)> = None;
        for (vpath, entry) in &self.entries {
            if let Entry::OverrideDir(real) = entry
                && virtual_path.starts_with(vpath)
            {
                best = Some((vpath, real));
            }
        }
        if let Some((vpath, real)) = best {
            let rest = virtual_path.strip_prefix(vpath).unwrap();
            return real.join(rest);
        }

        join_rooted(&self.base, virtual_path)
    }

    /// Creates a directory at the realized location of `virtual_path`.
    pub fn add_dir(&mut self, virtual_path: &Path) -> VesselResult<()> {
        let real = self.get_path(virtual_path);
        self.guard_inside(&real)?;
        std::fs::create_dir_all(&real)?;
        self.entries
            .insert(virtual_path.to_path_buf(), Entry::Dir);
        Ok(())
    }

    /// Creates a file with the given content.
    pub fn add_file(&mut self, virtual_path: &Path, content: &[u8]) -> VesselResult<()> {
        let real = self.get_path(virtual_path);
        self.guard_inside(&real)?;
        if let Some(parent) = real.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&real, content)?;
        self.entries
            .insert(virtual_path.to_path_buf(), Entry::File);
        Ok(())
    }

    /// Creates a symlink pointing at `target` (a container path, copied
    /// verbatim).
    pub fn add_symlink(&mut self, virtual_path: &Path, target: &Path) -> VesselResult<()> {
        let real = self.get_path(virtual_path);
        self.guard_inside(&real)?;
        if let Some(parent) = real.parent() {
            std::fs::create_dir_all(parent)?;
        }
        symlink(target, &real)?;
        self.entries
            .insert(virtual_path.to_path_buf(), Entry::Symlink(target.to_path_buf()));
        Ok(())
    }

    /// Grafts a real host directory into the virtual tree without mounting:
    /// later lookups of `virtual_path` (and anything below it) resolve to
    /// `real`.
    pub fn override_dir(&mut self, virtual_path: &Path, real: &Path) -> VesselResult<()> {
        if !real.is_absolute() {
            return Err(VesselError::Session(format!(
                "override for {} must be absolute, got {}",
                virtual_path.display(),
                real.display()
            )));
        }
        self.entries.insert(
            virtual_path.to_path_buf(),
            Entry::OverrideDir(real.to_path_buf()),
        );
        Ok(())
    }

    /// Realized path of a named session area (`overlay`, `driver`, ...).
    pub fn area(&self, name: &str) -> PathBuf {
        self.base.join(name)
    }

    fn guard_inside(&self, real: &Path) -> VesselResult<()> {
        if real.starts_with(&self.base) {
            return Ok(());
        }
        // Overridden subtrees realize outside the session on purpose; they
        // were vetted when the override was installed.
        if self.entries.values().any(
            |e| matches!(e, Entry::OverrideDir(root) if real.starts_with(root)),
        ) {
            return Ok(());
        }
        Err(VesselError::Session(format!(
            "{} escapes the session directory",
            real.display()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> (tempfile::TempDir, Session) {
        let dir = tempfile::tempdir().unwrap();
        let session = Session::create(dir.path()).unwrap();
        (dir, session)
    }

    #[test]
    fn test_create_builds_layout() {
        let (dir, s) = session();
        for sub in ["root", "overlay", "underlay", "driver", "fuse"] {
            assert!(dir.path().join(sub).is_dir(), "{sub} missing");
        }
        assert_eq!(s.final_path(), dir.path().join("root"));
    }

    #[test]
    fn test_get_path_is_idempotent_on_final_path() {
        let (_dir, s) = session();
        let fin = s.final_path().to_path_buf();
        assert_eq!(s.get_path(&fin), fin);
        assert_eq!(s.get_path(&s.get_path(Path::new("/etc"))), s.get_path(Path::new("/etc")));
    }

    #[test]
    fn test_add_dir_and_file_realize_under_session() {
        let (dir, mut s) = session();
        s.add_dir(Path::new("/root/etc")).unwrap();
        s.add_file(Path::new("/root/etc/hostname"), b"cell\n").unwrap();

        let realized = dir.path().join("root/etc/hostname");
        assert_eq!(std::fs::read(realized).unwrap(), b"cell\n");
    }

    #[test]
    fn test_add_symlink() {
        let (dir, mut s) = session();
        s.add_symlink(Path::new("/root/dev/ptmx"), Path::new("pts/ptmx"))
            .unwrap();
        let real = dir.path().join("root/dev/ptmx");
        assert_eq!(std::fs::read_link(real).unwrap(), PathBuf::from("pts/ptmx"));
    }

    #[test]
    fn test_override_dir_redirects_lookups() {
        let (_dir, mut s) = session();
        let home = tempfile::tempdir().unwrap();
        s.override_dir(Path::new("/home/user"), home.path()).unwrap();

        assert_eq!(s.get_path(Path::new("/home/user")), home.path());
        assert_eq!(
            s.get_path(Path::new("/home/user/.bashrc")),
            home.path().join(".bashrc")
        );
        // Sibling paths are untouched.
        assert!(s.get_path(Path::new("/home/other")).starts_with(s.base()));
    }

    #[test]
    fn test_longest_override_wins() {
        let (_dir, mut s) = session();
        let outer = tempfile::tempdir().unwrap();
        let inner = tempfile::tempdir().unwrap();
        s.override_dir(Path::new("/data"), outer.path()).unwrap();
        s.override_dir(Path::new("/data/scratch"), inner.path()).unwrap();

        assert_eq!(s.get_path(Path::new("/data/x")), outer.path().join("x"));
        assert_eq!(
            s.get_path(Path::new("/data/scratch/x")),
            inner.path().join("x")
        );
    }

    #[test]
    fn test_traversal_cannot_escape() {
        let (dir, mut s) = session();
        s.add_dir(Path::new("/root/../../../etc")).unwrap();
        // join_rooted confines the path; nothing lands outside the session.
        assert!(dir.path().join("etc").exists() || dir.path().join("root").exists());
        assert!(s.get_path(Path::new("/../../escape")).starts_with(dir.path()));
    }

    #[test]
    fn test_override_requires_absolute_real() {
        let (_dir, mut s) = session();
        assert!(s
            .override_dir(Path::new("/data"), Path::new("relative/path"))
            .is_err());
    }
}
