//! FUSE helper process lifecycle.
//!
//! A helper is an external binary (squashfuse, fuse2fs, fuse-overlayfs,
//! gocryptfs) that establishes one mount and stays alive while it is in use.
//! The launcher owns the child: stdout/stderr are drained by reader threads
//! into bounded rings, the mount's appearance is awaited by polling
//! mountinfo, and a helper only counts as reaped after its readers have been
//! joined — a reaped pid with unjoined pipes could still lose output.

use std::collections::VecDeque;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use caps::{CapSet, Capability};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use parking_lot::Mutex;
use tracing::{debug, warn};

use vessel_shared::constants::timeouts;
use vessel_shared::errors::{VesselError, VesselResult};

use crate::mounts::mountinfo;

/// Lines kept per output ring.
const RING_CAPACITY: usize = 64;

/// Helper chatter that is operationally meaningless; logged at debug only
/// and never surfaced in errors.
const NOISE_LINES: &[&str] = &[
    "failed to clone device fd",
    "journal is not supported.",
    "Mounting read-only.",
    "Filesystem mounted and ready.",
];

type Ring = Arc<Mutex<VecDeque<String>>>;

fn push_ring(ring: &Ring, line: String) {
    let mut ring = ring.lock();
    if ring.len() == RING_CAPACITY {
        ring.pop_front();
    }
    ring.push_back(line);
}

fn spawn_reader(name: &'static str, stream: impl std::io::Read + Send + 'static, ring: Ring) -> JoinHandle<()> {
    std::thread::spawn(move || {
        use std::io::BufRead;
        let reader = std::io::BufReader::new(stream);
        for line in reader.lines() {
            let Ok(line) = line else { break };
            if NOISE_LINES.iter().any(|noise| line.contains(noise)) {
                debug!(stream = name, "{line}");
            } else {
                debug!(stream = name, helper = true, "{line}");
                push_ring(&ring, line);
            }
        }
    })
}

/// One running helper bound to one mount target.
#[derive(Debug)]
pub struct HelperProcess {
    binary: PathBuf,
    child: Child,
    target: PathBuf,
    stdout_ring: Ring,
    stderr_ring: Ring,
    readers: Vec<JoinHandle<()>>,
    reaped: bool,
}

impl HelperProcess {
    /// Starts the helper. `ambient_caps` grants the mount-relevant ambient
    /// set to the child (only effective when this process still holds the
    /// capabilities, i.e. elevated privileges were not dropped).
    pub fn spawn(
        binary: &Path,
        prefix: &[String],
        args: &[String],
        envs: &[(String, String)],
        target: &Path,
        ambient_caps: bool,
    ) -> VesselResult<Self> {
        let mut command = if prefix.is_empty() {
            let mut c = Command::new(binary);
            c.args(args);
            c
        } else {
            // Hybrid fakeroot: re-enter the container's user namespace
            // through the registered prefix (nsenter --user=... -F).
            let mut c = Command::new(&prefix[0]);
            c.args(&prefix[1..]).arg(binary).args(args);
            c
        };

        command
            .envs(envs.iter().cloned())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        if ambient_caps {
            unsafe {
                command.pre_exec(|| {
                    for cap in [
                        Capability::CAP_SYS_ADMIN,
                        Capability::CAP_SYS_PTRACE,
                        Capability::CAP_DAC_OVERRIDE,
                    ] {
                        // Best effort: only works when the cap is still in
                        // permitted+inheritable.
                        let _ = caps::raise(None, CapSet::Inheritable, cap);
                        let _ = caps::raise(None, CapSet::Ambient, cap);
                    }
                    Ok(())
                });
            }
        }

        let mut child = command
            .spawn()
            .map_err(|e| VesselError::FuseHelperStartFailed {
                helper: binary.display().to_string(),
                detail: e.to_string(),
            })?;

        let stdout_ring: Ring = Arc::new(Mutex::new(VecDeque::new()));
        let stderr_ring: Ring = Arc::new(Mutex::new(VecDeque::new()));
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader("stdout", stdout, Arc::clone(&stdout_ring)));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader("stderr", stderr, Arc::clone(&stderr_ring)));
        }

        debug!(binary = %binary.display(), pid = child.id(), target = %target.display(), "helper spawned");
        Ok(Self {
            binary: binary.to_path_buf(),
            child,
            target: target.to_path_buf(),
            stdout_ring,
            stderr_ring,
            readers,
            reaped: false,
        })
    }

    pub fn pid(&self) -> Pid {
        Pid::from_raw(self.child.id() as i32)
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    pub fn binary_name(&self) -> String {
        self.binary
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.binary.display().to_string())
    }

    pub fn is_reaped(&self) -> bool {
        self.reaped
    }

    /// Marks the helper as reaped by the monitor loop (the wait already
    /// happened elsewhere); readers are joined so no output is lost.
    pub fn mark_reaped(&mut self) {
        self.reaped = true;
        for reader in self.readers.drain(..) {
            let _ = reader.join();
        }
    }

    /// Last captured stderr, newline-joined, for error reports.
    pub fn tail_stderr(&self) -> String {
        let ring = self.stderr_ring.lock();
        ring.iter().cloned().collect::<Vec<_>>().join("\n")
    }

    pub fn tail_stdout(&self) -> String {
        let ring = self.stdout_ring.lock();
        ring.iter().cloned().collect::<Vec<_>>().join("\n")
    }

    /// Blocks until the target shows up in our mountinfo. Past two seconds a
    /// warning is logged; past the deadline the helper is stopped and the
    /// timeout error carries its stderr.
    pub fn wait_for_mount(&mut self) -> VesselResult<()> {
        let started = Instant::now();
        let mut slow_logged = false;

        loop {
            let entries = mountinfo::read_self()?;
            if mountinfo::is_mounted(&entries, &self.target) {
                debug!(target = %self.target.display(), elapsed = ?started.elapsed(), "helper mount appeared");
                return Ok(());
            }

            // A dead helper will never produce the mount.
            if let Ok(Some(status)) = self.child.try_wait() {
                self.mark_reaped();
                return Err(VesselError::FuseHelperExited {
                    helper: self.binary_name(),
                    detail: format!("{status}: {}", self.tail_stderr()),
                });
            }

            let elapsed = started.elapsed();
            if !slow_logged && elapsed > timeouts::FUSE_MOUNT_SLOW {
                warn!(
                    helper = %self.binary_name(),
                    target = %self.target.display(),
                    "mount is taking unexpectedly long"
                );
                slow_logged = true;
            }
            if elapsed > timeouts::FUSE_MOUNT_DEADLINE {
                let stderr = self.tail_stderr();
                let _ = self.stop();
                warn!(helper = %self.binary_name(), stderr = %stderr, "helper mount deadline exceeded");
                return Err(VesselError::FuseHelperTimeout {
                    helper: self.binary_name(),
                    target: self.target.clone(),
                });
            }

            std::thread::sleep(timeouts::FUSE_MOUNT_POLL);
        }
    }

    /// Terminates and reaps the helper: SIGTERM, a grace period, then
    /// SIGKILL. Safe to call twice.
    pub fn stop(&mut self) -> VesselResult<()> {
        if self.reaped {
            return Ok(());
        }

        let pid = self.pid();
        let _ = kill(pid, Signal::SIGTERM);

        let grace_end = Instant::now() + timeouts::HELPER_TERM_GRACE;
        let exited = loop {
            match self.child.try_wait() {
                Ok(Some(_)) => break true,
                Ok(None) if Instant::now() < grace_end => {
                    std::thread::sleep(Duration::from_millis(10));
                }
                Ok(None) => break false,
                Err(_) => break true,
            }
        };

        if !exited {
            debug!(helper = %self.binary_name(), "helper ignored SIGTERM, killing");
            let _ = kill(pid, Signal::SIGTERM);
            let _ = kill(pid, Signal::SIGKILL);
            let _ = self.child.wait();
        }

        self.mark_reaped();
        debug!(helper = %self.binary_name(), "helper stopped");
        Ok(())
    }
}

impl Drop for HelperProcess {
    fn drop(&mut self) {
        if !self.reaped {
            let _ = self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spawn_sh(script: &str, target: &Path) -> HelperProcess {
        HelperProcess::spawn(
            Path::new("/bin/sh"),
            &[],
            &["-c".to_string(), script.to_string()],
            &[],
            target,
            false,
        )
        .unwrap()
    }

    #[test]
    fn test_spawn_missing_binary() {
        let err = HelperProcess::spawn(
            Path::new("/no/such/helper"),
            &[],
            &[],
            &[],
            Path::new("/mnt"),
            false,
        )
        .unwrap_err();
        assert!(matches!(err, VesselError::FuseHelperStartFailed { .. }));
    }

    #[test]
    fn test_stop_reaps_exactly_once() {
        let mut helper = spawn_sh("sleep 30", Path::new("/mnt/never"));
        assert!(!helper.is_reaped());
        helper.stop().unwrap();
        assert!(helper.is_reaped());
        // Idempotent.
        helper.stop().unwrap();
    }

    #[test]
    fn test_stderr_captured_and_noise_filtered() {
        let mut helper = spawn_sh(
            "echo real problem >&2; echo 'Mounting read-only.' >&2; sleep 0.05",
            Path::new("/mnt/never"),
        );
        std::thread::sleep(Duration::from_millis(200));
        helper.stop().unwrap();

        let tail = helper.tail_stderr();
        assert!(tail.contains("real problem"));
        assert!(!tail.contains("Mounting read-only."));
    }

    #[test]
    fn test_wait_for_mount_reports_helper_death() {
        let mut helper = spawn_sh("echo boom >&2; exit 3", Path::new("/mnt/never-appears"));
        let err = helper.wait_for_mount().unwrap_err();
        match err {
            VesselError::FuseHelperExited { detail, .. } => {
                assert!(detail.contains("boom"), "missing stderr in {detail}");
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(helper.is_reaped());
    }

    #[test]
    fn test_prefix_wraps_command() {
        // `env` as prefix proves the argv splice works end to end.
        let mut helper = HelperProcess::spawn(
            Path::new("/bin/sh"),
            &["/usr/bin/env".to_string()],
            &["-c".to_string(), "exit 0".to_string()],
            &[],
            Path::new("/mnt/never"),
            false,
        )
        .unwrap();
        std::thread::sleep(Duration::from_millis(100));
        helper.stop().unwrap();
    }
}
