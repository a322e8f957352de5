//! FUSE mount backend.
//!
//! Selected when the kernel will not mount image filesystems for us. Each
//! filesystem family maps to a helper binary found on the configured search
//! path: `squashfuse_ll`/`squashfuse`, `fuse2fs`, `fuse-overlayfs`,
//! `gocryptfs`. Helpers run in the foreground and live as long as their
//! mount; the monitor loop reports their exit through [`ImageDriver::stopped`].

use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use nix::mount::MsFlags;
use nix::unistd::Pid;
use tracing::{debug, warn};

use vessel_shared::errors::{VesselError, VesselResult};

use crate::util::find_binary;

use super::helper::HelperProcess;
use super::{DriverFs, Feature, Features, ImageDriver, KernelMountFn, MountParams};

/// Preload shim that translates file offsets for helpers without native
/// offset support (fuse2fs on a SIF partition).
const OFFSET_PRELOAD: &str = "vessel-offset-preload.so";

pub struct FuseDriver {
    /// Colon-separated helper search path (`binary path` key).
    binary_path: String,
    /// Running helpers, insertion order = mount order.
    instances: Vec<HelperProcess>,
    /// Startup prefix registered by `start` for hybrid fakeroot.
    prefix: Vec<String>,
    /// Keep CAP_SYS_ADMIN & friends ambient for helpers.
    ambient_caps: bool,
    /// Pass `allow_other` so a container running under another uid can
    /// still traverse the mount. Needs the helper's user_allow_other knob
    /// or root; enabled alongside the elevated modes.
    allow_other: bool,
    /// `-o uid=/gid=` support per helper binary, probed once.
    uid_opt_cache: HashMap<PathBuf, bool>,
}

impl FuseDriver {
    pub fn new(binary_path: &str, ambient_caps: bool) -> Self {
        Self {
            binary_path: binary_path.to_string(),
            instances: Vec::new(),
            prefix: Vec::new(),
            ambient_caps,
            allow_other: ambient_caps,
            uid_opt_cache: HashMap::new(),
        }
    }

    fn find(&self, names: &[&str]) -> VesselResult<PathBuf> {
        for name in names {
            if let Ok(path) = find_binary(name, &self.binary_path) {
                return Ok(path);
            }
        }
        Err(VesselError::FuseHelperStartFailed {
            helper: names.join("/"),
            detail: format!("not found on binary path {}", self.binary_path),
        })
    }

    /// Whether the helper advertises `-o uid=` in its help output.
    fn supports_uid_opt(&mut self, binary: &Path) -> bool {
        if let Some(&cached) = self.uid_opt_cache.get(binary) {
            return cached;
        }
        let supported = Command::new(binary)
            .arg("--help")
            .output()
            .map(|out| {
                let text = format!(
                    "{}{}",
                    String::from_utf8_lossy(&out.stdout),
                    String::from_utf8_lossy(&out.stderr)
                );
                text.contains("-o uid=") || text.contains("uid=N")
            })
            .unwrap_or(false);
        self.uid_opt_cache.insert(binary.to_path_buf(), supported);
        supported
    }

    fn spawn_and_wait(
        &mut self,
        binary: &Path,
        args: Vec<String>,
        envs: Vec<(String, String)>,
        target: &Path,
    ) -> VesselResult<()> {
        let mut helper = HelperProcess::spawn(
            binary,
            &self.prefix,
            &args,
            &envs,
            target,
            self.ambient_caps,
        )?;
        helper.wait_for_mount()?;
        self.instances.push(helper);
        Ok(())
    }

    fn mount_squashfuse(&mut self, params: &MountParams) -> VesselResult<()> {
        let binary = self.find(&["squashfuse_ll", "squashfuse"])?;

        let mut opts = vec!["-f".to_string()];
        let mut o = Vec::new();
        if self.allow_other {
            o.push("allow_other".to_string());
        }
        if params.flags.contains(MsFlags::MS_RDONLY) {
            o.push("ro".to_string());
        }
        if params.offset > 0 {
            o.push(format!("offset={}", params.offset));
        }
        if self.supports_uid_opt(&binary) {
            o.push(format!("uid={}", nix::unistd::getuid().as_raw()));
            o.push(format!("gid={}", nix::unistd::getgid().as_raw()));
        }
        if !o.is_empty() {
            opts.push("-o".to_string());
            opts.push(o.join(","));
        }
        opts.push(params.source.display().to_string());
        opts.push(params.target.display().to_string());

        self.spawn_and_wait(&binary, opts, Vec::new(), &params.target)
    }

    fn mount_fuse2fs(&mut self, params: &MountParams) -> VesselResult<()> {
        let binary = self.find(&["fuse2fs"])?;

        let mut envs = Vec::new();
        if params.offset > 0 {
            // fuse2fs has no offset option; the preload shim translates
            // reads against the partition start.
            let shim = find_binary(OFFSET_PRELOAD, &self.binary_path)?;
            envs.push(("LD_PRELOAD".to_string(), shim.display().to_string()));
            envs.push(("VESSEL_IMAGE_OFFSET".to_string(), params.offset.to_string()));
        }

        let mut o = vec!["fakeroot".to_string()];
        if self.allow_other {
            o.push("allow_other".to_string());
        }
        if params.flags.contains(MsFlags::MS_RDONLY) {
            o.push("ro".to_string());
        }

        let args = vec![
            "-f".to_string(),
            "-o".to_string(),
            o.join(","),
            params.source.display().to_string(),
            params.target.display().to_string(),
        ];
        self.spawn_and_wait(&binary, args, envs, &params.target)
    }

    fn mount_fuse_overlayfs(&mut self, params: &MountParams) -> VesselResult<()> {
        let binary = self.find(&["fuse-overlayfs"])?;
        let args = vec![
            "-f".to_string(),
            "-o".to_string(),
            params.data.clone(),
            params.target.display().to_string(),
        ];
        self.spawn_and_wait(&binary, args, Vec::new(), &params.target)
    }

    /// Three-stage encrypted mount: outer SquashFS exposes the gocryptfs
    /// ciphertext directory and config, gocryptfs maps it to plaintext, and
    /// the plaintext holds the actual root filesystem image.
    fn mount_gocryptfs_squashfs(&mut self, params: &MountParams) -> VesselResult<()> {
        let key = params.key.as_deref().ok_or(VesselError::CryptBadKey)?;

        let cipher_dir = params.staging.join("cipher");
        let plain_dir = params.staging.join("plain");
        std::fs::create_dir_all(&cipher_dir)?;
        std::fs::create_dir_all(&plain_dir)?;

        // Stage 1: outer squashfs with the ciphertext tree.
        let outer = MountParams {
            target: cipher_dir.clone(),
            fs: DriverFs::Squashfs,
            key: None,
            ..params.clone()
        };
        self.mount_squashfuse(&outer)?;

        // Stage 2: gocryptfs over the ciphertext. The passphrase goes in
        // through a 0600 file that is unlinked right after spawn.
        let binary = self.find(&["gocryptfs"])?;
        let passfile = params.staging.join(".pass");
        std::fs::write(&passfile, key)?;
        std::fs::set_permissions(&passfile, PermissionsExt::from_mode(0o600))?;

        let args = vec![
            "-fg".to_string(),
            "-passfile".to_string(),
            passfile.display().to_string(),
            cipher_dir.display().to_string(),
            plain_dir.display().to_string(),
        ];
        let result = self.spawn_and_wait(&binary, args, Vec::new(), &plain_dir);
        let _ = std::fs::remove_file(&passfile);
        result.map_err(|e| match e {
            // A helper that dies or stalls here almost always means the
            // passphrase did not unlock the filesystem.
            VesselError::FuseHelperExited { .. } | VesselError::FuseHelperTimeout { .. } => {
                VesselError::CryptBadKey
            }
            other => other,
        })?;

        // Stage 3: the inner image sits in the plaintext directory.
        let inner_image = find_inner_image(&plain_dir)?;
        let inner = MountParams {
            source: inner_image,
            target: params.target.clone(),
            fs: DriverFs::Squashfs,
            offset: 0,
            size: 0,
            key: None,
            ..params.clone()
        };
        self.mount_squashfuse(&inner)
    }
}

/// Picks the SquashFS image out of the gocryptfs plaintext directory.
fn find_inner_image(plain_dir: &Path) -> VesselResult<PathBuf> {
    for entry in std::fs::read_dir(plain_dir)? {
        let path = entry?.path();
        if path.extension().is_some_and(|e| e == "squashfs" || e == "sqsh" || e == "img")
            || path
                .file_name()
                .is_some_and(|n| n.to_string_lossy().starts_with("rootfs"))
        {
            return Ok(path);
        }
    }
    Err(VesselError::CryptBadKey)
}

impl ImageDriver for FuseDriver {
    fn name(&self) -> &'static str {
        "fuse"
    }

    fn features(&self) -> Features {
        let mut features: Features = [Feature::Fuse, Feature::Image].into_iter().collect();
        if self.find(&["squashfuse_ll", "squashfuse"]).is_ok() {
            features.insert(Feature::Squash);
        }
        if self.find(&["fuse2fs"]).is_ok() {
            features.insert(Feature::Ext3);
        }
        if self.find(&["fuse-overlayfs"]).is_ok() {
            features.insert(Feature::Overlay);
        }
        if self.find(&["gocryptfs"]).is_ok() {
            features.insert(Feature::Gocrypt);
        }
        features
    }

    fn mount(&mut self, params: &MountParams, _fallback: &mut KernelMountFn) -> VesselResult<()> {
        match params.fs {
            DriverFs::Squashfs => self.mount_squashfuse(params),
            DriverFs::Ext3 => self.mount_fuse2fs(params),
            DriverFs::Overlay => self.mount_fuse_overlayfs(params),
            DriverFs::GocryptfsSquashfs => self.mount_gocryptfs_squashfs(params),
        }
    }

    fn start(&mut self, container_pid: Option<Pid>, hybrid_fakeroot: bool) -> VesselResult<()> {
        if hybrid_fakeroot && let Some(pid) = container_pid {
            // Helpers must run inside the user namespace that owns the
            // mounts; -F avoids forking an extra intermediate.
            self.prefix = vec![
                "nsenter".to_string(),
                format!("--user=/proc/{pid}/ns/user"),
                "-F".to_string(),
            ];
            debug!(?pid, "registered hybrid fakeroot prefix");
        }
        Ok(())
    }

    fn stop(&mut self, target: Option<&Path>) -> VesselResult<()> {
        // LIFO: the most recent mount sits on top of earlier ones.
        for helper in self.instances.iter_mut().rev() {
            if let Some(target) = target
                && helper.target() != target
            {
                continue;
            }
            helper.stop()?;
        }
        self.instances.retain(|h| !h.is_reaped());
        Ok(())
    }

    fn stopped(&mut self, pid: Pid, status: i32) -> VesselResult<()> {
        let Some(index) = self.instances.iter().position(|h| h.pid() == pid) else {
            return Ok(()); // not ours
        };

        let mut helper = self.instances.remove(index);
        helper.mark_reaped();
        let detail = format!("status {status}: {}", helper.tail_stderr());
        warn!(helper = %helper.binary_name(), %detail, "helper exited while container is running");
        Err(VesselError::FuseHelperExited {
            helper: helper.binary_name(),
            detail,
        })
    }
}

impl Drop for FuseDriver {
    fn drop(&mut self) {
        let _ = self.stop(None);
    }
}
