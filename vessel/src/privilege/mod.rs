//! The privilege controller.
//!
//! Every uid and capability transition in the process tree goes through this
//! module; nothing else calls setresuid or capset. Escalation is per-thread:
//! the raw `SYS_setresuid` syscall is used instead of the libc wrapper
//! because glibc broadcasts the wrapper to every thread, and the RPC server
//! must escalate only the thread executing the current handler.
//!
//! Stage rules: STAGE1 never holds euid 0; MASTER escalates only around
//! crypt/unmount/network calls; RPC_SERVER escalates per handler; STAGE2
//! applies the container sets and never holds a host-privileged uid.

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;

use caps::{CapSet, Capability, CapsHashSet};
use serde::Deserialize;
use tracing::debug;

use vessel_shared::config::{CapDefault, CapabilityRequest};
use vessel_shared::errors::{VesselError, VesselResult};

/// Default location of the capability authorization file consumed by the
/// `file` policy.
pub const CAPABILITY_FILE: &str = "/etc/vessel/capability.json";

/// The five capability sets applied to the container right before exec.
#[derive(Debug, Clone, Default)]
pub struct ContainerCaps {
    pub permitted: CapsHashSet,
    pub effective: CapsHashSet,
    pub inheritable: CapsHashSet,
    pub bounding: CapsHashSet,
    pub ambient: CapsHashSet,
    pub no_new_privs: bool,
}

fn setresuid_thread(ruid: u32, euid: u32, suid: u32) -> VesselResult<()> {
    // Raw syscall: per-thread on Linux, unlike the glibc wrapper.
    let rc = unsafe { libc::syscall(libc::SYS_setresuid, ruid, euid, suid) };
    if rc != 0 {
        return Err(VesselError::Setup(format!(
            "setresuid({ruid},{euid},{suid}): {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

/// Restores the calling thread to the invoking user when released.
#[must_use = "dropping the guard is what drops privileges"]
#[derive(Debug)]
pub struct EscalateGuard {
    original_uid: u32,
}

impl Drop for EscalateGuard {
    fn drop(&mut self) {
        // ruid/euid back to the invoker, suid 0 so a later escalate works.
        if let Err(e) = setresuid_thread(self.original_uid, self.original_uid, 0) {
            // Failing to drop is not survivable.
            panic!("failed to drop privileges: {e}");
        }
    }
}

/// Raises the calling thread to uid 0. Only possible in a setuid
/// installation where the saved uid is 0; otherwise returns
/// [`VesselError::PrivilegeEscalationDenied`].
pub fn escalate() -> VesselResult<EscalateGuard> {
    let res = nix::unistd::getresuid()
        .map_err(|e| VesselError::Setup(format!("getresuid: {e}")))?;
    let original_uid = res.real.as_raw();

    if res.effective.as_raw() != 0 && res.saved.as_raw() != 0 {
        return Err(VesselError::PrivilegeEscalationDenied);
    }

    setresuid_thread(0, 0, original_uid)?;
    Ok(EscalateGuard { original_uid })
}

/// Pure transition rule behind [`set_effective`], kept separate so the
/// inverse property is testable without holding any capability.
pub fn effective_transition(
    permitted: &CapsHashSet,
    current_effective: &CapsHashSet,
    requested: &CapsHashSet,
) -> VesselResult<(CapsHashSet, CapsHashSet)> {
    for cap in requested {
        if !permitted.contains(cap) {
            return Err(VesselError::NotInPermitted(cap.to_string()));
        }
    }
    Ok((requested.clone(), current_effective.clone()))
}

/// Changes the effective capability set, returning the previous one so the
/// caller can restore it. Fails without touching anything when a requested
/// bit is outside the permitted set.
pub fn set_effective(mask: &CapsHashSet) -> VesselResult<CapsHashSet> {
    let permitted = caps::read(None, CapSet::Permitted)
        .map_err(|e| VesselError::Setup(format!("read permitted: {e}")))?;
    let current = caps::read(None, CapSet::Effective)
        .map_err(|e| VesselError::Setup(format!("read effective: {e}")))?;

    let (next, previous) = effective_transition(&permitted, &current, mask)?;

    caps::set(None, CapSet::Effective, &next)
        .map_err(|e| VesselError::Setup(format!("set effective: {e}")))?;
    Ok(previous)
}

/// Applies all five container sets atomically with respect to the exec that
/// follows: bounding first (needs CAP_SETPCAP in effective), then the main
/// three, then ambient raised cap by cap.
pub fn apply_container_caps(target: &ContainerCaps) -> VesselResult<()> {
    let all = caps::all();
    for cap in all.difference(&target.bounding) {
        caps::drop(None, CapSet::Bounding, *cap)
            .map_err(|e| VesselError::Setup(format!("drop bounding {cap}: {e}")))?;
    }

    caps::set(None, CapSet::Inheritable, &target.inheritable)
        .map_err(|e| VesselError::Setup(format!("set inheritable: {e}")))?;
    caps::set(None, CapSet::Permitted, &target.permitted)
        .map_err(|e| VesselError::Setup(format!("set permitted: {e}")))?;
    caps::set(None, CapSet::Effective, &target.effective)
        .map_err(|e| VesselError::Setup(format!("set effective: {e}")))?;

    caps::clear(None, CapSet::Ambient)
        .map_err(|e| VesselError::Setup(format!("clear ambient: {e}")))?;
    for cap in &target.ambient {
        caps::raise(None, CapSet::Ambient, *cap)
            .map_err(|e| VesselError::Setup(format!("raise ambient {cap}: {e}")))?;
    }

    if target.no_new_privs {
        let rc = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
        if rc != 0 {
            return Err(VesselError::Setup(format!(
                "PR_SET_NO_NEW_PRIVS: {}",
                std::io::Error::last_os_error()
            )));
        }
    }
    Ok(())
}

/// capability.json: per-user and per-group authorized capability names.
#[derive(Debug, Default, Deserialize)]
pub struct CapabilityFile {
    #[serde(default)]
    pub users: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub groups: HashMap<String, Vec<String>>,
}

impl CapabilityFile {
    pub fn load(path: &Path) -> VesselResult<Self> {
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text)
            .map_err(|e| VesselError::ConfigRejected(format!("{}: {e}", path.display())))
    }

    /// Union of the capabilities authorized for `user` and any of `groups`.
    pub fn authorized(&self, user: &str, groups: &[String]) -> VesselResult<CapsHashSet> {
        let mut out = CapsHashSet::new();
        let mut add_all = |names: &Vec<String>| -> VesselResult<()> {
            for name in names {
                out.insert(parse_cap(name)?);
            }
            Ok(())
        };
        if let Some(names) = self.users.get(user) {
            add_all(names)?;
        }
        for group in groups {
            if let Some(names) = self.groups.get(group) {
                add_all(names)?;
            }
        }
        Ok(out)
    }
}

pub fn parse_cap(name: &str) -> VesselResult<Capability> {
    Capability::from_str(name)
        .map_err(|_| VesselError::ConfigRejected(format!("unknown capability {name:?}")))
}

fn parse_caps(names: &[String]) -> VesselResult<CapsHashSet> {
    let mut out = CapsHashSet::new();
    for name in names {
        out.insert(parse_cap(name)?);
    }
    Ok(out)
}

/// Computes the container capability sets from the launch request and the
/// default policy, starting from what the process currently holds.
///
/// `authorized` is the capability.json union for the invoking identity; only
/// consulted by the `file` policy.
pub fn compute_container_caps(
    request: &CapabilityRequest,
    permitted_now: &CapsHashSet,
    authorized: &CapsHashSet,
) -> VesselResult<ContainerCaps> {
    let mut caps = ContainerCaps::default();

    let base: CapsHashSet = if request.no_privs {
        CapsHashSet::new()
    } else {
        match request.default {
            CapDefault::Full => permitted_now.clone(),
            CapDefault::File => authorized.clone(),
            CapDefault::No => CapsHashSet::new(),
        }
    };

    let add = parse_caps(&request.add)?;
    let drop = parse_caps(&request.drop)?;

    let mut effective: CapsHashSet = base.union(&add).copied().collect();
    for cap in &drop {
        effective.remove(cap);
    }

    caps.no_new_privs = request.no_privs || request.default == CapDefault::No;
    caps.bounding = effective.clone();
    caps.permitted = effective.clone();
    caps.inheritable = effective.clone();
    caps.ambient = if request.keep_privs {
        effective.clone()
    } else {
        // Without keep-privs, file capabilities still work through the
        // inheritable set, but nothing is ambient.
        CapsHashSet::new()
    };
    caps.effective = effective;

    debug!(
        effective = ?caps.effective,
        no_new_privs = caps.no_new_privs,
        "container capabilities computed"
    );
    Ok(caps)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set_of(names: &[&str]) -> CapsHashSet {
        names
            .iter()
            .map(|n| Capability::from_str(n).unwrap())
            .collect()
    }

    #[test]
    fn test_effective_transition_checks_permitted() {
        let permitted = set_of(&["CAP_CHOWN", "CAP_SYS_ADMIN"]);
        let current = set_of(&["CAP_CHOWN"]);
        let requested = set_of(&["CAP_SYS_ADMIN"]);

        let (next, prev) = effective_transition(&permitted, &current, &requested).unwrap();
        assert_eq!(next, requested);
        assert_eq!(prev, current);

        let outside = set_of(&["CAP_NET_ADMIN"]);
        let err = effective_transition(&permitted, &current, &outside).unwrap_err();
        assert!(matches!(err, VesselError::NotInPermitted(_)));
    }

    #[test]
    fn test_effective_transition_round_trips() {
        let permitted = set_of(&["CAP_CHOWN", "CAP_SYS_ADMIN", "CAP_FOWNER"]);
        let original = set_of(&["CAP_CHOWN", "CAP_FOWNER"]);
        let mask = set_of(&["CAP_SYS_ADMIN"]);

        let (now, prev) = effective_transition(&permitted, &original, &mask).unwrap();
        let (restored, _) = effective_transition(&permitted, &now, &prev).unwrap();
        assert_eq!(restored, original);
    }

    #[test]
    fn test_compute_full_policy_copies_permitted() {
        let permitted = set_of(&["CAP_CHOWN", "CAP_DAC_OVERRIDE"]);
        let request = CapabilityRequest::default();
        let caps = compute_container_caps(&request, &permitted, &CapsHashSet::new()).unwrap();
        assert_eq!(caps.effective, permitted);
        assert!(!caps.no_new_privs);
    }

    #[test]
    fn test_compute_no_policy_clears_everything() {
        let permitted = set_of(&["CAP_CHOWN"]);
        let request = CapabilityRequest {
            default: CapDefault::No,
            ..Default::default()
        };
        let caps = compute_container_caps(&request, &permitted, &CapsHashSet::new()).unwrap();
        assert!(caps.effective.is_empty());
        assert!(caps.no_new_privs);
    }

    #[test]
    fn test_compute_file_policy_uses_authorized() {
        let permitted = set_of(&["CAP_CHOWN", "CAP_SYS_ADMIN"]);
        let authorized = set_of(&["CAP_NET_RAW"]);
        let request = CapabilityRequest {
            default: CapDefault::File,
            ..Default::default()
        };
        let caps = compute_container_caps(&request, &permitted, &authorized).unwrap();
        assert_eq!(caps.effective, authorized);
    }

    #[test]
    fn test_compute_add_drop() {
        let permitted = set_of(&["CAP_CHOWN", "CAP_FOWNER"]);
        let request = CapabilityRequest {
            add: vec!["CAP_NET_RAW".into()],
            drop: vec!["CAP_CHOWN".into()],
            ..Default::default()
        };
        let caps = compute_container_caps(&request, &permitted, &CapsHashSet::new()).unwrap();
        assert!(caps.effective.contains(&Capability::CAP_NET_RAW));
        assert!(caps.effective.contains(&Capability::CAP_FOWNER));
        assert!(!caps.effective.contains(&Capability::CAP_CHOWN));
    }

    #[test]
    fn test_compute_rejects_unknown_cap() {
        let request = CapabilityRequest {
            add: vec!["CAP_TIME_TRAVEL".into()],
            ..Default::default()
        };
        let err =
            compute_container_caps(&request, &CapsHashSet::new(), &CapsHashSet::new()).unwrap_err();
        assert!(matches!(err, VesselError::ConfigRejected(_)));
    }

    #[test]
    fn test_capability_file_union() {
        let file: CapabilityFile = serde_json::from_str(
            r#"{
                "users": {"alice": ["CAP_NET_RAW"]},
                "groups": {"ops": ["CAP_SYS_PTRACE"], "web": ["CAP_NET_BIND_SERVICE"]}
            }"#,
        )
        .unwrap();

        let caps = file
            .authorized("alice", &["ops".to_string()])
            .unwrap();
        assert!(caps.contains(&Capability::CAP_NET_RAW));
        assert!(caps.contains(&Capability::CAP_SYS_PTRACE));
        assert!(!caps.contains(&Capability::CAP_NET_BIND_SERVICE));

        let none = file.authorized("bob", &[]).unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn test_escalate_denied_unprivileged() {
        // Test binaries are not installed setuid; escalation must fail
        // cleanly with the typed error.
        let res = nix::unistd::getresuid().unwrap();
        if res.effective.as_raw() != 0 && res.saved.as_raw() != 0 {
            let err = escalate().unwrap_err();
            assert!(matches!(err, VesselError::PrivilegeEscalationDenied));
        }
    }
}
