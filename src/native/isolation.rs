//! Restrictions applied to the sandbox process between fork and exec.
//!
//! Everything in [`apply`] runs in the forked child and must not log through
//! the host's subscriber.

use std::{io, path::PathBuf};

use nix::sys::resource::{Resource, setrlimit};

#[derive(Debug, Clone, Default)]
pub struct IsolationPolicy {
    pub landlock: bool,
    pub readable_paths: Vec<PathBuf>,
    pub writable_paths: Vec<PathBuf>,
    /// TCP ports the tree may connect to. `None` leaves TCP unrestricted.
    pub connect_ports: Option<Vec<u16>>,
    pub cpu_time_secs: Option<u64>,
    pub max_file_bytes: Option<u64>,
}

impl IsolationPolicy {
    /// Landlock rejects rules for paths that do not exist, so they are
    /// filtered out in the parent before forking.
    pub fn retain_existing(mut self) -> Self {
        self.readable_paths.retain(|path| path.exists());
        self.writable_paths.retain(|path| path.exists());
        self.readable_paths.sort();
        self.readable_paths.dedup();
        self
    }
}

/// What the running kernel enforces of the Landlock ruleset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LandlockSupport {
    pub filesystem: bool,
    /// TCP bind and connect rules (ABI 4).
    pub network: bool,
    /// Signal and abstract socket scoping (ABI 6).
    pub scoping: bool,
}

pub fn apply(policy: &IsolationPolicy) -> io::Result<()> {
    set_rlimits(policy)?;

    #[cfg(target_os = "linux")]
    if policy.landlock {
        apply_landlock(policy)?;
    }

    Ok(())
}

fn set_rlimits(policy: &IsolationPolicy) -> io::Result<()> {
    setrlimit(Resource::RLIMIT_CORE, 0, 0)?;

    // SIGXCPU at the soft limit, SIGKILL one second later.
    if let Some(secs) = policy.cpu_time_secs {
        setrlimit(Resource::RLIMIT_CPU, secs, secs.saturating_add(1))?;
    }
    if let Some(bytes) = policy.max_file_bytes {
        setrlimit(Resource::RLIMIT_FSIZE, bytes, bytes)?;
    }

    Ok(())
}

/// Makes the host unreadable through `/proc/<pid>` for same-uid processes
/// and adopts every orphan a sandbox leaves behind.
#[cfg(target_os = "linux")]
pub fn protect_host() -> nix::Result<()> {
    use nix::sys::prctl;

    prctl::set_dumpable(false)?;
    prctl::set_child_subreaper(true)?;
    Ok(())
}

#[cfg(target_os = "linux")]
fn apply_landlock(policy: &IsolationPolicy) -> io::Result<()> {
    use landlock::{
        ABI, Access, AccessFs, AccessNet, CompatLevel, Compatible, NetPort, Ruleset,
        RulesetAttr, RulesetCreatedAttr, Scope, path_beneath_rules,
    };

    let abi = ABI::V1;
    let access_rw = AccessFs::from_all(abi);
    let access_ro = AccessFs::from_read(abi);

    let mut ruleset = Ruleset::default()
        .set_compatibility(CompatLevel::BestEffort)
        .handle_access(access_rw)
        .map_err(landlock_err)?
        .scope(Scope::from_all(ABI::V6))
        .map_err(landlock_err)?;
    if policy.connect_ports.is_some() {
        ruleset = ruleset
            .handle_access(AccessNet::from_all(ABI::V4))
            .map_err(landlock_err)?;
    }

    let mut created = ruleset
        .create()
        .map_err(landlock_err)?
        .add_rules(path_beneath_rules(&policy.readable_paths, access_ro))
        .map_err(landlock_err)?
        .add_rules(path_beneath_rules(&policy.writable_paths, access_rw))
        .map_err(landlock_err)?;
    for &port in policy.connect_ports.iter().flatten() {
        created = created
            .add_rule(NetPort::new(port, AccessNet::ConnectTcp))
            .map_err(landlock_err)?;
    }

    created.restrict_self().map_err(landlock_err)?;
    Ok(())
}

/// Enforces a throwaway ruleset on a short-lived thread and reports what the
/// kernel supports. Landlock only ever restricts the calling thread.
#[cfg(target_os = "linux")]
pub fn detect_landlock() -> LandlockSupport {
    use landlock::{
        ABI, Access, AccessFs, CompatLevel, Compatible, LandlockStatus, Ruleset, RulesetAttr,
        RulesetStatus,
    };

    let restricted = std::thread::spawn(|| {
        Ruleset::default()
            .set_compatibility(CompatLevel::BestEffort)
            .handle_access(AccessFs::from_all(ABI::V1))?
            .create()?
            .restrict_self()
    });

    match restricted.join() {
        Ok(Ok(status)) => {
            let abi = match status.landlock {
                LandlockStatus::Available { effective_abi, .. } => effective_abi,
                _ => ABI::Unsupported,
            };
            LandlockSupport {
                filesystem: status.ruleset != RulesetStatus::NotEnforced,
                network: abi >= ABI::V4,
                scoping: abi >= ABI::V6,
            }
        }
        _ => LandlockSupport::default(),
    }
}

#[cfg(not(target_os = "linux"))]
pub fn detect_landlock() -> LandlockSupport {
    LandlockSupport::default()
}

#[cfg(not(target_os = "linux"))]
pub fn protect_host() -> nix::Result<()> {
    Ok(())
}

#[cfg(target_os = "linux")]
fn landlock_err(err: impl std::fmt::Display) -> io::Error {
    io::Error::other(format!("landlock: {err}"))
}
