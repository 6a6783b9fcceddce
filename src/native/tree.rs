//! Process-tree bookkeeping read from `/proc`.
//!
//! The host registers itself as a child subreaper, so a process that leaves
//! its session or process group is still reparented to the host when its
//! parent dies. Every live sandbox tree is kept in a process-wide registry;
//! a host child that belongs to no tree is a stray and gets killed.

use std::{
    collections::{HashMap, HashSet},
    fs,
    sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError},
};

use dashmap::DashMap;
use nix::{
    errno::Errno,
    sys::{
        signal::{Signal, kill},
        wait::{WaitPidFlag, waitpid},
    },
    unistd::Pid,
};

use crate::core::domain::RunId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcStat {
    pub pid: i32,
    pub ppid: i32,
    pub start_time: u64,
    pub zombie: bool,
}

/// Parses `/proc/<pid>/stat`. The command name may itself contain spaces
/// and parentheses, so fields are counted from the last `)`.
pub fn parse_stat(contents: &str) -> Option<ProcStat> {
    let (head, rest) = contents.rsplit_once(')')?;
    let pid = head.split_once('(')?.0.trim().parse().ok()?;
    let fields: Vec<&str> = rest.split_whitespace().collect();

    Some(ProcStat {
        pid,
        zombie: matches!(*fields.first()?, "Z" | "X"),
        ppid: fields.get(1)?.parse().ok()?,
        start_time: fields.get(19)?.parse().ok()?,
    })
}

pub fn read_stat(pid: i32) -> Option<ProcStat> {
    parse_stat(&fs::read_to_string(format!("/proc/{pid}/stat")).ok()?)
}

pub fn list_processes() -> Vec<ProcStat> {
    let Ok(entries) = fs::read_dir("/proc") else {
        return Vec::new();
    };
    entries
        .filter_map(Result::ok)
        .filter_map(|entry| entry.file_name().to_str()?.parse::<i32>().ok())
        .filter_map(read_stat)
        .collect()
}

/// `VmRSS` of one process. Kernel threads and zombies have none.
pub fn resident_bytes(pid: i32) -> Option<u64> {
    let status = fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
    let line = status.lines().find(|line| line.starts_with("VmRSS:"))?;
    let kib: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kib * 1024)
}

/// Every live process descended from one sandbox root, keyed by pid and
/// start time so a recycled pid is never mistaken for a member.
#[derive(Debug)]
pub struct ProcessTree {
    root: i32,
    members: HashMap<i32, u64>,
}

impl ProcessTree {
    pub fn new(root: i32) -> Self {
        let mut members = HashMap::new();
        if let Some(stat) = read_stat(root) {
            members.insert(root, stat.start_time);
        }
        Self { root, members }
    }

    pub fn root(&self) -> i32 {
        self.root
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, stat: &ProcStat) -> bool {
        self.members.get(&stat.pid) == Some(&stat.start_time)
    }

    /// Drops members that exited and adopts children of the remaining ones.
    pub fn refresh(&mut self, procs: &[ProcStat]) {
        let current: HashMap<i32, &ProcStat> = procs.iter().map(|stat| (stat.pid, stat)).collect();
        self.members.retain(|pid, start_time| {
            current
                .get(pid)
                .is_some_and(|stat| stat.start_time == *start_time && !stat.zombie)
        });

        loop {
            let adopted: Vec<&ProcStat> = procs
                .iter()
                .filter(|stat| !stat.zombie && !self.members.contains_key(&stat.pid))
                .filter(|stat| self.members.contains_key(&stat.ppid))
                .collect();
            if adopted.is_empty() {
                break;
            }
            for stat in adopted {
                self.members.insert(stat.pid, stat.start_time);
            }
        }
    }

    pub fn signal_all(&self, signal: Signal) {
        for (&pid, &start_time) in &self.members {
            if read_stat(pid).is_some_and(|stat| stat.start_time == start_time) {
                match kill(Pid::from_raw(pid), signal) {
                    Ok(()) | Err(Errno::ESRCH) => {}
                    Err(err) => tracing::debug!("Cannot send {} to {}: {}", signal, pid, err),
                }
            }
        }
    }

    pub fn resident_bytes(&self) -> u64 {
        self.members.keys().filter_map(|&pid| resident_bytes(pid)).sum()
    }
}

pub type SharedTree = Arc<Mutex<ProcessTree>>;

static TREES: LazyLock<DashMap<RunId, SharedTree>> = LazyLock::new(DashMap::new);
static SPAWN_LOCK: Mutex<()> = Mutex::new(());

/// Held while a child is spawned and registered, and while strays are
/// swept, so a fresh sandbox root is never taken for a stray.
pub fn spawn_lock() -> MutexGuard<'static, ()> {
    SPAWN_LOCK.lock().unwrap_or_else(PoisonError::into_inner)
}

pub fn lock(tree: &SharedTree) -> MutexGuard<'_, ProcessTree> {
    tree.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Registers a freshly spawned root. Call with [`spawn_lock`] held.
pub fn track(run_id: RunId, root: i32) -> SharedTree {
    let tree = Arc::new(Mutex::new(ProcessTree::new(root)));
    TREES.insert(run_id, tree.clone());
    tree
}

pub fn untrack(run_id: RunId) {
    TREES.remove(&run_id);
}

/// Refreshes `tree` and returns it locked, for limit checks.
pub fn refresh(tree: &SharedTree) -> MutexGuard<'_, ProcessTree> {
    let procs = list_processes();
    lock(tree).refresh(&procs);
    sweep_strays(&procs);
    lock(tree)
}

/// Kills the whole tree, adopting late children, until nothing is left.
/// Orphans that were never seen as members are caught by the stray sweep.
pub fn kill_tree(tree: &SharedTree) {
    for _ in 0..50 {
        let procs = list_processes();
        let mut guard = lock(tree);
        guard.refresh(&procs);
        if guard.is_empty() {
            drop(guard);
            sweep_strays(&procs);
            return;
        }
        guard.signal_all(Signal::SIGKILL);
        drop(guard);
        std::thread::sleep(std::time::Duration::from_millis(10));
    }
    tracing::warn!("Process tree of {} survived repeated kills", lock(tree).root());
}

/// Kills host children that no tracked tree owns and reaps zombie strays.
/// Tree roots are left to their owners, which wait for them.
pub fn sweep_strays(procs: &[ProcStat]) {
    let host = std::process::id() as i32;
    let _spawning = spawn_lock();

    let trees: Vec<SharedTree> = TREES.iter().map(|entry| entry.value().clone()).collect();
    let mut roots = HashSet::new();
    let mut owned = HashSet::new();
    for tree in &trees {
        let guard = lock(tree);
        roots.insert(guard.root());
        owned.extend(
            procs
                .iter()
                .filter(|stat| guard.contains(stat))
                .map(|stat| stat.pid),
        );
    }

    for stat in procs.iter().filter(|stat| stat.ppid == host) {
        if roots.contains(&stat.pid) {
            continue;
        }
        let pid = Pid::from_raw(stat.pid);
        if !stat.zombie && !owned.contains(&stat.pid) {
            tracing::warn!("Killing stray sandbox process {}", stat.pid);
            let _ = kill(pid, Signal::SIGKILL);
        }
        if stat.zombie {
            let _ = waitpid(pid, Some(WaitPidFlag::WNOHANG));
        }
    }
}
