//! cgroup v2 resource groups: one per sandbox.
//!
//! Groups are created before the sandbox is spawned and removed only after the
//! final statistics have been read. The accounting files outlive the confined
//! process, so stats stay readable until [`CgroupManager::destroy`].

use crate::config::CgroupConfig;
use crate::error::{Error, Result};
use nix::unistd::Pid;
use std::fs;
use std::io::ErrorKind;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const MEMORY_MAX: &str = "memory.max";
const CPU_MAX: &str = "cpu.max";
const PROCS: &str = "cgroup.procs";
const MEMORY_CURRENT: &str = "memory.current";
const MEMORY_PEAK: &str = "memory.peak";
const MEMORY_STAT: &str = "memory.stat";
const CPU_STAT: &str = "cpu.stat";
const SUBTREE_CONTROL: &str = "cgroup.subtree_control";

/// Usage counters read back from a group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CgroupStats {
    pub memory_peak_bytes: u64,
    pub cpu_user_usec: u64,
    pub cpu_system_usec: u64,
}

/// One resource group on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CgroupHandle {
    name: String,
    path: PathBuf,
}

impl CgroupHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Live `memory.current`, or `None` when unreadable.
    pub fn memory_current(&self) -> Option<u64> {
        read_counter(&self.path.join(MEMORY_CURRENT))
    }
}

/// Owns a [`CgroupHandle`] and removes its directory when dropped.
pub struct CgroupGuard {
    handle: CgroupHandle,
}

impl Deref for CgroupGuard {
    type Target = CgroupHandle;

    fn deref(&self) -> &CgroupHandle {
        &self.handle
    }
}

impl Drop for CgroupGuard {
    fn drop(&mut self) {
        if let Err(e) = CgroupManager::destroy(&self.handle) {
            warn!(cgroup = %self.handle.path.display(), error = %e, "Failed to remove cgroup");
        }
    }
}

/// Creates, populates and tears down groups under a configured root.
#[derive(Debug, Clone)]
pub struct CgroupManager {
    root: PathBuf,
    memory_limit_mb: Option<u64>,
    cpu_max: Option<String>,
}

impl CgroupManager {
    pub fn new(config: &CgroupConfig) -> Self {
        Self {
            root: config.root.clone(),
            memory_limit_mb: config.memory_limit_mb,
            cpu_max: config.cpu_max.map(|c| c.to_string()),
        }
    }

    /// Best-effort `+memory +cpu` on the root so child groups get both controllers.
    pub fn enable_controllers(&self) {
        let control = self.root.join(SUBTREE_CONTROL);
        if !control.exists() {
            return;
        }
        if let Err(e) = fs::write(&control, "+memory +cpu") {
            debug!(path = %control.display(), error = %e, "Could not enable cgroup controllers");
        }
    }

    /// Create the group `name` and write its limits. A leftover empty
    /// directory from a previous run is reused.
    pub fn create(&self, name: &str) -> Result<CgroupGuard> {
        let path = self.root.join(name);
        fs::create_dir_all(&path)
            .map_err(|e| Error::Cgroup(format!("mkdir {}: {}", path.display(), e)))?;
        let guard = CgroupGuard {
            handle: CgroupHandle {
                name: name.to_string(),
                path,
            },
        };

        if let Some(mb) = self.memory_limit_mb {
            write_limit(&guard.path, MEMORY_MAX, &format!("{}M", mb))?;
        }
        if let Some(cpu) = &self.cpu_max {
            write_limit(&guard.path, CPU_MAX, cpu)?;
        }

        info!(cgroup = %guard.path.display(), memory_limit_mb = ?self.memory_limit_mb,
              cpu_max = ?self.cpu_max, "Created cgroup");
        Ok(guard)
    }

    /// Move `pid` into the group. Returns `false` when the write failed and
    /// the process is left unconfined.
    pub fn attach(handle: &CgroupHandle, pid: Pid) -> bool {
        let procs = handle.path.join(PROCS);
        match fs::write(&procs, pid.as_raw().to_string()) {
            Ok(()) => {
                info!(pid = pid.as_raw(), cgroup = %handle.path.display(), "Added process to cgroup");
                true
            }
            Err(e) => {
                warn!(pid = pid.as_raw(), cgroup = %handle.path.display(), error = %e,
                      "Failed to add process to cgroup, running unconfined");
                false
            }
        }
    }

    /// Read final counters. Unreadable files count as zero.
    pub fn read_stats(handle: &CgroupHandle) -> CgroupStats {
        let mut stats = CgroupStats::default();

        match read_counter(&handle.path.join(MEMORY_PEAK)) {
            Some(peak) => stats.memory_peak_bytes = peak,
            None => debug!(cgroup = %handle.path.display(), "memory.peak unavailable"),
        }

        if let Ok(text) = fs::read_to_string(handle.path.join(MEMORY_STAT)) {
            let breakdown = memory_stat_peak(&text);
            stats.memory_peak_bytes = stats.memory_peak_bytes.max(breakdown);
        }

        if let Ok(text) = fs::read_to_string(handle.path.join(CPU_STAT)) {
            let (user, system) = cpu_stat_usage(&text);
            stats.cpu_user_usec = user;
            stats.cpu_system_usec = system;
        }

        debug!(cgroup = %handle.path.display(), ?stats, "Read cgroup stats");
        stats
    }

    /// Remove the group directory. Already gone is fine.
    pub fn destroy(handle: &CgroupHandle) -> Result<()> {
        // cgroupfs only allows rmdir; the interface files cannot be unlinked.
        let result = match fs::remove_dir(&handle.path) {
            Err(e) if e.kind() == ErrorKind::DirectoryNotEmpty => fs::remove_dir_all(&handle.path),
            other => other,
        };
        match result {
            Ok(()) => {
                info!(cgroup = %handle.path.display(), "Removed cgroup");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Cgroup(format!("rmdir {}: {}", handle.path.display(), e))),
        }
    }
}

fn write_limit(dir: &Path, file: &str, value: &str) -> Result<()> {
    fs::write(dir.join(file), value)
        .map_err(|e| Error::Cgroup(format!("write {} to {}/{}: {}", value, dir.display(), file, e)))
}

fn read_counter(path: &Path) -> Option<u64> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Largest of the file/anon/rss/shmem entries in `memory.stat`.
fn memory_stat_peak(text: &str) -> u64 {
    keyed_values(text)
        .filter(|(key, _)| matches!(*key, "file" | "anon" | "rss" | "shmem"))
        .map(|(_, value)| value)
        .max()
        .unwrap_or(0)
}

/// `(user_usec, system_usec)` from `cpu.stat`.
fn cpu_stat_usage(text: &str) -> (u64, u64) {
    let mut user = 0;
    let mut system = 0;
    for (key, value) in keyed_values(text) {
        match key {
            "user_usec" => user = value,
            "system_usec" => system = value,
            _ => {}
        }
    }
    (user, system)
}

fn keyed_values(text: &str) -> impl Iterator<Item = (&str, u64)> {
    text.lines().filter_map(|line| {
        let mut fields = line.split_whitespace();
        let key = fields.next()?;
        let value = fields.next()?.parse().ok()?;
        match fields.next() {
            None => Some((key, value)),
            Some(_) => None,
        }
    })
}
