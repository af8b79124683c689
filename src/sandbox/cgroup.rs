use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

static CGROUP_COUNTER: AtomicU64 = AtomicU64::new(0);

const REMOVE_ATTEMPTS: u32 = 20;

/// Prepares `root` as a cgroup v2 parent whose children get the memory controller
///
/// Fails when cgroup v2 is not mounted there or the hierarchy is not delegated
/// to this process.
pub(super) fn prepare_root(root: &Path) -> io::Result<()> {
    fs::create_dir_all(root)?;

    let available = fs::read_to_string(root.join("cgroup.controllers"))?;
    if !available.split_whitespace().any(|c| c == "memory") {
        return Err(io::Error::other(format!(
            "memory controller not available in {}",
            root.display()
        )));
    }

    let subtree = root.join("cgroup.subtree_control");
    if !enabled(&subtree)? {
        fs::write(&subtree, "+memory")?;
    }
    if !enabled(&subtree)? {
        return Err(io::Error::other("memory controller could not be enabled"));
    }
    Ok(())
}

fn enabled(subtree_control: &Path) -> io::Result<bool> {
    Ok(fs::read_to_string(subtree_control)?
        .split_whitespace()
        .any(|c| c == "memory"))
}

/// A single-use cgroup with a hard memory cap
///
/// The child joins it from `pre_exec` through the handle returned by
/// [`MemoryCgroup::procs_handle`]. Everything left inside is killed when the
/// scope is removed.
#[derive(Debug)]
pub(super) struct MemoryCgroup {
    path: PathBuf,
}

impl MemoryCgroup {
    pub(super) fn create(root: &Path, memory_limit: u64) -> io::Result<Self> {
        let name = format!(
            "run-{}-{}",
            std::process::id(),
            CGROUP_COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        let path = root.join(name);
        fs::create_dir(&path)?;
        let cgroup = Self { path };

        fs::write(cgroup.path.join("memory.max"), memory_limit.to_string())?;
        // Absent without swap accounting
        let _ = fs::write(cgroup.path.join("memory.swap.max"), "0");
        // One OOM kill takes down the whole program, not a single victim
        let _ = fs::write(cgroup.path.join("memory.oom.group"), "1");

        log::debug!("Created cgroup {} capped at {memory_limit} bytes", cgroup.path.display());
        Ok(cgroup)
    }

    /// Opens `cgroup.procs` for the child; writing "0" moves the writer in
    pub(super) fn procs_handle(&self) -> io::Result<File> {
        OpenOptions::new()
            .write(true)
            .open(self.path.join("cgroup.procs"))
    }

    /// Whether the kernel OOM-killed anything in this cgroup
    pub(super) fn oom_killed(&self) -> bool {
        let Ok(events) = fs::read_to_string(self.path.join("memory.events")) else {
            return false;
        };
        parse_oom_kills(&events) > 0
    }

    /// Peak usage in bytes, when the kernel tracks it
    pub(super) fn peak_memory(&self) -> Option<u64> {
        fs::read_to_string(self.path.join("memory.peak"))
            .ok()
            .and_then(|peak| peak.trim().parse().ok())
    }

    /// Kills whatever is left inside and removes the cgroup
    pub(super) async fn remove(self) {
        let _ = fs::write(self.path.join("cgroup.kill"), "1");
        for _ in 0..REMOVE_ATTEMPTS {
            match fs::remove_dir(&self.path) {
                Ok(()) => {
                    log::debug!("Removed cgroup {}", self.path.display());
                    return;
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => return,
                // Killed members take a moment to leave
                Err(_) => tokio::time::sleep(Duration::from_millis(10)).await,
            }
        }
        log::warn!("Failed to remove cgroup {}", self.path.display());
    }
}

impl Drop for MemoryCgroup {
    fn drop(&mut self) {
        if self.path.exists() {
            let _ = fs::write(self.path.join("cgroup.kill"), "1");
            let _ = fs::remove_dir(&self.path);
        }
    }
}

fn parse_oom_kills(events: &str) -> u64 {
    events
        .lines()
        .filter_map(|line| line.split_once(' '))
        .find(|(key, _)| *key == "oom_kill")
        .and_then(|(_, count)| count.trim().parse().ok())
        .unwrap_or(0)
}
