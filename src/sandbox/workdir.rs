use std::fs;
use std::io::{self, Read};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Local;

const WORK_DIR_PERMISSIONS: u32 = 0o700;

static WORK_DIR_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A single-use working directory, removed with everything in it on drop
#[derive(Debug)]
pub struct WorkDir {
    path: PathBuf,
}

impl WorkDir {
    /// Creates a fresh, uniquely named directory under `root`
    pub fn create(root: &Path) -> io::Result<Self> {
        fs::create_dir_all(root)?;

        let name = format!(
            "{}-{}-{}",
            Local::now().format("%y%m%d-%H-%M-%S"),
            std::process::id(),
            WORK_DIR_COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        let path = root.join(name);
        fs::create_dir(&path)?;
        fs::set_permissions(&path, fs::Permissions::from_mode(WORK_DIR_PERMISSIONS))?;

        log::debug!("Created work dir {}", path.display());
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn join(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }

    /// Writes a file into the directory and returns its path
    pub fn write(&self, name: &str, contents: &str) -> io::Result<PathBuf> {
        let path = self.join(name);
        fs::write(&path, contents)?;
        Ok(path)
    }

    /// Reads a file as lossy UTF-8, keeping at most `limit` bytes
    ///
    /// A missing file reads as empty.
    pub fn read_capped(&self, name: &str, limit: u64) -> io::Result<String> {
        read_capped(&self.join(name), limit)
    }
}

impl Drop for WorkDir {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir_all(&self.path) {
            log::warn!("Failed to remove work dir {}: {e}", self.path.display());
        } else {
            log::debug!("Removed work dir {}", self.path.display());
        }
    }
}

pub(super) fn read_capped(path: &Path, limit: u64) -> io::Result<String> {
    let file = match fs::File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(String::new()),
        Err(e) => return Err(e),
    };

    let mut buf = Vec::new();
    file.take(limit).read_to_end(&mut buf)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}
