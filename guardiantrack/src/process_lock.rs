//! Single-writer lock on the upload queue.
//!
//! `run`, `send` and `drain` each take it before opening the database so two
//! processes never retry the same rows at once. It is a `flock` on a small
//! file in the runtime directory, one file per database path, released by the
//! OS if the process dies.

use anyhow::{Context, Result};
use std::collections::hash_map::DefaultHasher;
use std::fs::{self, File, OpenOptions};
use std::hash::{Hash, Hasher};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

#[cfg(not(unix))]
compile_error!("guardiantrack process locks currently require Unix (macOS/Linux)");

const LOCK_EX: i32 = 2;
const LOCK_NB: i32 = 4;
const LOCK_UN: i32 = 8;

extern "C" {
    fn flock(fd: i32, operation: i32) -> i32;
}

/// Exclusive ownership of one queue database, released on drop.
pub struct AgentGuard {
    file: File,
    path: PathBuf,
}

impl Drop for AgentGuard {
    fn drop(&mut self) {
        let _ = apply_flock(&self.file, LOCK_UN);
        let _ = fs::remove_file(&self.path);
    }
}

/// Take exclusive ownership of the queue at `db_path`, failing immediately if
/// another guardiantrack process holds it.
pub fn acquire_agent_guard(db_path: &Path) -> Result<AgentGuard> {
    let path = lock_path(db_path);
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create lock directory {}", dir.display()))?;
    }

    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)
        .with_context(|| format!("failed to open lock file {}", path.display()))?;

    if let Err(e) = apply_flock(&file, LOCK_EX | LOCK_NB) {
        if !is_contended(&e) {
            return Err(e).with_context(|| format!("failed to lock {}", path.display()));
        }
        let holder = read_holder(&mut file).unwrap_or_default();
        anyhow::bail!(
            "another guardiantrack process{} is already using {}",
            holder,
            db_path.display()
        );
    }

    // Owner pid, shown to whoever is refused next
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    writeln!(file, "pid={}", std::process::id())?;
    file.flush()?;

    Ok(AgentGuard { file, path })
}

/// `$XDG_RUNTIME_DIR/guardiantrack/agent-<hash of db path>.lock`
fn lock_path(db_path: &Path) -> PathBuf {
    let base = std::env::var_os("XDG_RUNTIME_DIR")
        .filter(|dir| !dir.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir);

    let mut hasher = DefaultHasher::new();
    db_path.to_string_lossy().hash(&mut hasher);
    base.join("guardiantrack")
        .join(format!("agent-{:016x}.lock", hasher.finish()))
}

/// " (pid=N)" when the holder recorded itself
fn read_holder(file: &mut File) -> Option<String> {
    let mut owner = String::new();
    file.seek(SeekFrom::Start(0)).ok()?;
    file.read_to_string(&mut owner).ok()?;
    let owner = owner.trim();
    (!owner.is_empty()).then(|| format!(" ({})", owner))
}

fn is_contended(error: &io::Error) -> bool {
    error.kind() == io::ErrorKind::WouldBlock || matches!(error.raw_os_error(), Some(11 | 35))
}

fn apply_flock(file: &File, operation: i32) -> io::Result<()> {
    // SAFETY: the descriptor stays open for the duration of the call.
    match unsafe { flock(file.as_raw_fd(), operation) } {
        0 => Ok(()),
        _ => Err(io::Error::last_os_error()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_second_guard_is_refused_and_names_holder() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("queue.db");

        let first = acquire_agent_guard(&db_path).unwrap();
        let refused = acquire_agent_guard(&db_path).err().unwrap().to_string();
        assert!(
            refused.contains(&format!("pid={}", std::process::id())),
            "unexpected error: {refused}"
        );

        drop(first);
        assert!(acquire_agent_guard(&db_path).is_ok());
    }

    #[test]
    fn test_guards_are_scoped_per_database() {
        let dir = TempDir::new().unwrap();

        let _a = acquire_agent_guard(&dir.path().join("a.db")).unwrap();
        let _b = acquire_agent_guard(&dir.path().join("b.db")).unwrap();
    }

    #[test]
    fn test_lock_path_depends_only_on_db_path() {
        let a = lock_path(Path::new("/data/queue.db"));
        assert_eq!(a, lock_path(Path::new("/data/queue.db")));
        assert_ne!(a, lock_path(Path::new("/other/queue.db")));
        assert!(a.to_string_lossy().contains("guardiantrack"));
    }
}
