use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::SubmitError;
use crate::workspace::Workspace;

/// Single-writer guard on an output directory. The lock file holds the pid of
/// the owner and is removed when the guard drops.
#[derive(Debug)]
pub struct OutputLock {
    path: Utf8PathBuf,
}

impl OutputLock {
    /// A lock left behind by a process that no longer exists is removed and
    /// acquisition retried once. A lock whose owner cannot be read is treated
    /// as live.
    pub fn acquire(workspace: &Workspace) -> Result<Self, SubmitError> {
        workspace.ensure_root()?;
        let path = workspace.lock_path();
        match Self::create(&path)? {
            Some(lock) => Ok(lock),
            None => {
                let owner = fs::read_to_string(path.as_std_path()).unwrap_or_default();
                let owner = owner.trim();
                match owner.parse::<u32>() {
                    Ok(pid) if !process_alive(pid) => {
                        tracing::warn!(lock = %path, owner, "removing stale lock of a finished process");
                        let still_same = fs::read_to_string(path.as_std_path())
                            .map(|current| current.trim() == owner)
                            .unwrap_or(false);
                        if still_same {
                            fs::remove_file(path.as_std_path()).map_err(|err| {
                                SubmitError::Filesystem(format!("remove {path}: {err}"))
                            })?;
                        }
                        Self::create(&path)?
                            .ok_or_else(|| SubmitError::Locked(path.clone().into_std_path_buf()))
                    }
                    _ => {
                        tracing::warn!(lock = %path, owner, "output directory in use");
                        Err(SubmitError::Locked(path.into_std_path_buf()))
                    }
                }
            }
        }
    }

    /// `None` when the lock file already exists.
    fn create(path: &Utf8Path) -> Result<Option<Self>, SubmitError> {
        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path.as_std_path())
        {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::AlreadyExists => return Ok(None),
            Err(err) => return Err(SubmitError::Filesystem(format!("create {path}: {err}"))),
        };
        writeln!(file, "{}", std::process::id())
            .map_err(|err| SubmitError::Filesystem(format!("write {path}: {err}")))?;
        tracing::debug!(lock = %path, "output directory locked");
        Ok(Some(Self {
            path: path.to_path_buf(),
        }))
    }
}

#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> bool {
    pid == std::process::id() || std::path::Path::new(&format!("/proc/{pid}")).exists()
}

/// Without a process table to consult, every owner counts as running.
#[cfg(not(target_os = "linux"))]
fn process_alive(_pid: u32) -> bool {
    true
}

impl Drop for OutputLock {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(self.path.as_std_path()) {
            tracing::warn!(lock = %self.path, "failed to remove lock file: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn second_writer_is_refused_until_release() {
        let temp = tempfile::tempdir().unwrap();
        let workspace = Workspace::from_std(temp.path()).unwrap();

        let first = OutputLock::acquire(&workspace).unwrap();
        assert_matches!(
            OutputLock::acquire(&workspace),
            Err(SubmitError::Locked(_))
        );
        drop(first);
        assert!(!workspace.lock_path().exists());
        OutputLock::acquire(&workspace).unwrap();
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn lock_of_a_dead_process_is_reclaimed() {
        let temp = tempfile::tempdir().unwrap();
        let workspace = Workspace::from_std(temp.path()).unwrap();
        // Above the kernel's pid_max ceiling, so never a running process.
        fs::write(workspace.lock_path().as_std_path(), "4194305\n").unwrap();

        let lock = OutputLock::acquire(&workspace).unwrap();
        let owner = fs::read_to_string(workspace.lock_path().as_std_path()).unwrap();
        assert_eq!(owner.trim(), std::process::id().to_string());
        drop(lock);
        assert!(!workspace.lock_path().exists());
    }

    #[test]
    fn unreadable_owner_keeps_the_lock() {
        let temp = tempfile::tempdir().unwrap();
        let workspace = Workspace::from_std(temp.path()).unwrap();
        fs::write(workspace.lock_path().as_std_path(), "").unwrap();

        assert_matches!(
            OutputLock::acquire(&workspace),
            Err(SubmitError::Locked(_))
        );
        assert!(workspace.lock_path().exists());
    }
}
