//! Advisory lock file protecting a project tree from concurrent runs.

use anyhow::{Context, Result};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Holds `regresql/.lock` for the lifetime of a command. Created with
/// create-new semantics; removed on drop.
#[derive(Debug)]
pub struct Lock {
    path: PathBuf,
}

impl Lock {
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::AlreadyExists {
                    anyhow::anyhow!(
                        "another regresql invocation holds {}; remove the file if it is stale",
                        path.display()
                    )
                } else {
                    anyhow::anyhow!("creating lock {}: {}", path.display(), e)
                }
            })?;
        let _ = writeln!(file, "{}", std::process::id());
        Ok(Self {
            path: path.to_path_buf(),
        })
    }
}

impl Drop for Lock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_excludes_second_holder() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".lock");
        let lock = Lock::acquire(&path).unwrap();
        let err = Lock::acquire(&path).unwrap_err().to_string();
        assert!(err.contains("another regresql invocation"), "got: {err}");
        drop(lock);
        let _relocked = Lock::acquire(&path).unwrap();
    }

    #[test]
    fn test_lock_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".lock");
        {
            let _lock = Lock::acquire(&path).unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }
}
