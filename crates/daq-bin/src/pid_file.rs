//! PID file of the running session.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Holds the PID file for the lifetime of a session and removes it on drop.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Record the current process id at `path`.
    pub fn create(path: &Path) -> Result<Self> {
        fs::write(path, format!("{}\n", std::process::id()))
            .with_context(|| format!("Failed to write PID file {:?}", path))?;
        debug!(path = ?path, "PID file written");
        Ok(Self {
            path: path.to_path_buf(),
        })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = ?self.path, error = %e, "Failed to remove PID file");
        }
    }
}

/// Read the process id recorded at `path`.
pub fn read_pid(path: &Path) -> Result<i32> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("No session PID file at {:?}", path))?;
    text.trim()
        .parse()
        .with_context(|| format!("Malformed PID file {:?}", path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_pid_file_lifecycle() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("logger.pid");

        let pid_file = PidFile::create(&path).unwrap();
        assert_eq!(read_pid(&path).unwrap(), std::process::id() as i32);

        drop(pid_file);
        assert!(!path.exists());
        assert!(read_pid(&path).is_err());
    }

    #[test]
    fn test_malformed_pid() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("logger.pid");
        fs::write(&path, "not a pid").unwrap();
        let err = read_pid(&path).unwrap_err();
        assert!(err.to_string().contains("Malformed"));
    }
}
