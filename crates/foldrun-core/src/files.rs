//! File bookkeeping around engine runs
//!
//! - output-name prediction: the engine never overwrites, it writes
//!   `<name>.<ext>_2`, `_3`, ... when `<name>.<ext>` already exists
//! - bounded probing for files that appear with a delay (shared filesystems)
//! - `ScratchFiles`: generated files deleted on drop when cleanup is requested
//! - `RunLog`: append-only transcript of every command and its output

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tempfile::TempPath;
use tracing::debug;

/// Name the engine will give to `<dir>/<file_name>` if launched now.
pub fn predict_output(dir: &Path, file_name: &str) -> PathBuf {
    let first = dir.join(file_name);
    if !first.exists() {
        return first;
    }
    (2..)
        .map(|i| dir.join(format!("{}_{}", file_name, i)))
        .find(|p| !p.exists())
        .unwrap_or(first)
}

/// Wait until `path` exists, checking up to `attempts` times.
///
/// Returns the number of attempts used, or `None` if the file never appeared.
pub async fn wait_for_file(path: &Path, attempts: u32, delay: Duration) -> Option<u32> {
    for attempt in 1..=attempts.max(1) {
        if path.exists() {
            return Some(attempt);
        }
        if attempt < attempts {
            debug!(path = %path.display(), attempt, "Output not visible yet");
            tokio::time::sleep(delay).await;
        }
    }
    None
}

/// `<file_name>` without its last extension.
pub fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// ScratchFiles
// ---------------------------------------------------------------------------

/// Files generated during one run.
///
/// With cleanup enabled every tracked path is removed when the set is
/// dropped; missing files are ignored. Without cleanup the paths are only
/// recorded.
#[derive(Debug, Default)]
pub struct ScratchFiles {
    cleanup: bool,
    paths: Vec<PathBuf>,
    guards: Vec<TempPath>,
}

impl ScratchFiles {
    pub fn new(cleanup: bool) -> Self {
        Self {
            cleanup,
            paths: Vec::new(),
            guards: Vec::new(),
        }
    }

    pub fn track(&mut self, path: impl Into<PathBuf>) {
        let path = path.into();
        if self.paths.contains(&path) {
            return;
        }
        if self.cleanup {
            self.guards.push(TempPath::from_path(&path));
        }
        self.paths.push(path);
    }

    pub fn cleanup_enabled(&self) -> bool {
        self.cleanup
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.paths.len()
    }
}

// ---------------------------------------------------------------------------
// RunLog
// ---------------------------------------------------------------------------

/// Transcript of engine invocations.
#[derive(Debug, Clone)]
pub struct RunLog {
    path: PathBuf,
}

impl RunLog {
    /// Start a fresh log at `path`, truncating any previous one.
    pub fn create(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        File::create(&path)?;
        Ok(Self { path })
    }

    /// Append to an existing log (created if missing).
    pub fn append_to(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&self, command_line: &str, stdout: &[String], stderr: &str) -> std::io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "#cmd: {}", command_line)?;
        for line in stdout {
            writeln!(file, "{}", line)?;
        }
        if !stderr.trim().is_empty() {
            writeln!(file, "#stderr:")?;
            file.write_all(stderr.as_bytes())?;
            if !stderr.ends_with('\n') {
                writeln!(file)?;
            }
        }
        Ok(())
    }
}
