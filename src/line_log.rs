//! Append-only log of every line the runner scans.
//!
//! Write failures never stop the scan loop: they are logged and the next line
//! tries again, reopening the file if it could not be opened before.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use tracing::warn;

/// Appends `<prefix> <line>` entries to a file.
pub struct LineLog {
    path: PathBuf,
    prefix: String,
    writer: Mutex<Option<Box<dyn Write + Send>>>,
}

impl LineLog {
    /// Create a line log appending to `path`. The file is opened on first write.
    pub fn new(path: impl AsRef<Path>, prefix: impl Into<String>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            prefix: prefix.into(),
            writer: Mutex::new(None),
        }
    }

    /// Render one entry, without the trailing newline.
    pub fn format_entry(&self, line: &str) -> String {
        if self.prefix.is_empty() {
            line.to_owned()
        } else {
            format!("{} {line}", self.prefix)
        }
    }

    /// Append one line. Failures are logged and swallowed.
    pub fn append(&self, line: &str) {
        if let Err(e) = self.try_append(line) {
            warn!(error = %e, "failed to append to line log");
        }
    }

    fn try_append(&self, line: &str) -> std::io::Result<()> {
        let mut slot = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(self.open_file()?);
        }
        let Some(writer) = slot.as_mut() else {
            return Ok(());
        };
        let result = writeln!(writer, "{}", self.format_entry(line)).and_then(|()| writer.flush());
        if result.is_err() {
            // Reopen on the next line.
            *slot = None;
        }
        result
    }

    fn open_file(&self) -> std::io::Result<Box<dyn Write + Send>> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        Ok(Box::new(file))
    }
}
