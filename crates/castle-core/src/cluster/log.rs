use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

/// Append-only transcript of everything run against one node.
///
/// Lines are mirrored to `tracing`; raw command output only goes to the file.
/// The file is opened lazily so clusters that never touch a node leave no log.
pub struct NodeLog {
    node: String,
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl NodeLog {
    pub fn new(node: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            node: node.into(),
            path: path.into(),
            file: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn info(&self, msg: &str) {
        tracing::info!(node = %self.node, "{msg}");
        self.write_line(msg);
    }

    pub fn debug(&self, msg: &str) {
        tracing::debug!(node = %self.node, "{msg}");
        self.write_line(msg);
    }

    pub fn warn(&self, msg: &str) {
        tracing::warn!(node = %self.node, "{msg}");
        self.write_line(msg);
    }

    /// Append command output verbatim, terminating it with a newline.
    pub fn write_output(&self, text: &str) {
        if text.is_empty() {
            return;
        }
        if text.ends_with('\n') {
            self.write(text.as_bytes());
        } else {
            self.write(format!("{text}\n").as_bytes());
        }
    }

    fn write_line(&self, msg: &str) {
        let stamp = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ");
        self.write(format!("[{stamp}] {msg}\n").as_bytes());
    }

    fn write(&self, data: &[u8]) {
        let mut guard = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.is_none() {
            match self.open() {
                Ok(f) => *guard = Some(f),
                Err(e) => {
                    tracing::warn!(path = %self.path.display(), "unable to open node log: {e}");
                    return;
                }
            }
        }
        if let Some(f) = guard.as_mut() {
            if let Err(e) = f.write_all(data) {
                tracing::warn!(path = %self.path.display(), "unable to write node log: {e}");
            }
        }
    }

    fn open(&self) -> std::io::Result<File> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        OpenOptions::new().create(true).append(true).open(&self.path)
    }

    /// Release the file handle. A later write reopens it.
    pub fn close(&self) {
        let mut guard = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(mut f) = guard.take() {
            let _ = f.flush();
        }
    }
}
