// Copyright 2025 Sushanth (https://github.com/sushanthpy)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Plain-text daemon state: the last processed event id and the pid file.

use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt state file {path}: {contents:?}")]
    Corrupt { path: PathBuf, contents: String },
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> StateError + '_ {
    move |source| StateError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Stores the id of the last processed event as decimal text.
///
/// Deleting the file before startup makes the daemon skip everything that
/// happened while it was down.
#[derive(Debug, Clone)]
pub struct EventIdStore {
    path: PathBuf,
}

impl EventIdStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `None` when the file does not exist or is empty.
    pub fn load(&self) -> Result<Option<i64>, StateError> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error(&self.path)(e)),
        };
        let trimmed = contents.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }
        trimmed
            .parse::<i64>()
            .map(Some)
            .map_err(|_| StateError::Corrupt {
                path: self.path.clone(),
                contents: trimmed.to_string(),
            })
    }

    /// Write the id through a temp file and rename, so a crash never leaves a
    /// half-written id behind.
    pub fn save(&self, event_id: i64) -> Result<(), StateError> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir).map_err(io_error(dir))?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_error(dir))?;
        write!(tmp, "{event_id}").map_err(io_error(tmp.path()))?;
        tmp.persist(&self.path)
            .map_err(|e| io_error(&self.path)(e.error))?;
        Ok(())
    }
}

/// Holds the daemon's process id on disk for as long as it lives.
///
/// Removing the file while the daemon runs asks it to stop cleanly after the
/// batch in progress.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Write the current process id to `path`.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self, StateError> {
        let path = path.into();
        if let Some(dir) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(io_error(dir))?;
        }
        std::fs::write(&path, std::process::id().to_string()).map_err(io_error(&path))?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// False once someone has removed the file.
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Read the process id recorded in a pid file.
    pub fn read(path: &Path) -> Result<u32, StateError> {
        let contents = std::fs::read_to_string(path).map_err(io_error(path))?;
        contents.trim().parse().map_err(|_| StateError::Corrupt {
            path: path.to_path_buf(),
            contents: contents.trim().to_string(),
        })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Failed to remove pid file"
                );
            }
        }
    }
}
