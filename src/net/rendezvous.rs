// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Out-of-band rendezvous store
//!
//! The accepting side of a connection publishes its reachable address under
//! a key derived from the participant names and its rank; the requesting
//! side polls the same key. The store is a plain key-value abstraction so
//! that the directory of address files can be replaced by an in-memory map
//! when all ranks live in one process.

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{ComError, ComResult};

/// Key under which `acceptor_rank` of `acceptor` publishes its address for `requester`
pub fn address_key(acceptor: &str, requester: &str, acceptor_rank: i32) -> String {
    format!("{}-{}_{}.address", acceptor, requester, acceptor_rank)
}

/// Suffix that sets the master channel of a participant apart from its per-rank channels
const MASTER_CHANNEL_SUFFIX: &str = ".master";

/// Requester name used by the master channel of `participant`
pub fn master_channel_name(participant: &str) -> String {
    format!("{}{}", participant, MASTER_CHANNEL_SUFFIX)
}

/// Participant behind a requester name, with or without the master suffix
pub fn participant_name(requester: &str) -> &str {
    requester
        .strip_suffix(MASTER_CHANNEL_SUFFIX)
        .unwrap_or(requester)
}

/// Key under which `rank` of `local` asks its master for the size of `remote`
pub fn layout_request_key(local: &str, remote: &str, rank: i32) -> String {
    format!("{}-{}_{}.layout-request", local, remote, rank)
}

/// Key under which the master of `local` answers the request of `rank`
pub fn layout_key(local: &str, remote: &str, rank: i32) -> String {
    format!("{}-{}_{}.layout", local, remote, rank)
}

/// Key-value store shared by all ranks taking part in a rendezvous
pub trait RendezvousStore: Send + Sync + std::fmt::Debug {
    /// Store `value` under `key`, replacing any previous value
    fn publish(&self, key: &str, value: &str) -> ComResult<()>;

    /// Read the value under `key`, `None` while nothing has been published
    fn lookup(&self, key: &str) -> ComResult<Option<String>>;

    /// Remove `key`; removing a missing key is not an error
    fn remove(&self, key: &str) -> ComResult<()>;
}

/// Rendezvous through a directory of small text files
///
/// The directory must be visible to every process of both participants,
/// typically a shared file system or the working directory of a local run.
#[derive(Debug, Clone)]
pub struct FileRendezvous {
    directory: PathBuf,
}

impl FileRendezvous {
    /// Use `directory` for address files, creating it when missing
    ///
    /// An empty path means the current working directory.
    pub fn new(directory: impl AsRef<Path>) -> ComResult<Self> {
        let directory = directory.as_ref();
        let directory = if directory.as_os_str().is_empty() {
            PathBuf::from(".")
        } else {
            directory.to_path_buf()
        };

        fs::create_dir_all(&directory).map_err(|e| {
            ComError::Configuration(format!(
                "address directory {} cannot be created: {}",
                directory.display(),
                e
            ))
        })?;
        if !directory.is_dir() {
            return Err(ComError::Configuration(format!(
                "address directory {} is not a directory",
                directory.display()
            )));
        }

        Ok(Self { directory })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Path of the file holding `key`
    pub fn path_for(&self, key: &str) -> PathBuf {
        self.directory.join(key)
    }
}

impl RendezvousStore for FileRendezvous {
    fn publish(&self, key: &str, value: &str) -> ComResult<()> {
        let path = self.path_for(key);
        // Readers must never observe a half-written entry.
        let staging = self.path_for(&format!("{}~", key));
        fs::write(&staging, value)
            .and_then(|_| fs::rename(&staging, &path))
            .map_err(|e| {
                ComError::Configuration(format!(
                    "cannot write rendezvous entry {}: {}",
                    path.display(),
                    e
                ))
            })?;
        log::debug!("Published {} -> {}", path.display(), value);
        Ok(())
    }

    fn lookup(&self, key: &str) -> ComResult<Option<String>> {
        let path = self.path_for(key);
        match fs::read_to_string(&path) {
            Ok(content) => {
                let content = content.trim();
                if content.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(content.to_string()))
                }
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ComError::Configuration(format!(
                "cannot read rendezvous entry {}: {}",
                path.display(),
                e
            ))),
        }
    }

    fn remove(&self, key: &str) -> ComResult<()> {
        let path = self.path_for(key);
        match fs::remove_file(&path) {
            Ok(()) => {
                log::debug!("Removed {}", path.display());
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ComError::Configuration(format!(
                "cannot remove rendezvous entry {}: {}",
                path.display(),
                e
            ))),
        }
    }
}

/// Rendezvous through a map shared by ranks running as threads of one process
#[derive(Debug, Default)]
pub struct MemoryRendezvous {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryRendezvous {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries currently published
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RendezvousStore for MemoryRendezvous {
    fn publish(&self, key: &str, value: &str) -> ComResult<()> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn lookup(&self, key: &str) -> ComResult<Option<String>> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(entries.get(key).cloned())
    }

    fn remove(&self, key: &str) -> ComResult<()> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(key);
        Ok(())
    }
}
