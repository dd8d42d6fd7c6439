//! Durable queue of operations that could not be dispatched.
//!
//! # Layout
//!
//! ```text
//! <dir>/<sequence:020>.<uuid>.json
//! ```
//!
//! The zero-padded sequence prefix gives FIFO order by file name. The uuid
//! suffix makes every freeze write a distinct file, so draining removes
//! exactly the file it replayed even if the same operation is frozen again
//! while the drain is still running.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::StoreError;
use crate::request::OperationRequest;
use crate::store_io;

/// Durable projection of an operation awaiting replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrozenOperation {
    pub sequence: u64,
    pub request: OperationRequest,
    pub frozen_at: DateTime<Utc>,
}

/// Append-only store of frozen operations. Cheap to clone.
#[derive(Debug, Clone)]
pub struct FreezeStore {
    dir: PathBuf,
}

impl FreezeStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persist `request` under `sequence`. Returns the file written.
    pub fn freeze(&self, sequence: u64, request: &OperationRequest) -> Result<PathBuf, StoreError> {
        let frozen = FrozenOperation {
            sequence,
            request: request.clone(),
            frozen_at: Utc::now(),
        };
        let path = self
            .dir
            .join(format!("{sequence:020}.{}.json", Uuid::new_v4().simple()));
        store_io::write_atomic(&path, &serde_json::to_vec(&frozen)?)?;
        info!(sequence, url = %request.url, method = %request.method, "froze operation");
        Ok(path)
    }

    /// Withdraw one frozen operation by the file `freeze` returned.
    pub fn discard(&self, path: &Path) -> Result<(), StoreError> {
        match fs::remove_file(path) {
            Ok(()) => {
                info!(path = %path.display(), "discarded frozen operation");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io(path, e)),
        }
    }

    /// Every pending operation in submission order, with its file.
    fn entries(&self) -> Result<Vec<(PathBuf, FrozenOperation)>, StoreError> {
        let listing = fs::read_dir(&self.dir).map_err(|e| StoreError::io(&self.dir, e))?;
        let mut paths: Vec<PathBuf> = listing
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|x| x.to_str()) == Some("json"))
            .collect();
        paths.sort();

        let mut out = Vec::with_capacity(paths.len());
        for path in paths {
            let parsed = fs::read(&path)
                .map_err(|e| e.to_string())
                .and_then(|bytes| {
                    serde_json::from_slice::<FrozenOperation>(&bytes).map_err(|e| e.to_string())
                });
            match parsed {
                Ok(op) => out.push((path, op)),
                Err(reason) => warn!(path = %path.display(), %reason, "skipping unreadable frozen operation"),
            }
        }
        out.sort_by_key(|(_, op)| op.sequence);
        Ok(out)
    }

    /// Pending operations in submission order.
    pub fn pending(&self) -> Result<Vec<FrozenOperation>, StoreError> {
        Ok(self.entries()?.into_iter().map(|(_, op)| op).collect())
    }

    /// Hand each pending operation to `accept` in submission order. An
    /// operation is deleted only after `accept` returns `Ok`; the first
    /// refusal stops the drain and leaves it and everything after it queued.
    /// Returns how many operations were accepted.
    pub fn drain<F, E>(&self, mut accept: F) -> Result<usize, StoreError>
    where
        F: FnMut(FrozenOperation) -> Result<(), E>,
        E: std::fmt::Display,
    {
        let mut accepted = 0;
        for (path, op) in self.entries()? {
            let sequence = op.sequence;
            if let Err(err) = accept(op) {
                warn!(sequence, error = %err, "replay refused; leaving remaining operations frozen");
                break;
            }
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(StoreError::io(path, e)),
            }
            accepted += 1;
        }
        if accepted > 0 {
            info!(accepted, "thawed frozen operations");
        }
        Ok(accepted)
    }

    pub fn len(&self) -> usize {
        self.entries().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// One past the highest stored sequence number, or 1 when empty.
    pub fn next_sequence(&self) -> u64 {
        self.entries()
            .ok()
            .and_then(|e| e.last().map(|(_, op)| op.sequence + 1))
            .unwrap_or(1)
    }
}
