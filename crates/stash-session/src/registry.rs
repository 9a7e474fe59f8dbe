//! Registry of running account session tasks, one per front-channel user.
//!
//! The registry is the only shared mutable state between the handshake and
//! logout flows; register/remove are atomic under one lock so the
//! single-active-session invariant holds under concurrent attempts.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::warn;

use stash_account::credential_state_path;
use stash_core::current_unix_timestamp_ms;

/// Owning handle to one spawned account session task.
#[derive(Debug)]
pub struct SessionHandle {
    cancel_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
    started_unix_ms: u64,
}

impl SessionHandle {
    pub(crate) fn new(cancel_tx: watch::Sender<bool>, task: JoinHandle<()>) -> Self {
        Self {
            cancel_tx,
            task,
            started_unix_ms: current_unix_timestamp_ms(),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub fn started_unix_ms(&self) -> u64 {
        self.started_unix_ms
    }

    /// Signals cooperative cancellation. The task disconnects and unwinds at
    /// its next suspension point.
    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }

    /// Waits up to `grace` for the task to terminate. Returns true when it
    /// terminated within the grace period.
    pub async fn await_termination(self, grace: Duration) -> bool {
        tokio::time::timeout(grace, self.task).await.is_ok()
    }
}

/// Result of a registration attempt.
///
/// Rejection hands the offered handle back so the caller can cancel the
/// task it just spawned without touching the registry again.
#[derive(Debug)]
pub enum RegisterOutcome {
    Accepted,
    Rejected(SessionHandle),
}

impl RegisterOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Report from `cancel_and_remove`.
pub struct CancelReport {
    pub was_registered: bool,
    pub terminated_within_grace: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Report from `logout`: cancellation plus credential-state cleanup.
pub struct LogoutReport {
    pub was_registered: bool,
    pub terminated_within_grace: bool,
    pub credential_file_removed: bool,
    pub credential_file_error: Option<String>,
}

/// Concurrent map from front-channel user id to its running session task.
#[derive(Debug)]
pub struct SessionRegistry {
    sessions_dir: PathBuf,
    entries: Mutex<HashMap<i64, SessionHandle>>,
}

impl SessionRegistry {
    pub fn new(sessions_dir: impl Into<PathBuf>) -> Self {
        Self {
            sessions_dir: sessions_dir.into(),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn sessions_dir(&self) -> &Path {
        &self.sessions_dir
    }

    /// Registers `handle` for `user_id`. Rejected when a non-terminal entry
    /// already exists; a finished entry is replaced.
    pub fn register(&self, user_id: i64, handle: SessionHandle) -> RegisterOutcome {
        let Ok(mut entries) = self.entries.lock() else {
            warn!("session registry lock poisoned; rejecting registration for {user_id}");
            return RegisterOutcome::Rejected(handle);
        };
        match entries.entry(user_id) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_finished() {
                    occupied.insert(handle);
                    RegisterOutcome::Accepted
                } else {
                    RegisterOutcome::Rejected(handle)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(handle);
                RegisterOutcome::Accepted
            }
        }
    }

    /// True when a non-terminal session task is registered for `user_id`.
    pub fn is_active(&self, user_id: i64) -> bool {
        self.entries
            .lock()
            .map(|entries| {
                entries
                    .get(&user_id)
                    .map(|handle| !handle.is_finished())
                    .unwrap_or(false)
            })
            .unwrap_or(false)
    }

    /// Removes and returns the entry for `user_id` without cancelling it.
    pub fn remove(&self, user_id: i64) -> Option<SessionHandle> {
        self.entries
            .lock()
            .ok()
            .and_then(|mut entries| entries.remove(&user_id))
    }

    /// Cancels the entry for `user_id`, waits up to `grace` for termination,
    /// and removes it regardless of whether the wait completed.
    pub async fn cancel_and_remove(&self, user_id: i64, grace: Duration) -> CancelReport {
        let Some(handle) = self.remove(user_id) else {
            return CancelReport {
                was_registered: false,
                terminated_within_grace: false,
            };
        };
        handle.cancel();
        let terminated = handle.await_termination(grace).await;
        if !terminated {
            warn!("session task for user {user_id} did not terminate within the grace period");
        }
        CancelReport {
            was_registered: true,
            terminated_within_grace: terminated,
        }
    }

    /// Logout cleanup: cancel + remove, then delete the user's durable
    /// credential-state file. A missing file is not an error; a filesystem
    /// error is reported but the entry stays removed.
    pub async fn logout(&self, user_id: i64, grace: Duration) -> LogoutReport {
        let cancel = self.cancel_and_remove(user_id, grace).await;
        let credential_path = credential_state_path(&self.sessions_dir, user_id);
        let (credential_file_removed, credential_file_error) =
            match std::fs::remove_file(&credential_path) {
                Ok(()) => (true, None),
                Err(error) if error.kind() == std::io::ErrorKind::NotFound => (false, None),
                Err(error) => {
                    warn!(
                        "failed to remove credential state {}: {error}",
                        credential_path.display()
                    );
                    (false, Some(error.to_string()))
                }
            };
        LogoutReport {
            was_registered: cancel.was_registered,
            terminated_within_grace: cancel.terminated_within_grace,
            credential_file_removed,
            credential_file_error,
        }
    }
}
