//! Process-wide active-run registry: one entry per session with an
//! in-flight run, guarded by a single lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

use crate::{AppError, Result};

/// The single active run tracked for a session.
#[derive(Clone)]
pub struct ActiveRun {
    /// The run this entry tracks.
    pub run_id: String,
    /// Fired to request cancellation; observed by the process runner.
    pub cancel: CancellationToken,
}

/// `session_id -> ActiveRun` map. Inserted on run start, removed on run end.
#[derive(Clone, Default)]
pub struct ActiveRunRegistry {
    inner: Arc<Mutex<HashMap<String, ActiveRun>>>,
}

impl ActiveRunRegistry {
    /// Build an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a newly started run, returning its cancellation token.
    #[must_use]
    pub fn register(&self, session_id: &str, run_id: &str) -> CancellationToken {
        let cancel = CancellationToken::new();
        let entry = ActiveRun {
            run_id: run_id.to_string(),
            cancel: cancel.clone(),
        };
        let mut guard = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        guard.insert(session_id.to_string(), entry);
        cancel
    }

    /// Remove the tracked run for a session once it has finished.
    pub fn clear(&self, session_id: &str) {
        let mut guard = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        guard.remove(session_id);
    }

    /// Fetch the active run entry for a session, if any.
    #[must_use]
    pub fn get(&self, session_id: &str) -> Option<ActiveRun> {
        let guard = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        guard.get(session_id).cloned()
    }

    /// Cancel the active run for a session, if its run id matches
    /// `expected_run_id` (the session's latest run per storage). Fires the
    /// cancellation token; the caller is responsible for recording a
    /// `cancel_requested` event.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if no run is active for the session, or
    /// `AppError::Conflict` if the active run is not the latest one.
    pub fn cancel_latest(&self, session_id: &str, expected_run_id: &str) -> Result<()> {
        let entry = self
            .get(session_id)
            .ok_or_else(|| AppError::NotFound(format!("no active run for session {session_id}")))?;

        if entry.run_id != expected_run_id {
            return Err(AppError::Conflict(format!(
                "active run {} is not the latest run {expected_run_id}",
                entry.run_id
            )));
        }

        entry.cancel.cancel();
        Ok(())
    }
}
