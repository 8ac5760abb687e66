//! The cloud relay: a multi-tenant Slack bot that pairs Slack users to their
//! own `fogd` instances and ferries work between them over a job queue.
//!
//! This module underlies the `fogcloud` binary. It never talks to git, a
//! tool adapter, or a worktree directly — all of that stays on the paired
//! device. The cloud side only brokers installations, pairings, and jobs.

pub mod command;
pub mod db;
pub mod device_repo;
pub mod event_repo;
pub mod installation_repo;
pub mod job_repo;
pub mod models;
pub mod pairing_repo;
pub mod schema;
pub mod server;
pub mod sig;
pub mod thread_repo;

use std::sync::Arc;

use db::Database;
use device_repo::DeviceRepo;
use event_repo::EventRepo;
use installation_repo::InstallationRepo;
use job_repo::JobRepo;
use pairing_repo::PairingRepo;
use thread_repo::ThreadRepo;

/// Bundles every cloud repository behind one shared connection pool, mirroring
/// [`crate::store::Store`] on the local-daemon side.
#[derive(Clone)]
pub struct CloudStore {
    pub installations: InstallationRepo,
    pub devices: DeviceRepo,
    pub pairings: PairingRepo,
    pub threads: ThreadRepo,
    pub events: EventRepo,
    pub jobs: JobRepo,
}

impl CloudStore {
    /// Bundle repositories around an already-connected pool.
    #[must_use]
    pub fn new(db: Database) -> Self {
        let db = Arc::new(db);
        Self {
            installations: InstallationRepo::new(db.clone()),
            devices: DeviceRepo::new(db.clone()),
            pairings: PairingRepo::new(db.clone()),
            threads: ThreadRepo::new(db.clone()),
            events: EventRepo::new(db.clone()),
            jobs: JobRepo::new(db),
        }
    }

    /// Open (and migrate) a file-backed cloud database.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the connection or schema bootstrap fails.
    pub async fn open(path: &std::path::Path) -> crate::Result<Self> {
        Ok(Self::new(db::connect(path).await?))
    }

    /// Open an in-memory cloud database, primarily for tests.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the connection or schema bootstrap fails.
    pub async fn open_memory() -> crate::Result<Self> {
        Ok(Self::new(db::connect_memory().await?))
    }
}
