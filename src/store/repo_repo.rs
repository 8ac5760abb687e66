//! Repo repository: managed git repositories.

use std::sync::Arc;

use sqlx::FromRow;

use crate::{AppError, Result};

use super::db::Database;
use super::models::Repo;

#[derive(FromRow)]
struct RepoRow {
    name: String,
    url: String,
    host: String,
    owner: String,
    repo: String,
    bare_path: String,
    base_worktree_path: String,
    default_branch: String,
}

impl From<RepoRow> for Repo {
    fn from(row: RepoRow) -> Self {
        Self {
            name: row.name,
            url: row.url,
            host: row.host,
            owner: row.owner,
            repo: row.repo,
            bare_path: row.bare_path,
            base_worktree_path: row.base_worktree_path,
            default_branch: row.default_branch,
        }
    }
}

/// Repository wrapper around `SQLite` for managed repos.
#[derive(Clone)]
pub struct RepoRepo {
    db: Arc<Database>,
}

impl RepoRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert or update a repo record, keyed on `name`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the write fails.
    pub async fn upsert(&self, repo: &Repo) -> Result<()> {
        sqlx::query(
            "INSERT INTO repos (name, url, host, owner, repo, bare_path, base_worktree_path, default_branch)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(name) DO UPDATE SET
                url = excluded.url, host = excluded.host, owner = excluded.owner,
                repo = excluded.repo, bare_path = excluded.bare_path,
                base_worktree_path = excluded.base_worktree_path,
                default_branch = excluded.default_branch",
        )
        .bind(&repo.name)
        .bind(&repo.url)
        .bind(&repo.host)
        .bind(&repo.owner)
        .bind(&repo.repo)
        .bind(&repo.bare_path)
        .bind(&repo.base_worktree_path)
        .bind(&repo.default_branch)
        .execute(self.db.as_ref())
        .await?;
        Ok(())
    }

    /// List every managed repo, ordered by name.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list(&self) -> Result<Vec<Repo>> {
        let rows: Vec<RepoRow> = sqlx::query_as("SELECT * FROM repos ORDER BY name")
            .fetch_all(self.db.as_ref())
            .await?;
        Ok(rows.into_iter().map(Repo::from).collect())
    }

    /// Fetch a repo by its `"owner/repo"` name.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get_by_name(&self, name: &str) -> Result<Option<Repo>> {
        let row: Option<RepoRow> = sqlx::query_as("SELECT * FROM repos WHERE name = ?1")
            .bind(name)
            .fetch_optional(self.db.as_ref())
            .await?;
        Ok(row.map(Repo::from))
    }

    /// Fetch a repo by name, erroring if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if no such repo is registered.
    pub async fn require_by_name(&self, name: &str) -> Result<Repo> {
        self.get_by_name(name)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("repo {name} not found")))
    }
}
