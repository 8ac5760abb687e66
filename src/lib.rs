#![forbid(unsafe_code)]

//! `fog` — local agent runner daemon core.
//!
//! This crate implements the session/run execution engine that drives
//! external AI coding tools against managed git worktrees, the SQLite-backed
//! persistence layer for both the local daemon and the Slack-facing cloud
//! relay, and the HTTP surfaces for each. See the two binaries in this
//! package: `fogd` (local daemon) and `fogcloud` (cloud relay server).

pub mod cloud;
pub mod config;
pub mod crypto;
pub mod engine;
pub mod errors;
pub mod git;
pub mod http;
pub mod process;
pub mod relay;
pub mod store;
pub mod tool;

pub use errors::{AppError, Result};
