//! # pairline-store
//!
//! Server-side persistence for Pairline, backed by SQLite.
//!
//! Holds the safety state (trust records, bans, reports) and the backing data
//! of the match queue.  The crate exposes a synchronous `Database` handle
//! that wraps a `rusqlite::Connection` and provides typed helpers for every
//! domain model.

pub mod database;
pub mod migrations;
pub mod models;
pub mod queue;
pub mod trust;

mod error;

pub use database::{Database, Location};
pub use error::{Result, StoreError};
pub use models::*;
