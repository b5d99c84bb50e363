//! # chatsync-store
//!
//! Local persistence for the sync engine, backed by SQLite.
//!
//! Two things survive a restart: the outbox (so unsent messages are retried
//! after the app comes back) and the confirmed part of each conversation's
//! message window (so a conversation can be shown while the hosted store is
//! unreachable). The crate exposes a synchronous [`Database`] handle that
//! wraps a `rusqlite::Connection` and provides typed helpers for both.

pub mod database;
pub mod messages;
pub mod migrations;
pub mod outbox;

mod error;

pub use database::Database;
pub use error::{Result, StoreError};
