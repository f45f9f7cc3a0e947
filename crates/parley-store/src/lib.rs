//! # parley-store
//!
//! SQLite-backed document store for Parley: users and their saved
//! contacts, chats, messages with their read receipts and reactions, calls
//! and call logs.
//!
//! The crate exposes a synchronous [`Database`] handle wrapping a
//! `rusqlite::Connection` with typed helpers for every record. It performs
//! no authorization and enforces no state machine; the server's managers
//! are the only writers.

pub mod calls;
pub mod chats;
pub mod contacts;
pub mod database;
pub mod messages;
pub mod migrations;
pub mod reactions;
pub mod users;

mod error;
mod rows;

pub use database::Database;
pub use error::{Result, StoreError};
pub use parley_shared::models::*;
