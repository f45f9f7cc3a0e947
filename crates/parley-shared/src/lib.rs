//! # parley-shared
//!
//! Types shared by the Parley server, store and client: entity ids,
//! domain records, the realtime wire protocol, the error taxonomy
//! carried back to endpoints, and signed session tokens.

pub mod constants;
pub mod error;
pub mod models;
pub mod protocol;
pub mod token;
pub mod types;
