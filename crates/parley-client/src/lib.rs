//! # parley-client
//!
//! Endpoint side of Parley: local mirrors of call and chat state, the
//! rules that reconcile them with relay events, and the REST and
//! WebSocket transports that carry commands to the server.
//!
//! Rendering is left to the embedding application. It feeds every
//! [`RelayEvent`](parley_shared::protocol::RelayEvent) into a
//! [`Controller`] and reads the resulting [`CallView`] and [`ChatView`].

pub mod api;
pub mod config;
pub mod connection;
pub mod controller;
pub mod error;
pub mod events;
pub mod signaling;
pub mod state;

pub use api::ApiClient;
pub use config::ClientConfig;
pub use connection::RelayConnection;
pub use controller::{CommandSink, Controller, Outcome};
pub use error::ClientError;
pub use state::{CallPhase, CallView, ChatView};
