#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]

//! hookgate library: the device gateway's building blocks.
//!
//! - `registry` / `session`: one live WebSocket session per device
//! - `protocol`: the device wire format
//! - `events` / `matcher`: inbound events matched against forwarding rules
//! - `delivery`: durable webhook queue with bounded retry
//! - `outbound`: send-SMS commands to devices
//! - `store`: account, device, rule and log collaborators
//! - `routes` / `auth`: HTTP surface

pub mod auth;
pub mod config;
pub mod delivery;
pub mod error;
pub mod events;
pub mod matcher;
pub mod models;
pub mod outbound;
pub mod protocol;
pub mod registry;
pub mod routes;
pub mod session;
pub mod state;
pub mod store;

// Re-export key types at crate root for convenience.
pub use config::Config;
pub use delivery::DeliveryQueue;
pub use registry::SessionRegistry;
pub use state::AppState;
