//! proxbox-serve - HTTP/WebSocket Server
//!
//! Exposes the Proxbox sync engine over WebSocket control sessions plus a
//! small JSON API for health and configuration inspection.

#![warn(missing_docs)]
#![warn(unused_extern_crates)]

/// Application configuration
pub mod config;

/// API error types
pub mod error;

/// WebSocket control commands
pub mod command;

/// WebSocket control sessions
pub mod websocket;

/// HTTP request handlers
pub mod handlers;

/// Server instance management
pub mod server;

pub use command::{Command, CommandSet};
pub use config::AppConfig;
pub use error::{ApiError, ApiResult};
pub use handlers::AppState;
pub use server::ProxboxServer;
