//! PIME Launcher Common Library
//!
//! This crate provides the shared building blocks used by both the launcher
//! broker and the text-service clients that connect to it. It includes:
//!
//! - Well-known endpoint names and protocol constants
//! - Per-user endpoint identity derivation and platform endpoints
//!   (Unix domain sockets, Windows named pipes)
//! - The wire protocol: one UTF-8 JSON message per read, decoded into a
//!   strict tagged variant type
//! - The endpoint access-control policy
//!
//! # Features
//!
//! - **Cross-platform IPC**: Unified interface for Unix domain sockets and Windows named pipes
//! - **Per-user isolation**: Two OS users never derive the same endpoint path
//! - **Strict protocol decode**: Malformed input is an explicit variant, not a fall-through

/// Well-known names and protocol constants
pub mod config;

/// Endpoint identity derivation and platform listener/stream implementations
pub mod endpoint;

/// Wire protocol decode and single-buffered-read framing
pub mod protocol;

/// Access-control policy applied to the listening endpoint
pub mod security;

// Re-export commonly used types for convenience
pub use config::{ENDPOINT_NAMESPACE, LAUNCHER_SERVICE_NAME, MESSAGE_BUFFER_SIZE};
pub use endpoint::{EndpointError, EndpointListener, EndpointStream};
pub use protocol::ClientMessage;
pub use security::SecurityPolicy;
