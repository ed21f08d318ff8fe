//! Session broker and HTTPS control plane.
//!
//! This crate pairs exactly one input stream with exactly one output stream
//! into a shell session, exposes the pairing over a small HTTPS handler set,
//! and serves everything from a TLS listener whose public-key fingerprint is
//! the only secret the target needs.

pub mod addr;
pub mod broker;
mod error;
pub mod events;
mod http;
pub mod server;

pub use broker::Broker;
pub use error::{ServerError, ServerResult};
pub use http::DEFAULT_TEMPLATE;
pub use server::{Server, ServerConfig};
