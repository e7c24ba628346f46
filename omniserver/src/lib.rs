//! # omniserver - Embedded HTTP server for the casting stack
//!
//! A thin, ergonomic wrapper around Axum used by the registry to expose
//! registered media payloads to devices on the local network.
//!
//! The API is deliberately small: build a [`Server`], attach handlers or
//! whole routers, then call [`Server::start`]. The TCP listener is bound
//! before the serve task is spawned, so a port conflict is reported as a
//! [`ServerError`] instead of killing a background task.

pub mod server;

pub use server::{Server, ServerError, ServerInfo};
