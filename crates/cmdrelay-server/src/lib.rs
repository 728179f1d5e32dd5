//! `cmdrelay` HTTP server.
//!
//! Wires the core gateway into a running Axum server: environment
//! configuration, token auth, JSON routes and error mapping.

pub mod config;
pub mod error;
pub mod middleware;
pub mod routes;
pub mod state;
