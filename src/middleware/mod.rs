//! HTTP middleware components.
//!
//! Middleware run before route handlers. They authenticate the gateway and
//! reject operator-only calls from anyone else.

/// Gateway token and operator checks
pub mod auth;
