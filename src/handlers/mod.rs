//! HTTP request handlers (route handlers).
//!
//! The chat gateway is the only client. Handlers translate its calls into
//! lifecycle engine operations and return plain data; wording and buttons
//! are the gateway's job.

/// Service health
pub mod health;
/// Operator approvals, renewals and migrations
pub mod operator;
/// Ordering flow
pub mod orders;
/// Owner profile view
pub mod owners;
