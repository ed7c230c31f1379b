//! Business logic services.
//!
//! Services contain the order lifecycle separated from HTTP handlers and the
//! scheduler. They talk to the store, the key server and the chat gateway.

pub mod expiration;
pub mod lifecycle;
pub mod notification_service;
pub mod provisioning;
