//! Data models representing database entities and wire payloads.

/// Provisioned access keys
pub mod access_key;
/// Outbound notification events
pub mod notification;
/// Orders and the order status state machine
pub mod order;
