//! Topic naming conventions.
//!
//! Logical topics are underscore-separated (`tenant_settingsupdated`).
//! Exchange and STOMP brokers route on dot-separated keys
//! (`tenant.settingsupdated`). Publishers translate underscore → dot,
//! monitors translate dot → underscore.

/// Translate a logical topic into a dot routing key.
///
/// ```
/// use sourced_dispatch::routing::to_dot_routing;
///
/// assert_eq!(to_dot_routing("tenant_settingsupdated"), "tenant.settingsupdated");
/// ```
pub fn to_dot_routing(topic: &str) -> String {
    topic.replace('_', ".")
}

/// Translate a dot routing key back into a logical topic.
///
/// ```
/// use sourced_dispatch::routing::to_underscore_routing;
///
/// assert_eq!(to_underscore_routing("tenant.added"), "tenant_added");
/// ```
pub fn to_underscore_routing(routing_key: &str) -> String {
    routing_key.replace('.', "_")
}
