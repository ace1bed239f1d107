//! Core identifier types shared across the bridge.
//!
//! Sessions are named by two independent opaque identifiers, both minted by
//! the hub: a [`SessionId`] (stable for the session's lifetime) and a
//! [`RouteKey`] (the addressing token carried inside data packets). The
//! bridge never generates either; it only stores and resolves them.

use serde_json::Value;

/// Metadata exchanged with framed-app children and the hub.
///
/// A JSON object with a required `"type"` string field; remaining fields
/// depend on the type.
pub type Meta = serde_json::Map<String, Value>;

/// Stable, hub-assigned identifier naming a session.
#[derive(Debug, Clone, Default, Hash, Eq, PartialEq)]
pub struct SessionId(pub String);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Addressing token used inside session-data packets.
///
/// One-to-one with a [`SessionId`] while the session exists; both dissolve
/// together on close.
#[derive(Debug, Clone, Default, Hash, Eq, PartialEq)]
pub struct RouteKey(pub String);

impl std::fmt::Display for RouteKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for RouteKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for RouteKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for RouteKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
