//! Typed identifiers for servers, clients, proxies and connections.
//!
//! Ids travel inside the envelope header with a `u16` length prefix, but are
//! capped at [`MAX_ID_LEN`] bytes so a header stays small and cheap to parse.

use crate::error::{RelayError, RelayResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum length of an id in bytes (UTF-8).
pub const MAX_ID_LEN: usize = 255;

/// Validate an id: non-empty, bounded, no control characters.
pub fn validate_id(kind: &str, value: &str) -> RelayResult<()> {
    if value.is_empty() {
        return Err(RelayError::InvalidId(format!("{kind} id is empty")));
    }
    if value.len() > MAX_ID_LEN {
        return Err(RelayError::InvalidId(format!(
            "{kind} id too long: {} bytes (max {MAX_ID_LEN})",
            value.len()
        )));
    }
    if value.chars().any(char::is_control) {
        return Err(RelayError::InvalidId(format!(
            "{kind} id contains control characters"
        )));
    }
    Ok(())
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> RelayResult<Self> {
                let value = value.into();
                validate_id($kind, &value)?;
                Ok(Self(value))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl TryFrom<String> for $name {
            type Error = RelayError;
            fn try_from(value: String) -> RelayResult<Self> {
                Self::new(value)
            }
        }

        impl TryFrom<&str> for $name {
            type Error = RelayError;
            fn try_from(value: &str) -> RelayResult<Self> {
                Self::new(value)
            }
        }

        impl std::str::FromStr for $name {
            type Err = RelayError;
            fn from_str(value: &str) -> RelayResult<Self> {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> String {
                id.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl std::borrow::Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }

        impl PartialEq<str> for $name {
            fn eq(&self, other: &str) -> bool {
                self.0 == other
            }
        }
    };
}

string_id!(
    /// On-premise server identity.
    ServerId,
    "server"
);
string_id!(
    /// Mobile client identity.
    ClientId,
    "client"
);
string_id!(
    /// Relay proxy identity. Ordering is the placement tie-break.
    ProxyId,
    "proxy"
);

/// Per-proxy connection handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_and_long() {
        assert!(ServerId::new("").is_err());
        assert!(ServerId::new("a".repeat(MAX_ID_LEN + 1)).is_err());
        assert!(ServerId::new("a".repeat(MAX_ID_LEN)).is_ok());
    }

    #[test]
    fn rejects_control_chars() {
        assert!(ClientId::new("bad\nid").is_err());
        assert!(ClientId::new("phone-42").is_ok());
    }

    #[test]
    fn proxy_ids_order_lexicographically() {
        let mut ids = vec![
            ProxyId::new("proxy-2").unwrap(),
            ProxyId::new("proxy-1").unwrap(),
            ProxyId::new("proxy-10").unwrap(),
        ];
        ids.sort();
        let names: Vec<&str> = ids.iter().map(ProxyId::as_str).collect();
        assert_eq!(names, vec!["proxy-1", "proxy-10", "proxy-2"]);
    }

    #[test]
    fn serde_validates() {
        let mut buf = Vec::new();
        ciborium::into_writer(&"", &mut buf).unwrap();
        let parsed: Result<ServerId, _> = ciborium::from_reader(&buf[..]);
        assert!(parsed.is_err());
    }
}
