//! Common types used throughout LanVault.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident, $what:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap an existing identifier.
            ///
            /// # Errors
            /// - Returns error if `id` is empty
            pub fn new(id: impl Into<String>) -> crate::Result<Self> {
                let id = id.into();
                if id.trim().is_empty() {
                    return Err(crate::Error::InvalidInput(
                        concat!($what, " cannot be empty").to_string(),
                    ));
                }
                Ok(Self(id))
            }

            /// Mint a fresh random identifier.
            pub fn generate() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            /// Get the inner string value.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

string_id!(
    /// Identifier of a paired sender, minted when a registration is confirmed.
    SessionId,
    "Session id"
);

string_id!(
    /// Per-file handle minted when a transfer batch is accepted.
    TransmissionId,
    "Transmission id"
);

string_id!(
    /// Application-level file id chosen by the sender.
    FileId,
    "File id"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_creation() {
        let id = SessionId::new("abc").unwrap();
        assert_eq!(id.as_str(), "abc");
    }

    #[test]
    fn test_empty_ids_fail() {
        assert!(SessionId::new("").is_err());
        assert!(TransmissionId::new("   ").is_err());
        assert!(FileId::new("").is_err());
    }

    #[test]
    fn test_generated_ids_are_distinct() {
        assert_ne!(TransmissionId::generate(), TransmissionId::generate());
    }

    #[test]
    fn test_id_serializes_as_plain_string() {
        let id = FileId::new("file-1").unwrap();
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"file-1\"");
    }
}
