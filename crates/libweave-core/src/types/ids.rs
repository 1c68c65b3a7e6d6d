use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identifier of a peer in the mesh (compared lexicographically for tie-breaks)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

/// Identifier of a node on the shared canvas
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

#[derive(Debug, Error)]
pub enum IdParseError {
    #[error("identifier must not be empty")]
    Empty,
    #[error("identifier contains whitespace: {0:?}")]
    Whitespace(String),
}

macro_rules! string_id {
    ($ty:ident) => {
        impl $ty {
            /// Wrap a string without validation
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Parse and validate an identifier
            pub fn parse(id: &str) -> Result<Self, IdParseError> {
                validate_id(id)?;
                Ok(Self(id.to_string()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $ty {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $ty {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id!(PeerId);
string_id!(NodeId);

fn validate_id(id: &str) -> Result<(), IdParseError> {
    if id.is_empty() {
        return Err(IdParseError::Empty);
    }
    if id.chars().any(char::is_whitespace) {
        return Err(IdParseError::Whitespace(id.to_string()));
    }
    Ok(())
}

/// Generate a random 64-bit peer ID, hex encoded
pub fn generate_peer_id() -> PeerId {
    let bytes: [u8; 8] = rand::thread_rng().gen();
    PeerId(hex::encode(bytes))
}

/// Generate a random 128-bit node ID, hex encoded
pub fn generate_node_id() -> NodeId {
    let bytes: [u8; 16] = rand::thread_rng().gen();
    NodeId(hex::encode(bytes))
}
