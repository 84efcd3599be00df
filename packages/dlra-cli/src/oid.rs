// Git object id handling
use crate::error::{Error, Result};
use std::fmt;
use std::str::FromStr;

/// Tree id of the empty tree, exported to reset a backend's export state
pub const EMPTY_TREE: &str = "4b825dc642cb6eb9a060e54bf8d69288fbee4904";

/// Git object id (SHA-1 or SHA-256) in its raw byte form
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectId(Vec<u8>);

impl ObjectId {
    /// Parse the first line of command output as an object id
    pub fn from_output(output: &str) -> Result<Self> {
        Self::from_str(output.lines().next().unwrap_or("").trim())
    }

    /// Get hex string representation
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    /// Get the id as bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for ObjectId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.len() != 40 && s.len() != 64 {
            return Err(Error::Protocol(format!(
                "invalid object id length: expected 40 or 64 hex chars, got {}",
                s.len()
            )));
        }

        let bytes =
            hex::decode(s).map_err(|e| Error::Protocol(format!("invalid object id {s:?}: {e}")))?;

        Ok(ObjectId(bytes))
    }
}
