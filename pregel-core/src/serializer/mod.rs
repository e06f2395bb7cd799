//! Serialization of queue payloads.
//!
//! # Features:
//! - **Serializable Trait**: A shorthand trait that encapsulates common
//!   serialization and deserialization behaviors for payloads crossing a queue.
//! - **Serializer Enum**: Serializes and deserializes binary data in one of the
//!   supported formats.
//!
//! Vertex results, messages and globals are free-form [`serde_json::Value`]s,
//! so only self-describing formats are offered.
//!
//! # Examples
//!
//! ```rust
//! use pregel::serializer::Serializer;
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Report {
//!    active: u64,
//! }
//!
//! let report = Report { active: 3 };
//! let bytes = Serializer::Cbor.to_bytes(&report).unwrap();
//! let report: Report = Serializer::Cbor.from_bytes(&bytes).unwrap();
//! assert_eq!(report.active, 3);
//! ```

use anyhow::Result;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::instrument;

use crate::config::{self, Config};

/// Represents a shorthand for common serialization and deserialization
/// behaviors.
pub trait Serializable: Serialize + DeserializeOwned + Send + Sync + Unpin + 'static {}
impl<T> Serializable for T where T: Serialize + DeserializeOwned + Send + Sync + Unpin + 'static {}

#[derive(Clone, Copy, Serialize, Deserialize, Debug, Default, PartialEq, Eq)]
pub enum Serializer {
    #[default]
    Cbor,
    Json,
}

impl std::fmt::Display for Serializer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cbor => write!(f, "cbor"),
            Self::Json => write!(f, "json"),
        }
    }
}

impl Serializer {
    #[instrument(skip(value), level = "trace")]
    pub fn to_bytes<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        match self {
            Self::Cbor => {
                let mut result = Vec::new();
                ciborium::into_writer(value, &mut result)?;
                Ok(result)
            }
            Self::Json => Ok(serde_json::to_vec(value)?),
        }
    }

    #[instrument(skip(bytes), level = "trace")]
    pub fn from_bytes<T: for<'a> Deserialize<'a>>(&self, bytes: &[u8]) -> Result<T> {
        match self {
            Self::Cbor => Ok(ciborium::from_reader(bytes)?),
            Self::Json => Ok(serde_json::from_slice(bytes)?),
        }
    }
}

impl From<&Config> for Serializer {
    fn from(config: &Config) -> Self {
        match config.serializer {
            config::Serializer::Cbor => Self::Cbor,
            config::Serializer::Json => Self::Json,
        }
    }
}

#[cfg(test)]
mod test {
    use serde_json::{json, Value};

    use super::*;

    #[test]
    fn json_values_survive_both_formats() {
        let value = json!({"rank": 0.25, "label": "1", "path": [1, 2, 3], "none": null});

        for serializer in [Serializer::Cbor, Serializer::Json] {
            let bytes = serializer.to_bytes(&value).unwrap();
            let decoded: Value = serializer.from_bytes(&bytes).unwrap();
            assert_eq!(decoded, value, "{serializer}");
        }
    }
}
