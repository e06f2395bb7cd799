use std::{fmt, str::FromStr};

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Upper bound (exclusive) for generated execution identifiers.
///
/// Identifiers end up in collection names, so they are kept short.
const EXECUTION_ID_BOUND: u64 = 1 << 48;

/// Identifies one execution across the conductor and every worker.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(pub u64);

impl ExecutionId {
    pub fn random() -> Self {
        Self(rand::thread_rng().gen_range(1..EXECUTION_ID_BOUND))
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ExecutionId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

/// Lifecycle of an execution.
///
/// Transitions are one-directional: `Running` moves to either `Finished` or
/// `Error`, both of which are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionState {
    #[default]
    Running,
    Finished,
    Error,
}

impl ExecutionState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Finished => write!(f, "finished"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Splits a document id (`collection/key`) into its parts.
pub fn split_id(id: &str) -> Option<(&str, &str)> {
    match id.split_once('/') {
        Some((collection, key)) if !collection.is_empty() && !key.is_empty() => {
            Some((collection, key))
        }
        _ => None,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn random_ids_stay_in_range() {
        for _ in 0..100 {
            let id = ExecutionId::random();
            assert!(id.0 > 0 && id.0 < EXECUTION_ID_BOUND);
        }
    }

    #[test]
    fn splits_document_ids() {
        assert_eq!(split_id("v/1"), Some(("v", "1")));
        assert_eq!(split_id("v/a/b"), Some(("v", "a/b")));
        assert_eq!(split_id("v"), None);
        assert_eq!(split_id("/1"), None);
        assert_eq!(split_id("v/"), None);
    }
}
