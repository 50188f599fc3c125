use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::ModelError;

/// What an idempotency guard does with a duplicate whose original is still in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateStrategy {
    /// Return a duplicate marker without a result.
    #[default]
    Reject,
    /// Same as `Reject`, signalling the caller should come back later for the cached result.
    ReturnCached,
    /// Suspend the caller until the original settles and hand it the same outcome.
    Queue,
}

impl DuplicateStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            DuplicateStrategy::Reject => "reject",
            DuplicateStrategy::ReturnCached => "return_cached",
            DuplicateStrategy::Queue => "queue",
        }
    }
}

impl fmt::Display for DuplicateStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DuplicateStrategy {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let norm = s.trim().to_ascii_lowercase().replace('-', "_");
        match norm.as_str() {
            "reject" => Ok(DuplicateStrategy::Reject),
            "return_cached" | "cached" => Ok(DuplicateStrategy::ReturnCached),
            "queue" | "wait" => Ok(DuplicateStrategy::Queue),
            _ => Err(ModelError::UnknownStrategy(s.to_string())),
        }
    }
}
