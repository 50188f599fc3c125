use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::ModelError;

/// Admission algorithm used by the rate limiter.
///
/// Each variant trades memory, precision and burst tolerance differently:
/// - `FixedWindow`: one counter per window; cheap, but admits up to 2x the limit across a boundary.
/// - `SlidingWindow`: one timestamp per admitted request; exact, memory grows with the limit.
/// - `TokenBucket`: refills continuously; allows bursts up to the limit.
/// - `LeakyBucket`: drains at a constant rate; smooths bursts into a steady flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitAlgorithm {
    FixedWindow,
    #[default]
    SlidingWindow,
    TokenBucket,
    LeakyBucket,
}

impl RateLimitAlgorithm {
    pub const ALL: [RateLimitAlgorithm; 4] = [
        RateLimitAlgorithm::FixedWindow,
        RateLimitAlgorithm::SlidingWindow,
        RateLimitAlgorithm::TokenBucket,
        RateLimitAlgorithm::LeakyBucket,
    ];

    /// Short symbolic name, also accepted by [`FromStr`].
    pub fn as_str(&self) -> &'static str {
        match self {
            RateLimitAlgorithm::FixedWindow => "fixed_window",
            RateLimitAlgorithm::SlidingWindow => "sliding_window",
            RateLimitAlgorithm::TokenBucket => "token_bucket",
            RateLimitAlgorithm::LeakyBucket => "leaky_bucket",
        }
    }
}

impl fmt::Display for RateLimitAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RateLimitAlgorithm {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let norm = s.trim().to_ascii_lowercase().replace('-', "_");
        match norm.as_str() {
            "fixed_window" | "fixed" => Ok(RateLimitAlgorithm::FixedWindow),
            "sliding_window" | "sliding" => Ok(RateLimitAlgorithm::SlidingWindow),
            "token_bucket" | "token" => Ok(RateLimitAlgorithm::TokenBucket),
            "leaky_bucket" | "leaky" => Ok(RateLimitAlgorithm::LeakyBucket),
            _ => Err(ModelError::UnknownAlgorithm(s.to_string())),
        }
    }
}
