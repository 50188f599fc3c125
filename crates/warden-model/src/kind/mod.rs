mod algorithm;
pub use algorithm::RateLimitAlgorithm;

mod strategy;
pub use strategy::DuplicateStrategy;
