use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ModelError {
    #[error("unknown rate-limit algorithm: {0} (expected: fixed_window|sliding_window|token_bucket|leaky_bucket)")]
    UnknownAlgorithm(String),
    #[error("unknown duplicate strategy: {0} (expected: reject|return_cached|queue)")]
    UnknownStrategy(String),
}
