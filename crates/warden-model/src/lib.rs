//! Plain data shared by the coordination core and its observers.
//!
//! Nothing in this crate talks to a store or spawns work; it only describes
//! locks, rate-limit decisions, scheduled tasks and idempotency records.

mod domain;
pub use domain::*;

mod kind;
pub use kind::*;
