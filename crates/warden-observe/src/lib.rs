//! Logging setup and scheduler event logging for warden services.

mod logger;
pub use logger::*;

mod subscriber;
pub use subscriber::*;
