//! Shared types, configuration and error taxonomy for Concierge.

pub mod config;
pub mod error;
pub mod locks;
pub mod types;

pub use config::ConciergeConfig;
pub use error::{ConciergeError, Result};
pub use locks::{KeyedGuard, KeyedLocks};
pub use types::*;
