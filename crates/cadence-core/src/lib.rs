//! Shared types, configuration and errors for the Cadence dispatch engine.

pub mod config;
pub mod error;
pub mod logging;
pub mod types;

pub use config::CadenceConfig;
pub use error::{CadenceError, Result};
pub use types::*;
