//! `mia-core` — configuration and error types shared by the Mia crates.

pub mod config;
pub mod error;

pub use config::MiaConfig;
pub use error::{MiaError, Result};
