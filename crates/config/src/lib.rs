//! Configuration module for the relay daemon
//!
//! Handles loading configuration from TOML files, environment variable overrides,
//! and one-shot validation of the quality profile table.

pub mod config;
pub mod profile;

pub use config::*;
pub use profile::{ProfileName, QualityProfile};
