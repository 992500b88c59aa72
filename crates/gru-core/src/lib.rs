//! Core types shared across grurt crates.
//!
//! Provides:
//! - Centralized error types via thiserror
//! - Runtime configuration with TOML support

pub mod config;
pub mod error;

// Re-export commonly used types
pub use config::{AppConfig, RuntimeConfig, StorageSupport};
pub use error::{status_code, GruError, Result};
