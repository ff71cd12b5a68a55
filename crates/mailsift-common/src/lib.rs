//! mailsift Common - Shared types and utilities
//!
//! This crate provides the configuration, error taxonomy and data model
//! shared by the storage adapters, the ingestion core and the binary.

pub mod config;
pub mod error;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
