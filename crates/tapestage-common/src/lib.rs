//! Tapestage Common - Shared types and utilities
//!
//! This crate provides the identifiers, request targets, status codes,
//! error definitions and configuration used by every tapestage component.

pub mod config;
pub mod error;
pub mod status;
pub mod types;

pub use config::Config;
pub use error::{Error, ErrorClass, Result};
pub use status::StatusCode;
pub use types::*;
