//! # Recon Common Library
//!
//! Shared code for the reconstruction pipeline service:
//! - Error type
//! - TOML bootstrap configuration
//! - Pipeline event model and per-session event channel
//! - SSE adapter for event channels

pub mod config;
pub mod error;
pub mod events;
pub mod sse;

pub use error::{Error, Result};
