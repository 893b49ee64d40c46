//! Shared domain types for the edgecam agent.

pub mod config;
pub mod events;
pub mod twin;
pub mod vision;

mod errors;

pub use errors::{EdgecamError, Result};
