//! Common types, wire formats, and errors shared across `vault-backup` crates.

pub mod error;
pub mod protocol;

pub use error::{Error, Result};
