//! Shared foundation for the DRTI runtime crates.
//!
//! Holds the pieces every other crate agrees on:
//! - ABI constants and the stash-word format (`config`, `stash`)
//! - The specialization error taxonomy (`error`)

pub mod config;
pub mod error;
pub mod stash;

pub use config::{ABI_VERSION, RETALIGN, STASH_BYTES};
pub use error::SpecializeError;
