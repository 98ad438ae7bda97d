//! Core types shared across the guard
//!
//! - `GuardError` / `GuardResult` - Error taxonomy

pub mod error;

pub use error::{GuardError, GuardResult};
