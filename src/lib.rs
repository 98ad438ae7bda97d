pub mod core;
pub mod config;
pub mod permissions;
pub mod sandbox;

// Optional components
pub mod logging;

pub use config::GuardConfig;
pub use core::{GuardError, GuardResult};
