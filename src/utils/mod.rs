//! Utility functions shared across the crate
//!
//! Formatting, paths, cancellation, progress tracking and system helpers.

mod cancel;
mod format;
mod path;
mod progress;
mod system;

pub use cancel::*;
pub use format::*;
pub use path::*;
pub use progress::*;
pub use system::*;
