//! Centralized configuration constants.
//!
//! Constants that depend on each other are co-located in [`constants`] and
//! documented together to prevent mismatch bugs. Import from here rather
//! than redefining locally.

mod constants;

pub use constants::*;
