//! # BurrowDB Configuration Module
//!
//! Centralizes all configuration constants. Constants are grouped by
//! functional area and their interdependencies are documented and enforced
//! through compile-time assertions, so a change in one place cannot silently
//! invalidate a derived value somewhere else.

pub mod constants;
pub use constants::*;
