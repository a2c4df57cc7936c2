//! Foundation module - Core utilities and types
//!
//! - Math types, transforms and projections
//! - Logging setup

pub mod math;
pub mod logging;
