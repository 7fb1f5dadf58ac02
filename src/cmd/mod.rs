//! Command-line entry points.

pub mod digitize;
pub mod schema;
