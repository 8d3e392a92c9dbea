//! Small utilities shared across plughub crates.

pub mod time;
