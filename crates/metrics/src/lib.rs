//! Metrics collection and export for plughub.
//!
//! This crate provides a unified metrics interface using the `metrics` crate facade.
//! When the `prometheus` feature is enabled, metrics are exported in Prometheus format.
//!
//! # Usage
//!
//! ```rust,ignore
//! use plughub_metrics::{counter, supervisor};
//!
//! counter!(supervisor::WORKER_STARTS_TOTAL, "plugin" => "echo").increment(1);
//! ```
//!
//! # Features
//!
//! - `prometheus`: install a Prometheus recorder whose text output is available
//!   through [`MetricsHandle::render`]

mod definitions;
mod recorder;

pub use {
    definitions::*,
    recorder::{MetricsHandle, MetricsRecorderConfig, init_metrics},
};

// Re-export metrics macros for convenience
pub use metrics::{counter, gauge, histogram};
