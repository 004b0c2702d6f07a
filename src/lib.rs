//! Multi-runtime test and service orchestration.
//!
//! A run resolves the service dependency graph, brings the services up in
//! waves gated on health checks, dispatches test jobs to runtime adapters
//! under a bounded worker pool and aggregates every result into one report.

pub mod adapter;
pub mod app;
pub mod cli;
pub mod config;
pub mod driver;
pub mod error;
pub mod graph;
pub mod health;
pub mod logging;
pub mod model;
pub mod process;
pub mod report;
pub mod scheduler;
pub mod service;
pub mod supervisor;
pub mod version;

pub use error::{Error, Result};
