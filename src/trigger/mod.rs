// src/trigger/mod.rs

//! Producers of run requests.
//!
//! - [`time`]: periodic scan of enabled jobs with a trigger interval.
//! - [`signal`]: jobs registered against a signal set that received data.
//!
//! Neither de-duplicates anything; the worker's single-flight guard does.

pub mod signal;
pub mod time;

pub use signal::jobs_for_source;
pub use time::{due_jobs, scan_once, spawn_time_trigger};
