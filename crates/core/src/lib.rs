//! Shared domain types for the image-edit bot.
//!
//! Holds the [`job::Job`] lifecycle model, generation parameters with their
//! defaults and limits, and small pure helpers (seed resolution, progress
//! rendering) used by both the backend client and the worker.

pub mod error;
pub mod job;
pub mod params;
pub mod progress;
pub mod types;
