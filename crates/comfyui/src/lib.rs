//! ComfyUI protocol client.
//!
//! Typed event-stream messages, REST wrappers, workflow templating,
//! readiness polling, progress tracking with a history fallback, and an
//! optional launcher for a local ComfyUI process.

pub mod api;
pub mod client;
pub mod history;
pub mod launcher;
pub mod messages;
pub mod readiness;
pub mod tracker;
pub mod workflow;
