pub mod config;
pub mod intake;
pub mod processor;
pub mod queue;
pub mod sink;
