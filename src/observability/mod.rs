//! # Observability
//!
//! Structured logging for the Meshplane control plane, built on the tracing
//! ecosystem. Every component logs with structured fields (`node_id`,
//! `service_name`, `type_url`, `version`) so discovery cycles can be followed
//! end to end.

pub mod logging;

pub use logging::init_logging;
