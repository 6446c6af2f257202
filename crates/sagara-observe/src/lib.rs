//! Observability setup for sagara deployments.

pub mod tracing_setup;
