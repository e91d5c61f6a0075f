//! Observability setup for Tideway: tracing subscriber with an optional
//! OpenTelemetry bridge.

pub mod tracing_setup;
