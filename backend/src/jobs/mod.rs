//! Background Jobs Module
//!
//! Job types that ship with the scheduler. Each module exposes its
//! `JOB_TYPE` key and a handler function; `register_all` wires them into the
//! registry while the process starts.
//!
//! # Available Jobs
//!
//! - `heartbeat_job` - Diagnostic job that ticks through N steps, reporting
//!   progress and honouring cancellation

pub mod heartbeat_job;

use crate::registry::HandlerRegistry;

pub fn register_all(registry: &mut HandlerRegistry) {
    registry.register(heartbeat_job::JOB_TYPE, heartbeat_job::run_heartbeat);
}
