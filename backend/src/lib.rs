//! Embedded, database-backed job scheduler.
//!
//! Request handlers queue work through [`services::job_service`]; a single
//! background [`services::job_scheduler_service::JobSchedulerService`] polls
//! the [`store::JobStore`], runs jobs through their registered handlers and
//! records the outcome.

pub mod app;
pub mod config;
pub mod db;
pub mod errors;
pub mod jobs;
pub mod logging;
pub mod models;
pub mod registry;
pub mod routes;
pub mod services;
pub mod state;
pub mod store;
