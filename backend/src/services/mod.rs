pub mod cancellation;
pub mod job_runner;
pub mod job_scheduler_service;
pub mod job_service;
