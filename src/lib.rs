pub mod agent;
pub mod audit;
pub mod budget;
pub mod checkpoint;
pub mod config;
pub mod drift;
pub mod errors;
pub mod escalation;
pub mod foreman_config;
pub mod logging;
pub mod phase;
pub mod review;
pub mod workflow;
