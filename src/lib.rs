pub mod agent;
pub mod billing;
pub mod config;
pub mod errors;
pub mod executor;
pub mod guard;
pub mod orchestrator;
pub mod output;
pub mod pause;
pub mod plan;
pub mod planner;
pub mod process;
pub mod qa;
pub mod redact;
pub mod state;
