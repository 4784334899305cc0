pub mod config;
pub mod errors;
pub mod messaging;
pub mod models;
pub mod resilience;
pub mod state_machine;
