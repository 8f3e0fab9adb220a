pub mod api;
pub mod config;
pub mod node_api;
pub mod orchestrator;
pub mod plan;
pub mod policy;
pub mod pooltool;
pub mod process;
pub mod runner;
pub mod schedule;
pub mod state;

pub use state::AppState;
