pub mod api;
pub mod auth;
mod cli;
pub mod config;
pub mod daemon;
pub mod docker;
pub mod gpu;
pub mod hub;
pub mod mining;
pub mod ports;
pub mod rental;
mod utils;

pub use cli::execute_command;
pub use cli::Cli;
pub use utils::identity::{machine_id, outbound_ip};
pub use utils::logging::setup_logging;

pub type TaskHandles = std::sync::Arc<tokio::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>>;
