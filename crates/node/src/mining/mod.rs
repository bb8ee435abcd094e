mod config;
mod supervisor;

pub use config::MiningConfig;
pub use supervisor::{MiningState, MiningStatus, MiningSupervisor};
