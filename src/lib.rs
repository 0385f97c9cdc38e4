pub mod cli;
pub mod commands;
pub mod config;
pub mod firecracker;
pub mod network;
pub mod paths;
pub mod state;
pub mod storage;

pub use config::SpawnConfig;
