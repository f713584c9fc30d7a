//! Side-effecting adapters: configuration files, child processes, archives
//! and the coordinator's HTTP API.

pub mod archive;
pub mod config;
pub mod coordinator;
pub mod process;
