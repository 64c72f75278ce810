//! Side-effecting parts of the engine: files, logs, processes, git.

pub mod candidates;
pub mod config;
pub mod decision_log;
pub mod dispatcher;
pub mod executor;
pub mod fsutil;
pub mod git;
pub mod init;
pub mod observability;
pub mod process;
pub mod registry_store;
pub mod state_store;
