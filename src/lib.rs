pub mod account;
pub mod api;
pub mod cli;
pub mod client;
pub mod config;
pub mod crypto;
pub mod encoding;
pub mod error;
pub mod storage;
pub mod vault;
pub mod watcher;
