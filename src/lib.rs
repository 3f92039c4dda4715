// Transport API harness - credential lifecycle and test-resource cleanup

pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod session;
pub mod tracker;
pub mod utils;
