pub mod cli;
pub mod config;
pub mod error;
pub mod exec;
pub mod invocation;
pub mod orchestration;
pub mod stream;
