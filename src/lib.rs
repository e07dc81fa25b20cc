pub mod cli;
pub mod command;
pub mod daemon;
pub mod errors;
pub mod models;
pub mod process;
pub mod server;
pub mod storage;
