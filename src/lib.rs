pub mod capability;
pub mod classifier;
pub mod cli;
pub mod config;
pub mod env;
pub mod error;
pub mod job;
pub mod log;
pub mod paths;
pub mod provision;
pub mod resolver;
pub mod supervisor;

pub use error::{Error, StrategyError};
