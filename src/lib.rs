pub mod config;
pub mod error;
pub mod evaluation;
pub mod exec;
pub mod ground_truth;
pub mod output;
pub mod runner;
pub mod tools;
