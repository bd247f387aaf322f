//! Benchmark orchestration across threading backends: run matrices, bounded retries,
//! crash/recovery sessions, environment resets and cpu topology control.

pub mod builder;
pub mod cli;
pub mod command;
pub mod config;
pub mod executors;
pub mod fault;
pub mod harness;
pub mod matrix;
pub mod reset;
pub mod sampler;
pub mod topology;
