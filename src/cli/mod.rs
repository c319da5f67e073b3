//! Command-line interface for job-forge.
//!
//! Provides commands for running the worker daemon, pushing jobs and
//! inspecting queues, plus the hidden worker-process mode.

mod commands;

pub use commands::{
    parse_cli, run, run_with_cli, run_with_handlers, Cli, Commands, PushArgs, QueueArgs, WorkArgs,
};
