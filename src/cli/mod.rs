//! Command-line interface
//!
//! Argument parsing for the `reciprocus` binary.

pub mod commands;

pub use commands::{Command, Opt};
