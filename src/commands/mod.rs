//! CLI command implementations.
//!
//! Each submodule implements a poolrun command with pure formatting logic
//! separated from IO for testability.

pub mod attach;
pub mod clean;
pub mod run;
