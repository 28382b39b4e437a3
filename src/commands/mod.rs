//! Subcommand implementations

pub mod fuzz;
pub mod run;
