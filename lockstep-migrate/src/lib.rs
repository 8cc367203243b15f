//! Lockstep Migration Library
//!
//! Argument parsing and command handlers for the `lockstep-migrate` binary,
//! kept in a library so they can be tested without a process boundary.

pub mod cli;
pub mod commands;
