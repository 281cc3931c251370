//! Core of the castle cluster tool.
//!
//! A cluster file names nodes and the roles they play. Each role contributes
//! actions; the [`action::scheduler`] runs the closure of the requested
//! targets concurrently, honoring the dependencies between them.

pub mod action;
pub mod cloud;
pub mod cluster;
pub mod command;
pub mod env;
pub mod error;
pub mod io;
pub mod json_merge;
pub mod json_transform;
pub mod return_code;
pub mod role;
pub mod shutdown;
pub mod ssh;
pub mod uplink;
pub mod util;

#[cfg(test)]
mod testing;

pub use error::{CastleError, Result};
pub use return_code::CastleReturnCode;
