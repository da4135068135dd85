//! Application services layer: ports and process-level errors.

pub mod error;
pub mod repos;
