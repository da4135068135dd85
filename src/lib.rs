//! Report cache and JSON API for the H1B insights dashboard.

pub mod application;
pub mod cache;
pub mod config;
pub mod domain;
pub mod infra;
