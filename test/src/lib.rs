//! Shared fixtures for the reslink integration tests: loopback nodes,
//! recording subscribers and polling helpers.

pub mod helpers;

pub use helpers::*;
