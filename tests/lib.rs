//! Shared fixtures for Freepath integration tests.

pub mod fixtures;
