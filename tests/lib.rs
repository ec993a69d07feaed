//! Shared fixtures for the THUNDER integration tests.

pub mod fixtures;
