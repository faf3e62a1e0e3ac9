//! Shared storage integration tests.
//!
//! Tests the DataStorage and MonitoringApi interfaces against all
//! implementations. Each implementation module imports these test functions
//! and runs them.

pub mod data_storage_tests;
