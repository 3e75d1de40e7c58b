//! Common test utilities and fixtures for fastcollect integration tests
//!
//! This module provides:
//! - `TestProject` builder for temporary Python projects
//! - `RunningDaemon` for serving a project from a background runtime

#![allow(unused_imports)]
#![allow(dead_code)]

pub mod daemon;

pub use daemon::RunningDaemon;
pub use test_project::TestProject;
