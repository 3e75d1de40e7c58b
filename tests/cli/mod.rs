//! CLI end-to-end tests

mod collect_tests;
