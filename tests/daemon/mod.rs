//! Daemon tests over real sockets

mod lifecycle_tests;
mod server_tests;
