//! Collection daemon
//!
//! One long-lived process per project root, holding the warm cache and
//! answering requests on a Unix socket.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                 FASTCOLLECT DAEMON (per root)                │
//! ├──────────────────────────────────────────────────────────────┤
//! │                                                              │
//! │  UnixListener ──► accept (bounded wait) ──► Semaphore slot   │
//! │                        │                        │            │
//! │                  housekeeping            task per connection │
//! │                  (health log)                   │            │
//! │                                                 ▼            │
//! │   DaemonContext { cache, source, root, state } ◄─ handlers   │
//! │                                                              │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Protocol
//!
//! One JSON request per connection, answered by one JSON response:
//!
//! ```json
//! {"command": "collect", "root_path": "/repo", "filters": {"marker": "slow"}}
//! {"status": "success", "collection_time": 0.004, "items": {...}, "files": 3}
//! ```

pub mod handlers;
pub mod protocol;
pub mod server;

pub use handlers::{handle_request, DaemonContext};
pub use protocol::{
    CollectResponse, ErrorResponse, HealthResponse, ReloadResponse, Request, ResponseStatus,
    StatusResponse, StopResponse,
};
pub use server::{serve, DaemonServer, RunOutcome, ServerOptions, ServerState, ShutdownHandle};
