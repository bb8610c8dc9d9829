//! Edge-triggered HTTP/1.1 server core.
//!
//! One driver thread waits on the readiness multiplexer and accepts connections; every read, parse,
//! respond and flush step for a connection runs as a task on a fixed worker pool, never more than one
//! task per connection at a time.

pub mod config;
pub mod connection;
pub mod logging;
pub mod poller;
pub mod pool;
pub mod registry;
pub mod request;
pub mod response;
pub mod router;
pub mod server;

pub use config::ServerConfig;
pub use pool::{PoolError, WorkerPool};
pub use request::{parse_request, Limits, ParseOutcome, Request};
pub use response::{Response, StatusCode};
pub use router::Router;
pub use server::{Server, ServerHandle};
