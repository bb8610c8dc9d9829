use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use crate::poller::DEFAULT_EVENT_CAPACITY;
use crate::pool::DEFAULT_WORKERS;
use crate::request::Limits;
use crate::router::{DEFAULT_DOCUMENT_ROOT, DEFAULT_INDEX_DOCUMENT};

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_MAX_CONNECTIONS: usize = 10_000;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: IpAddr,
    pub port: u16,
    pub workers: usize,
    /// Relative paths resolve against the process working directory.
    pub document_root: PathBuf,
    pub index_document: String,
    /// Accepted connections beyond this are closed immediately.
    pub max_connections: usize,
    /// Readiness events returned per wait.
    pub event_capacity: usize,
    pub limits: Limits,
}

impl ServerConfig {
    pub fn address(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            workers: DEFAULT_WORKERS,
            document_root: PathBuf::from(DEFAULT_DOCUMENT_ROOT),
            index_document: DEFAULT_INDEX_DOCUMENT.to_string(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            limits: Limits::default(),
        }
    }
}
