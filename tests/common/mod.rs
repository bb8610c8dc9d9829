#![allow(dead_code)]

use std::fs;
use std::io::{self, Read, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use pollhttpd::{Server, ServerConfig, ServerHandle};

pub const INDEX_BODY: &[u8] = b"hello world\n";

static SCRATCH: AtomicUsize = AtomicUsize::new(0);

/// Fresh document root with `index.html` (12 bytes), `style.css` and `logo.png`.
pub fn scratch_root() -> PathBuf {
    let root = std::env::temp_dir().join(format!(
        "pollhttpd-it-{}-{}",
        std::process::id(),
        SCRATCH.fetch_add(1, Ordering::SeqCst)
    ));
    fs::create_dir_all(&root).unwrap();
    fs::write(root.join("index.html"), INDEX_BODY).unwrap();
    fs::write(root.join("style.css"), b"h1 { color: red; }").unwrap();
    fs::write(root.join("logo.png"), [0x89, b'P', b'N', b'G', 0, 1, 2, 3]).unwrap();
    root
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub root: PathBuf,
    handle: ServerHandle,
    thread: Option<JoinHandle<anyhow::Result<()>>>,
}

impl TestServer {
    pub fn start(workers: usize) -> Self {
        let root = scratch_root();
        let config = ServerConfig {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            workers,
            document_root: root.clone(),
            ..ServerConfig::default()
        };
        let mut server = Server::bind(config).expect("bind test server");
        let addr = server.local_addr().unwrap();
        let handle = server.handle();
        let thread = thread::spawn(move || server.run());
        Self {
            addr,
            root,
            handle,
            thread: Some(thread),
        }
    }

    pub fn client(&self) -> Client {
        Client::connect(self.addr)
    }

    pub fn connection_count(&self) -> usize {
        self.handle.connection_count()
    }

    /// Polls until the live connection count reaches `expected`.
    pub fn wait_for_connections(&self, expected: usize) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if self.connection_count() == expected {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    pub fn stop(mut self) -> anyhow::Result<()> {
        self.handle.shutdown().unwrap();
        let result = self.thread.take().unwrap().join().unwrap();
        let _ = fs::remove_dir_all(&self.root);
        result
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = self.handle.shutdown();
            let _ = thread.join();
            let _ = fs::remove_dir_all(&self.root);
        }
    }
}

#[derive(Debug)]
pub struct Reply {
    pub status_line: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Reply {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Blocking client that keeps leftover bytes between responses.
pub struct Client {
    pub stream: TcpStream,
    buffer: Vec<u8>,
}

impl Client {
    pub fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();
        Self {
            stream,
            buffer: Vec::new(),
        }
    }

    pub fn send(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).unwrap();
        self.stream.flush().unwrap();
    }

    fn fill(&mut self) -> io::Result<usize> {
        let mut chunk = [0u8; 4096];
        let read = self.stream.read(&mut chunk)?;
        self.buffer.extend_from_slice(&chunk[..read]);
        Ok(read)
    }

    pub fn response(&mut self) -> Reply {
        let head_len = loop {
            if let Some(pos) = self.buffer.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
            assert!(self.fill().unwrap() > 0, "connection closed before a response");
        };

        let head = String::from_utf8(self.buffer[..head_len - 4].to_vec()).unwrap();
        let mut lines = head.split("\r\n");
        let status_line = lines.next().unwrap().to_string();
        let headers: Vec<(String, String)> = lines
            .map(|line| {
                let (key, value) = line.split_once(':').unwrap();
                (key.trim().to_string(), value.trim().to_string())
            })
            .collect();
        let length: usize = headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case("Content-Length"))
            .map(|(_, value)| value.parse().unwrap())
            .expect("response without Content-Length");

        while self.buffer.len() < head_len + length {
            assert!(self.fill().unwrap() > 0, "connection closed mid-body");
        }
        let body = self.buffer[head_len..head_len + length].to_vec();
        self.buffer.drain(..head_len + length);

        Reply {
            status_line,
            headers,
            body,
        }
    }

    /// True once the server has closed its side and nothing else is pending.
    pub fn at_eof(&mut self) -> bool {
        self.buffer.is_empty() && matches!(self.fill(), Ok(0))
    }

    /// True if nothing arrives within `wait`.
    pub fn is_silent_for(&mut self, wait: Duration) -> bool {
        self.stream.set_read_timeout(Some(wait)).unwrap();
        let silent = match self.fill() {
            Err(err) => matches!(
                err.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
            ),
            Ok(_) => false,
        };
        self.stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();
        silent && self.buffer.is_empty()
    }
}
