use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use anyhow::Context as _;
use mio::net::TcpListener;
use mio::{Interest, Token, Waker};
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::connection::{Connection, Context, Next, Schedule};
use crate::poller::{Multiplexer, Readiness};
use crate::pool::WorkerPool;
use crate::registry::ConnectionRegistry;
use crate::router::Router;

const LISTENER: Token = Token(0);
const WAKER: Token = Token(1);

/// State shared between the driver and every connection task.
struct Shared {
    ctx: Context,
    connections: ConnectionRegistry<Connection>,
}

impl Shared {
    fn tear_down(&self, conn: &Connection) {
        conn.shutdown(&self.ctx.registrar);
        self.connections.remove(conn.token());
        debug!(token = conn.token().0, live = self.connections.len(), "connection released");
    }
}

/// Stops a running [`Server`] from any thread.
#[derive(Clone)]
pub struct ServerHandle {
    waker: Arc<Waker>,
    stop: Arc<AtomicBool>,
    shared: Arc<Shared>,
}

impl ServerHandle {
    pub fn shutdown(&self) -> io::Result<()> {
        self.stop.store(true, Ordering::SeqCst);
        self.waker.wake()
    }

    /// Connections currently held in the registry.
    pub fn connection_count(&self) -> usize {
        self.shared.connections.len()
    }
}

pub struct Server {
    config: ServerConfig,
    listener: TcpListener,
    mux: Multiplexer,
    shared: Arc<Shared>,
    pool: WorkerPool,
    waker: Arc<Waker>,
    stop: Arc<AtomicBool>,
}

impl Server {
    pub fn bind(config: ServerConfig) -> anyhow::Result<Self> {
        let address = config.address();
        let mut listener = TcpListener::bind(address)
            .with_context(|| format!("cannot listen on {address}"))?;

        let mux = Multiplexer::new(config.event_capacity)
            .context("cannot create readiness multiplexer")?;
        let registrar = mux.registrar().context("cannot clone poll registry")?;
        registrar
            .register(&mut listener, LISTENER, Interest::READABLE)
            .context("cannot register listening socket")?;
        let waker = Arc::new(Waker::new(mux.registry(), WAKER).context("cannot create waker")?);

        let pool = WorkerPool::new(config.workers).context("cannot start worker pool")?;

        let shared = Arc::new(Shared {
            ctx: Context {
                registrar,
                router: Router::new(&config.document_root, config.index_document.clone()),
                limits: config.limits,
            },
            connections: ConnectionRegistry::with_capacity(config.max_connections.min(4096)),
        });

        Ok(Self {
            config,
            listener,
            mux,
            shared,
            pool,
            waker,
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            waker: Arc::clone(&self.waker),
            stop: Arc::clone(&self.stop),
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn connection_count(&self) -> usize {
        self.shared.connections.len()
    }

    // Intent: drive the readiness loop until a shutdown is requested or the wait itself fails.
    // Result: accepts happen here; all connection I/O runs on the worker pool.
    pub fn run(&mut self) -> anyhow::Result<()> {
        info!(
            address = %self.local_addr().unwrap_or_else(|_| self.config.address()),
            workers = self.pool.size(),
            root = %self.shared.ctx.router.document_root().display(),
            "server listening"
        );

        let result = self.event_loop();
        self.close_all();
        self.pool.shutdown();
        info!("server stopped");
        result
    }

    fn event_loop(&mut self) -> anyhow::Result<()> {
        loop {
            let ready = match self.mux.wait(None) {
                Ok(ready) => ready,
                Err(err) => {
                    error!("readiness wait failed: {err}");
                    return Err(err).context("readiness wait failed");
                }
            };

            let mut accept = false;
            for (token, readiness) in ready {
                match token {
                    LISTENER => accept = true,
                    WAKER => {}
                    token => self.dispatch(token, readiness),
                }
            }
            if self.stop.load(Ordering::SeqCst) {
                info!("shutdown requested");
                return Ok(());
            }
            // After the batch, so no slot freed and reused within it sees a stale event.
            if accept {
                self.accept_connections();
            }
        }
    }

    fn dispatch(&self, token: Token, readiness: Readiness) {
        let Some(conn) = self.shared.connections.get(token) else {
            return;
        };

        if readiness == Readiness::Hangup {
            debug!(token = token.0, "error or hang-up on connection");
            if conn.close() {
                self.shared.tear_down(&conn);
            }
            return;
        }

        match conn.schedule(readiness) {
            Schedule::Submit => {
                let shared = Arc::clone(&self.shared);
                let task_conn = Arc::clone(&conn);
                if let Err(err) =
                    self.pool
                        .submit(move || run_connection_task(&shared, &task_conn, readiness))
                {
                    warn!(token = token.0, "cannot dispatch connection task: {err}");
                    conn.close();
                    self.shared.tear_down(&conn);
                }
            }
            Schedule::Deferred | Schedule::Skip => {}
        }
    }

    fn accept_connections(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if self.shared.connections.len() >= self.config.max_connections {
                        warn!(%peer, "connection limit reached, refusing");
                        drop(stream);
                        continue;
                    }
                    let conn = self
                        .shared
                        .connections
                        .create(|token| Connection::new(token, stream, Some(peer)));
                    if let Err(err) = conn.register(&self.shared.ctx.registrar) {
                        error!(%peer, "cannot register connection: {err}");
                        self.shared.connections.remove(conn.token());
                        continue;
                    }
                    info!(token = conn.token().0, %peer, "accepted connection");
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    error!("accept failed: {err}");
                    break;
                }
            }
        }
    }

    fn close_all(&self) {
        for conn in self.shared.connections.drain() {
            if conn.close() {
                conn.shutdown(&self.shared.ctx.registrar);
            }
        }
    }
}

/// Closes and releases the connection if the task unwinds.
struct PanicGuard<'a> {
    shared: &'a Shared,
    conn: &'a Connection,
}

impl Drop for PanicGuard<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            warn!(
                token = self.conn.token().0,
                "connection task failed, closing connection"
            );
            self.conn.close();
            self.shared.tear_down(self.conn);
        }
    }
}

// Intent: own the connection for as long as events keep arriving for it.
// Result: events run one at a time in reported order; the task that observes a close releases it.
fn run_connection_task(shared: &Shared, conn: &Connection, first: Readiness) {
    let _guard = PanicGuard { shared, conn };
    #[cfg(test)]
    let _span = conn.enter_task();
    let mut readiness = first;
    loop {
        let phase = conn.handle(readiness, &shared.ctx);
        match conn.finish(phase) {
            Next::Handle(next) => readiness = next,
            Next::Idle => return,
            Next::TearDown => {
                shared.tear_down(conn);
                return;
            }
        }
    }
}
