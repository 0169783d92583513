//! The server event loop and the handles a host uses to drive it.
//!
//! A [`Server`] is bound synchronously, so a bad root or a busy port is
//! reported before anything runs. [`Server::run`] then multiplexes three
//! sources on one task: the control channel, the socket and the timers. The control channel is polled first, so a stop that is already
//! pending wins over a datagram waiting in the socket, while a datagram
//! that is being handled always gets its reply before the stop is seen.

use std::io;
use std::net::{SocketAddr, UdpSocket as StdUdpSocket};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, warn};
use tokio::runtime::Builder;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::{self, MissedTickBehavior};

use super::config::ServerConfig;
use super::constants::{DEFAULT_STATS_INTERVAL, PROTOCOL_VERSION};
use super::datagram::{self, Transport};
use super::dispatch::{Dispatcher, ServerContext};
use super::errors::StartError;
use super::logsink::{diag, Diagnostics, LogCrateSink, LogSink};

/// Messages accepted by a running loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Stop,
}

/// Stops a server from any thread. Stopping twice, or stopping a server
/// that already exited, is harmless.
#[derive(Debug, Clone)]
pub struct ServerHandle {
    tx: UnboundedSender<Control>,
}

impl ServerHandle {
    /// Asks the loop to exit once the request in hand, if any, is answered.
    ///
    /// # Returns
    /// Nothing. If the loop has already exited the request is only logged.
    pub fn stop(&self) {
        if self.tx.send(Control::Stop).is_err() {
            debug!("Stop requested for a server that is no longer running");
        }
    }
}

/// A bound server, ready to run.
pub struct Server {
    socket: StdUdpSocket,
    dispatcher: Dispatcher,
    // Kept so the channel never closes while the loop runs
    control_tx: UnboundedSender<Control>,
    control_rx: UnboundedReceiver<Control>,
    sweep_interval: Duration,
    stats_interval: Option<Duration>,
    diag: Diagnostics,
}

const MAX_RECEIVE_FAILURES: u32 = 32;
const MAX_RECEIVE_DELAY: Duration = Duration::from_secs(1);

/// Counts consecutive receive errors so a broken socket does not spin the
/// loop.
#[derive(Debug, Default)]
struct ReceiveBackoff {
    failures: u32,
}

impl ReceiveBackoff {
    fn success(&mut self) {
        self.failures = 0;
    }

    /// Records a failure.
    ///
    /// # Returns
    /// * `Some(delay)` - How long to pause before receiving again
    /// * `None` once `MAX_RECEIVE_FAILURES` errors came in a row
    fn failure(&mut self) -> Option<Duration> {
        self.failures += 1;
        if self.failures >= MAX_RECEIVE_FAILURES {
            return None;
        }
        if self.failures == 1 {
            // a lone ICMP error is common and needs no pause
            return Some(Duration::ZERO);
        }
        let millis = 1u64 << (self.failures - 2).min(10);
        Some(Duration::from_millis(millis).min(MAX_RECEIVE_DELAY))
    }
}

impl Server {
    /// Validates the root and binds the socket.
    ///
    /// # Errors
    ///
    /// `InvalidDirectory` when the root is not a usable directory, `Socket`
    /// when the port cannot be bound.
    pub fn bind(config: &ServerConfig, diag: Diagnostics) -> Result<Self, StartError> {
        let (tx, rx) = mpsc::unbounded_channel();
        Self::bind_with_control(config, diag, tx, rx)
    }

    fn bind_with_control(
        config: &ServerConfig,
        diag: Diagnostics,
        control_tx: UnboundedSender<Control>,
        control_rx: UnboundedReceiver<Control>,
    ) -> Result<Self, StartError> {
        let ctx = ServerContext::new(&config.root, config.auth())
            .map_err(|e| StartError::InvalidDirectory {
                path: config.root.clone(),
                reason: e.to_string(),
            })?
            .with_diagnostics(diag.clone());
        let socket = datagram::bind(config.socket_addr()).map_err(|source| StartError::Socket {
            port: config.port,
            source,
        })?;

        diag!(
            diag,
            "Starting tnfsd version {}.{} on port {} using root directory {}",
            PROTOCOL_VERSION >> 8,
            PROTOCOL_VERSION & 0xFF,
            socket.local_addr().map(|a| a.port()).unwrap_or(config.port),
            ctx.namespace.root().display()
        );
        if ctx.read_only {
            diag!(diag, "Serving read-only");
        }
        if let Some(accounts) = &config.accounts {
            diag!(diag, "Authentication enabled, {} accounts", accounts.len());
        }

        Ok(Self {
            socket,
            dispatcher: Dispatcher::new(ctx, config.limits()),
            control_tx,
            control_rx,
            sweep_interval: config.sweep_interval.max(Duration::from_millis(1)),
            stats_interval: Some(config.stats_interval).filter(|i| !i.is_zero()),
            diag,
        })
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            tx: self.control_tx.clone(),
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Serves requests until stopped, then destroys every session.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// The last receive error, when the socket failed too many times in a
    /// row. Sessions are closed before returning it.
    pub async fn run(self) -> io::Result<()> {
        let Server {
            socket,
            mut dispatcher,
            control_tx: _control_tx,
            mut control_rx,
            sweep_interval,
            stats_interval,
            diag,
        } = self;
        let transport = Transport::from_std(socket)?;
        let mut sweep = time::interval_at(time::Instant::now() + sweep_interval, sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let stats_enabled = stats_interval.is_some();
        let stats_period = stats_interval.unwrap_or(DEFAULT_STATS_INTERVAL);
        let mut stats = time::interval_at(time::Instant::now() + stats_period, stats_period);
        stats.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut backoff = ReceiveBackoff::default();
        let mut failed = None;

        loop {
            tokio::select! {
                biased;
                control = control_rx.recv() => match control {
                    Some(Control::Stop) | None => break,
                },
                received = transport.receive() => match received {
                    Ok(Some((dgram, from))) => {
                        backoff.success();
                        let reply = dispatcher.dispatch(&dgram, from, std::time::Instant::now());
                        if let Some(reply) = reply {
                            if let Err(e) = transport.send(from, &reply).await {
                                warn!("Failed to reply to {}: {}", from, e);
                            }
                        }
                    }
                    Ok(None) => backoff.success(),
                    // ICMP errors from earlier sends surface here
                    Err(e) => match backoff.failure() {
                        Some(delay) => {
                            warn!("Receive failed: {}", e);
                            if !delay.is_zero() {
                                time::sleep(delay).await;
                            }
                        }
                        None => {
                            error!("Receive failed {} times in a row, giving up: {}", MAX_RECEIVE_FAILURES, e);
                            failed = Some(e);
                            break;
                        }
                    },
                },
                _ = sweep.tick() => {
                    let expired = dispatcher.sweep(std::time::Instant::now());
                    if !expired.is_empty() {
                        debug!("Sweep evicted {} sessions", expired.len());
                    }
                }
                _ = stats.tick(), if stats_enabled => {
                    diag!(diag, "Stats | Sessions: {}", dispatcher.sessions().len());
                }
            }
        }

        let closed = dispatcher.shutdown();
        diag!(diag, "Stopping tnfsd, {} sessions closed", closed);
        match failed {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Runs the loop on a fresh single-threaded runtime, blocking the caller.
    pub fn run_blocking(self) -> Result<(), StartError> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(StartError::Runtime)?;
        runtime.block_on(self.run()).map_err(StartError::Runtime)
    }
}

/// Embedding entry point: one instance serves one root.
///
/// The handle can be taken before `start` blocks, and used from another
/// thread to stop the server.
pub struct Tnfsd {
    diag: Diagnostics,
    control_tx: UnboundedSender<Control>,
    control_rx: UnboundedReceiver<Control>,
}

impl Tnfsd {
    /// Prepares a server that reports to `sink`.
    pub fn init(sink: Arc<dyn LogSink>) -> Self {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        Self {
            diag: Diagnostics::new(sink),
            control_tx,
            control_rx,
        }
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            tx: self.control_tx.clone(),
        }
    }

    /// Serves `root` on `port` until stopped.
    pub fn start<P: Into<PathBuf>>(self, root: P, port: u16, read_only: bool) -> Result<(), StartError> {
        let config = ServerConfig::new(root).with_port(port).read_only(read_only);
        self.start_with_config(&config)
    }

    pub fn start_with_config(self, config: &ServerConfig) -> Result<(), StartError> {
        let server = Server::bind_with_control(config, self.diag, self.control_tx, self.control_rx)?;
        server.run_blocking()
    }
}

impl Default for Tnfsd {
    fn default() -> Self {
        Self::init(Arc::new(LogCrateSink))
    }
}

/// A server running on its own thread.
pub struct RunningServer {
    local_addr: SocketAddr,
    handle: ServerHandle,
    thread: Option<JoinHandle<Result<(), StartError>>>,
}

impl RunningServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn handle(&self) -> ServerHandle {
        self.handle.clone()
    }

    pub fn stop(&self) {
        self.handle.stop();
    }

    /// Waits for the loop to exit.
    pub fn join(mut self) -> Result<(), StartError> {
        match self.thread.take() {
            Some(thread) => thread.join().unwrap_or_else(|_| {
                Err(StartError::Runtime(io::Error::new(
                    io::ErrorKind::Other,
                    "server thread panicked",
                )))
            }),
            None => Ok(()),
        }
    }
}

impl Drop for RunningServer {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.handle.stop();
            if thread.join().is_err() {
                error!("Server thread panicked");
            }
        }
    }
}

/// Binds a server and runs it on a dedicated thread.
pub fn spawn(config: &ServerConfig, sink: Arc<dyn LogSink>) -> Result<RunningServer, StartError> {
    let server = Server::bind(config, Diagnostics::new(sink))?;
    let handle = server.handle();
    let local_addr = server.local_addr().map_err(|source| StartError::Socket {
        port: config.port,
        source,
    })?;
    let thread = thread::Builder::new()
        .name("tnfsd".into())
        .spawn(move || server.run_blocking())
        .map_err(StartError::Runtime)?;
    Ok(RunningServer {
        local_addr,
        handle,
        thread: Some(thread),
    })
}
