//! Server side of an operator: the local processing endpoint and the
//! acceptor that hands each connection to the backend.

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, info, info_span, warn};

use crate::backend::Backend;
use crate::config::OperatorConfig;
use crate::data::Scalar;
use crate::error::{ProtocolError, Result};
use crate::operator::Affinity;
use crate::protocol::{Protocol, Protocol0};

const ACCEPT_RETRY_BASE_BACKOFF_MS: u64 = 10;
const ACCEPT_RETRY_MAX_BACKOFF_MS: u64 = 1_000;

/// Local processing capabilities served to remote clients
pub trait Endpoint: Send + Sync {
    /// Affinity table; the position of an entry is its index
    fn affinities(&self) -> Vec<Affinity>;

    /// Process one row of inputs with affinity `index`.
    ///
    /// Input and output lengths are checked against [`Endpoint::affinities`]
    /// by the caller.
    fn process_data(&self, index: u8, inputs: &[Scalar]) -> anyhow::Result<Vec<Scalar>>;
}

/// Accepts connections and serves them with an [`Endpoint`]
pub struct Provider<E, B> {
    endpoint: Arc<E>,
    backend: B,
    listener: TcpListener,
    protocol: Protocol0,
    running: Arc<AtomicBool>,
}

impl<E, B> Provider<E, B>
where
    E: Endpoint + 'static,
    B: Backend,
{
    /// Listen on the configured address through `backend`
    pub fn bind(endpoint: Arc<E>, backend: B, config: &OperatorConfig) -> Result<Self> {
        let server = &config.server;
        let listener = backend.listen(&server.host, server.port, server.use_ipv6, server.backlog)?;
        Self::from_listener(listener, endpoint, backend, config)
    }

    pub fn from_listener(
        listener: TcpListener,
        endpoint: Arc<E>,
        backend: B,
        config: &OperatorConfig,
    ) -> Result<Self> {
        Ok(Self {
            endpoint,
            backend,
            listener,
            protocol: config.net.protocol()?,
            running: Arc::new(AtomicBool::new(true)),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept a single connection and hand it to the backend
    pub fn accept_one(&self) -> Result<()> {
        let (stream, peer) = self.listener.accept()?;
        self.hand_off(stream, peer)
    }

    /// Accept connections until [`Provider::stop`] is called.
    ///
    /// Connections the backend cannot take are closed right away. While
    /// `accept` keeps failing the loop waits between attempts, up to
    /// one second.
    pub fn serve(&self) -> Result<()> {
        info!(addr = ?self.listener.local_addr().ok(), "operator serving");
        let mut failures = 0u32;
        while self.running.load(Ordering::Acquire) {
            let (stream, peer) = match self.listener.accept() {
                Ok(accepted) => {
                    failures = 0;
                    accepted
                }
                Err(e) if is_transient_accept_error(&e) => {
                    debug!(error = %e, "accept interrupted");
                    continue;
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    let delay = accept_backoff(failures);
                    warn!(
                        error = %e,
                        failures,
                        retry_ms = delay.as_millis() as u64,
                        "accept failed"
                    );
                    thread::sleep(delay);
                    continue;
                }
            };
            if !self.running.load(Ordering::Acquire) {
                break;
            }
            if let Err(e) = self.hand_off(stream, peer) {
                warn!(%peer, error = %e, "connection refused");
            }
        }
        info!("operator stopped");
        Ok(())
    }

    /// Make [`Provider::serve`] return after its current accept
    pub fn stop(&self) -> Result<()> {
        self.running.store(false, Ordering::Release);
        let mut addr = self.local_addr()?;
        if addr.ip().is_unspecified() {
            addr.set_ip(match addr {
                SocketAddr::V4(_) => std::net::Ipv4Addr::LOCALHOST.into(),
                SocketAddr::V6(_) => std::net::Ipv6Addr::LOCALHOST.into(),
            });
        }
        // wake the blocking accept
        TcpStream::connect(addr)?;
        Ok(())
    }

    fn hand_off(&self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        self.backend.configure(&stream)?;
        let endpoint = Arc::clone(&self.endpoint);
        let protocol = self.protocol;
        self.backend.dispatch(Box::new(move || {
            handle_connection(protocol, stream, peer, endpoint.as_ref())
        }))
    }
}

/// Failures tied to one incoming connection, not to the listener
fn is_transient_accept_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::Interrupted
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}

fn accept_backoff(failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(16);
    let scaled = ACCEPT_RETRY_BASE_BACKOFF_MS.saturating_mul(1 << exp);
    Duration::from_millis(scaled.min(ACCEPT_RETRY_MAX_BACKOFF_MS))
}

fn handle_connection<E: Endpoint + ?Sized>(
    protocol: Protocol0,
    mut stream: TcpStream,
    peer: SocketAddr,
    endpoint: &E,
) {
    let span = info_span!("connection", %peer);
    let _enter = span.enter();
    debug!("accepted");
    match protocol.dispatch(&mut stream, endpoint) {
        Ok(()) => debug!("peer closed"),
        Err(e @ ProtocolError::Timeout(_)) => debug!(error = %e, "idle connection dropped"),
        Err(e) => warn!(error = %e, "connection aborted"),
    }
}
