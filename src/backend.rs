//! Transport capabilities: connecting, listening and running connection
//! handlers off the acceptor thread.
//!
//! Handlers run on a [`WorkerPool`] of fixed size fed by a bounded queue.
//! Dispatch never blocks; a full queue is reported as
//! [`ProtocolError::Overloaded`] and the caller drops the work.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Sender, TrySendError};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::{debug, error};

use crate::config::{NetConfig, ServerConfig};
use crate::error::{ProtocolError, Result};

/// Unit of work handed to a backend
pub type Job = Box<dyn FnOnce() + Send + 'static>;

pub trait Backend: Send + Sync {
    /// Run `job` without blocking the caller
    fn dispatch(&self, job: Job) -> Result<()>;

    fn connect(&self, host: &str, port: u16) -> Result<TcpStream>;

    fn listen(&self, host: &str, port: u16, use_ipv6: bool, backlog: i32) -> Result<TcpListener>;

    /// Apply read/write deadlines to an accepted or opened stream
    fn configure(&self, stream: &TcpStream) -> Result<()>;
}

/// Threads and sockets of the host OS
pub struct NativeBackend {
    config: NetConfig,
    pool: Option<WorkerPool>,
}

impl NativeBackend {
    /// Backend whose jobs run on a bounded [`WorkerPool`]
    pub fn new(net: NetConfig, server: &ServerConfig) -> Result<Self> {
        Ok(Self {
            config: net,
            pool: Some(WorkerPool::new(server.workers, server.queue_capacity)?),
        })
    }

    /// Backend without a pool; every dispatched job gets its own thread.
    ///
    /// Meant for clients, which only connect.
    pub fn unpooled(net: NetConfig) -> Self {
        Self {
            config: net,
            pool: None,
        }
    }
}

impl Backend for NativeBackend {
    fn dispatch(&self, job: Job) -> Result<()> {
        match &self.pool {
            Some(pool) => pool.dispatch(job),
            None => {
                thread::Builder::new()
                    .name("operator-job".into())
                    .spawn(job)?;
                Ok(())
            }
        }
    }

    fn connect(&self, host: &str, port: u16) -> Result<TcpStream> {
        connect(host, port, &self.config)
    }

    fn listen(&self, host: &str, port: u16, use_ipv6: bool, backlog: i32) -> Result<TcpListener> {
        listen(host, port, use_ipv6, backlog)
    }

    fn configure(&self, stream: &TcpStream) -> Result<()> {
        configure(stream, &self.config)
    }
}

/// Connect to `host:port`, trying every resolved address within the connect deadline
pub fn connect(host: &str, port: u16, config: &NetConfig) -> Result<TcpStream> {
    let mut last_err = None;
    for addr in (host, port).to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, config.connect_timeout()) {
            Ok(stream) => {
                configure(&stream, config)?;
                return Ok(stream);
            }
            Err(e) => {
                debug!(%addr, error = %e, "connect attempt failed");
                last_err = Some(e);
            }
        }
    }
    Err(match last_err {
        Some(e) => e.into(),
        None => ProtocolError::Connection(io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("{host}:{port} resolved to no address"),
        )),
    })
}

/// Bind a listening socket with an explicit backlog.
///
/// An empty `host` binds the unspecified address of the chosen family.
pub fn listen(host: &str, port: u16, use_ipv6: bool, backlog: i32) -> Result<TcpListener> {
    let addr = if host.is_empty() {
        let ip = if use_ipv6 {
            IpAddr::V6(Ipv6Addr::UNSPECIFIED)
        } else {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        };
        SocketAddr::new(ip, port)
    } else {
        (host, port)
            .to_socket_addrs()?
            .find(|addr| addr.is_ipv6() == use_ipv6)
            .ok_or_else(|| {
                ProtocolError::Connection(io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    format!("{host} has no {} address", if use_ipv6 { "IPv6" } else { "IPv4" }),
                ))
            })?
    };

    let domain = if use_ipv6 { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&SockAddr::from(addr))?;
    socket.listen(backlog)?;
    debug!(%addr, backlog, "listening");
    Ok(socket.into())
}

fn configure(stream: &TcpStream, config: &NetConfig) -> Result<()> {
    stream.set_read_timeout(Some(config.io_timeout()))?;
    stream.set_write_timeout(Some(config.io_timeout()))?;
    stream.set_nodelay(true)?;
    Ok(())
}

/// Fixed set of worker threads draining a bounded job queue
pub struct WorkerPool {
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(workers: usize, queue_capacity: usize) -> Result<Self> {
        let (sender, receiver) = bounded::<Job>(queue_capacity);
        let workers = (0..workers.max(1))
            .map(|id| {
                let receiver = receiver.clone();
                thread::Builder::new()
                    .name(format!("operator-worker-{id}"))
                    .spawn(move || {
                        for job in receiver.iter() {
                            if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                                error!(worker = id, "connection handler panicked");
                            }
                        }
                        debug!(worker = id, "worker stopped");
                    })
            })
            .collect::<io::Result<Vec<_>>>()?;

        Ok(Self {
            sender: Some(sender),
            workers,
        })
    }

    pub fn dispatch(&self, job: Job) -> Result<()> {
        let Some(sender) = &self.sender else {
            return Err(ProtocolError::Overloaded);
        };
        match sender.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(ProtocolError::Overloaded),
            Err(TrySendError::Disconnected(_)) => Err(ProtocolError::Connection(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "worker pool stopped",
            ))),
        }
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Jobs waiting for a free worker
    pub fn queued(&self) -> usize {
        self.sender.as_ref().map_or(0, Sender::len)
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // closing the queue lets workers finish what is queued, then exit
        self.sender.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}
