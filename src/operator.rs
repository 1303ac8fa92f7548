//! Client side of an operator: a scoped session to one remote node.

use std::net::{Shutdown, TcpStream};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::backend::{Backend, NativeBackend};
use crate::config::NetConfig;
use crate::data::{Item, Stream};
use crate::error::{ProtocolError, Result};
use crate::protocol::{Protocol, Protocol0};

/// Input/output arity of one processing capability
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Affinity {
    pub inputs: usize,
    pub outputs: usize,
}

/// An open session to a remote operator. Dropping it releases the connection.
pub trait OperatorSession {
    /// Affinity table of the remote, indexed by affinity index
    fn retrieve_affinities(&mut self) -> Result<&[Affinity]>;

    /// Run every row of `stream` through affinity `index`
    fn process(&mut self, index: u8, stream: &Stream) -> Result<Stream>;

    fn affinity(&mut self, index: u8) -> Result<Affinity> {
        let table = self.retrieve_affinities()?;
        table
            .get(usize::from(index))
            .copied()
            .ok_or(ProtocolError::AffinityLookup {
                index,
                available: table.len(),
            })
    }
}

/// Opens sessions to operators by address
pub trait Connector {
    type Session: OperatorSession;

    fn connect(&self, address: &str, port: u16) -> Result<Self::Session>;
}

/// Session speaking protocol variant 0 over TCP
#[derive(Debug)]
pub struct RemoteOperator {
    address: String,
    port: u16,
    stream: TcpStream,
    protocol: Protocol0,
    affinities: Option<Vec<Affinity>>,
}

impl RemoteOperator {
    /// Open a session with the deadlines and protocol version of `config`
    pub fn connect(address: &str, port: u16, config: &NetConfig) -> Result<Self> {
        let protocol = config.protocol()?;
        Self::open(&NativeBackend::unpooled(config.clone()), protocol, address, port)
    }

    /// Open a session over a connection made by `backend`
    pub fn open<B: Backend + ?Sized>(
        backend: &B,
        protocol: Protocol0,
        address: &str,
        port: u16,
    ) -> Result<Self> {
        let stream = backend.connect(address, port)?;
        debug!(address, port, version = protocol.version(), "operator session opened");
        Ok(Self {
            address: address.to_owned(),
            port,
            stream,
            protocol,
            affinities: None,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl OperatorSession for RemoteOperator {
    fn retrieve_affinities(&mut self) -> Result<&[Affinity]> {
        let affinities = match self.affinities.take() {
            Some(cached) => cached,
            None => {
                let fetched = self.protocol.get_affinities(&mut self.stream)?;
                debug!(count = fetched.len(), "affinity table retrieved");
                fetched
            }
        };
        Ok(self.affinities.insert(affinities).as_slice())
    }

    fn process(&mut self, index: u8, stream: &Stream) -> Result<Stream> {
        let mut items = Vec::with_capacity(stream.count());
        for item in &stream.items {
            let output = self
                .protocol
                .process_data(&mut self.stream, index, &item.parameters)?;
            items.push(Item::new(output));
        }
        debug!(index, rows = items.len(), "stream processed");
        Ok(Stream::new(items))
    }
}

impl Drop for RemoteOperator {
    fn drop(&mut self) {
        // peer may already be gone
        let _ = self.stream.shutdown(Shutdown::Both);
        debug!(address = %self.address, port = self.port, "operator session released");
    }
}

/// Connects [`RemoteOperator`]s with the deadlines of a [`NetConfig`]
pub struct TcpConnector {
    backend: NativeBackend,
    protocol: Protocol0,
}

impl TcpConnector {
    pub fn new(config: NetConfig) -> Result<Self> {
        let protocol = config.protocol()?;
        Ok(Self {
            backend: NativeBackend::unpooled(config),
            protocol,
        })
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self {
            backend: NativeBackend::unpooled(NetConfig::default()),
            protocol: Protocol0::default(),
        }
    }
}

impl Connector for TcpConnector {
    type Session = RemoteOperator;

    fn connect(&self, address: &str, port: u16) -> Result<RemoteOperator> {
        RemoteOperator::open(&self.backend, self.protocol, address, port)
    }
}
