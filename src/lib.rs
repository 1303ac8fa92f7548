//! Awareness operator protocol: operators expose affinities over a framed
//! binary protocol and clients chain them into assemblies.

use byteorder::{NetworkEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Cursor, Read, Write};
use tracing::trace;

pub mod assembly;
pub mod backend;
pub mod config;
pub mod data;
pub mod endpoint;
pub mod error;
pub mod operator;
pub mod protocol;
pub mod unit;

pub use assembly::{Assembly, AssemblyError, OffsetConvention, Operation, Progress, ProgressHook};
pub use backend::{Backend, NativeBackend, WorkerPool};
pub use config::{AssemblyConfig, NetConfig, OperatorConfig, ServerConfig};
pub use data::{Datum, Item, Scalar, Set, Stream};
pub use endpoint::{Endpoint, Provider};
pub use error::{ProtocolError, Result};
pub use operator::{Affinity, Connector, OperatorSession, RemoteOperator, TcpConnector};
pub use protocol::{Protocol, Protocol0};
pub use unit::{UnitType, VERSION_0};

/// Size of the fixed PDU header on the wire
pub const HEADER_LEN: usize = 19;

/// PDU header: version, unit type, requested type and payload length
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PduHeader {
    pub version: u8,
    pub unit_type: UnitType,
    pub requested_type: UnitType,
    pub length: u64,
}

impl PduHeader {
    /// Encode header to its 19 wire bytes
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(HEADER_LEN);
        buf.write_u8(self.version)?;
        buf.write_u8(self.unit_type as u8)?;
        buf.write_u8(self.requested_type as u8)?;
        buf.write_u64::<NetworkEndian>(self.length)?;
        Ok(buf)
    }

    /// Decode header from its wire bytes
    pub fn decode(data: &[u8]) -> Result<Self> {
        let (version, unit_type, requested_type, length) = split_header(data)?;
        Ok(PduHeader {
            version,
            unit_type: unit_from_byte(unit_type)?,
            requested_type: unit_from_byte(requested_type)?,
            length,
        })
    }
}

/// Complete PDU
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pdu {
    pub hdr: PduHeader,
    pub payload: Vec<u8>,
}

impl Pdu {
    /// Build a PDU of protocol variant 0 around `payload`
    pub fn new(unit_type: UnitType, requested_type: UnitType, payload: Vec<u8>) -> Self {
        Pdu {
            hdr: PduHeader {
                version: VERSION_0,
                unit_type,
                requested_type,
                length: payload.len() as u64,
            },
            payload,
        }
    }

    /// Encode PDU to bytes
    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.hdr.length != self.payload.len() as u64 {
            return Err(ProtocolError::MalformedFrame(format!(
                "header announces {} bytes, payload has {}",
                self.hdr.length,
                self.payload.len()
            )));
        }
        let mut buf = self.hdr.encode()?;
        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }

    /// Decode PDU from a buffer holding exactly one frame
    pub fn decode(data: &[u8]) -> Result<Self> {
        let hdr = PduHeader::decode(data)?;
        let payload = &data[HEADER_LEN..];
        if payload.len() as u64 != hdr.length {
            return Err(ProtocolError::MalformedFrame(format!(
                "header announces {} bytes, frame carries {}",
                hdr.length,
                payload.len()
            )));
        }
        Ok(Pdu {
            hdr,
            payload: payload.to_vec(),
        })
    }

    /// Write the whole frame
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        let bytes = self.encode()?;
        writer.write_all(&bytes)?;
        writer.flush()?;
        trace!(unit = ?self.hdr.unit_type, len = self.hdr.length, "pdu sent");
        Ok(())
    }

    /// Read one frame from a stream.
    ///
    /// Returns `Ok(None)` when the peer closed before sending any header byte.
    /// The version is checked before the payload is read; unknown unit codes
    /// are reported after the payload is consumed, so the stream stays aligned.
    pub fn read_from<R: Read>(reader: &mut R, max_payload: u64) -> Result<Option<Self>> {
        let mut header = [0u8; HEADER_LEN];
        match read_full(reader, &mut header)? {
            0 => return Ok(None),
            HEADER_LEN => {}
            n => {
                return Err(ProtocolError::MalformedFrame(format!(
                    "connection closed after {n} of {HEADER_LEN} header bytes"
                )))
            }
        }

        let (version, unit_type, requested_type, length) = split_header(&header)?;
        if version != VERSION_0 {
            return Err(ProtocolError::VersionMismatch {
                expected: VERSION_0,
                found: version,
            });
        }
        if length > max_payload {
            return Err(ProtocolError::MalformedFrame(format!(
                "payload too large: {length} bytes (max {max_payload})"
            )));
        }

        let mut payload = vec![0u8; length as usize];
        reader.read_exact(&mut payload)?;

        let pdu = Pdu {
            hdr: PduHeader {
                version,
                unit_type: unit_from_byte(unit_type)?,
                requested_type: unit_from_byte(requested_type)?,
                length,
            },
            payload,
        };
        trace!(unit = ?pdu.hdr.unit_type, len = length, "pdu received");
        Ok(Some(pdu))
    }
}

fn split_header(data: &[u8]) -> Result<(u8, u8, u8, u64)> {
    if data.len() < HEADER_LEN {
        return Err(ProtocolError::MalformedFrame(format!(
            "header needs {HEADER_LEN} bytes, got {}",
            data.len()
        )));
    }
    let mut cursor = Cursor::new(data);
    let version = cursor.read_u8()?;
    let unit_type = cursor.read_u8()?;
    let requested_type = cursor.read_u8()?;
    let length = cursor.read_u64::<NetworkEndian>()?;
    Ok((version, unit_type, requested_type, length))
}

fn unit_from_byte(byte: u8) -> Result<UnitType> {
    UnitType::from_u8(byte).ok_or(ProtocolError::UnsupportedUnitType(byte))
}

/// Fill `buf` until it is full or the reader hits EOF; returns bytes read
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
