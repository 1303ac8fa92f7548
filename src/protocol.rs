//! Request/response exchanges on top of the PDU framing.
//!
//! [`Protocol`] is the contract every protocol variant implements; variant 0
//! ([`Protocol0`], version byte `0xA0`) is the byte protocol where each scalar
//! travels as one unsigned byte.

use std::io::{Cursor, Read, Write};
use std::time::Duration;

use anyhow::{bail, Context};
use byteorder::{NetworkEndian, ReadBytesExt, WriteBytesExt};
use tracing::{debug, warn};

use crate::data::{Datum, Scalar, Set};
use crate::endpoint::Endpoint;
use crate::error::{ProtocolError, Result};
use crate::operator::Affinity;
use crate::unit::{UnitType, VERSION_0};
use crate::Pdu;

/// Default cap on a single payload
pub const DEFAULT_MAX_PAYLOAD: u64 = 16 * 1024 * 1024;

/// Operations a protocol variant offers over an established connection
pub trait Protocol {
    /// Version byte carried in every header of this variant
    fn version(&self) -> u8;

    fn local_search<S: Read + Write>(&self, conn: &mut S, set: &Set, time: Duration)
        -> Result<Set>;

    fn propagating_search<S: Read + Write>(
        &self,
        conn: &mut S,
        set: &Set,
        depth: u32,
        time: Duration,
    ) -> Result<Set>;

    fn get_acceptable_data<S: Read + Write>(&self, conn: &mut S) -> Result<Set>;

    /// Ask the peer for its affinity table
    fn get_affinities<S: Read + Write>(&self, conn: &mut S) -> Result<Vec<Affinity>>;

    /// Run one row through the peer's affinity `index`
    fn process_data<S: Read + Write>(
        &self,
        conn: &mut S,
        index: u8,
        input: &[Scalar],
    ) -> Result<Vec<Scalar>>;

    /// Serve requests arriving on `conn` with `endpoint` until the peer hangs up
    fn dispatch<S, E>(&self, conn: &mut S, endpoint: &E) -> Result<()>
    where
        S: Read + Write,
        E: Endpoint + ?Sized;
}

/// Pick the protocol variant a version byte belongs to
pub fn select(version: u8, max_payload: u64) -> Result<Protocol0> {
    match version {
        VERSION_0 => Ok(Protocol0::new(max_payload)),
        found => Err(ProtocolError::VersionMismatch {
            expected: VERSION_0,
            found,
        }),
    }
}

/// Byte protocol, version `0xA0`
#[derive(Clone, Copy, Debug)]
pub struct Protocol0 {
    max_payload: u64,
}

impl Default for Protocol0 {
    fn default() -> Self {
        Self {
            max_payload: DEFAULT_MAX_PAYLOAD,
        }
    }
}

impl Protocol0 {
    pub fn new(max_payload: u64) -> Self {
        Self { max_payload }
    }

    /// `PROCESS_DATA` request: affinity index followed by one byte per input
    pub fn process_data_request(index: u8, input: &[Scalar]) -> Pdu {
        let mut payload = Vec::with_capacity(input.len() + 1);
        payload.push(index);
        payload.extend(input.iter().map(|&value| Datum(value).to_wire()));
        Pdu::new(UnitType::ProcessData, UnitType::ItemResponse, payload)
    }

    /// `ITEM_RESPONSE`: one byte per output
    pub fn item_response(output: &[Scalar]) -> Pdu {
        let payload = output.iter().map(|&value| Datum(value).to_wire()).collect();
        Pdu::new(UnitType::ItemResponse, UnitType::Nothing, payload)
    }

    /// `AFFINITY_RESPONSE`: `(u32 inputs, u32 outputs)` per affinity, in index order
    pub fn affinity_response(affinities: &[Affinity]) -> Result<Pdu> {
        let mut payload = Vec::with_capacity(affinities.len() * 8);
        for affinity in affinities {
            payload.write_u32::<NetworkEndian>(arity_to_wire(affinity.inputs)?)?;
            payload.write_u32::<NetworkEndian>(arity_to_wire(affinity.outputs)?)?;
        }
        Ok(Pdu::new(
            UnitType::AffinityResponse,
            UnitType::Nothing,
            payload,
        ))
    }

    /// Failure frame carrying a diagnostic message
    pub fn error_response(unit: UnitType, message: &str) -> Pdu {
        debug_assert!(unit.is_error());
        Pdu::new(unit, UnitType::Nothing, message.as_bytes().to_vec())
    }

    pub fn decode_affinities(payload: &[u8]) -> Result<Vec<Affinity>> {
        if payload.len() % 8 != 0 {
            return Err(ProtocolError::MalformedFrame(format!(
                "affinity table of {} bytes is not a multiple of 8",
                payload.len()
            )));
        }
        let mut cursor = Cursor::new(payload);
        let mut affinities = Vec::with_capacity(payload.len() / 8);
        for _ in 0..payload.len() / 8 {
            let inputs = cursor.read_u32::<NetworkEndian>()? as usize;
            let outputs = cursor.read_u32::<NetworkEndian>()? as usize;
            affinities.push(Affinity { inputs, outputs });
        }
        Ok(affinities)
    }

    fn round_trip<S: Read + Write>(
        &self,
        conn: &mut S,
        request: &Pdu,
        expected: UnitType,
    ) -> Result<Pdu> {
        request.write_to(conn)?;
        let response = Pdu::read_from(conn, self.max_payload)?.ok_or_else(|| {
            ProtocolError::MalformedFrame("connection closed before the response".into())
        })?;

        let unit = response.hdr.unit_type;
        if unit.is_error() {
            return Err(ProtocolError::RemoteProcessing {
                unit,
                message: String::from_utf8_lossy(&response.payload).into_owned(),
            });
        }
        if unit != expected {
            return Err(ProtocolError::UnexpectedUnit {
                expected,
                found: unit,
            });
        }
        Ok(response)
    }

    fn respond<E: Endpoint + ?Sized>(&self, request: &Pdu, endpoint: &E) -> Result<Pdu> {
        match request.hdr.unit_type {
            UnitType::ProcessData => match serve_process_data(&request.payload, endpoint) {
                Ok(output) => Ok(Self::item_response(&output)),
                Err(e) => {
                    let message = format!("{e:#}");
                    warn!(%message, "process request failed");
                    Ok(Self::error_response(UnitType::DataError, &message))
                }
            },
            UnitType::GetAffinities => Self::affinity_response(&endpoint.affinities()),
            other if other.is_request() => {
                warn!(unit = ?other, "rejecting unhandled request");
                Ok(Self::error_response(
                    UnitType::UnitError,
                    &format!("{other:?} is not handled by this operator"),
                ))
            }
            other => {
                warn!(unit = ?other, "rejecting non-request unit");
                Ok(Self::error_response(
                    UnitType::UnitError,
                    &format!("{other:?} is not a request"),
                ))
            }
        }
    }
}

impl Protocol for Protocol0 {
    fn version(&self) -> u8 {
        VERSION_0
    }

    fn local_search<S: Read + Write>(
        &self,
        _conn: &mut S,
        _set: &Set,
        _time: Duration,
    ) -> Result<Set> {
        Err(ProtocolError::Unsupported(UnitType::LocalSearch))
    }

    fn propagating_search<S: Read + Write>(
        &self,
        _conn: &mut S,
        _set: &Set,
        _depth: u32,
        _time: Duration,
    ) -> Result<Set> {
        Err(ProtocolError::Unsupported(UnitType::PropagatingSearch))
    }

    fn get_acceptable_data<S: Read + Write>(&self, _conn: &mut S) -> Result<Set> {
        Err(ProtocolError::Unsupported(UnitType::GetAcceptableData))
    }

    fn get_affinities<S: Read + Write>(&self, conn: &mut S) -> Result<Vec<Affinity>> {
        let request = Pdu::new(
            UnitType::GetAffinities,
            UnitType::AffinityResponse,
            Vec::new(),
        );
        let response = self.round_trip(conn, &request, UnitType::AffinityResponse)?;
        Self::decode_affinities(&response.payload)
    }

    fn process_data<S: Read + Write>(
        &self,
        conn: &mut S,
        index: u8,
        input: &[Scalar],
    ) -> Result<Vec<Scalar>> {
        let request = Self::process_data_request(index, input);
        let response = self.round_trip(conn, &request, UnitType::ItemResponse)?;
        Ok(response
            .payload
            .iter()
            .map(|&byte| Datum::from_wire(byte).0)
            .collect())
    }

    fn dispatch<S, E>(&self, conn: &mut S, endpoint: &E) -> Result<()>
    where
        S: Read + Write,
        E: Endpoint + ?Sized,
    {
        loop {
            let request = match Pdu::read_from(conn, self.max_payload) {
                Ok(Some(request)) => request,
                Ok(None) => return Ok(()),
                Err(e @ ProtocolError::VersionMismatch { .. }) => {
                    Self::error_response(UnitType::IncompatibleError, &e.to_string())
                        .write_to(conn)?;
                    return Err(e);
                }
                Err(e @ ProtocolError::UnsupportedUnitType(_)) => {
                    warn!(error = %e, "rejecting unknown unit");
                    Self::error_response(UnitType::UnitError, &e.to_string()).write_to(conn)?;
                    continue;
                }
                Err(e) => return Err(e),
            };
            debug!(unit = ?request.hdr.unit_type, len = request.hdr.length, "request");
            self.respond(&request, endpoint)?.write_to(conn)?;
        }
    }
}

fn serve_process_data<E: Endpoint + ?Sized>(
    payload: &[u8],
    endpoint: &E,
) -> anyhow::Result<Vec<Scalar>> {
    let Some((&index, input)) = payload.split_first() else {
        bail!("missing affinity index");
    };
    let affinities = endpoint.affinities();
    let Some(affinity) = affinities.get(usize::from(index)) else {
        bail!(
            "affinity {index} not offered ({} available)",
            affinities.len()
        );
    };
    if input.len() != affinity.inputs {
        bail!(
            "affinity {index} takes {} inputs, got {}",
            affinity.inputs,
            input.len()
        );
    }

    let input: Vec<Scalar> = input.iter().map(|&byte| Datum::from_wire(byte).0).collect();
    let output = endpoint
        .process_data(index, &input)
        .with_context(|| format!("affinity {index}"))?;
    if output.len() != affinity.outputs {
        bail!(
            "affinity {index} produced {} outputs, declared {}",
            output.len(),
            affinity.outputs
        );
    }
    Ok(output)
}

fn arity_to_wire(arity: usize) -> Result<u32> {
    u32::try_from(arity)
        .map_err(|_| ProtocolError::MalformedFrame(format!("arity {arity} exceeds u32")))
}
