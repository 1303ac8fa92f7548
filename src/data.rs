//! Parameter vectors and their slicing algebra.
//!
//! An [`Item`] is one dataset row, a [`Stream`] is a sequence of rows and a
//! [`Set`] pairs an input stream with an output stream. Everything serializes
//! to a flat sequence of [`Datum`]s in row order.
//!
//! Bounds are never rejected: ranges are clamped to the item length, the
//! same way for [`Stream::extract`], [`Stream::inject`] and [`Stream::splice`].

use std::ops::Range;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{ProtocolError, Result};

pub type Scalar = f64;

/// Smallest unit put on the wire, one scalar
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Datum(pub Scalar);

impl Datum {
    /// Quantize to a wire byte. Fractions are truncated, out-of-range values
    /// saturate to 0 or 255 and NaN becomes 0.
    pub fn to_wire(self) -> u8 {
        self.0 as u8
    }

    pub fn from_wire(byte: u8) -> Self {
        Datum(Scalar::from(byte))
    }
}

/// One dataset row
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub parameters: Vec<Scalar>,
}

impl Item {
    pub fn new(parameters: impl Into<Vec<Scalar>>) -> Self {
        Self {
            parameters: parameters.into(),
        }
    }

    pub fn to_datums(&self) -> Vec<Datum> {
        self.parameters.iter().copied().map(Datum).collect()
    }

    pub fn from_datums(datums: &[Datum]) -> Self {
        Self {
            parameters: datums.iter().map(|d| d.0).collect(),
        }
    }

    pub fn count(&self) -> usize {
        self.parameters.len()
    }

    fn clamp(&self, start: usize, end: usize) -> Range<usize> {
        let len = self.parameters.len();
        let start = start.min(len);
        start..end.min(len).max(start)
    }
}

/// Ordered sequence of rows, normally of uniform arity
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Stream {
    pub items: Vec<Item>,
}

impl Stream {
    pub fn new(items: impl Into<Vec<Item>>) -> Self {
        Self {
            items: items.into(),
        }
    }

    /// `count` rows of `parameters` zeros each
    pub fn blank(count: usize, parameters: usize) -> Self {
        Self {
            items: (0..count)
                .map(|_| Item::new(vec![0.0; parameters]))
                .collect(),
        }
    }

    pub fn to_datums(&self) -> Vec<Datum> {
        self.items.iter().flat_map(Item::to_datums).collect()
    }

    /// Number of rows
    pub fn count(&self) -> usize {
        self.items.len()
    }

    /// Parameters per row, read from the first row
    pub fn arity(&self) -> usize {
        self.items.first().map_or(0, Item::count)
    }

    /// Project every row onto the half-open parameter range `[start, end)`
    pub fn extract(&self, start: usize, end: usize) -> Stream {
        Stream {
            items: self
                .items
                .iter()
                .map(|item| Item::new(&item.parameters[item.clamp(start, end)]))
                .collect(),
        }
    }

    /// Replace the parameter range `[start, end]` (upper bound inclusive) of
    /// every row with the parameters of `other`'s row at the same position.
    ///
    /// The replaced range and the incoming parameters need not have the same
    /// length, so rows may grow or shrink; the row count never changes.
    pub fn inject(&mut self, other: &Stream, start: usize, end: usize) -> Result<()> {
        self.replace_range(other, start, end.saturating_add(1))
    }

    /// Like [`Stream::inject`] but with an exclusive upper bound `[start, end)`
    pub fn splice(&mut self, other: &Stream, start: usize, end: usize) -> Result<()> {
        self.replace_range(other, start, end)
    }

    fn replace_range(&mut self, other: &Stream, start: usize, stop: usize) -> Result<()> {
        if self.count() != other.count() {
            return Err(ProtocolError::RowCountMismatch {
                left: self.count(),
                right: other.count(),
            });
        }
        for (item, replacement) in self.items.iter_mut().zip(&other.items) {
            let range = item.clamp(start, stop);
            item.parameters
                .splice(range, replacement.parameters.iter().copied());
        }
        Ok(())
    }

    /// Partition a flat datum sequence into `count` equally sized rows.
    ///
    /// Datums past `count * (datums.len() / count)` are dropped.
    pub fn from_count_datums(count: usize, datums: &[Datum]) -> Stream {
        if count == 0 {
            return Stream::default();
        }
        let per_item = datums.len() / count;
        let dropped = datums.len() - per_item * count;
        if dropped > 0 {
            warn!(count, per_item, dropped, "dropping trailing datums");
        }
        Stream {
            items: (0..count)
                .map(|i| Item::from_datums(&datums[i * per_item..(i + 1) * per_item]))
                .collect(),
        }
    }

    /// Like [`Stream::from_count_datums`] but refuses to drop anything
    pub fn from_count_datums_exact(count: usize, datums: &[Datum]) -> Result<Stream> {
        let uneven = match count {
            0 => !datums.is_empty(),
            _ => datums.len() % count != 0,
        };
        if uneven {
            return Err(ProtocolError::Truncation {
                datums: datums.len(),
                count,
            });
        }
        Ok(Self::from_count_datums(count, datums))
    }
}

/// A dataset split into input rows and output rows of equal count
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Set {
    pub input: Stream,
    pub output: Stream,
}

impl Set {
    pub fn new(input: Stream, output: Stream) -> Result<Self> {
        if input.count() != output.count() {
            return Err(ProtocolError::RowCountMismatch {
                left: input.count(),
                right: output.count(),
            });
        }
        Ok(Self { input, output })
    }

    /// All input datums followed by all output datums
    pub fn to_datums(&self) -> Vec<Datum> {
        let mut datums = self.input.to_datums();
        datums.extend(self.output.to_datums());
        datums
    }

    pub fn from_inputs_outputs_count_datums(
        n_inputs: usize,
        n_outputs: usize,
        count: usize,
        datums: &[Datum],
    ) -> Set {
        let split = n_inputs.saturating_mul(count).min(datums.len());
        let stop = split
            .saturating_add(n_outputs.saturating_mul(count))
            .min(datums.len());
        Set {
            input: Stream::from_count_datums(count, &datums[..split]),
            output: Stream::from_count_datums(count, &datums[split..stop]),
        }
    }

    pub fn count(&self) -> usize {
        self.input.count()
    }

    pub fn n_inputs(&self) -> usize {
        self.input.arity()
    }

    pub fn n_outputs(&self) -> usize {
        self.output.arity()
    }
}
