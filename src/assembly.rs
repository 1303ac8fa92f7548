//! Assemblies: ordered chains of remote operations over a shared stream.
//!
//! Each [`Operation`] reads a window of every row, sends it to an affinity on
//! some operator and writes the answer back into the rows, possibly at a
//! different offset. Operations run one after another; the stream mutated by
//! one operation is the input of the next.
//!
//! A run stops at the first failing operation. Nothing is rolled back: rows
//! keep whatever earlier operations wrote into them.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, info_span};

use crate::data::Stream;
use crate::error::{ProtocolError, Result};
use crate::operator::{Connector, OperatorSession};

/// How the output window `[offset, offset + outputs]` is bounded when written back
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OffsetConvention {
    /// Upper bound included, as existing operators expect
    #[default]
    Inclusive,
    /// Upper bound excluded, matching how inputs are read
    Exclusive,
}

/// One remote call of an assembly
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub address: String,
    pub port: u16,
    pub affinity_index: u8,
    pub input_offset: usize,
    pub output_offset: usize,
}

/// Ordered, immutable list of operations
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assembly {
    operations: Vec<Operation>,
}

/// Operations completed so far in a run
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Progress {
    pub completed: usize,
    pub total: usize,
}

/// Callback invoked after every `frequency` completed operations
pub struct ProgressHook<'a> {
    frequency: usize,
    callback: Box<dyn FnMut(Progress) + 'a>,
}

impl<'a> ProgressHook<'a> {
    /// A `frequency` of zero never fires
    pub fn new(frequency: usize, callback: impl FnMut(Progress) + 'a) -> Self {
        Self {
            frequency,
            callback: Box::new(callback),
        }
    }

    fn completed(&mut self, progress: Progress) {
        if self.frequency != 0 && progress.completed % self.frequency == 0 {
            (self.callback)(progress);
        }
    }
}

/// A failed operation of an assembly run
#[derive(Debug, Error)]
#[error("operation {position} (affinity {affinity_index} on {address}:{port}) failed: {source}")]
pub struct AssemblyError {
    pub position: usize,
    pub address: String,
    pub port: u16,
    pub affinity_index: u8,
    #[source]
    pub source: ProtocolError,
}

impl Assembly {
    pub fn new(operations: Vec<Operation>) -> Self {
        Self { operations }
    }

    /// Build from wire records whose addresses may carry NUL padding
    pub fn from_records(records: impl IntoIterator<Item = Operation>) -> Self {
        Self {
            operations: records
                .into_iter()
                .map(|mut op| {
                    let trimmed = op.address.trim_end_matches('\0').len();
                    op.address.truncate(trimmed);
                    op
                })
                .collect(),
        }
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Config(e.to_string()))
    }

    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| ProtocolError::Config(e.to_string()))
    }

    /// Thread `stream` through every operation in order.
    ///
    /// On failure `stream` holds the writes of all operations before the
    /// failing one.
    pub fn run<C: Connector>(
        &self,
        connector: &C,
        stream: &mut Stream,
        convention: OffsetConvention,
        mut progress: Option<&mut ProgressHook<'_>>,
    ) -> std::result::Result<(), AssemblyError> {
        let total = self.operations.len();
        info!(operations = total, rows = stream.count(), "assembly run started");

        for (position, op) in self.operations.iter().enumerate() {
            let span = info_span!(
                "operation",
                position,
                address = %op.address,
                port = op.port,
                affinity = op.affinity_index
            );
            let _enter = span.enter();

            run_operation(op, connector, stream, convention).map_err(|source| AssemblyError {
                position,
                address: op.address.clone(),
                port: op.port,
                affinity_index: op.affinity_index,
                source,
            })?;

            if let Some(hook) = progress.as_deref_mut() {
                hook.completed(Progress {
                    completed: position + 1,
                    total,
                });
            }
        }

        info!(arity = stream.arity(), "assembly run finished");
        Ok(())
    }
}

fn run_operation<C: Connector>(
    op: &Operation,
    connector: &C,
    stream: &mut Stream,
    convention: OffsetConvention,
) -> Result<()> {
    let mut session = connector.connect(&op.address, op.port)?;
    let affinity = session.affinity(op.affinity_index)?;

    let section = stream.extract(
        op.input_offset,
        op.input_offset.saturating_add(affinity.inputs),
    );
    let result = session.process(op.affinity_index, &section)?;
    if let Some(item) = result.items.iter().find(|item| item.count() != affinity.outputs) {
        return Err(ProtocolError::ArityMismatch {
            expected: affinity.outputs,
            found: item.count(),
        });
    }

    let start = op.output_offset;
    let end = op.output_offset.saturating_add(affinity.outputs);
    match convention {
        OffsetConvention::Inclusive => stream.inject(&result, start, end)?,
        OffsetConvention::Exclusive => stream.splice(&result, start, end)?,
    }
    debug!(
        inputs = affinity.inputs,
        outputs = affinity.outputs,
        arity = stream.arity(),
        "operation applied"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Item, Scalar};
    use crate::operator::Affinity;
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::io;
    use std::rc::Rc;

    type Func = fn(&[Scalar]) -> Vec<Scalar>;

    #[derive(Clone)]
    struct Stub {
        affinities: Vec<Affinity>,
        func: Func,
    }

    /// Connector to in-process operators keyed by port; records session events
    #[derive(Default)]
    struct StubConnector {
        operators: HashMap<u16, Stub>,
        events: Rc<RefCell<Vec<String>>>,
    }

    impl StubConnector {
        fn with(mut self, port: u16, inputs: usize, outputs: usize, func: Func) -> Self {
            self.operators.insert(
                port,
                Stub {
                    affinities: vec![Affinity { inputs, outputs }],
                    func,
                },
            );
            self
        }

        fn events(&self) -> Vec<String> {
            self.events.borrow().clone()
        }
    }

    struct StubSession {
        port: u16,
        stub: Stub,
        events: Rc<RefCell<Vec<String>>>,
    }

    impl OperatorSession for StubSession {
        fn retrieve_affinities(&mut self) -> Result<&[Affinity]> {
            Ok(&self.stub.affinities)
        }

        fn process(&mut self, _index: u8, stream: &Stream) -> Result<Stream> {
            Ok(Stream::new(
                stream
                    .items
                    .iter()
                    .map(|item| Item::new((self.stub.func)(&item.parameters)))
                    .collect::<Vec<_>>(),
            ))
        }
    }

    impl Drop for StubSession {
        fn drop(&mut self) {
            self.events.borrow_mut().push(format!("release {}", self.port));
        }
    }

    impl Connector for StubConnector {
        type Session = StubSession;

        fn connect(&self, _address: &str, port: u16) -> Result<StubSession> {
            self.events.borrow_mut().push(format!("connect {port}"));
            let stub = self.operators.get(&port).cloned().ok_or_else(|| {
                ProtocolError::Connection(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    "refused",
                ))
            })?;
            Ok(StubSession {
                port,
                stub,
                events: Rc::clone(&self.events),
            })
        }
    }

    fn op(port: u16, input_offset: usize, output_offset: usize) -> Operation {
        Operation {
            address: "127.0.0.1".into(),
            port,
            affinity_index: 0,
            input_offset,
            output_offset,
        }
    }

    fn sum(values: &[Scalar]) -> Vec<Scalar> {
        vec![values.iter().sum()]
    }

    fn product(values: &[Scalar]) -> Vec<Scalar> {
        vec![values.iter().product()]
    }

    fn rows() -> Stream {
        Stream::new(vec![
            Item::new(vec![1.0, 2.0, 3.0]),
            Item::new(vec![1.0, 2.0, 3.0]),
        ])
    }

    #[test]
    fn test_single_operation_appends_output() {
        let connector = StubConnector::default().with(1601, 3, 1, sum);
        let assembly = Assembly::new(vec![op(1601, 0, 3)]);
        let mut stream = rows();

        assembly
            .run(&connector, &mut stream, OffsetConvention::Inclusive, None)
            .unwrap();

        assert_eq!(stream.arity(), 4);
        for item in &stream.items {
            assert_eq!(item.parameters, vec![1.0, 2.0, 3.0, 6.0]);
        }
        assert_eq!(connector.events(), vec!["connect 1601", "release 1601"]);
    }

    #[test]
    fn test_operations_chain_through_stream() {
        let connector = StubConnector::default()
            .with(1601, 3, 1, sum)
            .with(1602, 2, 1, product);
        // second operation multiplies the fresh sum with the third parameter
        let assembly = Assembly::new(vec![op(1601, 0, 3), op(1602, 2, 4)]);
        let mut stream = rows();

        assembly
            .run(&connector, &mut stream, OffsetConvention::Inclusive, None)
            .unwrap();

        assert_eq!(stream.items[0].parameters, vec![1.0, 2.0, 3.0, 6.0, 18.0]);
        assert_eq!(
            connector.events(),
            vec!["connect 1601", "release 1601", "connect 1602", "release 1602"]
        );
    }

    #[test]
    fn test_inclusive_window_overwrites_one_extra_parameter() {
        let connector = StubConnector::default().with(1601, 1, 1, |v| vec![v[0] + 10.0]);
        let assembly = Assembly::new(vec![op(1601, 0, 1)]);

        let mut inclusive = rows();
        assembly
            .run(&connector, &mut inclusive, OffsetConvention::Inclusive, None)
            .unwrap();
        let mut exclusive = rows();
        assembly
            .run(&connector, &mut exclusive, OffsetConvention::Exclusive, None)
            .unwrap();

        assert_eq!(inclusive.items[0].parameters, vec![1.0, 11.0]);
        assert_eq!(exclusive.items[0].parameters, vec![1.0, 11.0, 3.0]);
    }

    #[test]
    fn test_refused_connection_aborts_run() {
        let connector = StubConnector::default()
            .with(1601, 3, 1, sum)
            .with(1603, 1, 1, sum);
        let assembly = Assembly::new(vec![op(1601, 0, 3), op(1602, 0, 4), op(1603, 0, 5)]);
        let mut stream = rows();

        let err = assembly
            .run(&connector, &mut stream, OffsetConvention::Inclusive, None)
            .unwrap_err();

        assert_eq!(err.position, 1);
        assert_eq!(err.port, 1602);
        assert_eq!(err.affinity_index, 0);
        assert!(err.source.is_transport());
        assert_eq!(
            connector.events(),
            vec!["connect 1601", "release 1601", "connect 1602"]
        );
        assert_eq!(stream.items[0].parameters, vec![1.0, 2.0, 3.0, 6.0]);
    }

    #[test]
    fn test_missing_affinity_releases_session() {
        let connector = StubConnector::default().with(1601, 3, 1, sum);
        let mut operation = op(1601, 0, 3);
        operation.affinity_index = 4;
        let mut stream = rows();

        let err = Assembly::new(vec![operation])
            .run(&connector, &mut stream, OffsetConvention::Inclusive, None)
            .unwrap_err();

        assert!(matches!(
            err.source,
            ProtocolError::AffinityLookup { index: 4, .. }
        ));
        assert_eq!(connector.events(), vec!["connect 1601", "release 1601"]);
        assert_eq!(stream, rows());
    }

    #[test]
    fn test_wrong_output_arity_is_rejected() {
        let connector = StubConnector::default().with(1601, 3, 2, sum);
        let mut stream = rows();

        let err = Assembly::new(vec![op(1601, 0, 3)])
            .run(&connector, &mut stream, OffsetConvention::Inclusive, None)
            .unwrap_err();

        assert!(matches!(
            err.source,
            ProtocolError::ArityMismatch {
                expected: 2,
                found: 1
            }
        ));
    }

    fn width(values: &[Scalar]) -> Vec<Scalar> {
        vec![values.len() as Scalar]
    }

    #[test]
    fn test_input_offset_past_any_row_reads_nothing() {
        let connector = StubConnector::default().with(1601, 1, 1, width);
        let mut stream = rows();

        Assembly::new(vec![op(1601, usize::MAX, 3)])
            .run(&connector, &mut stream, OffsetConvention::Inclusive, None)
            .unwrap();

        assert_eq!(stream.items[0].parameters, vec![1.0, 2.0, 3.0, 0.0]);
    }

    #[test]
    fn test_output_offset_past_any_row_appends() {
        let connector = StubConnector::default().with(1601, 2, 1, width);

        let mut inclusive = rows();
        Assembly::new(vec![op(1601, 0, usize::MAX)])
            .run(&connector, &mut inclusive, OffsetConvention::Inclusive, None)
            .unwrap();
        let mut exclusive = rows();
        Assembly::new(vec![op(1601, 0, usize::MAX)])
            .run(&connector, &mut exclusive, OffsetConvention::Exclusive, None)
            .unwrap();

        assert_eq!(inclusive.items[0].parameters, vec![1.0, 2.0, 3.0, 2.0]);
        assert_eq!(exclusive, inclusive);
    }

    #[test]
    fn test_huge_remote_arity_takes_whole_row() {
        let connector = StubConnector::default().with(1601, usize::MAX, 1, width);
        let mut stream = rows();

        Assembly::new(vec![op(1601, 1, 3)])
            .run(&connector, &mut stream, OffsetConvention::Exclusive, None)
            .unwrap();

        assert_eq!(stream.items[1].parameters, vec![1.0, 2.0, 3.0, 2.0]);
    }

    #[test]
    fn test_json_offsets_at_the_integer_limit() {
        let json = format!(
            r#"{{"operations":[{{"address":"127.0.0.1","port":1601,"affinity_index":0,"input_offset":{max},"output_offset":3}}]}}"#,
            max = usize::MAX
        );
        let assembly = Assembly::from_json_str(&json).unwrap();
        let connector = StubConnector::default().with(1601, 1, 1, width);
        let mut stream = rows();

        assembly
            .run(&connector, &mut stream, OffsetConvention::Inclusive, None)
            .unwrap();

        assert_eq!(stream.items[0].parameters, vec![1.0, 2.0, 3.0, 0.0]);
    }

    #[test]
    fn test_progress_hook_frequency() {
        let connector = StubConnector::default().with(1601, 1, 1, |v| v.to_vec());
        let assembly = Assembly::new(vec![op(1601, 0, 0); 5]);
        let mut seen = Vec::new();
        let mut hook = ProgressHook::new(2, |p| seen.push(p.completed));

        assembly
            .run(&connector, &mut rows(), OffsetConvention::Exclusive, Some(&mut hook))
            .unwrap();
        drop(hook);

        assert_eq!(seen, vec![2, 4]);
    }

    #[test]
    fn test_progress_hook_disabled() {
        let connector = StubConnector::default().with(1601, 1, 1, |v| v.to_vec());
        let mut calls = 0;
        let mut hook = ProgressHook::new(0, |_| calls += 1);

        Assembly::new(vec![op(1601, 0, 0); 3])
            .run(&connector, &mut rows(), OffsetConvention::Exclusive, Some(&mut hook))
            .unwrap();
        drop(hook);

        assert_eq!(calls, 0);
    }

    #[test]
    fn test_empty_assembly_leaves_stream() {
        let mut stream = rows();
        Assembly::default()
            .run(
                &StubConnector::default(),
                &mut stream,
                OffsetConvention::Inclusive,
                None,
            )
            .unwrap();
        assert_eq!(stream, rows());
    }

    #[test]
    fn test_from_records_strips_padding() {
        let mut padded = op(1601, 0, 3);
        padded.address = "10.0.0.7\0\0\0\0".into();

        let assembly = Assembly::from_records([padded]);

        assert_eq!(assembly.operations()[0].address, "10.0.0.7");
    }

    #[test]
    fn test_json_round_trip() {
        let assembly = Assembly::new(vec![op(1601, 0, 3), op(1602, 1, 4)]);
        let json = assembly.to_json_string().unwrap();
        assert_eq!(Assembly::from_json_str(&json).unwrap(), assembly);
        assert!(Assembly::from_json_str("[]").is_err());
    }

    #[test]
    fn test_error_message_names_operation() {
        let connector = StubConnector::default();
        let err = Assembly::new(vec![op(1700, 0, 0)])
            .run(&connector, &mut rows(), OffsetConvention::Inclusive, None)
            .unwrap_err();
        assert!(err
            .to_string()
            .starts_with("operation 0 (affinity 0 on 127.0.0.1:1700) failed"));
    }
}
