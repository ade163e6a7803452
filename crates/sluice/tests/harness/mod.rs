//! Test harness for driving the pump against scripted replication streams
//! and the in-memory warehouse.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use sluice::decoder::{
    BinlogEvent, ColumnValue, GtidEvent, QueryEvent, RowImage, RowsEvent, RowsOp, TableMapEvent,
    XidEvent,
};
use sluice::{Error, EventStream, Gtid, ReplicaSource, Replicator, Result};

/// A replication source that plays back pre-scripted sessions. Each call to
/// `connect` consumes the next session; a session that runs out of events
/// fails the stream terminally, which stops the pump and lets the test
/// inspect the result.
#[derive(Default)]
pub struct ScriptedSource {
    sessions: Mutex<VecDeque<Vec<Result<BinlogEvent>>>>,
    connects: Mutex<Vec<String>>,
    logs: Vec<String>,
    positions: HashMap<String, Vec<Gtid>>,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the binary-log catalog used by the resume scan. Entries are
    /// `(log name, GTID list at offset 4)`.
    pub fn with_logs(mut self, entries: &[(&str, &str)]) -> Self {
        for (log, gtids) in entries {
            self.logs.push(log.to_string());
            self.positions.insert(
                log.to_string(),
                sluice::gtid::parse_gtid_list(gtids).unwrap(),
            );
        }
        self
    }

    /// Append one replication session to the script.
    pub fn session(self, events: Vec<Result<BinlogEvent>>) -> Self {
        self.sessions.lock().unwrap().push_back(events);
        self
    }

    /// The starting GTID list of every `connect` call, in order.
    pub fn connects(&self) -> Vec<String> {
        self.connects.lock().unwrap().clone()
    }
}

#[async_trait]
impl ReplicaSource for ScriptedSource {
    async fn connect(&self, start_gtid: &str) -> Result<Box<dyn EventStream>> {
        self.connects.lock().unwrap().push(start_gtid.to_string());

        match self.sessions.lock().unwrap().pop_front() {
            Some(events) => Ok(Box::new(ScriptedStream {
                events: events.into(),
            })),
            None => Err(Error::other("no scripted session left")),
        }
    }

    async fn binary_logs(&self) -> Result<Vec<String>> {
        Ok(self.logs.clone())
    }

    async fn gtid_position(&self, log: &str) -> Result<Vec<Gtid>> {
        Ok(self.positions.get(log).cloned().unwrap_or_default())
    }
}

struct ScriptedStream {
    events: VecDeque<Result<BinlogEvent>>,
}

#[async_trait]
impl EventStream for ScriptedStream {
    async fn fetch(&mut self) -> Result<BinlogEvent> {
        self.events
            .pop_front()
            .unwrap_or_else(|| Err(Error::other("end of scripted stream")))
    }
}

// Event constructors

pub fn gtid(text: &str) -> Result<BinlogEvent> {
    Ok(BinlogEvent::Gtid(GtidEvent {
        gtid: text.parse().unwrap(),
        flags: 0,
    }))
}

pub fn gtid_standalone(text: &str) -> Result<BinlogEvent> {
    Ok(BinlogEvent::Gtid(GtidEvent {
        gtid: text.parse().unwrap(),
        flags: GtidEvent::FL_STANDALONE,
    }))
}

pub fn query(database: &str, statement: &str) -> Result<BinlogEvent> {
    Ok(BinlogEvent::Query(QueryEvent {
        thread_id: 1,
        exec_time: 0,
        error_code: 0,
        database: database.into(),
        statement: statement.into(),
    }))
}

pub fn xid(transaction_nr: u64) -> Result<BinlogEvent> {
    Ok(BinlogEvent::Xid(XidEvent { transaction_nr }))
}

pub fn table_map(table_id: u64, database: &str, table: &str) -> Result<BinlogEvent> {
    Ok(BinlogEvent::TableMap(TableMapEvent {
        table_id,
        flags: 0,
        database: database.into(),
        table: table.into(),
        column_count: 1,
        column_types: vec![],
        column_metadata: vec![],
        null_bitmap: vec![],
    }))
}

pub fn write_rows(table_id: u64, value: i64) -> Result<BinlogEvent> {
    Ok(BinlogEvent::Rows(RowsEvent {
        op: RowsOp::Write,
        table_id,
        flags: 0,
        column_count: 1,
        rows: vec![RowImage {
            before: None,
            after: Some(vec![ColumnValue::SignedInt(value)]),
        }],
    }))
}

pub fn connection_lost() -> Result<BinlogEvent> {
    Err(Error::connection_lost("scripted network loss"))
}

/// Initialize tracing output for tests; honors RUST_LOG.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Wait for the pump to stop on its own (the scripted stream ends with a
/// terminal error), then join the worker.
pub async fn run_to_completion(replicator: Replicator) {
    for _ in 0..500 {
        if !replicator.ok() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!replicator.ok(), "pump did not stop within the deadline");
    replicator.stop().await;
}
