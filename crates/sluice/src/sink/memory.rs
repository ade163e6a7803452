//! In-memory warehouse for testing and development
//!
//! [`MemoryWarehouse`] stands in for the downstream store: it hands out
//! statement and table sinks that buffer enqueued events and move them into
//! a shared committed view on `commit`. Nothing enters the committed view on
//! rollback, which is exactly the property the pump's atomicity tests need.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::decoder::{QueryEvent, RowImage, RowsEvent, TableMapEvent};
use crate::error::{Error, Result};
use crate::sink::{StatementSink, TableSink, TableSinkConnector};

#[derive(Default)]
struct Inner {
    committed_statements: Vec<String>,
    committed_rows: HashMap<String, Vec<RowImage>>,
    opened: Vec<String>,
    rollbacks: usize,
    fail_commits: bool,
    fail_opens: bool,
}

/// Shared in-memory downstream store.
#[derive(Clone, Default)]
pub struct MemoryWarehouse {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    /// A statement sink writing into this warehouse.
    pub fn statement_sink(&self) -> MemoryStatementSink {
        MemoryStatementSink {
            inner: self.inner.clone(),
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Committed statements, in apply order.
    pub async fn statements(&self) -> Vec<String> {
        self.inner.lock().await.committed_statements.clone()
    }

    /// Committed row images for a `database.table` identifier.
    pub async fn rows(&self, name: &str) -> Vec<RowImage> {
        self.inner
            .lock()
            .await
            .committed_rows
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    /// Every table a sink was opened for, in open order.
    pub async fn opened(&self) -> Vec<String> {
        self.inner.lock().await.opened.clone()
    }

    /// Number of sink rollbacks observed.
    pub async fn rollbacks(&self) -> usize {
        self.inner.lock().await.rollbacks
    }

    /// Make every subsequent commit fail.
    pub async fn fail_commits(&self, fail: bool) {
        self.inner.lock().await.fail_commits = fail;
    }

    /// Make every subsequent table open fail.
    pub async fn fail_opens(&self, fail: bool) {
        self.inner.lock().await.fail_opens = fail;
    }
}

#[async_trait]
impl TableSinkConnector for MemoryWarehouse {
    async fn open(&self, table_map: &TableMapEvent) -> Result<Box<dyn TableSink>> {
        let name = table_map.qualified_name();
        let mut inner = self.inner.lock().await;
        if inner.fail_opens {
            return Err(Error::apply(format!("could not open table {name}")));
        }
        inner.opened.push(name.clone());

        Ok(Box::new(MemoryTableSink {
            name,
            inner: self.inner.clone(),
            pending: Vec::new(),
        }))
    }
}

/// Statement sink buffering into a [`MemoryWarehouse`].
pub struct MemoryStatementSink {
    inner: Arc<Mutex<Inner>>,
    pending: Mutex<Vec<String>>,
}

#[async_trait]
impl StatementSink for MemoryStatementSink {
    async fn enqueue(&self, event: QueryEvent) -> Result<()> {
        self.pending.lock().await.push(event.statement);
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        let mut pending = self.pending.lock().await;
        let mut inner = self.inner.lock().await;
        if inner.fail_commits {
            return Err(Error::apply("statement commit failed"));
        }
        inner.committed_statements.append(&mut pending);
        Ok(())
    }

    async fn rollback(&self) {
        self.pending.lock().await.clear();
        self.inner.lock().await.rollbacks += 1;
    }
}

struct MemoryTableSink {
    name: String,
    inner: Arc<Mutex<Inner>>,
    pending: Vec<RowsEvent>,
}

#[async_trait]
impl TableSink for MemoryTableSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn enqueue(&mut self, event: RowsEvent) -> Result<()> {
        self.pending.push(event);
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.fail_commits {
            return Err(Error::apply(format!("commit failed for {}", self.name)));
        }
        let rows = inner.committed_rows.entry(self.name.clone()).or_default();
        for event in self.pending.drain(..) {
            rows.extend(event.rows);
        }
        Ok(())
    }

    async fn rollback(&mut self) {
        self.pending.clear();
        self.inner.lock().await.rollbacks += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::{ColumnValue, RowsOp};

    fn table_map(table_id: u64, database: &str, table: &str) -> TableMapEvent {
        TableMapEvent {
            table_id,
            flags: 0,
            database: database.into(),
            table: table.into(),
            column_count: 1,
            column_types: vec![],
            column_metadata: vec![],
            null_bitmap: vec![],
        }
    }

    fn write_rows(table_id: u64, value: i64) -> RowsEvent {
        RowsEvent {
            op: RowsOp::Write,
            table_id,
            flags: 0,
            column_count: 1,
            rows: vec![RowImage {
                before: None,
                after: Some(vec![ColumnValue::SignedInt(value)]),
            }],
        }
    }

    fn query(statement: &str) -> QueryEvent {
        QueryEvent {
            thread_id: 0,
            exec_time: 0,
            error_code: 0,
            database: "db".into(),
            statement: statement.into(),
        }
    }

    #[tokio::test]
    async fn test_statement_sink_commit_and_rollback() {
        let warehouse = MemoryWarehouse::new();
        let sink = warehouse.statement_sink();

        sink.enqueue(query("INSERT INTO t VALUES (1)")).await.unwrap();
        assert!(warehouse.statements().await.is_empty());

        sink.commit().await.unwrap();
        assert_eq!(warehouse.statements().await.len(), 1);

        sink.enqueue(query("INSERT INTO t VALUES (2)")).await.unwrap();
        sink.rollback().await;
        sink.commit().await.unwrap();
        assert_eq!(warehouse.statements().await.len(), 1);
    }

    #[tokio::test]
    async fn test_table_sink_commit() {
        let warehouse = MemoryWarehouse::new();
        let mut sink = warehouse.open(&table_map(7, "db", "t")).await.unwrap();

        assert_eq!(sink.name(), "db.t");
        sink.enqueue(write_rows(7, 1)).await.unwrap();
        assert!(warehouse.rows("db.t").await.is_empty());

        sink.commit().await.unwrap();
        assert_eq!(warehouse.rows("db.t").await.len(), 1);
    }

    #[tokio::test]
    async fn test_forced_failures() {
        let warehouse = MemoryWarehouse::new();
        let sink = warehouse.statement_sink();

        warehouse.fail_commits(true).await;
        sink.enqueue(query("INSERT INTO t VALUES (1)")).await.unwrap();
        assert!(sink.commit().await.is_err());

        warehouse.fail_opens(true).await;
        assert!(warehouse.open(&table_map(1, "db", "t")).await.is_err());
    }
}
