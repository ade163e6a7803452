//! Downstream apply contracts
//!
//! The pump routes events to two execution paths: query events go to one
//! [`StatementSink`], row-image batches go to per-table [`TableSink`]s
//! opened through a [`TableSinkConnector`]. Events transfer ownership to the
//! sink on enqueue; nothing is durable until the sink's `commit` returns.

pub mod bulk;
pub mod memory;
pub mod sql;

use async_trait::async_trait;

use crate::decoder::{QueryEvent, RowsEvent, TableMapEvent};
use crate::error::Result;

/// Applies query events to the downstream statement executor.
#[async_trait]
pub trait StatementSink: Send + Sync {
    /// Queue a query event for execution.
    async fn enqueue(&self, event: QueryEvent) -> Result<()>;

    /// Apply all queued events and make them durable.
    async fn commit(&self) -> Result<()>;

    /// Discard queued events and undo any partially applied work.
    async fn rollback(&self);
}

/// An open per-table bulk apply session.
#[async_trait]
pub trait TableSink: Send {
    /// The `database.table` identifier this sink writes to.
    fn name(&self) -> &str;

    /// Queue a row-image batch.
    async fn enqueue(&mut self, event: RowsEvent) -> Result<()>;

    /// Apply all queued batches and make them durable.
    async fn commit(&mut self) -> Result<()>;

    /// Discard queued batches and undo any partially applied work.
    async fn rollback(&mut self);
}

/// Opens table sinks from observed table map events.
#[async_trait]
pub trait TableSinkConnector: Send + Sync {
    /// Open a bulk session for the mapped table. Failures are fatal to the
    /// pump.
    async fn open(&self, table_map: &TableMapEvent) -> Result<Box<dyn TableSink>>;
}
