//! Active table registry
//!
//! Maps the numeric table id carried by row events to the open bulk sink
//! for that table. A table map event replaces any prior entry for the same
//! id; the replaced sink is rolled back before it is released. On shutdown
//! every entry is rolled back.

use std::collections::HashMap;

use tracing::{debug, error};

use crate::decoder::TableMapEvent;
use crate::error::{Error, Result};
use crate::sink::{TableSink, TableSinkConnector};

#[derive(Default)]
pub struct TableRegistry {
    tables: HashMap<u64, Box<dyn TableSink>>,
}

impl TableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open (or re-open) the sink for a mapped table. An open failure is
    /// returned to the caller and is fatal to the pump.
    pub async fn open(
        &mut self,
        connector: &dyn TableSinkConnector,
        table_map: &TableMapEvent,
    ) -> Result<()> {
        let sink = connector.open(table_map).await?;
        debug!(
            "Opened table `{}`.`{}` (table_id={})",
            table_map.database, table_map.table, table_map.table_id
        );

        if let Some(mut replaced) = self.tables.insert(table_map.table_id, sink) {
            replaced.rollback().await;
        }
        Ok(())
    }

    pub fn contains(&self, table_id: u64) -> bool {
        self.tables.contains_key(&table_id)
    }

    pub fn get_mut(&mut self, table_id: u64) -> Option<&mut Box<dyn TableSink>> {
        self.tables.get_mut(&table_id)
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Commit every open sink. All commits are attempted even after a
    /// failure; the sinks are independent downstream sessions and each one
    /// should get the chance to finish its work.
    pub async fn commit_all(&mut self) -> Result<()> {
        let mut failed = 0;

        for sink in self.tables.values_mut() {
            if let Err(e) = sink.commit().await {
                error!("Commit failed for table {}: {}", sink.name(), e);
                failed += 1;
            }
        }

        if failed == 0 {
            Ok(())
        } else {
            Err(Error::apply(format!("{failed} table commit(s) failed")))
        }
    }

    /// Roll back and release every open sink.
    pub async fn rollback_all(&mut self) {
        for (_, mut sink) in self.tables.drain() {
            sink.rollback().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::{ColumnValue, RowImage, RowsEvent, RowsOp};
    use crate::sink::memory::MemoryWarehouse;

    fn table_map(table_id: u64, table: &str) -> TableMapEvent {
        TableMapEvent {
            table_id,
            flags: 0,
            database: "db".into(),
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

    #[tokio::test]
    async fn test_open_and_commit() {
        let warehouse = MemoryWarehouse::new();
        let mut registry = TableRegistry::new();

        registry.open(&warehouse, &table_map(7, "t")).await.unwrap();
        assert!(registry.contains(7));
        assert!(!registry.contains(8));

        registry
            .get_mut(7)
            .unwrap()
            .enqueue(write_rows(7, 1))
            .await
            .unwrap();
        registry.commit_all().await.unwrap();

        assert_eq!(warehouse.rows("db.t").await.len(), 1);
    }

    #[tokio::test]
    async fn test_replacement_rolls_back_old_entry() {
        let warehouse = MemoryWarehouse::new();
        let mut registry = TableRegistry::new();

        registry.open(&warehouse, &table_map(7, "t")).await.unwrap();
        registry
            .get_mut(7)
            .unwrap()
            .enqueue(write_rows(7, 1))
            .await
            .unwrap();

        // Re-mapping the id rolls back the replaced sink; its pending rows
        // never reach the committed view.
        registry.open(&warehouse, &table_map(7, "t")).await.unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(warehouse.rollbacks().await, 1);

        registry.commit_all().await.unwrap();
        assert!(warehouse.rows("db.t").await.is_empty());
    }

    #[tokio::test]
    async fn test_commit_all_attempts_every_sink() {
        let warehouse = MemoryWarehouse::new();
        let mut registry = TableRegistry::new();

        registry.open(&warehouse, &table_map(1, "a")).await.unwrap();
        registry.open(&warehouse, &table_map(2, "b")).await.unwrap();

        warehouse.fail_commits(true).await;
        assert!(registry.commit_all().await.is_err());
    }

    #[tokio::test]
    async fn test_rollback_all_releases_entries() {
        let warehouse = MemoryWarehouse::new();
        let mut registry = TableRegistry::new();

        registry.open(&warehouse, &table_map(1, "a")).await.unwrap();
        registry.open(&warehouse, &table_map(2, "b")).await.unwrap();

        registry.rollback_all().await;
        assert!(registry.is_empty());
        assert_eq!(warehouse.rollbacks().await, 2);
    }

    #[tokio::test]
    async fn test_open_failure_propagates() {
        let warehouse = MemoryWarehouse::new();
        let mut registry = TableRegistry::new();

        warehouse.fail_opens(true).await;
        assert!(registry.open(&warehouse, &table_map(1, "a")).await.is_err());
        assert!(registry.is_empty());
    }
}
