//! # sluice - MariaDB binlog to columnar warehouse replication
//!
//! A change-data-capture pump: consumes the binary replication stream of a
//! MariaDB source, interprets each event, and applies the resulting
//! mutations to a downstream analytic store with an exactly-once apply
//! discipline on durable checkpoints.
//!
//! ## Architecture
//!
//! ```text
//! MariaDB binlog → BinlogConnection → BinlogDecoder ─┐
//!                                                    ▼
//!              ┌──────────────── Replicator ─────────────────┐
//!              │ skip gate → table filter → dispatch         │
//!              │   Query  ──► StatementSink (STATEMENT mode) │
//!              │   Rows   ──► TableSink     (BULK mode)      │
//!              │   Xid    ──► commit ──► GtidStateFile       │
//!              └─────────────────────────────────────────────┘
//! ```
//!
//! Transaction boundaries (XID or implicit commit) flush both downstream
//! paths atomically; the checkpoint file only advances when every
//! participant committed. On restart the pump rewinds to the binlog
//! containing the checkpointed transaction and discards events up to and
//! including it, so no committed row is applied twice.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use sluice::{Config, MariaDbSource, Replicator, ServerAddr, SqlExecutor};
//!
//! # async fn example() {
//! let config = Config::new(
//!     ServerAddr::new("127.0.0.1", 3306, "repl").with_password("secret"),
//!     1234,
//! )
//! .add_apply_server(ServerAddr::new("127.0.0.1", 3307, "apply"))
//! .accept_table("db.events");
//!
//! let source = Arc::new(MariaDbSource::new(config.source.clone()));
//! let statements = Arc::new(SqlExecutor::new(config.apply.clone()));
//! let tables: Arc<dyn sluice::TableSinkConnector> =
//!     Arc::new(sluice::MemoryWarehouse::new());
//!
//! let replicator = Replicator::start(config, source, statements, tables);
//! while replicator.ok() {
//!     tokio::time::sleep(std::time::Duration::from_secs(1)).await;
//! }
//! # }
//! ```

pub mod checkpoint;
pub mod config;
pub mod decoder;
pub mod driver;
pub mod error;
pub mod filter;
pub mod gtid;
pub mod protocol;
pub mod registry;
pub mod resume;
pub mod sink;
pub mod source;

pub use checkpoint::GtidStateFile;
pub use config::{ApplyConfig, Config, ServerAddr, SourceConfig, DEFAULT_STATE_FILE};
pub use decoder::{BinlogDecoder, BinlogEvent, ColumnValue, QueryEvent, RowsEvent, TableMapEvent};
pub use driver::Replicator;
pub use error::{Error, Result};
pub use filter::TableFilter;
pub use gtid::Gtid;
pub use registry::TableRegistry;
pub use sink::bulk::SqlBulkLoader;
pub use sink::memory::MemoryWarehouse;
pub use sink::sql::SqlExecutor;
pub use sink::{StatementSink, TableSink, TableSinkConnector};
pub use source::{EventStream, MariaDbSource, ReplicaSource};
