//! The replication pump
//!
//! [`Replicator::start`] spawns one long-lived worker that serially fetches
//! and dispatches replication events. Query events are routed to the
//! statement sink, row events to per-table bulk sinks; transaction
//! boundaries flush both paths atomically and advance the persisted
//! checkpoint. The worker owns all mutable state; the owner only sees the
//! `running` flag through [`Replicator::ok`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::checkpoint::GtidStateFile;
use crate::config::Config;
use crate::decoder::BinlogEvent;
use crate::error::{Error, Result};
use crate::filter::TableFilter;
use crate::gtid::Gtid;
use crate::registry::TableRegistry;
use crate::resume::{self, SkipGate};
use crate::sink::{StatementSink, TableSinkConnector};
use crate::source::{EventStream, ReplicaSource};

/// Back-off between connection attempts.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Which downstream path the pump is currently routing to. Exclusive;
/// switching requires a successful commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Routing query events to the statement executor
    Statement,
    /// Routing row events to the per-table bulk sinks
    Bulk,
}

/// Handle to a running replication stream.
pub struct Replicator {
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl Replicator {
    /// Create a new replication stream and start it. Control returns
    /// immediately; the worker runs until it hits a fatal error or
    /// [`Replicator::stop`] is called.
    pub fn start(
        config: Config,
        source: Arc<dyn ReplicaSource>,
        statements: Arc<dyn StatementSink>,
        tables: Arc<dyn TableSinkConnector>,
    ) -> Self {
        let running = Arc::new(AtomicBool::new(true));

        let worker = Worker {
            state_file: GtidStateFile::new(&config.state_file),
            filter: TableFilter::new(config.source.tables.clone()),
            gtid: config.source.start_gtid,
            source,
            statements,
            connector: tables,
            registry: TableRegistry::new(),
            skip: SkipGate::new(),
            running: running.clone(),
            current: None,
            mode: Mode::Statement,
            implicit_commit: false,
            stream: None,
        };

        let handle = tokio::spawn(worker.run());

        Self {
            running,
            worker: Some(handle),
        }
    }

    /// Whether the stream is still running. Turns false after a fatal
    /// error or a stop request.
    pub fn ok(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop the stream and wait for the worker to roll back and exit.
    pub async fn stop(mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            let _ = worker.await;
        }
    }
}

impl Drop for Replicator {
    fn drop(&mut self) {
        // The worker observes the flag between events and exits on its own.
        self.running.store(false, Ordering::SeqCst);
    }
}

struct Worker {
    source: Arc<dyn ReplicaSource>,
    statements: Arc<dyn StatementSink>,
    connector: Arc<dyn TableSinkConnector>,
    registry: TableRegistry,
    state_file: GtidStateFile,
    filter: TableFilter,
    skip: SkipGate,
    running: Arc<AtomicBool>,
    /// Resume target on startup, last committed transaction afterwards
    gtid: Option<Gtid>,
    /// Transaction currently being processed
    current: Option<Gtid>,
    mode: Mode,
    implicit_commit: bool,
    stream: Option<Box<dyn EventStream>>,
}

impl Worker {
    async fn run(mut self) {
        match self.state_file.load().await {
            Ok(Some(gtid)) => {
                info!("Continuing from GTID '{}'", gtid);
                self.gtid = Some(gtid);
            }
            Ok(None) => {}
            Err(e) => {
                error!(
                    "Failed to load GTID state from '{}': {}",
                    self.state_file.path().display(),
                    e
                );
                self.running.store(false, Ordering::SeqCst);
            }
        }

        while self.running.load(Ordering::SeqCst) {
            if self.stream.is_none() {
                match self.connect().await {
                    Ok(stream) => self.stream = Some(stream),
                    Err(e) => {
                        warn!("Connection attempt failed: {}", e);
                        tokio::time::sleep(RECONNECT_DELAY).await;
                        continue;
                    }
                }
            }

            let fetched = match self.stream.as_mut() {
                Some(stream) => stream.fetch().await,
                None => continue,
            };

            match fetched {
                Ok(event) => match self.admit(&event) {
                    Ok(true) => {
                        if let Err(e) = self.process(event).await {
                            // Fixing this may require operator intervention,
                            // so the safest thing to do is to stop.
                            error!("Failed to process replicated event: {}", e);
                            self.running.store(false, Ordering::SeqCst);
                        }
                    }
                    Ok(false) => {}
                    Err(e) => {
                        error!("{}", e);
                        self.running.store(false, Ordering::SeqCst);
                    }
                },
                Err(e) if e.is_transient() => {
                    warn!("Lost connection to source: {}", e);
                    self.stream = None;
                }
                Err(e) => {
                    error!("Failed to read replicated event: {}", e);
                    self.running.store(false, Ordering::SeqCst);
                }
            }
        }

        self.statements.rollback().await;
        self.registry.rollback_all().await;
        info!("Replication stream stopped");
    }

    /// Establish a session, rewinding to the checkpointed position first
    /// when one is known.
    async fn connect(&mut self) -> Result<Box<dyn EventStream>> {
        let mut start = String::new();

        if let Some(target) = self.gtid {
            start = resume::find_start_position(self.source.as_ref(), &target).await?;
            self.skip.engage(target);
            info!(
                "Starting from GTID '{}' and skipping events until GTID '{}'",
                start, target
            );
        }

        self.source.connect(&start).await
    }

    /// Skip gate first, then the accepted-table filter. While skipping, no
    /// mutation is applied and no commit is issued.
    fn admit(&mut self, event: &BinlogEvent) -> Result<bool> {
        if self.skip.is_skipping() {
            return self.skip.admit(event);
        }
        Ok(self.filter.should_process(event))
    }

    async fn process(&mut self, event: BinlogEvent) -> Result<()> {
        match event {
            BinlogEvent::Gtid(gtid_event) => {
                if gtid_event.is_standalone() {
                    self.implicit_commit = true;
                }
                debug!("GTID: {}", gtid_event.gtid);
                self.current = Some(gtid_event.gtid);
            }

            BinlogEvent::Xid(xid) => {
                self.commit_transactions().await?;
                self.gtid = self.current;
                debug!(
                    "XID for GTID '{}': {}",
                    display_gtid(&self.current),
                    xid.transaction_nr
                );
            }

            BinlogEvent::TableMap(table_map) => {
                if let Err(e) = self.registry.open(self.connector.as_ref(), &table_map).await {
                    error!(
                        "Could not open table `{}`.`{}`: {}",
                        table_map.database, table_map.table, e
                    );
                    return Err(e);
                }
            }

            BinlogEvent::Query(query) => {
                self.set_mode(Mode::Statement).await?;
                self.statements.enqueue(query).await?;

                if self.implicit_commit {
                    self.implicit_commit = false;
                    self.gtid = self.current;
                    self.commit_transactions().await?;
                }
            }

            BinlogEvent::Rows(rows) => {
                // A missing entry means the table map was filtered out.
                if self.registry.contains(rows.table_id) {
                    self.set_mode(Mode::Bulk).await?;
                    if let Some(sink) = self.registry.get_mut(rows.table_id) {
                        debug!("ROWS event for `{}`", sink.name());
                        sink.enqueue(rows).await?;
                    }
                }
            }

            BinlogEvent::FormatDescription(_)
            | BinlogEvent::Rotate(_)
            | BinlogEvent::GtidList(_)
            | BinlogEvent::Heartbeat
            | BinlogEvent::Ignored(_) => {}
        }

        Ok(())
    }

    /// Switch routing paths, flushing open transactions first. A failed
    /// commit fails the transition and the triggering event is not
    /// dispatched.
    async fn set_mode(&mut self, mode: Mode) -> Result<()> {
        if self.mode != mode {
            self.commit_transactions().await?;
            self.mode = mode;
        }
        Ok(())
    }

    /// The atomic unit of durability: flush the statement executor and
    /// every open table sink, then persist the checkpoint. The checkpoint
    /// only advances when every participant committed.
    async fn commit_transactions(&mut self) -> Result<()> {
        let statement_result = self.statements.commit().await;
        if let Err(e) = &statement_result {
            error!("Statement executor commit failed: {}", e);
        }

        // Table commits are attempted even after a failure; the sinks are
        // independent sessions.
        let table_result = self.registry.commit_all().await;

        if statement_result.is_err() || table_result.is_err() {
            let gtid = display_gtid(&self.current);
            error!("One or more transactions failed to commit at GTID '{gtid}'");
            return Err(Error::apply(format!("commit failed at GTID '{gtid}'")));
        }

        if let Some(current) = &self.current {
            self.state_file.save(current).await?;
        }
        Ok(())
    }
}

fn display_gtid(gtid: &Option<Gtid>) -> String {
    gtid.map(|g| g.to_string()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerAddr;
    use crate::sink::memory::MemoryWarehouse;
    use async_trait::async_trait;

    struct ClosedSource;

    struct ClosedStream;

    #[async_trait]
    impl EventStream for ClosedStream {
        async fn fetch(&mut self) -> Result<BinlogEvent> {
            Err(Error::protocol("stream exhausted"))
        }
    }

    #[async_trait]
    impl ReplicaSource for ClosedSource {
        async fn connect(&self, _start_gtid: &str) -> Result<Box<dyn EventStream>> {
            Ok(Box::new(ClosedStream))
        }

        async fn binary_logs(&self) -> Result<Vec<String>> {
            Ok(vec![])
        }

        async fn gtid_position(&self, _log: &str) -> Result<Vec<Gtid>> {
            Ok(vec![])
        }
    }

    #[tokio::test]
    async fn test_terminal_fetch_error_stops_the_pump() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new(ServerAddr::new("unused", 3306, "u"), 1)
            .with_state_file(dir.path().join("current_gtid.txt"));

        let warehouse = MemoryWarehouse::new();
        let replicator = Replicator::start(
            config,
            Arc::new(ClosedSource),
            Arc::new(warehouse.statement_sink()),
            Arc::new(warehouse),
        );

        for _ in 0..200 {
            if !replicator.ok() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert!(!replicator.ok());
        replicator.stop().await;
    }
}
