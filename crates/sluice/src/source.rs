//! Upstream replication source
//!
//! [`ReplicaSource`] is the contract the dispatch loop drives: open a
//! replication session at a starting GTID position, fetch events from it,
//! and answer the two catalog questions the resume scan needs.
//! [`MariaDbSource`] is the production implementation speaking the binlog
//! wire protocol; tests substitute scripted sources.

use async_trait::async_trait;
use mysql_async::prelude::Queryable;
use mysql_async::{Conn, Opts, OptsBuilder, Row};
use tracing::{debug, info};

use crate::config::{ServerAddr, SourceConfig};
use crate::decoder::{BinlogDecoder, BinlogEvent};
use crate::error::{Error, Result};
use crate::gtid::{parse_gtid_list, Gtid};
use crate::protocol::BinlogConnection;

/// An open replication session producing events in emission order.
#[async_trait]
pub trait EventStream: Send {
    /// Block until the next event. Returns [`Error::ConnectionLost`] when
    /// the network drops; any other error is terminal.
    async fn fetch(&mut self) -> Result<BinlogEvent>;
}

/// Factory for replication sessions plus the resume-scan catalog queries.
#[async_trait]
pub trait ReplicaSource: Send + Sync {
    /// Connect, prepare the session, register as a replica and start the
    /// dump at `start_gtid` (a comma-separated GTID list; empty means the
    /// server default position).
    async fn connect(&self, start_gtid: &str) -> Result<Box<dyn EventStream>>;

    /// Ordered list of binary logs available upstream.
    async fn binary_logs(&self) -> Result<Vec<String>>;

    /// The set of transaction ids valid at offset 4 of `log`.
    async fn gtid_position(&self, log: &str) -> Result<Vec<Gtid>>;
}

/// Replication source backed by a MariaDB server.
pub struct MariaDbSource {
    config: SourceConfig,
}

impl MariaDbSource {
    pub fn new(config: SourceConfig) -> Self {
        Self { config }
    }

    /// Open a plain SQL connection to the first reachable server for the
    /// resume-scan queries, which return result sets the replication
    /// connection cannot read.
    async fn admin_conn(&self) -> Result<Conn> {
        let mut last_error = String::from("no source servers configured");

        for server in &self.config.servers {
            let opts = OptsBuilder::default()
                .ip_or_hostname(server.host.clone())
                .tcp_port(server.port)
                .user(Some(server.user.clone()))
                .pass(server.password.clone());

            match Conn::new(Opts::from(opts)).await {
                Ok(conn) => return Ok(conn),
                Err(e) => {
                    debug!("{}:{} not reachable: {}", server.host, server.port, e);
                    last_error = e.to_string();
                }
            }
        }

        Err(Error::connection_refused(last_error))
    }

    async fn connect_binlog(&self, server: &ServerAddr) -> anyhow::Result<BinlogConnection> {
        BinlogConnection::connect(
            &server.host,
            server.port,
            &server.user,
            server.password.as_deref(),
        )
        .await
    }
}

#[async_trait]
impl ReplicaSource for MariaDbSource {
    async fn connect(&self, start_gtid: &str) -> Result<Box<dyn EventStream>> {
        if start_gtid.contains('\'') {
            return Err(Error::protocol(format!(
                "invalid starting GTID list: {start_gtid:?}"
            )));
        }

        let mut last_error = String::from("no source servers configured");
        let mut connection = None;

        for server in &self.config.servers {
            match self.connect_binlog(server).await {
                Ok(conn) => {
                    connection = Some((conn, server));
                    break;
                }
                Err(e) => {
                    debug!("{}:{} not reachable: {:#}", server.host, server.port, e);
                    last_error = format!("{e:#}");
                }
            }
        }

        let Some((mut conn, server)) = connection else {
            return Err(Error::connection_refused(last_error));
        };

        // Session settings required before GTID replication can start: the
        // checksum request must match what the source emits, the capability
        // level declares a GTID-aware replica, and the connect state fixes
        // the starting position.
        let setup = [
            "SET @master_binlog_checksum = @@global.binlog_checksum".to_string(),
            "SET @mariadb_slave_capability=4".to_string(),
            format!("SET @slave_connect_state='{start_gtid}'"),
            "SET @slave_gtid_strict_mode=1".to_string(),
            "SET @slave_gtid_ignore_duplicates=1".to_string(),
            "SET NAMES latin1".to_string(),
        ];
        for sql in &setup {
            conn.query(sql)
                .await
                .map_err(|e| Error::protocol(format!("failed to prepare connection: {e:#}")))?;
        }

        conn.register_slave(self.config.server_id)
            .await
            .map_err(|e| Error::protocol(format!("failed to open replication channel: {e:#}")))?;
        conn.binlog_dump(self.config.server_id)
            .await
            .map_err(|e| Error::protocol(format!("failed to open replication channel: {e:#}")))?;

        info!(
            "Started replicating from [{}]:{} at GTID '{}'",
            server.host, server.port, start_gtid
        );

        Ok(Box::new(MariaDbStream {
            conn,
            decoder: BinlogDecoder::new(),
        }))
    }

    async fn binary_logs(&self) -> Result<Vec<String>> {
        let mut conn = self.admin_conn().await?;
        let rows: Vec<Row> = conn
            .query("SHOW BINARY LOGS")
            .await
            .map_err(|e| Error::other(e.to_string()))?;

        Ok(rows
            .into_iter()
            .filter_map(|row| row.get::<String, _>(0))
            .collect())
    }

    async fn gtid_position(&self, log: &str) -> Result<Vec<Gtid>> {
        validate_log_name(log)?;

        let mut conn = self.admin_conn().await?;
        let position: Option<Option<String>> = conn
            .query_first(format!("SELECT BINLOG_GTID_POS('{log}', 4)"))
            .await
            .map_err(|e| Error::other(e.to_string()))?;

        match position.flatten() {
            Some(text) => parse_gtid_list(&text),
            None => Ok(Vec::new()),
        }
    }
}

struct MariaDbStream {
    conn: BinlogConnection,
    decoder: BinlogDecoder,
}

#[async_trait]
impl EventStream for MariaDbStream {
    async fn fetch(&mut self) -> Result<BinlogEvent> {
        let packet = self
            .conn
            .next_event_packet()
            .await
            .map_err(classify_stream_error)?;

        let Some(packet) = packet else {
            return Err(Error::connection_lost("binlog stream closed by server"));
        };

        self.decoder
            .decode(&packet)
            .map_err(|e| Error::protocol(format!("{e:#}")))
    }
}

/// Map wire failures onto the pump's transient/terminal split. Network-level
/// failures become [`Error::ConnectionLost`] so the dispatch loop reconnects.
fn classify_stream_error(e: anyhow::Error) -> Error {
    for cause in e.chain() {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            use std::io::ErrorKind;
            if matches!(
                io.kind(),
                ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::BrokenPipe
                    | ErrorKind::UnexpectedEof
                    | ErrorKind::TimedOut
            ) {
                return Error::connection_lost(format!("{e:#}"));
            }
        }
    }
    Error::protocol(format!("{e:#}"))
}

/// Binary log names come back from the server, but they are interpolated
/// into a scan query, so hold them to the expected shape anyway.
fn validate_log_name(log: &str) -> Result<()> {
    let valid = !log.is_empty()
        && log
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(Error::protocol(format!("invalid binary log name: {log:?}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_log_name() {
        assert!(validate_log_name("mariadb-bin.000001").is_ok());
        assert!(validate_log_name("binlog_000042").is_ok());

        assert!(validate_log_name("").is_err());
        assert!(validate_log_name("bin'; DROP TABLE x; --").is_err());
        assert!(validate_log_name("bin log").is_err());
    }

    #[test]
    fn test_classify_stream_error() {
        let io: anyhow::Error =
            std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset").into();
        assert!(classify_stream_error(io.context("reading event")).is_transient());

        let eof: anyhow::Error =
            std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof").into();
        assert!(classify_stream_error(eof).is_transient());

        let proto = anyhow::anyhow!("binlog stream error: 1236 - could not find GTID");
        assert!(!classify_stream_error(proto).is_transient());
    }
}
