//! Downstream SQL statement executor
//!
//! Applies replicated query events to the downstream store over a plain SQL
//! connection: `USE <database>` followed by the statement text, inside an
//! explicit transaction (`autocommit=0`). Events are queued by the pump and
//! drained either by a periodic background flush or synchronously when the
//! commit coordinator asks for durability.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mysql_async::prelude::Queryable;
use mysql_async::{Conn, Opts, OptsBuilder};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::config::ApplyConfig;
use crate::decoder::QueryEvent;
use crate::error::{Error, Result};
use crate::sink::StatementSink;

/// Cadence of the background flush.
const FLUSH_INTERVAL: Duration = Duration::from_secs(5);

struct ExecutorState {
    config: ApplyConfig,
    conn: Option<Conn>,
    queue: Vec<QueryEvent>,
    /// A previous flush failed; the transaction cannot commit.
    broken: bool,
}

/// [`StatementSink`] executing events against the first reachable apply
/// server.
pub struct SqlExecutor {
    state: Arc<Mutex<ExecutorState>>,
    flusher: JoinHandle<()>,
}

impl SqlExecutor {
    pub fn new(config: ApplyConfig) -> Self {
        let state = Arc::new(Mutex::new(ExecutorState {
            config,
            conn: None,
            queue: Vec::new(),
            broken: false,
        }));

        let flusher = tokio::spawn(flush_loop(state.clone()));
        Self { state, flusher }
    }
}

impl Drop for SqlExecutor {
    fn drop(&mut self) {
        self.flusher.abort();
    }
}

async fn flush_loop(state: Arc<Mutex<ExecutorState>>) {
    let mut interval = tokio::time::interval(FLUSH_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let mut state = state.lock().await;
        if let Err(e) = flush(&mut state).await {
            error!("Statement flush failed: {}", e);
        }
    }
}

/// Apply every queued event on the open connection, establishing one first
/// if needed. A failed statement poisons the transaction until rollback.
async fn flush(state: &mut ExecutorState) -> Result<()> {
    if state.queue.is_empty() || state.broken {
        return Ok(());
    }

    if state.conn.is_none() {
        state.conn = Some(connect(&state.config).await?);
    }
    let Some(conn) = state.conn.as_mut() else {
        return Err(Error::apply("no apply connection"));
    };

    let pending = std::mem::take(&mut state.queue);
    let mut failure = None;

    for event in pending {
        debug!("Applying statement: {}", event.statement);

        let result = async {
            if !event.database.is_empty() {
                conn.query_drop(format!("USE {}", quote_ident(&event.database)))
                    .await?;
            }
            conn.query_drop(event.statement.as_str()).await
        }
        .await;

        if let Err(e) = result {
            failure = Some(e);
            break;
        }
    }

    if let Some(e) = failure {
        state.conn = None;
        state.broken = true;
        return Err(Error::apply(format!("statement failed: {e}")));
    }

    Ok(())
}

/// Connect to the first reachable apply server and prepare the session.
pub(crate) async fn connect(config: &ApplyConfig) -> Result<Conn> {
    let mut last_error = String::from("no apply servers configured");

    for server in &config.servers {
        let opts = OptsBuilder::default()
            .ip_or_hostname(server.host.clone())
            .tcp_port(server.port)
            .user(Some(server.user.clone()))
            .pass(server.password.clone());

        match Conn::new(Opts::from(opts)).await {
            Ok(mut conn) => {
                conn.query_drop("SET autocommit=0")
                    .await
                    .map_err(|e| Error::apply(e.to_string()))?;
                for statement in &config.init_statements {
                    conn.query_drop(statement.as_str())
                        .await
                        .map_err(|e| Error::apply(e.to_string()))?;
                }
                return Ok(conn);
            }
            Err(e) => {
                debug!("{}:{} not reachable: {}", server.host, server.port, e);
                last_error = e.to_string();
            }
        }
    }

    Err(Error::connection_refused(last_error))
}

#[async_trait]
impl StatementSink for SqlExecutor {
    async fn enqueue(&self, event: QueryEvent) -> Result<()> {
        self.state.lock().await.queue.push(event);
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        flush(&mut state).await?;

        if state.broken {
            return Err(Error::apply("transaction poisoned by a failed statement"));
        }

        if let Some(conn) = state.conn.as_mut() {
            if let Err(e) = conn.query_drop("COMMIT").await {
                state.conn = None;
                state.broken = true;
                return Err(Error::apply(format!("commit failed: {e}")));
            }
        }
        Ok(())
    }

    async fn rollback(&self) {
        let mut state = self.state.lock().await;
        state.queue.clear();
        state.broken = false;

        if let Some(conn) = state.conn.as_mut() {
            if conn.query_drop("ROLLBACK").await.is_err() {
                state.conn = None;
            }
        }
    }
}

/// Backtick-quote an identifier for statement interpolation.
pub(crate) fn quote_ident(ident: &str) -> String {
    format!("`{}`", ident.replace('`', "``"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("db"), "`db`");
        assert_eq!(quote_ident("we`ird"), "`we``ird`");
    }

    #[tokio::test]
    async fn test_enqueue_buffers_without_connection() {
        // Enqueue never touches the network; the failure surfaces on flush.
        let executor = SqlExecutor::new(ApplyConfig {
            servers: vec![],
            init_statements: vec![],
        });

        executor
            .enqueue(QueryEvent {
                thread_id: 0,
                exec_time: 0,
                error_code: 0,
                database: "db".into(),
                statement: "INSERT INTO t VALUES (1)".into(),
            })
            .await
            .unwrap();

        assert_eq!(executor.state.lock().await.queue.len(), 1);
    }

    #[tokio::test]
    async fn test_commit_fails_without_servers() {
        let executor = SqlExecutor::new(ApplyConfig {
            servers: vec![],
            init_statements: vec![],
        });

        executor
            .enqueue(QueryEvent {
                thread_id: 0,
                exec_time: 0,
                error_code: 0,
                database: String::new(),
                statement: "SELECT 1".into(),
            })
            .await
            .unwrap();

        assert!(executor.commit().await.is_err());
    }

    #[tokio::test]
    async fn test_rollback_clears_queue_and_poison() {
        let executor = SqlExecutor::new(ApplyConfig {
            servers: vec![],
            init_statements: vec![],
        });

        {
            let mut state = executor.state.lock().await;
            state.broken = true;
            state.queue.push(QueryEvent {
                thread_id: 0,
                exec_time: 0,
                error_code: 0,
                database: String::new(),
                statement: "SELECT 1".into(),
            });
        }

        executor.rollback().await;

        let state = executor.state.lock().await;
        assert!(state.queue.is_empty());
        assert!(!state.broken);
    }

    #[tokio::test]
    async fn test_empty_commit_is_a_noop() {
        let executor = SqlExecutor::new(ApplyConfig {
            servers: vec![],
            init_statements: vec![],
        });
        assert!(executor.commit().await.is_ok());
    }
}
