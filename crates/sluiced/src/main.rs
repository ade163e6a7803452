//! Replication pump daemon
//!
//! Usage:
//!   # Replicate everything from one source to one apply server
//!   sluiced --source 127.0.0.1:3306 --apply 127.0.0.1:3307
//!
//!   # Restrict to specific tables, resume from a known GTID
//!   sluiced --source db1:3306 --source db2:3306 \
//!     --apply warehouse:3306 \
//!     --table shop.orders --table shop.customers \
//!     --gtid 0-1-12345 \
//!     --state-file /var/lib/sluice/current_gtid.txt

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use sluice::{Config, MariaDbSource, Replicator, ServerAddr, SqlBulkLoader, SqlExecutor};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(
    name = "sluiced",
    about = "MariaDB binlog to columnar warehouse replication pump"
)]
struct Cli {
    /// Source server as host[:port]; repeatable, tried in order
    #[arg(long = "source", required = true)]
    sources: Vec<String>,

    /// Username for the source servers
    #[arg(long, default_value = "repl")]
    source_user: String,

    /// Password for the source servers
    #[arg(long)]
    source_password: Option<String>,

    /// Server id used when registering as a replica; must be unique
    #[arg(long, default_value_t = 1234)]
    server_id: u32,

    /// Starting GTID when no checkpoint file exists
    #[arg(long)]
    gtid: Option<String>,

    /// database.table to process; repeatable, default is all tables
    #[arg(long = "table")]
    tables: Vec<String>,

    /// Apply server as host[:port]; repeatable, tried in order
    #[arg(long = "apply", required = true)]
    applies: Vec<String>,

    /// Username for the apply servers
    #[arg(long, default_value = "apply")]
    apply_user: String,

    /// Password for the apply servers
    #[arg(long)]
    apply_password: Option<String>,

    /// Statement run on every new apply connection; repeatable
    #[arg(long = "apply-init")]
    apply_init: Vec<String>,

    /// Location of the persisted GTID checkpoint
    #[arg(long, default_value = sluice::DEFAULT_STATE_FILE)]
    state_file: PathBuf,

    /// Log level when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn parse_addr(text: &str, user: &str, password: Option<&str>) -> anyhow::Result<ServerAddr> {
    let (host, port) = match text.rsplit_once(':') {
        Some((host, port)) => (host, port.parse()?),
        None => (text, 3306),
    };
    if host.is_empty() {
        anyhow::bail!("empty host in server address {text:?}");
    }

    let mut addr = ServerAddr::new(host, port, user);
    if let Some(password) = password {
        addr = addr.with_password(password);
    }
    Ok(addr)
}

fn build_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut sources = cli.sources.iter();
    let first = sources.next().expect("clap requires at least one source");

    let mut config = Config::new(
        parse_addr(first, &cli.source_user, cli.source_password.as_deref())?,
        cli.server_id,
    )
    .with_state_file(&cli.state_file);

    for source in sources {
        config = config.add_source_server(parse_addr(
            source,
            &cli.source_user,
            cli.source_password.as_deref(),
        )?);
    }

    if let Some(gtid) = &cli.gtid {
        config = config.with_start_gtid(gtid.parse()?);
    }
    for table in &cli.tables {
        config = config.accept_table(table);
    }
    for apply in &cli.applies {
        config = config.add_apply_server(parse_addr(
            apply,
            &cli.apply_user,
            cli.apply_password.as_deref(),
        )?);
    }
    for statement in &cli.apply_init {
        config = config.apply_init_statement(statement);
    }

    config.validate()?;
    Ok(config)
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
        tokio::select! {
            _ = sigterm.recv() => {}
            _ = sigint.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = build_config(&cli)?;

    let source = Arc::new(MariaDbSource::new(config.source.clone()));
    let statements = Arc::new(SqlExecutor::new(config.apply.clone()));
    let tables = Arc::new(SqlBulkLoader::new(config.apply.clone()));

    let replicator = Replicator::start(config, source, statements, tables);

    let mut shutdown = Box::pin(wait_for_shutdown_signal());
    let mut interval = tokio::time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("Shutdown signal received");
                break;
            }
            _ = interval.tick() => {
                if !replicator.ok() {
                    break;
                }
            }
        }
    }

    let healthy = replicator.ok();
    tracing::info!("Shutting down");
    replicator.stop().await;

    if healthy {
        Ok(())
    } else {
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_addr() {
        let addr = parse_addr("db1:3307", "repl", Some("pw")).unwrap();
        assert_eq!(addr.host, "db1");
        assert_eq!(addr.port, 3307);
        assert_eq!(addr.user, "repl");
        assert_eq!(addr.password.as_deref(), Some("pw"));

        let addr = parse_addr("db1", "repl", None).unwrap();
        assert_eq!(addr.port, 3306);
        assert!(addr.password.is_none());

        assert!(parse_addr(":3306", "repl", None).is_err());
        assert!(parse_addr("db1:notaport", "repl", None).is_err());
    }

    #[test]
    fn test_build_config() {
        let cli = Cli::parse_from([
            "sluiced",
            "--source",
            "db1:3306",
            "--source",
            "db2:3306",
            "--apply",
            "warehouse:3306",
            "--table",
            "shop.orders",
            "--gtid",
            "0-1-42",
            "--server-id",
            "99",
        ]);

        let config = build_config(&cli).unwrap();
        assert_eq!(config.source.servers.len(), 2);
        assert_eq!(config.source.server_id, 99);
        assert_eq!(config.source.start_gtid, Some("0-1-42".parse().unwrap()));
        assert!(config.source.tables.contains("shop.orders"));
        assert_eq!(config.apply.servers.len(), 1);
    }
}
