//! Pump configuration
//!
//! # Security Note
//!
//! Server addresses implement a custom Debug that redacts the password field
//! to prevent accidental leakage to logs.

use std::collections::HashSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::gtid::Gtid;

/// Default location of the persisted transaction id.
pub const DEFAULT_STATE_FILE: &str = "./current_gtid.txt";

/// One connection candidate, either on the replication or the apply side.
#[derive(Clone, Serialize, Deserialize)]
pub struct ServerAddr {
    /// Address to connect to
    pub host: String,
    /// Port where the server is listening
    pub port: u16,
    /// Username used for the connection
    pub user: String,
    /// Password for the user
    pub password: Option<String>,
}

impl ServerAddr {
    pub fn new(host: impl Into<String>, port: u16, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            user: user.into(),
            password: None,
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }
}

impl std::fmt::Debug for ServerAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerAddr")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Replication-side configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Ordered list of source servers; the first reachable one is used
    pub servers: Vec<ServerAddr>,
    /// Server id the pump registers with (must be unique among replicas)
    pub server_id: u32,
    /// Starting transaction id; overridden by the checkpoint file when present
    pub start_gtid: Option<Gtid>,
    /// `database.table` identifiers that are processed; empty accepts all
    pub tables: HashSet<String>,
}

/// Apply-side configuration for the downstream statement executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyConfig {
    /// Ordered list of apply servers; the first reachable one is used
    pub servers: Vec<ServerAddr>,
    /// Statements run once per connection before any event is applied
    pub init_statements: Vec<String>,
}

/// Full pump configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub source: SourceConfig,
    pub apply: ApplyConfig,
    /// Location of the persisted transaction id
    pub state_file: PathBuf,
}

impl Config {
    pub fn new(source_server: ServerAddr, server_id: u32) -> Self {
        Self {
            source: SourceConfig {
                servers: vec![source_server],
                server_id,
                start_gtid: None,
                tables: HashSet::new(),
            },
            apply: ApplyConfig {
                servers: Vec::new(),
                init_statements: Vec::new(),
            },
            state_file: PathBuf::from(DEFAULT_STATE_FILE),
        }
    }

    pub fn add_source_server(mut self, server: ServerAddr) -> Self {
        self.source.servers.push(server);
        self
    }

    pub fn with_start_gtid(mut self, gtid: Gtid) -> Self {
        self.source.start_gtid = Some(gtid);
        self
    }

    /// Restrict processing to the given `database.table` identifier.
    pub fn accept_table(mut self, table: impl Into<String>) -> Self {
        self.source.tables.insert(table.into());
        self
    }

    pub fn add_apply_server(mut self, server: ServerAddr) -> Self {
        self.apply.servers.push(server);
        self
    }

    /// Run a statement on every new apply-side connection.
    pub fn apply_init_statement(mut self, statement: impl Into<String>) -> Self {
        self.apply.init_statements.push(statement.into());
        self
    }

    pub fn with_state_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.state_file = path.into();
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.source.servers.is_empty() {
            return Err(Error::config("no source servers configured"));
        }
        if self.source.server_id == 0 {
            return Err(Error::config("server_id must be non-zero"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = Config::new(
            ServerAddr::new("127.0.0.1", 3306, "repl").with_password("secret"),
            1234,
        )
        .add_source_server(ServerAddr::new("10.0.0.2", 3306, "repl"))
        .with_start_gtid("0-1-10".parse().unwrap())
        .accept_table("db.users")
        .add_apply_server(ServerAddr::new("127.0.0.1", 3307, "apply"))
        .apply_init_statement("SET default_storage_engine=COLUMNSTORE")
        .with_state_file("/var/lib/sluice/current_gtid.txt");

        assert_eq!(config.source.servers.len(), 2);
        assert_eq!(config.source.server_id, 1234);
        assert_eq!(config.source.start_gtid, Some(Gtid::new(0, 1, 10)));
        assert!(config.source.tables.contains("db.users"));
        assert_eq!(config.apply.servers.len(), 1);
        assert_eq!(config.apply.init_statements.len(), 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty() {
        let mut config = Config::new(ServerAddr::new("h", 3306, "u"), 1);
        config.source.servers.clear();
        assert!(config.validate().is_err());

        let config = Config::new(ServerAddr::new("h", 3306, "u"), 0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_debug_redacts_password() {
        let server = ServerAddr::new("localhost", 3306, "admin").with_password("super_secret");
        let output = format!("{:?}", server);
        assert!(output.contains("[REDACTED]"));
        assert!(!output.contains("super_secret"));
        assert!(output.contains("localhost"));
    }
}
