//! Accepted-table event filtering
//!
//! When a set of `database.table` identifiers is configured, table map
//! events pass only for members of the set, and query events pass only when
//! every table the statement references is a member. Unqualified names are
//! qualified with the default database carried by the query event. With no
//! set configured, everything passes.

use std::collections::HashSet;
use std::ops::ControlFlow;

use sqlparser::ast::{visit_relations, ObjectName};
use sqlparser::dialect::MySqlDialect;
use sqlparser::parser::Parser;
use tracing::debug;

use crate::decoder::BinlogEvent;

pub struct TableFilter {
    accepted: HashSet<String>,
}

impl TableFilter {
    pub fn new(accepted: HashSet<String>) -> Self {
        Self { accepted }
    }

    /// Whether the pump should dispatch this event.
    pub fn should_process(&self, event: &BinlogEvent) -> bool {
        if self.accepted.is_empty() {
            return true;
        }

        match event {
            BinlogEvent::TableMap(map) => self.accepted.contains(&map.qualified_name()),
            BinlogEvent::Query(query) => {
                // All participating tables must be in the accepted set.
                referenced_tables(&query.statement, &query.database)
                    .iter()
                    .all(|table| self.accepted.contains(table))
            }
            _ => true,
        }
    }
}

/// Extract the `database.table` names a statement references. Names without
/// an explicit database are qualified with `default_db`. Statements the
/// parser cannot handle contribute no names, which lets the event pass.
fn referenced_tables(sql: &str, default_db: &str) -> Vec<String> {
    let statements = match Parser::parse_sql(&MySqlDialect {}, sql) {
        Ok(statements) => statements,
        Err(e) => {
            debug!("statement not parseable, passing through: {}", e);
            return Vec::new();
        }
    };

    let mut tables = Vec::new();
    for statement in &statements {
        let _: ControlFlow<()> = visit_relations(statement, |name: &ObjectName| {
            let parts: Vec<&str> = name.0.iter().map(|ident| ident.value.as_str()).collect();
            match parts.as_slice() {
                [] => {}
                [table] => tables.push(format!("{default_db}.{table}")),
                [.., db, table] => tables.push(format!("{db}.{table}")),
            }
            ControlFlow::Continue(())
        });
    }
    tables
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::{GtidEvent, QueryEvent, TableMapEvent, XidEvent};
    use crate::gtid::Gtid;

    fn accepted(names: &[&str]) -> TableFilter {
        TableFilter::new(names.iter().map(|s| s.to_string()).collect())
    }

    fn table_map(database: &str, table: &str) -> BinlogEvent {
        BinlogEvent::TableMap(TableMapEvent {
            table_id: 1,
            flags: 0,
            database: database.into(),
            table: table.into(),
            column_count: 0,
            column_types: vec![],
            column_metadata: vec![],
            null_bitmap: vec![],
        })
    }

    fn query(database: &str, statement: &str) -> BinlogEvent {
        BinlogEvent::Query(QueryEvent {
            thread_id: 1,
            exec_time: 0,
            error_code: 0,
            database: database.into(),
            statement: statement.into(),
        })
    }

    #[test]
    fn test_empty_set_accepts_everything() {
        let filter = TableFilter::new(HashSet::new());
        assert!(filter.should_process(&table_map("db", "anything")));
        assert!(filter.should_process(&query("db", "DROP TABLE whatever")));
    }

    #[test]
    fn test_table_map_membership() {
        let filter = accepted(&["db.a"]);
        assert!(filter.should_process(&table_map("db", "a")));
        assert!(!filter.should_process(&table_map("db", "b")));
        assert!(!filter.should_process(&table_map("other", "a")));
    }

    #[test]
    fn test_query_all_tables_must_be_accepted() {
        let filter = accepted(&["db.a", "db.b"]);

        assert!(filter.should_process(&query("db", "INSERT INTO a VALUES (1)")));
        assert!(filter.should_process(&query("db", "INSERT INTO a SELECT * FROM b")));

        // Mixed membership drops the event entirely
        assert!(!filter.should_process(&query("db", "INSERT INTO a SELECT * FROM c")));
        assert!(!filter.should_process(&query("db", "DELETE FROM c")));
    }

    #[test]
    fn test_query_qualification() {
        let filter = accepted(&["db.a"]);

        // Unqualified names take the event's default database
        assert!(filter.should_process(&query("db", "DELETE FROM a WHERE id = 1")));
        assert!(!filter.should_process(&query("other", "DELETE FROM a WHERE id = 1")));

        // Qualified names ignore the default database
        assert!(filter.should_process(&query("other", "DELETE FROM db.a WHERE id = 1")));
    }

    #[test]
    fn test_non_table_events_pass() {
        let filter = accepted(&["db.a"]);
        let gtid = BinlogEvent::Gtid(GtidEvent {
            gtid: Gtid::new(0, 1, 1),
            flags: 0,
        });
        let xid = BinlogEvent::Xid(XidEvent { transaction_nr: 1 });

        assert!(filter.should_process(&gtid));
        assert!(filter.should_process(&xid));
        assert!(filter.should_process(&BinlogEvent::Heartbeat));
    }

    #[test]
    fn test_unparseable_statement_passes() {
        let filter = accepted(&["db.a"]);
        assert!(filter.should_process(&query("db", "FLUSH PRIVILEGES SOMEHOW NOT SQL")));
    }

    #[test]
    fn test_referenced_tables() {
        assert_eq!(
            referenced_tables("INSERT INTO a SELECT * FROM db2.b", "db"),
            vec!["db.a".to_string(), "db2.b".to_string()]
        );
        assert_eq!(
            referenced_tables("CREATE TABLE t (id INT)", "db"),
            vec!["db.t".to_string()]
        );
        assert!(referenced_tables("not sql at all ][", "db").is_empty());
    }
}
