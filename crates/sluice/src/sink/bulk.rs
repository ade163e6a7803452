//! SQL bulk loader
//!
//! A [`TableSinkConnector`] that replays row-image batches as SQL against
//! the apply servers: WRITE rows become multi-row `INSERT`s, UPDATE and
//! DELETE rows become single-row statements matched on the full before
//! image. Binlog events carry no column names, so the loader resolves them
//! from `INFORMATION_SCHEMA` when a table is opened; a table the downstream
//! does not know is a fatal open error.

use async_trait::async_trait;
use mysql_async::prelude::Queryable;
use mysql_async::Conn;
use tracing::debug;

use crate::config::ApplyConfig;
use crate::decoder::{ColumnValue, RowsEvent, RowsOp, TableMapEvent};
use crate::error::{Error, Result};
use crate::sink::sql::{connect, quote_ident};
use crate::sink::{TableSink, TableSinkConnector};

/// Opens SQL-backed table sinks on the apply servers.
pub struct SqlBulkLoader {
    config: ApplyConfig,
}

impl SqlBulkLoader {
    pub fn new(config: ApplyConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl TableSinkConnector for SqlBulkLoader {
    async fn open(&self, table_map: &TableMapEvent) -> Result<Box<dyn TableSink>> {
        let mut conn = connect(&self.config).await?;

        let columns: Vec<String> = conn
            .exec(
                "SELECT COLUMN_NAME FROM INFORMATION_SCHEMA.COLUMNS \
                 WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ? \
                 ORDER BY ORDINAL_POSITION",
                (&table_map.database, &table_map.table),
            )
            .await
            .map_err(|e| Error::apply(e.to_string()))?;

        let name = table_map.qualified_name();
        if columns.is_empty() {
            return Err(Error::apply(format!("table {name} does not exist downstream")));
        }
        if columns.len() != table_map.column_count {
            return Err(Error::apply(format!(
                "table {name} has {} columns downstream but {} in the replication stream",
                columns.len(),
                table_map.column_count
            )));
        }

        Ok(Box::new(SqlTableSink {
            name,
            target: format!(
                "{}.{}",
                quote_ident(&table_map.database),
                quote_ident(&table_map.table)
            ),
            columns,
            conn,
            pending: Vec::new(),
        }))
    }
}

struct SqlTableSink {
    name: String,
    target: String,
    columns: Vec<String>,
    conn: Conn,
    pending: Vec<RowsEvent>,
}

#[async_trait]
impl TableSink for SqlTableSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn enqueue(&mut self, event: RowsEvent) -> Result<()> {
        self.pending.push(event);
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        let pending = std::mem::take(&mut self.pending);

        for event in pending {
            for statement in render_rows_event(&self.target, &self.columns, &event) {
                debug!("Applying to {}: {}", self.name, statement);
                self.conn
                    .query_drop(statement.as_str())
                    .await
                    .map_err(|e| Error::apply(format!("{}: {e}", self.name)))?;
            }
        }

        self.conn
            .query_drop("COMMIT")
            .await
            .map_err(|e| Error::apply(format!("{}: {e}", self.name)))
    }

    async fn rollback(&mut self) {
        self.pending.clear();
        let _ = self.conn.query_drop("ROLLBACK").await;
    }
}

/// Render one rows event into SQL statements.
fn render_rows_event(target: &str, columns: &[String], event: &RowsEvent) -> Vec<String> {
    match event.op {
        RowsOp::Write => {
            let tuples: Vec<String> = event
                .rows
                .iter()
                .filter_map(|row| row.after.as_ref())
                .map(|values| format!("({})", render_values(values)))
                .collect();
            if tuples.is_empty() {
                return Vec::new();
            }
            vec![format!(
                "INSERT INTO {target} ({}) VALUES {}",
                column_list(columns),
                tuples.join(",")
            )]
        }
        RowsOp::Delete => event
            .rows
            .iter()
            .filter_map(|row| row.before.as_ref())
            .map(|values| {
                format!(
                    "DELETE FROM {target} WHERE {} LIMIT 1",
                    render_match(columns, values)
                )
            })
            .collect(),
        RowsOp::Update => event
            .rows
            .iter()
            .filter_map(|row| Some((row.before.as_ref()?, row.after.as_ref()?)))
            .map(|(before, after)| {
                format!(
                    "UPDATE {target} SET {} WHERE {} LIMIT 1",
                    render_assignments(columns, after),
                    render_match(columns, before)
                )
            })
            .collect(),
    }
}

fn column_list(columns: &[String]) -> String {
    columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(",")
}

fn render_values(values: &[ColumnValue]) -> String {
    values
        .iter()
        .map(literal)
        .collect::<Vec<_>>()
        .join(",")
}

fn render_assignments(columns: &[String], values: &[ColumnValue]) -> String {
    columns
        .iter()
        .zip(values)
        .map(|(column, value)| format!("{}={}", quote_ident(column), literal(value)))
        .collect::<Vec<_>>()
        .join(",")
}

/// NULL-safe equality match on the full row image.
fn render_match(columns: &[String], values: &[ColumnValue]) -> String {
    columns
        .iter()
        .zip(values)
        .map(|(column, value)| format!("{}<=>{}", quote_ident(column), literal(value)))
        .collect::<Vec<_>>()
        .join(" AND ")
}

/// Render a decoded column value as a SQL literal.
fn literal(value: &ColumnValue) -> String {
    match value {
        ColumnValue::Null => "NULL".to_string(),
        ColumnValue::SignedInt(v) => v.to_string(),
        ColumnValue::UnsignedInt(v) => v.to_string(),
        ColumnValue::Float(v) => v.to_string(),
        ColumnValue::Double(v) => v.to_string(),
        ColumnValue::Decimal(v) => v.clone(),
        ColumnValue::String(v) => quote_string(v),
        ColumnValue::Bytes(v) | ColumnValue::Bit(v) => {
            let hex: String = v.iter().map(|b| format!("{b:02x}")).collect();
            format!("x'{hex}'")
        }
        ColumnValue::Date { year, month, day } => {
            format!("'{year:04}-{month:02}-{day:02}'")
        }
        ColumnValue::Time {
            hours,
            minutes,
            seconds,
            microseconds,
            negative,
        } => {
            let sign = if *negative { "-" } else { "" };
            if *microseconds > 0 {
                format!("'{sign}{hours:02}:{minutes:02}:{seconds:02}.{microseconds:06}'")
            } else {
                format!("'{sign}{hours:02}:{minutes:02}:{seconds:02}'")
            }
        }
        ColumnValue::DateTime {
            year,
            month,
            day,
            hour,
            minute,
            second,
            microsecond,
        } => {
            if *microsecond > 0 {
                format!(
                    "'{year:04}-{month:02}-{day:02} {hour:02}:{minute:02}:{second:02}.{microsecond:06}'"
                )
            } else {
                format!("'{year:04}-{month:02}-{day:02} {hour:02}:{minute:02}:{second:02}'")
            }
        }
        ColumnValue::Timestamp(v) => format!("FROM_UNIXTIME({v})"),
        ColumnValue::Year(v) => v.to_string(),
        ColumnValue::Enum(v) => v.to_string(),
        ColumnValue::Set(v) => v.to_string(),
    }
}

fn quote_string(text: &str) -> String {
    format!("'{}'", text.replace('\\', "\\\\").replace('\'', "''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::RowImage;

    fn columns() -> Vec<String> {
        vec!["id".to_string(), "name".to_string()]
    }

    fn event(op: RowsOp, rows: Vec<RowImage>) -> RowsEvent {
        RowsEvent {
            op,
            table_id: 7,
            flags: 0,
            column_count: 2,
            rows,
        }
    }

    #[test]
    fn test_render_insert() {
        let event = event(
            RowsOp::Write,
            vec![
                RowImage {
                    before: None,
                    after: Some(vec![
                        ColumnValue::SignedInt(1),
                        ColumnValue::String("alice".into()),
                    ]),
                },
                RowImage {
                    before: None,
                    after: Some(vec![ColumnValue::SignedInt(2), ColumnValue::Null]),
                },
            ],
        );

        let statements = render_rows_event("`db`.`t`", &columns(), &event);
        assert_eq!(
            statements,
            vec!["INSERT INTO `db`.`t` (`id`,`name`) VALUES (1,'alice'),(2,NULL)"]
        );
    }

    #[test]
    fn test_render_delete() {
        let event = event(
            RowsOp::Delete,
            vec![RowImage {
                before: Some(vec![ColumnValue::SignedInt(1), ColumnValue::Null]),
                after: None,
            }],
        );

        let statements = render_rows_event("`db`.`t`", &columns(), &event);
        assert_eq!(
            statements,
            vec!["DELETE FROM `db`.`t` WHERE `id`<=>1 AND `name`<=>NULL LIMIT 1"]
        );
    }

    #[test]
    fn test_render_update() {
        let event = event(
            RowsOp::Update,
            vec![RowImage {
                before: Some(vec![
                    ColumnValue::SignedInt(1),
                    ColumnValue::String("alice".into()),
                ]),
                after: Some(vec![
                    ColumnValue::SignedInt(1),
                    ColumnValue::String("bob".into()),
                ]),
            }],
        );

        let statements = render_rows_event("`db`.`t`", &columns(), &event);
        assert_eq!(
            statements,
            vec![
                "UPDATE `db`.`t` SET `id`=1,`name`='bob' \
                 WHERE `id`<=>1 AND `name`<=>'alice' LIMIT 1"
            ]
        );
    }

    #[test]
    fn test_literals() {
        assert_eq!(literal(&ColumnValue::Null), "NULL");
        assert_eq!(literal(&ColumnValue::SignedInt(-5)), "-5");
        assert_eq!(literal(&ColumnValue::Decimal("12.50".into())), "12.50");
        assert_eq!(literal(&ColumnValue::String("o'brien".into())), "'o''brien'");
        assert_eq!(
            literal(&ColumnValue::String("a\\b".into())),
            "'a\\\\b'"
        );
        assert_eq!(literal(&ColumnValue::Bytes(vec![0xDE, 0xAD])), "x'dead'");
        assert_eq!(
            literal(&ColumnValue::Date {
                year: 2024,
                month: 1,
                day: 15
            }),
            "'2024-01-15'"
        );
        assert_eq!(
            literal(&ColumnValue::DateTime {
                year: 2024,
                month: 1,
                day: 15,
                hour: 12,
                minute: 30,
                second: 45,
                microsecond: 0
            }),
            "'2024-01-15 12:30:45'"
        );
        assert_eq!(literal(&ColumnValue::Timestamp(1700000000)), "FROM_UNIXTIME(1700000000)");
    }

    #[test]
    fn test_insert_with_no_after_images_renders_nothing() {
        let event = event(RowsOp::Write, vec![]);
        assert!(render_rows_event("`db`.`t`", &columns(), &event).is_empty());
    }
}
