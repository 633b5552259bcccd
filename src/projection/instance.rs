//! Watermark-gated writes to one projection table.
//!
//! Every statement carries the guard `watermark < :commit_watermark`, so a
//! record only changes when the commit is newer than the last one applied to
//! it. Replaying an old batch, or the same batch twice, changes nothing:
//!
//! ```text
//! id-targeted upsert
//!   INSERT INTO t (id, c.., watermark) VALUES (?, ?.., :w)
//!   ON CONFLICT(id) DO UPDATE SET c = excluded.c.., watermark = excluded.watermark
//!   WHERE t.watermark < excluded.watermark [AND t.f = ?..]
//!
//! filter-only upsert (update-only)
//!   UPDATE t SET c = ?.., watermark = :w WHERE watermark < :w AND f = ?..
//!
//! delete
//!   DELETE FROM t WHERE watermark < :w AND f = ?..
//! ```
//!
//! All statements of one commit run in one immediate transaction.

use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection, TransactionBehavior};
use serde_json::Value as JsonValue;

use super::filter::ProjectionQuery;
use super::operation::{CommitResult, Fields, Projection, ProjectionRecord, Upsert};
use super::schema::{json_value_to_sql, row_value_to_json, ProjectionSchema, ID_COLUMN, WATERMARK_COLUMN};
use crate::error::{Error, Result};
use crate::schema::quote_identifier;
use crate::types::EventId;

/// A validated schema plus the SQL it needs.
#[derive(Debug, Clone)]
pub struct ProjectionInstance {
    schema: ProjectionSchema,
    table: String,
}

impl ProjectionInstance {
    pub fn new(schema: ProjectionSchema) -> Result<Self> {
        schema.validate()?;
        let table = quote_identifier(&schema.table_name);
        Ok(Self { schema, table })
    }

    pub fn name(&self) -> &str {
        &self.schema.table_name
    }

    pub fn schema(&self) -> &ProjectionSchema {
        &self.schema
    }

    /// Creates the table and its indexes. Idempotent.
    pub fn create_projection_table(&self, conn: &mut Connection) -> Result<()> {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        for statement in self.schema.ddl() {
            tx.execute_batch(&statement)?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Applies `projection` atomically with `watermark`.
    pub fn apply(&self, conn: &mut Connection, projection: &Projection, watermark: EventId) -> Result<CommitResult> {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut upserted = 0;
        for upsert in &projection.upserts {
            let (sql, values) = self.upsert_statement(upsert, watermark)?;
            upserted += tx.execute(&sql, params_from_iter(values))?;
        }

        let mut deleted = 0;
        for delete in &projection.deletes {
            if delete.filter.is_empty() {
                return Err(Error::InvalidArgument("delete requires a filter".to_string()));
            }
            let mut values = vec![SqlValue::Integer(watermark.as_raw())];
            let clauses = self.match_clauses(&delete.filter, &mut values, None)?;
            let sql = format!(
                "DELETE FROM {} WHERE {} < ?1 AND {clauses}",
                self.table,
                quote_identifier(WATERMARK_COLUMN)
            );
            deleted += tx.execute(&sql, params_from_iter(values))?;
        }

        tx.commit()?;
        Ok(CommitResult {
            upserted,
            deleted,
            watermark,
        })
    }

    fn upsert_statement(&self, upsert: &Upsert, watermark: EventId) -> Result<(String, Vec<SqlValue>)> {
        let set_fields: Vec<(&String, &JsonValue)> = upsert
            .values
            .iter()
            .filter(|(k, _)| k.as_str() != ID_COLUMN)
            .collect();
        if upsert.values.is_empty() {
            return Err(Error::InvalidArgument("upsert requires values".to_string()));
        }

        let wm_col = quote_identifier(WATERMARK_COLUMN);
        let mut values = vec![SqlValue::Integer(watermark.as_raw())];

        match upsert.id() {
            Some(id) => {
                let id = id_text(id)?;
                values.push(SqlValue::Text(id));

                let mut columns = vec![quote_identifier(ID_COLUMN)];
                let mut placeholders = vec!["?2".to_string()];
                let mut updates = Vec::with_capacity(set_fields.len() + 1);
                for (name, value) in &set_fields {
                    let col_type = self.writable_type(name)?;
                    values.push(json_value_to_sql(value, col_type)?);
                    let column = quote_identifier(name);
                    placeholders.push(format!("?{}", values.len()));
                    updates.push(format!("{column} = excluded.{column}"));
                    columns.push(column);
                }
                columns.push(wm_col.clone());
                placeholders.push("?1".to_string());
                updates.push(format!("{wm_col} = excluded.{wm_col}"));

                let mut guard = format!("{}.{wm_col} < excluded.{wm_col}", self.table);
                let others: Fields = upsert
                    .filter
                    .iter()
                    .filter(|(k, _)| k.as_str() != ID_COLUMN)
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                if !others.is_empty() {
                    let clauses = self.match_clauses(&others, &mut values, Some(self.table.as_str()))?;
                    guard.push_str(" AND ");
                    guard.push_str(&clauses);
                }

                let sql = format!(
                    "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT({}) DO UPDATE SET {} WHERE {guard}",
                    self.table,
                    columns.join(", "),
                    placeholders.join(", "),
                    quote_identifier(ID_COLUMN),
                    updates.join(", ")
                );
                Ok((sql, values))
            }
            None => {
                if upsert.filter.is_empty() {
                    return Err(Error::InvalidArgument(
                        "upsert without an id requires a filter".to_string(),
                    ));
                }
                let mut updates = Vec::with_capacity(set_fields.len() + 1);
                for (name, value) in &set_fields {
                    let col_type = self.writable_type(name)?;
                    values.push(json_value_to_sql(value, col_type)?);
                    updates.push(format!("{} = ?{}", quote_identifier(name), values.len()));
                }
                updates.push(format!("{wm_col} = ?1"));

                let clauses = self.match_clauses(&upsert.filter, &mut values, None)?;
                let sql = format!(
                    "UPDATE {} SET {} WHERE {wm_col} < ?1 AND {clauses}",
                    self.table,
                    updates.join(", ")
                );
                Ok((sql, values))
            }
        }
    }

    /// Equality clauses for `filter`, pushing their parameters onto `values`.
    fn match_clauses(&self, filter: &Fields, values: &mut Vec<SqlValue>, prefix: Option<&str>) -> Result<String> {
        let mut clauses = Vec::with_capacity(filter.len());
        for (name, value) in filter {
            let col_type = self.schema.column_type(name)?;
            let column = match prefix {
                Some(table) => format!("{table}.{}", quote_identifier(name)),
                None => quote_identifier(name),
            };
            if value.is_null() {
                clauses.push(format!("{column} IS NULL"));
            } else {
                values.push(json_value_to_sql(value, col_type)?);
                clauses.push(format!("{column} = ?{}", values.len()));
            }
        }
        Ok(clauses.join(" AND "))
    }

    fn writable_type(&self, name: &str) -> Result<super::ColumnType> {
        if name == WATERMARK_COLUMN {
            return Err(Error::InvalidArgument("watermark cannot be written directly".to_string()));
        }
        self.schema.column_type(name)
    }

    /// Scans records matching `query`, handing each to `visit`. Stops early
    /// when `visit` returns `false`; returns the number delivered.
    pub fn query_each<F>(&self, conn: &Connection, query: &ProjectionQuery, mut visit: F) -> Result<usize>
    where
        F: FnMut(ProjectionRecord) -> bool,
    {
        let columns = query.columns(&self.schema)?;
        let (tail, values) = query.tail(&self.schema, 1)?;
        let sql = format!(
            "SELECT {}, {} FROM {}{tail}",
            columns.iter().map(|c| quote_identifier(c)).collect::<Vec<_>>().join(", "),
            quote_identifier(WATERMARK_COLUMN),
            self.table
        );

        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(values))?;
        let mut count = 0;
        while let Some(row) = rows.next()? {
            let record = self.record_from_row(row, &columns)?;
            count += 1;
            if !visit(record) {
                break;
            }
        }
        Ok(count)
    }

    /// Point lookup of `ids`. Missing ids are skipped.
    pub fn load(&self, conn: &Connection, ids: &[String]) -> Result<Vec<ProjectionRecord>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let columns = ProjectionQuery::new().columns(&self.schema)?;
        let placeholders = (1..=ids.len()).map(|i| format!("?{i}")).collect::<Vec<_>>().join(", ");
        let sql = format!(
            "SELECT {}, {} FROM {} WHERE {} IN ({placeholders})",
            columns.iter().map(|c| quote_identifier(c)).collect::<Vec<_>>().join(", "),
            quote_identifier(WATERMARK_COLUMN),
            self.table,
            quote_identifier(ID_COLUMN)
        );

        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(ids.iter()))?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(self.record_from_row(row, &columns)?);
        }
        Ok(records)
    }

    fn record_from_row(&self, row: &rusqlite::Row<'_>, columns: &[String]) -> Result<ProjectionRecord> {
        let mut state = Fields::new();
        for (i, name) in columns.iter().enumerate() {
            let col_type = self.schema.column_type(name)?;
            state.insert(name.clone(), row_value_to_json(row, i, col_type)?);
        }
        let watermark: i64 = row.get(columns.len())?;
        Ok(ProjectionRecord {
            state,
            watermark: EventId::from_raw(watermark),
        })
    }
}

fn id_text(id: &JsonValue) -> Result<String> {
    match id {
        JsonValue::String(s) if !s.is_empty() => Ok(s.clone()),
        JsonValue::Number(n) => Ok(n.to_string()),
        other => Err(Error::InvalidArgument(format!("invalid projection id: {other}"))),
    }
}
