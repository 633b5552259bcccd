//! Projection queries.
//!
//! A [`ProjectionQuery`] selects columns, filters with per-field conditions,
//! sorts on several fields and limits. Conditions against `null` collapse to
//! `IS NULL` / `IS NOT NULL`:
//!
//! | Operator | value `null` |
//! |----------|--------------|
//! | `Eq`, `Lte`, `Gte`, `In` | `IS NULL` |
//! | `Neq`, `Lt`, `Gt`, `NotIn` | `IS NOT NULL` |

use rusqlite::types::Value as SqlValue;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use super::schema::{json_value_to_sql, ProjectionSchema, SortOrder};
use crate::error::Result;
use crate::schema::quote_identifier;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Eq,
    Neq,
    Lt,
    Gt,
    Lte,
    Gte,
    In,
    NotIn,
}

impl Operator {
    fn to_sql(self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::Neq => "<>",
            Operator::Lt => "<",
            Operator::Gt => ">",
            Operator::Lte => "<=",
            Operator::Gte => ">=",
            Operator::In => "IN",
            Operator::NotIn => "NOT IN",
        }
    }

    /// Whether a `null` operand means `IS NULL` (otherwise `IS NOT NULL`).
    fn null_means_is_null(self) -> bool {
        matches!(self, Operator::Eq | Operator::Lte | Operator::Gte | Operator::In)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub operator: Operator,
    pub value: JsonValue,
}

/// Query over one projection table.
///
/// ```rust
/// use serde_json::json;
/// use tideline::projection::{Operator, ProjectionQuery, SortOrder};
///
/// let query = ProjectionQuery::new()
///     .select(["id", "title"])
///     .filter("status", Operator::In, json!(["open", "blocked"]))
///     .filter("assignee", Operator::Neq, json!(null))
///     .sort("title", SortOrder::Asc)
///     .limit(20);
/// assert_eq!(query.conditions.len(), 2);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectionQuery {
    /// Columns to return. Empty means `id` plus every declared column.
    #[serde(default)]
    pub select: Vec<String>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub sort: Vec<(String, SortOrder)>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl ProjectionQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn select<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.select = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn filter(mut self, field: impl Into<String>, operator: Operator, value: JsonValue) -> Self {
        self.conditions.push(Condition {
            field: field.into(),
            operator,
            value,
        });
        self
    }

    pub fn sort(mut self, field: impl Into<String>, order: SortOrder) -> Self {
        self.sort.push((field.into(), order));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Column names this query returns, in order, validated against `schema`.
    pub(crate) fn columns(&self, schema: &ProjectionSchema) -> Result<Vec<String>> {
        if self.select.is_empty() {
            let mut all = vec![super::ID_COLUMN.to_string()];
            all.extend(schema.columns.iter().map(|c| c.name.clone()));
            return Ok(all);
        }
        for field in &self.select {
            schema.column_type(field)?;
        }
        Ok(self.select.clone())
    }

    /// `WHERE ... ORDER BY ... LIMIT ...` tail and its parameters.
    ///
    /// Placeholders are numbered from `first_param`.
    pub(crate) fn tail(&self, schema: &ProjectionSchema, first_param: usize) -> Result<(String, Vec<SqlValue>)> {
        let mut values = Vec::new();
        let mut clauses = Vec::with_capacity(self.conditions.len());

        for condition in &self.conditions {
            let col_type = schema.column_type(&condition.field)?;
            let column = quote_identifier(&condition.field);

            if condition.value.is_null() {
                let test = if condition.operator.null_means_is_null() {
                    "IS NULL"
                } else {
                    "IS NOT NULL"
                };
                clauses.push(format!("{column} {test}"));
                continue;
            }

            match condition.operator {
                Operator::In | Operator::NotIn => {
                    let items: Vec<&JsonValue> = match &condition.value {
                        JsonValue::Array(items) => items.iter().collect(),
                        single => vec![single],
                    };
                    if items.is_empty() {
                        // Nothing is in the empty set.
                        clauses.push(if condition.operator == Operator::In { "0" } else { "1" }.to_string());
                        continue;
                    }
                    let mut placeholders = Vec::with_capacity(items.len());
                    for item in items {
                        values.push(json_value_to_sql(item, col_type)?);
                        placeholders.push(format!("?{}", first_param + values.len() - 1));
                    }
                    clauses.push(format!(
                        "{column} {} ({})",
                        condition.operator.to_sql(),
                        placeholders.join(", ")
                    ));
                }
                op => {
                    values.push(json_value_to_sql(&condition.value, col_type)?);
                    clauses.push(format!(
                        "{column} {} ?{}",
                        op.to_sql(),
                        first_param + values.len() - 1
                    ));
                }
            }
        }

        let mut sql = String::new();
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }

        if !self.sort.is_empty() {
            let mut keys = Vec::with_capacity(self.sort.len());
            for (field, order) in &self.sort {
                schema.column_type(field)?;
                keys.push(format!("{} {}", quote_identifier(field), order.to_sql()));
            }
            sql.push_str(" ORDER BY ");
            sql.push_str(&keys.join(", "));
        }

        if let Some(limit) = self.limit {
            values.push(SqlValue::Integer(i64::try_from(limit).unwrap_or(i64::MAX)));
            sql.push_str(&format!(" LIMIT ?{}", first_param + values.len() - 1));
        }

        Ok((sql, values))
    }
}
