//! Projection schema types.
//!
//! Every projection table has two implicit columns:
//!
//! - `id TEXT PRIMARY KEY`: the entity id
//! - `watermark INTEGER NOT NULL`: global id of the last commit applied to the row
//!
//! Application columns are declared with [`ProjectionSchema::column`] and
//! friends. Neither implicit name may be redeclared.

use std::str::FromStr;

use rusqlite::types::{Value as SqlValue, ValueRef};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{Error, Result};
use crate::schema::{quote_identifier, validate_identifier};

/// Name of the implicit primary key column.
pub const ID_COLUMN: &str = "id";

/// Name of the implicit watermark column.
pub const WATERMARK_COLUMN: &str = "watermark";

/// Column type for projection schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Text,
    Integer,
    Real,
    Boolean,
    /// Arbitrary JSON, stored as text.
    Json,
}

impl ColumnType {
    /// Converts to SQLite type string.
    pub fn to_sql(&self) -> &'static str {
        match self {
            ColumnType::Text | ColumnType::Json => "TEXT",
            ColumnType::Integer | ColumnType::Boolean => "INTEGER",
            ColumnType::Real => "REAL",
        }
    }
}

impl FromStr for ColumnType {
    type Err = Error;

    /// Case-insensitive, with the usual aliases.
    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "text" | "string" => Ok(ColumnType::Text),
            "integer" | "int" | "bigint" => Ok(ColumnType::Integer),
            "real" | "float" | "double" | "decimal" | "number" => Ok(ColumnType::Real),
            "boolean" | "bool" => Ok(ColumnType::Boolean),
            "json" | "object" | "array" => Ok(ColumnType::Json),
            other => Err(Error::Schema(format!("unknown column type '{other}'"))),
        }
    }
}

/// Definition of a column in a projection table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub col_type: ColumnType,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
    #[serde(default)]
    pub default_value: Option<JsonValue>,
}

fn default_nullable() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

impl SortOrder {
    pub fn to_sql(&self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

/// A secondary index, created by `seed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDef {
    pub columns: Vec<(String, SortOrder)>,
}

/// Schema definition for a projection table.
///
/// # Example
///
/// ```rust
/// use tideline::projection::{ColumnType, ProjectionSchema, SortOrder};
///
/// let schema = ProjectionSchema::new("tickets")
///     .column("title", ColumnType::Text)
///     .required_column("status", ColumnType::Text)
///     .column("assignee", ColumnType::Text)
///     .index([("assignee", SortOrder::Asc)]);
/// assert!(schema.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectionSchema {
    pub table_name: String,
    pub columns: Vec<ColumnDef>,
    #[serde(default)]
    pub indexes: Vec<IndexDef>,
}

impl ProjectionSchema {
    pub fn new(table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            columns: Vec::new(),
            indexes: Vec::new(),
        }
    }

    /// Adds a nullable column.
    pub fn column(mut self, name: impl Into<String>, col_type: ColumnType) -> Self {
        self.columns.push(ColumnDef {
            name: name.into(),
            col_type,
            nullable: true,
            default_value: None,
        });
        self
    }

    /// Adds a `NOT NULL` column. Id upserts that omit it fail the whole
    /// commit, even when the record already exists.
    pub fn required_column(mut self, name: impl Into<String>, col_type: ColumnType) -> Self {
        self.columns.push(ColumnDef {
            name: name.into(),
            col_type,
            nullable: false,
            default_value: None,
        });
        self
    }

    /// Adds a `NOT NULL` column with a default.
    pub fn column_with_default(
        mut self,
        name: impl Into<String>,
        col_type: ColumnType,
        default_value: JsonValue,
    ) -> Self {
        self.columns.push(ColumnDef {
            name: name.into(),
            col_type,
            nullable: false,
            default_value: Some(default_value),
        });
        self
    }

    pub fn index<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = (S, SortOrder)>,
        S: Into<String>,
    {
        self.indexes.push(IndexDef {
            columns: columns.into_iter().map(|(c, o)| (c.into(), o)).collect(),
        });
        self
    }

    /// Looks up an application column.
    pub fn column_def(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Type of any addressable column, including the implicit `id` and
    /// `watermark`. Unknown names are an [`Error::InvalidArgument`].
    pub fn column_type(&self, name: &str) -> Result<ColumnType> {
        match name {
            ID_COLUMN => Ok(ColumnType::Text),
            WATERMARK_COLUMN => Ok(ColumnType::Integer),
            _ => self.column_def(name).map(|c| c.col_type).ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "projection '{}' has no column '{name}'",
                    self.table_name
                ))
            }),
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_identifier(&self.table_name)?;
        let mut seen = std::collections::HashSet::new();
        for col in &self.columns {
            validate_identifier(&col.name)?;
            if col.name == ID_COLUMN || col.name == WATERMARK_COLUMN {
                return Err(Error::Schema(format!(
                    "column '{}' is reserved in projection '{}'",
                    col.name, self.table_name
                )));
            }
            if !seen.insert(col.name.as_str()) {
                return Err(Error::Schema(format!(
                    "duplicate column '{}' in projection '{}'",
                    col.name, self.table_name
                )));
            }
        }
        for index in &self.indexes {
            if index.columns.is_empty() {
                return Err(Error::Schema("index without columns".to_string()));
            }
            for (column, _) in &index.columns {
                self.column_type(column)
                    .map_err(|_| Error::Schema(format!("index on unknown column '{column}'")))?;
            }
        }
        Ok(())
    }

    /// `CREATE TABLE` followed by one `CREATE INDEX` per index.
    pub(crate) fn ddl(&self) -> Vec<String> {
        let table = quote_identifier(&self.table_name);
        let mut sql = format!(
            "CREATE TABLE IF NOT EXISTS {table} (\n    {} TEXT PRIMARY KEY NOT NULL",
            quote_identifier(ID_COLUMN)
        );

        for col in &self.columns {
            sql.push_str(&format!(",\n    {} {}", quote_identifier(&col.name), col.col_type.to_sql()));

            if !col.nullable {
                sql.push_str(" NOT NULL");
            }

            if let Some(ref default) = col.default_value {
                sql.push_str(&format!(" DEFAULT {}", json_to_sql_literal(default)));
            }
        }

        sql.push_str(&format!(
            ",\n    {} INTEGER NOT NULL\n)",
            quote_identifier(WATERMARK_COLUMN)
        ));

        let mut statements = vec![sql];
        for index in &self.indexes {
            let name = format!(
                "{}_{}",
                self.table_name,
                index.columns.iter().map(|(c, _)| c.as_str()).collect::<Vec<_>>().join("_")
            );
            let columns = index
                .columns
                .iter()
                .map(|(c, o)| format!("{} {}", quote_identifier(c), o.to_sql()))
                .collect::<Vec<_>>()
                .join(", ");
            statements.push(format!(
                "CREATE INDEX IF NOT EXISTS {} ON {table} ({columns})",
                quote_identifier(&name)
            ));
        }
        statements
    }
}

/// Converts a JSON value to a SQL literal string, for `DEFAULT` clauses.
pub fn json_to_sql_literal(value: &JsonValue) -> String {
    match value {
        JsonValue::Null => "NULL".to_string(),
        JsonValue::Bool(b) => if *b { "1" } else { "0" }.to_string(),
        JsonValue::Number(n) => n.to_string(),
        JsonValue::String(s) => format!("'{}'", s.replace('\'', "''")),
        other => format!("'{}'", other.to_string().replace('\'', "''")),
    }
}

/// Converts a JSON value to a bound SQL parameter for a column of `col_type`.
pub fn json_value_to_sql(value: &JsonValue, col_type: ColumnType) -> Result<SqlValue> {
    if col_type == ColumnType::Json {
        return Ok(match value {
            JsonValue::Null => SqlValue::Null,
            other => SqlValue::Text(serde_json::to_string(other)?),
        });
    }
    match value {
        JsonValue::Null => Ok(SqlValue::Null),
        JsonValue::Bool(b) => Ok(SqlValue::Integer(i64::from(*b))),
        JsonValue::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) if col_type != ColumnType::Real => Ok(SqlValue::Integer(i)),
            (_, Some(f)) => Ok(SqlValue::Real(f)),
            _ => Ok(SqlValue::Text(n.to_string())),
        },
        JsonValue::String(s) => Ok(SqlValue::Text(s.clone())),
        other => Err(Error::InvalidArgument(format!(
            "cannot store {other} in a {} column",
            col_type.to_sql()
        ))),
    }
}

/// Converts a row value to JSON based on column type.
pub fn row_value_to_json(
    row: &rusqlite::Row,
    idx: usize,
    col_type: ColumnType,
) -> rusqlite::Result<JsonValue> {
    let value = row.get_ref(idx)?;
    let json = match (value, col_type) {
        (ValueRef::Null, _) => JsonValue::Null,
        (ValueRef::Integer(n), ColumnType::Boolean) => JsonValue::Bool(n != 0),
        (ValueRef::Integer(n), _) => JsonValue::from(n),
        (ValueRef::Real(f), _) => serde_json::Number::from_f64(f)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null),
        (ValueRef::Text(bytes), ColumnType::Json) => serde_json::from_slice(bytes).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })?,
        (ValueRef::Text(bytes), _) => JsonValue::String(String::from_utf8_lossy(bytes).into_owned()),
        (ValueRef::Blob(_), _) => {
            return Err(rusqlite::Error::InvalidColumnType(
                idx,
                "blob".to_string(),
                rusqlite::types::Type::Blob,
            ))
        }
    };
    Ok(json)
}
