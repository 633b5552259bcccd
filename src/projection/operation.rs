//! Projection operation types.
//!
//! A [`Projection`] is the set of writes derived from one or more events. It
//! is applied atomically with a single watermark by
//! [`ProjectionStore::commit`](super::ProjectionStore::commit).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::types::EventId;

/// Column name to value.
pub type Fields = Map<String, JsonValue>;

fn into_fields(value: JsonValue) -> Fields {
    match value {
        JsonValue::Object(map) => map,
        _ => Fields::new(),
    }
}

/// Insert-or-update, or update-only.
///
/// When `filter` or `values` carries an `id`, the record with that id is
/// inserted or updated. Otherwise every record matching `filter` is updated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Upsert {
    /// Equality match on columns. A `null` value matches `IS NULL`.
    pub filter: Fields,
    pub values: Fields,
}

impl Upsert {
    /// Id targeted by this upsert, from `filter` first, then `values`.
    pub fn id(&self) -> Option<&JsonValue> {
        self.filter
            .get(super::ID_COLUMN)
            .or_else(|| self.values.get(super::ID_COLUMN))
            .filter(|v| !v.is_null())
    }
}

/// Deletes every record matching `filter`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Delete {
    pub filter: Fields,
}

/// Writes to apply in one projection commit.
///
/// Builders take `serde_json::json!` objects; anything that is not an
/// object counts as an empty field set.
///
/// ```rust
/// use serde_json::json;
/// use tideline::projection::Projection;
///
/// let projection = Projection::new()
///     .upsert_id("t-1", json!({ "title": "Fix login", "status": "open" }))
///     .update(json!({ "assignee": "ann" }), json!({ "assignee": null }))
///     .delete_id("t-0");
/// assert_eq!(projection.upserts.len(), 2);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Projection {
    #[serde(default)]
    pub upserts: Vec<Upsert>,
    #[serde(default)]
    pub deletes: Vec<Delete>,
}

impl Projection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.deletes.is_empty()
    }

    pub fn upsert(mut self, filter: JsonValue, values: JsonValue) -> Self {
        self.upserts.push(Upsert {
            filter: into_fields(filter),
            values: into_fields(values),
        });
        self
    }

    /// Insert-or-update of the record `id`.
    pub fn upsert_id(self, id: impl Into<String>, values: JsonValue) -> Self {
        let filter = JsonValue::Object(Fields::from_iter([(
            super::ID_COLUMN.to_string(),
            JsonValue::String(id.into()),
        )]));
        self.upsert(filter, values)
    }

    /// Update-only of the records matching `filter`. Same as [`Projection::upsert`];
    /// the name documents intent when `filter` has no id.
    pub fn update(self, filter: JsonValue, values: JsonValue) -> Self {
        self.upsert(filter, values)
    }

    pub fn delete(mut self, filter: JsonValue) -> Self {
        self.deletes.push(Delete {
            filter: into_fields(filter),
        });
        self
    }

    pub fn delete_id(self, id: impl Into<String>) -> Self {
        let filter = JsonValue::Object(Fields::from_iter([(
            super::ID_COLUMN.to_string(),
            JsonValue::String(id.into()),
        )]));
        self.delete(filter)
    }

    /// Appends the writes of `other`.
    pub fn merge(mut self, other: Projection) -> Self {
        self.upserts.extend(other.upserts);
        self.deletes.extend(other.deletes);
        self
    }
}

/// Rows actually changed by a commit.
///
/// Writes skipped by the watermark guard are not counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitResult {
    pub upserted: usize,
    pub deleted: usize,
    pub watermark: EventId,
}

/// A projected entity: its state and the watermark of the last commit
/// applied to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectionRecord {
    /// Object of column name to value. Includes `id` unless the query
    /// selected a subset without it.
    pub state: Fields,
    pub watermark: EventId,
}

impl ProjectionRecord {
    pub fn id(&self) -> Option<&str> {
        self.state.get(super::ID_COLUMN).and_then(JsonValue::as_str)
    }
}
