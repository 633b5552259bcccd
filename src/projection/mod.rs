//! # Projections
//!
//! Materialized read models derived from the event log. Each projection is
//! one table in the store's database with an `id` primary key, the
//! application columns and a `watermark`:
//!
//! ```text
//! ProjectionStore ("tickets")
//!     │
//!     ├── tickets (projection table)
//!     │     id TEXT PRIMARY KEY │ title │ status │ ... │ watermark INTEGER
//!     │
//!     └── ConnectionPool (shared with the EventStore, or its own)
//! ```
//!
//! Writes are idempotent under redelivery: a commit with watermark `W` only
//! touches records whose watermark is below `W`. Replaying an old batch after
//! a newer one, or the same batch twice, changes nothing.

mod filter;
mod instance;
mod operation;
mod schema;
mod store;

pub use filter::{Condition, Operator, ProjectionQuery};
pub use instance::ProjectionInstance;
pub use operation::{CommitResult, Delete, Fields, Projection, ProjectionRecord, Upsert};
pub use schema::{ColumnDef, ColumnType, IndexDef, ProjectionSchema, SortOrder, ID_COLUMN, WATERMARK_COLUMN};
pub use store::ProjectionStore;
