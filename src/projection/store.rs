//! Async handle to one projection table.

use std::sync::Arc;

use tracing::{debug, info};

use super::filter::ProjectionQuery;
use super::instance::ProjectionInstance;
use super::operation::{CommitResult, Projection, ProjectionRecord};
use super::schema::ProjectionSchema;
use crate::error::Result;
use crate::pool::ConnectionPool;
use crate::stream::RowStream;
use crate::types::EventId;

/// One named projection, sharing a [`ConnectionPool`] with its event store
/// or using one of its own.
///
/// ```rust,no_run
/// use serde_json::json;
/// use tideline::projection::{ColumnType, Projection, ProjectionSchema, ProjectionStore};
/// use tideline::EventId;
///
/// # async fn run(store: tideline::EventStore) -> tideline::Result<()> {
/// let schema = ProjectionSchema::new("totals").column("value", ColumnType::Integer);
/// let totals = ProjectionStore::new(store.pool().clone(), schema)?;
/// totals.seed().await?;
/// totals
///     .commit(Projection::new().upsert_id("Calc/A", json!({ "value": 3 })), EventId::from_raw(3))
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ProjectionStore {
    pool: ConnectionPool,
    instance: Arc<ProjectionInstance>,
}

impl ProjectionStore {
    pub fn new(pool: ConnectionPool, schema: ProjectionSchema) -> Result<Self> {
        Ok(Self {
            pool,
            instance: Arc::new(ProjectionInstance::new(schema)?),
        })
    }

    pub fn name(&self) -> &str {
        self.instance.name()
    }

    /// Creates the table and its indexes. Idempotent; run once at startup.
    pub async fn seed(&self) -> Result<()> {
        let instance = Arc::clone(&self.instance);
        self.pool
            .run(move |conn| instance.create_projection_table(conn))
            .await?;
        info!(projection = %self.name(), "projection seeded");
        Ok(())
    }

    /// Applies `projection` in one transaction, skipping every write whose
    /// record already carries a watermark `>= watermark`.
    pub async fn commit(&self, projection: Projection, watermark: EventId) -> Result<CommitResult> {
        let instance = Arc::clone(&self.instance);
        let result = self
            .pool
            .run(move |conn| instance.apply(conn, &projection, watermark))
            .await?;
        debug!(
            projection = %self.name(),
            upserted = result.upserted,
            deleted = result.deleted,
            watermark = %watermark,
            "projection committed"
        );
        Ok(result)
    }

    /// Lazily streams the records matching `query`.
    pub async fn query(&self, query: ProjectionQuery) -> Result<RowStream<ProjectionRecord>> {
        let instance = Arc::clone(&self.instance);
        self.pool
            .stream(move |conn, sink| instance.query_each(conn, &query, |record| sink.push(record)).map(|_| ()))
            .await
    }

    pub async fn query_all(&self, query: ProjectionQuery) -> Result<Vec<ProjectionRecord>> {
        let instance = Arc::clone(&self.instance);
        self.pool
            .run(move |conn| {
                let mut records = Vec::new();
                instance.query_each(conn, &query, |record| {
                    records.push(record);
                    true
                })?;
                Ok(records)
            })
            .await
    }

    /// Records for the ids that exist. Order is unspecified.
    pub async fn load<I, S>(&self, ids: I) -> Result<Vec<ProjectionRecord>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ids: Vec<String> = ids.into_iter().map(Into::into).collect();
        let instance = Arc::clone(&self.instance);
        self.pool.run(move |conn| instance.load(conn, &ids)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::projection::{ColumnType, Operator, SortOrder};
    use futures::TryStreamExt;
    use serde_json::json;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn open(dir: &TempDir) -> (ConnectionPool, ProjectionStore) {
        let pool = ConnectionPool::open(&dir.path().join("proj.db"), 2, Duration::from_secs(5), 16).unwrap();
        let schema = ProjectionSchema::new("balances")
            .column_with_default("amount", ColumnType::Integer, json!(0))
            .column("owner", ColumnType::Text)
            .index([("owner", SortOrder::Asc)]);
        let store = ProjectionStore::new(pool.clone(), schema).unwrap();
        store.seed().await.unwrap();
        store.seed().await.unwrap();
        (pool, store)
    }

    #[tokio::test]
    async fn test_commit_query_load() {
        let dir = TempDir::new().unwrap();
        let (pool, store) = open(&dir).await;

        let result = store
            .commit(
                Projection::new()
                    .upsert_id("a", json!({"amount": 10, "owner": "ann"}))
                    .upsert_id("b", json!({"owner": "bob"})),
                EventId::from_raw(4),
            )
            .await
            .unwrap();
        assert_eq!(result.upserted, 2);

        let mut loaded = store.load(["b", "a", "missing"]).await.unwrap();
        loaded.sort_by(|x, y| x.id().cmp(&y.id()));
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[1].state["amount"], json!(0));

        let rich: Vec<ProjectionRecord> = store
            .query(ProjectionQuery::new().filter("amount", Operator::Gt, json!(5)))
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(rich.len(), 1);
        assert_eq!(rich[0].id(), Some("a"));
        assert_eq!(rich[0].watermark, EventId::from_raw(4));

        let all = store
            .query_all(ProjectionQuery::new().sort("owner", SortOrder::Desc))
            .await
            .unwrap();
        assert_eq!(all.iter().map(|r| r.id()).collect::<Vec<_>>(), vec![Some("b"), Some("a")]);

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_query_errors_surface_through_stream() {
        let dir = TempDir::new().unwrap();
        let (_pool, store) = open(&dir).await;
        let stream = store
            .query(ProjectionQuery::new().filter("nope", Operator::Eq, json!(1)))
            .await
            .unwrap();
        let result: Result<Vec<ProjectionRecord>> = stream.try_collect().await;
        assert!(matches!(result, Err(crate::Error::InvalidArgument(_))));
    }
}
