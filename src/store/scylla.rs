//! Scylla-driver store
//!
//! Production [`CqlStore`] backed by the scylla driver. Statements are
//! prepared once with their consistency level. Inserts are spawned and
//! not awaited: a failure after handoff is logged, matching the
//! fire-and-forget write path.

use std::sync::Arc;

use async_trait::async_trait;
use scylla::prepared_statement::PreparedStatement;
use scylla::serialize::row::SerializeRow;
use scylla::statement::Consistency;
use scylla::Session;

use super::{statements, ConsistencyLevel, ConsistencyPolicy, CqlStore};
use crate::error::{Error, Result};
use crate::query::Order;

impl From<ConsistencyLevel> for Consistency {
    fn from(level: ConsistencyLevel) -> Self {
        match level {
            ConsistencyLevel::Any => Consistency::Any,
            ConsistencyLevel::One => Consistency::One,
            ConsistencyLevel::Two => Consistency::Two,
            ConsistencyLevel::Three => Consistency::Three,
            ConsistencyLevel::Quorum => Consistency::Quorum,
            ConsistencyLevel::All => Consistency::All,
            ConsistencyLevel::LocalOne => Consistency::LocalOne,
            ConsistencyLevel::LocalQuorum => Consistency::LocalQuorum,
            ConsistencyLevel::EachQuorum => Consistency::EachQuorum,
        }
    }
}

/// `CqlStore` over a live session
pub struct ScyllaStore {
    session: Arc<Session>,
    insert_data: PreparedStatement,
    insert_row_key: PreparedStatement,
    insert_split: PreparedStatement,
    insert_string: PreparedStatement,
    query_string: PreparedStatement,
    query_row_key: PreparedStatement,
    query_split: PreparedStatement,
    query_data_asc: PreparedStatement,
    query_data_desc: PreparedStatement,
    delete_row: PreparedStatement,
    delete_column: PreparedStatement,
    delete_index_entry: PreparedStatement,
}

impl ScyllaStore {
    /// Prepare every statement against `session` with the per-operation
    /// consistency levels
    pub async fn new(session: Arc<Session>, policy: ConsistencyPolicy) -> Result<Self> {
        Ok(Self {
            insert_data: prepare(&session, statements::DATA_POINTS_INSERT, policy.write_datapoint)
                .await?,
            insert_row_key: prepare(
                &session,
                statements::ROW_TIME_KEY_INDEX_INSERT,
                policy.write_meta,
            )
            .await?,
            insert_split: prepare(
                &session,
                statements::ROW_TIME_KEY_SPLIT_INDEX_INSERT,
                policy.write_meta,
            )
            .await?,
            insert_string: prepare(&session, statements::STRING_INDEX_INSERT, policy.write_meta)
                .await?,
            query_string: prepare(&session, statements::STRING_INDEX_QUERY, policy.read).await?,
            query_row_key: prepare(&session, statements::ROW_TIME_KEY_INDEX_QUERY, policy.read)
                .await?,
            query_split: prepare(
                &session,
                statements::ROW_TIME_KEY_SPLIT_INDEX_QUERY,
                policy.read,
            )
            .await?,
            query_data_asc: prepare(&session, statements::DATA_POINTS_QUERY_ASC, policy.read)
                .await?,
            query_data_desc: prepare(&session, statements::DATA_POINTS_QUERY_DESC, policy.read)
                .await?,
            delete_row: prepare(&session, statements::DATA_POINTS_DELETE_ROW, policy.write_datapoint)
                .await?,
            delete_column: prepare(
                &session,
                statements::DATA_POINTS_DELETE_COLUMN,
                policy.write_datapoint,
            )
            .await?,
            delete_index_entry: prepare(
                &session,
                statements::ROW_TIME_KEY_INDEX_DELETE,
                policy.write_meta,
            )
            .await?,
            session,
        })
    }

    /// Hand a bound write to the session without awaiting the result
    fn submit<V>(&self, statement: &PreparedStatement, values: V)
    where
        V: SerializeRow + Send + Sync + 'static,
    {
        let session = Arc::clone(&self.session);
        let statement = statement.clone();
        tokio::spawn(async move {
            if let Err(e) = session.execute_unpaged(&statement, values).await {
                tracing::error!(error = %e, "async write failed");
            }
        });
    }
}

async fn prepare(
    session: &Session,
    text: &str,
    level: ConsistencyLevel,
) -> Result<PreparedStatement> {
    let mut statement = session
        .prepare(text)
        .await
        .map_err(|e| Error::Datastore(e.to_string()))?;
    statement.set_consistency(level.into());
    Ok(statement)
}

fn datastore_err(e: impl std::fmt::Display) -> Error {
    Error::Datastore(e.to_string())
}

#[async_trait]
impl CqlStore for ScyllaStore {
    async fn insert_data_point(
        &self,
        key: &[u8],
        column: u32,
        value: &[u8],
        ttl: u32,
    ) -> Result<()> {
        self.submit(
            &self.insert_data,
            (
                key.to_vec(),
                column.to_be_bytes().to_vec(),
                value.to_vec(),
                ttl as i32,
            ),
        );
        Ok(())
    }

    async fn insert_row_key_index(
        &self,
        metric: &[u8],
        row_key: &[u8],
        time_bucket: i64,
        ttl: u32,
    ) -> Result<()> {
        self.submit(
            &self.insert_row_key,
            (metric.to_vec(), row_key.to_vec(), time_bucket, ttl as i32),
        );
        Ok(())
    }

    async fn insert_row_key_split_index(
        &self,
        metric: &str,
        tag_name: &str,
        tag_value: &str,
        row_key: &[u8],
        time_bucket: i64,
        ttl: u32,
    ) -> Result<()> {
        self.submit(
            &self.insert_split,
            (
                metric.to_string(),
                tag_name.to_string(),
                tag_value.to_string(),
                row_key.to_vec(),
                time_bucket,
                ttl as i32,
            ),
        );
        Ok(())
    }

    async fn insert_string_index(&self, scope: &[u8], value: &str, ttl: u32) -> Result<()> {
        self.submit(
            &self.insert_string,
            (scope.to_vec(), value.to_string(), ttl as i32),
        );
        Ok(())
    }

    async fn query_string_index(&self, scope: &[u8]) -> Result<Vec<String>> {
        let result = self
            .session
            .execute_unpaged(&self.query_string, (scope.to_vec(),))
            .await
            .map_err(datastore_err)?;
        let rows = result.into_rows_result().map_err(datastore_err)?;
        let mut values = Vec::new();
        for row in rows.rows::<(String,)>().map_err(datastore_err)? {
            let (value,) = row.map_err(datastore_err)?;
            values.push(value);
        }
        Ok(values)
    }

    async fn query_row_key_index(
        &self,
        metric: &[u8],
        time_bucket: i64,
        limit: usize,
    ) -> Result<Vec<Vec<u8>>> {
        let result = self
            .session
            .execute_unpaged(
                &self.query_row_key,
                (metric.to_vec(), time_bucket, limit as i32),
            )
            .await
            .map_err(datastore_err)?;
        collect_key_rows(result)
    }

    async fn query_row_key_split_index(
        &self,
        metric: &str,
        tag_name: &str,
        tag_value: &str,
        time_bucket: i64,
        limit: usize,
    ) -> Result<Vec<Vec<u8>>> {
        let result = self
            .session
            .execute_unpaged(
                &self.query_split,
                (
                    metric.to_string(),
                    tag_name.to_string(),
                    tag_value.to_string(),
                    time_bucket,
                    limit as i32,
                ),
            )
            .await
            .map_err(datastore_err)?;
        collect_key_rows(result)
    }

    async fn query_data_points(
        &self,
        key: &[u8],
        lower: u32,
        upper: u32,
        order: Order,
        limit: Option<usize>,
    ) -> Result<Vec<(u32, Vec<u8>)>> {
        let statement = match order {
            Order::Asc => &self.query_data_asc,
            Order::Desc => &self.query_data_desc,
        };
        let result = self
            .session
            .execute_unpaged(
                statement,
                (
                    key.to_vec(),
                    lower.to_be_bytes().to_vec(),
                    upper.to_be_bytes().to_vec(),
                ),
            )
            .await
            .map_err(datastore_err)?;
        let rows = result.into_rows_result().map_err(datastore_err)?;
        let mut points = Vec::new();
        for row in rows.rows::<(Vec<u8>, Vec<u8>)>().map_err(datastore_err)? {
            let (column_bytes, value) = row.map_err(datastore_err)?;
            if column_bytes.len() != 4 {
                return Err(Error::Datastore(format!(
                    "column name has {} bytes, expected 4",
                    column_bytes.len()
                )));
            }
            let mut column = [0u8; 4];
            column.copy_from_slice(&column_bytes);
            points.push((u32::from_be_bytes(column), value));
            if let Some(limit) = limit {
                if points.len() >= limit {
                    break;
                }
            }
        }
        Ok(points)
    }

    async fn delete_data_row(&self, key: &[u8]) -> Result<()> {
        self.session
            .execute_unpaged(&self.delete_row, (key.to_vec(),))
            .await
            .map_err(datastore_err)?;
        Ok(())
    }

    async fn delete_data_column(&self, key: &[u8], column: u32) -> Result<()> {
        self.session
            .execute_unpaged(
                &self.delete_column,
                (key.to_vec(), column.to_be_bytes().to_vec()),
            )
            .await
            .map_err(datastore_err)?;
        Ok(())
    }

    async fn delete_row_key_index_entry(&self, metric: &[u8], row_key: &[u8]) -> Result<()> {
        self.session
            .execute_unpaged(&self.delete_index_entry, (metric.to_vec(), row_key.to_vec()))
            .await
            .map_err(datastore_err)?;
        Ok(())
    }
}

fn collect_key_rows(result: scylla::QueryResult) -> Result<Vec<Vec<u8>>> {
    let rows = result.into_rows_result().map_err(datastore_err)?;
    let mut keys = Vec::new();
    for row in rows.rows::<(Vec<u8>,)>().map_err(datastore_err)? {
        let (key,) = row.map_err(datastore_err)?;
        keys.push(key);
    }
    Ok(keys)
}
