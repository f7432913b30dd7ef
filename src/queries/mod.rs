//! Data query CRUD.

use crate::error::{QueryError, Result};
use crate::model::DataQuery;
use crate::store::DataQueryStore;
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Fields of a new data query.
#[derive(Clone, Debug)]
pub struct NewDataQuery {
    pub name: String,
    pub kind: String,
    pub options: Value,
    pub app_id: String,
    pub data_source_id: Option<String>,
    pub app_version_id: Option<String>,
}

#[derive(Clone)]
pub struct DataQueryService {
    queries: Arc<dyn DataQueryStore>,
}

impl DataQueryService {
    pub fn new(queries: Arc<dyn DataQueryStore>) -> Self {
        Self { queries }
    }

    /// Queries of an app, optionally restricted to one version, newest first.
    pub async fn all(&self, app_id: &str, app_version_id: Option<&str>) -> Result<Vec<DataQuery>> {
        self.queries.list(app_id, app_version_id).await
    }

    pub async fn find_one(&self, id: &str) -> Result<DataQuery> {
        self.queries
            .find(id)
            .await?
            .ok_or_else(|| QueryError::not_found(format!("Data query {}", id)))
    }

    pub async fn create(&self, new: NewDataQuery) -> Result<DataQuery> {
        let now = Utc::now();
        let query = DataQuery {
            id: Uuid::new_v4().to_string(),
            name: new.name,
            kind: new.kind,
            options: new.options,
            app_id: new.app_id,
            data_source_id: new.data_source_id,
            app_version_id: new.app_version_id,
            created_at: now,
            updated_at: now,
        };

        self.queries.save(&query).await?;
        info!(query_id = %query.id, kind = %query.kind, app_id = %query.app_id, "Data query created");
        Ok(query)
    }

    /// Renames a query and replaces its options. Identity, kind and owner never change.
    pub async fn update(&self, id: &str, name: &str, options: Value) -> Result<DataQuery> {
        let mut query = self.find_one(id).await?;
        query.name = name.to_string();
        query.options = options;
        query.updated_at = Utc::now();

        self.queries.save(&query).await?;
        Ok(query)
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        if !self.queries.delete(id).await? {
            return Err(QueryError::not_found(format!("Data query {}", id)));
        }
        info!(query_id = %id, "Data query deleted");
        Ok(())
    }
}
