//! Query invocation with one-shot OAuth token refresh.
//!
//! A run resolves the organization, parses source options, interpolates the
//! query options and hands both to the connector registered for the query's
//! kind. When the connector reports an OAuth authorization failure the runner
//! refreshes the token, persists it, reloads the data source, rebuilds every
//! input from scratch and runs exactly once more. Whatever that second run
//! returns is final.

use crate::types::{ConnectorError, RunError};
use crate::{Connector, ConnectorRegistry};
use dataquery::model::{DataQuery, DataSource, QueryOptions, User, TOKEN_DATA_KEY};
use dataquery::store::AppStore;
use dataquery::{DataSourceService, TemplateEngine};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Inputs of a single connector invocation.
struct PreparedRun {
    service: Box<dyn Connector>,
    source_options: Map<String, Value>,
    query_options: Value,
}

/// Executes data queries through their connectors.
pub struct QueryRunner {
    registry: ConnectorRegistry,
    data_sources: DataSourceService,
    apps: Arc<dyn AppStore>,
    templates: TemplateEngine,
}

impl QueryRunner {
    pub fn new(
        registry: ConnectorRegistry,
        data_sources: DataSourceService,
        apps: Arc<dyn AppStore>,
        templates: TemplateEngine,
    ) -> Self {
        Self {
            registry,
            data_sources,
            apps,
            templates,
        }
    }

    /// Runs `query` with the caller's template bindings.
    ///
    /// Without a `user` the organization comes from the query's app, which
    /// must exist. Only the refresh branch writes to the store.
    pub async fn run_query(
        &self,
        user: Option<&User>,
        query: &DataQuery,
        query_options: &QueryOptions,
    ) -> Result<Value, RunError> {
        let organization_id = self.organization_id(user, query).await?;

        let data_source = match &query.data_source_id {
            Some(id) => Some(self.data_sources.find(id).await?),
            None => None,
        };

        let prepared = self
            .prepare(query, data_source.as_ref(), query_options, &organization_id)
            .await?;

        debug!(query_id = %query.id, kind = %query.kind, "Running data query");

        let error = match invoke(&prepared, data_source.as_ref()).await {
            Ok(result) => return Ok(result),
            Err(error) => error,
        };

        let data_source = match data_source {
            Some(data_source) if requires_token_refresh(&error, &prepared.source_options) => data_source,
            _ => return Err(error.into()),
        };

        warn!(
            query_id = %query.id,
            data_source_id = %data_source.id,
            error = %error,
            "Access token expired, attempting refresh token flow"
        );

        let token = prepared
            .service
            .refresh_token(&prepared.source_options, Some(&data_source.id))
            .await?;

        self.data_sources
            .update_oauth_access_token(&token, &data_source.options, &data_source.id)
            .await?;

        let data_source = self.data_sources.find(&data_source.id).await?;

        info!(
            query_id = %query.id,
            data_source_id = %data_source.id,
            "Token refreshed, retrying query"
        );

        let retry = self
            .prepare(query, Some(&data_source), query_options, &organization_id)
            .await?;

        Ok(invoke(&retry, Some(&data_source)).await?)
    }

    async fn organization_id(&self, user: Option<&User>, query: &DataQuery) -> Result<String, RunError> {
        match user {
            Some(user) => Ok(user.organization_id.clone()),
            None => Ok(self.apps.find_one_or_fail(&query.app_id).await?.organization_id),
        }
    }

    /// Builds connector, source options and query options from current state.
    async fn prepare(
        &self,
        query: &DataQuery,
        data_source: Option<&DataSource>,
        query_options: &QueryOptions,
        organization_id: &str,
    ) -> Result<PreparedRun, RunError> {
        let source_options = self
            .data_sources
            .parse_source_options(data_source.map(|ds| &ds.options))
            .await?;

        let parsed_query_options = self
            .templates
            .parse_query_options(&query.options, query_options, organization_id)
            .await?;

        let service = self.registry.create(&query.kind)?;

        Ok(PreparedRun {
            service,
            source_options,
            query_options: parsed_query_options,
        })
    }
}

async fn invoke(prepared: &PreparedRun, data_source: Option<&DataSource>) -> Result<Value, ConnectorError> {
    prepared
        .service
        .run(
            &prepared.source_options,
            &prepared.query_options,
            data_source.map(|ds| ds.id.as_str()),
            data_source.map(|ds| ds.updated_at),
        )
        .await
}

/// OAuth client errors always qualify; a plain 401 only for sources holding `tokenData`.
fn requires_token_refresh(error: &ConnectorError, source_options: &Map<String, Value>) -> bool {
    if matches!(error, ConnectorError::OAuthUnauthorizedClient(_)) {
        return true;
    }
    let has_token_data = source_options
        .get(TOKEN_DATA_KEY)
        .is_some_and(|token| !token.is_null());
    error.status_code() == Some(401) && has_token_data
}
