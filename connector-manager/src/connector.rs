use crate::types::ConnectorError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dataquery::model::TokenBundle;
use serde_json::{Map, Value};

/// Connector interface for data source kinds.
///
/// A connector is created per run by the [`ConnectorRegistry`](crate::registry::ConnectorRegistry)
/// and holds no state between runs: everything it needs arrives as parsed
/// source options (credentials already decrypted) and interpolated query options.
///
/// # Lifecycle
/// 1. Runner parses source options and interpolates query options
/// 2. Runner calls `run(...)`
/// 3. On an OAuth failure the runner calls `refresh_token(...)`, persists the
///    result, rebuilds the options and calls `run(...)` once more
///
/// # Example
/// ```no_run
/// use async_trait::async_trait;
/// use chrono::{DateTime, Utc};
/// use connector_manager::{Connector, ConnectorError};
/// use serde_json::{json, Map, Value};
///
/// struct EchoConnector;
///
/// #[async_trait]
/// impl Connector for EchoConnector {
///     fn kind(&self) -> &str {
///         "echo"
///     }
///
///     async fn run(
///         &self,
///         _source_options: &Map<String, Value>,
///         query_options: &Value,
///         _data_source_id: Option<&str>,
///         _data_source_updated_at: Option<DateTime<Utc>>,
///     ) -> Result<Value, ConnectorError> {
///         Ok(json!({"status": "ok", "data": query_options}))
///     }
/// }
/// ```
#[async_trait]
pub trait Connector: Send + Sync {
    /// Data source kind this connector serves (e.g. "restapi").
    fn kind(&self) -> &str;

    /// Executes a query against the data source.
    ///
    /// `data_source_id` is `None` for adhoc queries. `data_source_updated_at`
    /// lets connectors key pooled connections on the source's version.
    async fn run(
        &self,
        source_options: &Map<String, Value>,
        query_options: &Value,
        data_source_id: Option<&str>,
        data_source_updated_at: Option<DateTime<Utc>>,
    ) -> Result<Value, ConnectorError>;

    /// Obtains fresh OAuth tokens for the source.
    ///
    /// Connectors without OAuth support keep the default, which fails.
    async fn refresh_token(
        &self,
        _source_options: &Map<String, Value>,
        _data_source_id: Option<&str>,
    ) -> Result<TokenBundle, ConnectorError> {
        Err(ConnectorError::RefreshUnsupported(self.kind().to_string()))
    }
}
