use dataquery::QueryError;
use serde_json::Value;
use thiserror::Error;

/// Failure raised by a connector.
#[derive(Error, Debug)]
pub enum ConnectorError {
    /// The provider rejected the client's OAuth credentials.
    #[error("OAuth client unauthorized: {0}")]
    OAuthUnauthorizedClient(String),

    /// The query reached the data source and failed there.
    ///
    /// `status_code` is set for HTTP-backed sources; `response` carries the
    /// upstream body when one was returned.
    #[error("Query could not be completed: {message}")]
    Query {
        message: String,
        status_code: Option<u16>,
        response: Option<Value>,
    },

    /// The connector has no token refresh capability.
    #[error("Connector '{0}' does not support token refresh")]
    RefreshUnsupported(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ConnectorError {
    pub fn query(message: impl Into<String>, status_code: Option<u16>, response: Option<Value>) -> Self {
        Self::Query {
            message: message.into(),
            status_code,
            response,
        }
    }

    /// HTTP status reported by the data source, if any.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Query { status_code, .. } => *status_code,
            _ => None,
        }
    }
}

/// Failure of a query run.
#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Connector(#[from] ConnectorError),

    /// Option resolution, credential or persistence failure.
    #[error(transparent)]
    Query(#[from] QueryError),

    #[error("Unsupported data source kind: {0}")]
    UnsupportedKind(String),
}
