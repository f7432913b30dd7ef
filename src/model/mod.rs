//! Data model for queries, data sources and organization variables.
//!
//! These are the records the store persists. Runtime-only values (query
//! options supplied by the caller, parsed source options handed to a
//! connector) are plain `serde_json` maps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Option key under which OAuth token bundles are stored on a data source.
pub const TOKEN_DATA_KEY: &str = "tokenData";

/// Caller-supplied template bindings, keyed by literal token text (`{{x}}`, `%%y%%`).
pub type QueryOptions = Map<String, Value>;

/// Stored option map of a data source.
pub type SourceOptions = BTreeMap<String, SourceOption>;

/// A persisted, parameterized request against a data source.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DataQuery {
    pub id: String,
    pub name: String,
    /// Connector discriminator (e.g. "restapi", "postgresql")
    pub kind: String,
    /// Arbitrary JSON whose string leaves may contain template tokens
    pub options: Value,
    pub app_id: String,
    /// None for adhoc queries that carry their whole configuration inline
    pub data_source_id: Option<String>,
    pub app_version_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A configured external system with stored connection options.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DataSource {
    pub id: String,
    pub name: String,
    pub kind: String,
    pub options: SourceOptions,
    pub updated_at: DateTime<Utc>,
}

/// One entry of a data source's option map.
///
/// Either a plain value, or a reference to an encrypted credential. The raw
/// secret of an encrypted entry is only reachable through the credential store.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceOption {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default)]
    pub encrypted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_id: Option<String>,
}

impl SourceOption {
    pub fn plain(value: Value) -> Self {
        Self {
            value: Some(value),
            encrypted: false,
            credential_id: None,
        }
    }

    pub fn credential(credential_id: impl Into<String>) -> Self {
        Self {
            value: None,
            encrypted: true,
            credential_id: Some(credential_id.into()),
        }
    }
}

/// An option write request used by `DataSourceService::update_options`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OptionEntry {
    pub key: String,
    pub value: Value,
    #[serde(default)]
    pub encrypted: bool,
}

/// OAuth tokens returned by a code exchange or a connector refresh.
///
/// Providers may add fields (`expires_in`, `scope`, ...); they are kept in `extra`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenBundle {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Scope of an organization environment variable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariableType {
    Server,
    Client,
}

impl VariableType {
    pub fn as_str(&self) -> &'static str {
        match self {
            VariableType::Server => "server",
            VariableType::Client => "client",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "server" => Some(VariableType::Server),
            "client" => Some(VariableType::Client),
            _ => None,
        }
    }
}

/// Organization-scoped variable. `value` holds the column ciphertext.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrgEnvironmentVariable {
    pub id: String,
    pub variable_type: VariableType,
    pub organization_id: String,
    pub variable_name: String,
    pub value: String,
}

/// Owning application of a data query.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct App {
    pub id: String,
    pub organization_id: String,
}

/// Authenticated caller.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub organization_id: String,
}
