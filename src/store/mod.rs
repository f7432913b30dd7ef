//! Persistence collaborators of the query service.
//!
//! The resolution engine and the invocation protocol only see these traits.
//! [`SqliteStore`] implements all of them over a single SQLite database.

mod sqlite;

pub use sqlite::SqliteStore;

use crate::error::Result;
use crate::model::{App, DataQuery, DataSource, OrgEnvironmentVariable, SourceOptions, VariableType};
use async_trait::async_trait;

/// Encrypted credential values referenced by data source options.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Returns the decrypted value. Fails with `NotFound` for an unknown id.
    async fn get_value(&self, credential_id: &str) -> Result<String>;

    /// Stores a new value and returns its credential id.
    async fn create(&self, value: &str) -> Result<String>;

    /// Replaces the value of an existing credential.
    async fn update(&self, credential_id: &str, value: &str) -> Result<()>;
}

/// Organization environment variables. Values are returned still encrypted.
#[async_trait]
pub trait EnvVariableStore: Send + Sync {
    async fn find_one(
        &self,
        variable_type: VariableType,
        organization_id: &str,
        variable_name: &str,
    ) -> Result<Option<OrgEnvironmentVariable>>;
}

#[async_trait]
pub trait DataSourceStore: Send + Sync {
    async fn find(&self, id: &str) -> Result<Option<DataSource>>;

    /// Replaces the stored option map, bumps `updated_at` and returns the saved row.
    async fn save_options(&self, id: &str, options: &SourceOptions) -> Result<DataSource>;
}

#[async_trait]
pub trait AppStore: Send + Sync {
    /// Fails with `NotFound` when the app does not exist.
    async fn find_one_or_fail(&self, id: &str) -> Result<App>;
}

#[async_trait]
pub trait DataQueryStore: Send + Sync {
    async fn find(&self, id: &str) -> Result<Option<DataQuery>>;

    /// Inserts or replaces the query row.
    async fn save(&self, query: &DataQuery) -> Result<()>;

    /// Returns false when no row existed.
    async fn delete(&self, id: &str) -> Result<bool>;

    /// Queries of an app (optionally one version), most recently created first.
    async fn list(&self, app_id: &str, app_version_id: Option<&str>) -> Result<Vec<DataQuery>>;
}
