//! SQLite-backed implementation of the persistence collaborators.
//!
//! Credential values and environment variable values are encrypted at rest
//! with the [`ColumnCipher`]. Option maps and query options are stored as
//! JSON text.

use super::{AppStore, CredentialStore, DataQueryStore, DataSourceStore, EnvVariableStore};
use crate::credentials::{ColumnCipher, CREDENTIALS_TABLE, ORG_ENV_VARIABLES_TABLE};
use crate::error::{QueryError, Result};
use crate::model::{App, DataQuery, DataSource, OrgEnvironmentVariable, SourceOptions, VariableType};
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

/// Context under which credential values are encrypted.
const CREDENTIAL_VALUE_CONTEXT: &str = "value";

/// Query service store backed by SQLite.
///
/// # Schema
/// ```sql
/// credentials (id, value_ciphertext, created_at, updated_at)
/// org_environment_variables (id, variable_type, organization_id, variable_name, value,
///                            UNIQUE(variable_type, organization_id, variable_name))
/// apps (id, organization_id)
/// data_sources (id, name, kind, options, updated_at)
/// data_queries (id, name, kind, options, app_id, data_source_id, app_version_id,
///               created_at, updated_at)
/// ```
pub struct SqliteStore {
    conn: Mutex<Connection>,
    cipher: Arc<ColumnCipher>,
}

impl SqliteStore {
    /// Creates or opens the store and ensures the schema exists.
    pub fn new<P: AsRef<Path>>(db_path: P, cipher: Arc<ColumnCipher>) -> anyhow::Result<Self> {
        let conn = Connection::open(db_path).context("Failed to open database")?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS credentials (
                id               TEXT PRIMARY KEY,
                value_ciphertext TEXT NOT NULL,
                created_at       TEXT NOT NULL,
                updated_at       TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS org_environment_variables (
                id              TEXT PRIMARY KEY,
                variable_type   TEXT NOT NULL,
                organization_id TEXT NOT NULL,
                variable_name   TEXT NOT NULL,
                value           TEXT NOT NULL,
                UNIQUE(variable_type, organization_id, variable_name)
            );
            CREATE TABLE IF NOT EXISTS apps (
                id              TEXT PRIMARY KEY,
                organization_id TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS data_sources (
                id         TEXT PRIMARY KEY,
                name       TEXT NOT NULL,
                kind       TEXT NOT NULL,
                options    TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS data_queries (
                id             TEXT PRIMARY KEY,
                name           TEXT NOT NULL,
                kind           TEXT NOT NULL,
                options        TEXT NOT NULL,
                app_id         TEXT NOT NULL,
                data_source_id TEXT,
                app_version_id TEXT,
                created_at     TEXT NOT NULL,
                updated_at     TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_data_queries_app ON data_queries(app_id, app_version_id);
            "#,
        )
        .context("Failed to create schema")?;

        Ok(Self {
            conn: Mutex::new(conn),
            cipher,
        })
    }

    fn conn(&self) -> anyhow::Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("SQLite connection mutex poisoned"))
    }

    /// Registers an app and its owning organization.
    pub fn insert_app(&self, app: &App) -> Result<()> {
        self.conn()?
            .execute(
                "INSERT INTO apps (id, organization_id) VALUES (?1, ?2)",
                params![app.id, app.organization_id],
            )
            .context("Failed to insert app")?;
        Ok(())
    }

    /// Inserts or replaces a data source row as given.
    pub fn insert_data_source(&self, data_source: &DataSource) -> Result<()> {
        let options =
            serde_json::to_string(&data_source.options).context("Failed to encode options")?;
        self.conn()?
            .execute(
                r#"
                INSERT INTO data_sources (id, name, kind, options, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    kind = excluded.kind,
                    options = excluded.options,
                    updated_at = excluded.updated_at
                "#,
                params![
                    data_source.id,
                    data_source.name,
                    data_source.kind,
                    options,
                    timestamp(&data_source.updated_at),
                ],
            )
            .context("Failed to insert data source")?;
        Ok(())
    }

    /// Sets (upserts) an organization variable, encrypting the plaintext value.
    pub fn set_env_variable(
        &self,
        variable_type: VariableType,
        organization_id: &str,
        variable_name: &str,
        plaintext: &str,
    ) -> Result<OrgEnvironmentVariable> {
        let value =
            self.cipher
                .encrypt_column_value(ORG_ENV_VARIABLES_TABLE, organization_id, plaintext)?;
        let id = Uuid::new_v4().to_string();

        self.conn()?
            .execute(
                r#"
                INSERT INTO org_environment_variables
                    (id, variable_type, organization_id, variable_name, value)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT(variable_type, organization_id, variable_name) DO UPDATE SET
                    value = excluded.value
                "#,
                params![id, variable_type.as_str(), organization_id, variable_name, value],
            )
            .context("Failed to store environment variable")?;

        self.find_env_variable(variable_type, organization_id, variable_name)?
            .ok_or_else(|| QueryError::not_found(format!("Environment variable {}", variable_name)))
    }

    fn find_env_variable(
        &self,
        variable_type: VariableType,
        organization_id: &str,
        variable_name: &str,
    ) -> Result<Option<OrgEnvironmentVariable>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                r#"
                SELECT id, variable_type, organization_id, variable_name, value
                FROM org_environment_variables
                WHERE variable_type = ?1 AND organization_id = ?2 AND variable_name = ?3
                "#,
                params![variable_type.as_str(), organization_id, variable_name],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()
            .context("Failed to query environment variable")?;

        let Some((id, variable_type, organization_id, variable_name, value)) = row else {
            return Ok(None);
        };

        let variable_type = VariableType::parse(&variable_type)
            .ok_or_else(|| anyhow!("Unknown variable type '{}'", variable_type))?;

        Ok(Some(OrgEnvironmentVariable {
            id,
            variable_type,
            organization_id,
            variable_name,
            value,
        }))
    }

    fn find_data_source(&self, id: &str) -> Result<Option<DataSource>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT id, name, kind, options, updated_at FROM data_sources WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()
            .context("Failed to query data source")?;

        let Some((id, name, kind, options, updated_at)) = row else {
            return Ok(None);
        };

        let options: SourceOptions = serde_json::from_str(&options)
            .with_context(|| format!("Corrupt options for data source {}", id))?;

        Ok(Some(DataSource {
            id,
            name,
            kind,
            options,
            updated_at: parse_timestamp(&updated_at)?,
        }))
    }
}

/// Raw `data_queries` row before JSON and timestamp decoding.
struct QueryRow {
    id: String,
    name: String,
    kind: String,
    options: String,
    app_id: String,
    data_source_id: Option<String>,
    app_version_id: Option<String>,
    created_at: String,
    updated_at: String,
}

impl QueryRow {
    const COLUMNS: &'static str =
        "id, name, kind, options, app_id, data_source_id, app_version_id, created_at, updated_at";

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            kind: row.get(2)?,
            options: row.get(3)?,
            app_id: row.get(4)?,
            data_source_id: row.get(5)?,
            app_version_id: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
        })
    }

    fn into_query(self) -> Result<DataQuery> {
        let options = serde_json::from_str(&self.options)
            .with_context(|| format!("Corrupt options for data query {}", self.id))?;
        Ok(DataQuery {
            options,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
            id: self.id,
            name: self.name,
            kind: self.kind,
            app_id: self.app_id,
            data_source_id: self.data_source_id,
            app_version_id: self.app_version_id,
        })
    }
}

/// Fixed-width RFC 3339 so that text ordering matches time ordering.
fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    let parsed = DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("Invalid timestamp '{}'", s))?;
    Ok(parsed.with_timezone(&Utc))
}

#[async_trait]
impl CredentialStore for SqliteStore {
    async fn get_value(&self, credential_id: &str) -> Result<String> {
        let ciphertext: Option<String> = self
            .conn()?
            .query_row(
                "SELECT value_ciphertext FROM credentials WHERE id = ?1",
                params![credential_id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query credential")?;

        let ciphertext = ciphertext
            .ok_or_else(|| QueryError::not_found(format!("Credential {}", credential_id)))?;

        self.cipher
            .decrypt_column_value(CREDENTIALS_TABLE, CREDENTIAL_VALUE_CONTEXT, &ciphertext)
    }

    async fn create(&self, value: &str) -> Result<String> {
        let ciphertext =
            self.cipher
                .encrypt_column_value(CREDENTIALS_TABLE, CREDENTIAL_VALUE_CONTEXT, value)?;
        let id = Uuid::new_v4().to_string();
        let now = timestamp(&Utc::now());

        self.conn()?
            .execute(
                "INSERT INTO credentials (id, value_ciphertext, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![id, ciphertext, now, now],
            )
            .context("Failed to create credential")?;

        Ok(id)
    }

    async fn update(&self, credential_id: &str, value: &str) -> Result<()> {
        let ciphertext =
            self.cipher
                .encrypt_column_value(CREDENTIALS_TABLE, CREDENTIAL_VALUE_CONTEXT, value)?;

        let rows_affected = self
            .conn()?
            .execute(
                "UPDATE credentials SET value_ciphertext = ?1, updated_at = ?2 WHERE id = ?3",
                params![ciphertext, timestamp(&Utc::now()), credential_id],
            )
            .context("Failed to update credential")?;

        if rows_affected == 0 {
            return Err(QueryError::not_found(format!("Credential {}", credential_id)));
        }
        Ok(())
    }
}

#[async_trait]
impl EnvVariableStore for SqliteStore {
    async fn find_one(
        &self,
        variable_type: VariableType,
        organization_id: &str,
        variable_name: &str,
    ) -> Result<Option<OrgEnvironmentVariable>> {
        self.find_env_variable(variable_type, organization_id, variable_name)
    }
}

#[async_trait]
impl DataSourceStore for SqliteStore {
    async fn find(&self, id: &str) -> Result<Option<DataSource>> {
        self.find_data_source(id)
    }

    async fn save_options(&self, id: &str, options: &SourceOptions) -> Result<DataSource> {
        let encoded = serde_json::to_string(options).context("Failed to encode options")?;

        let rows_affected = self
            .conn()?
            .execute(
                "UPDATE data_sources SET options = ?1, updated_at = ?2 WHERE id = ?3",
                params![encoded, timestamp(&Utc::now()), id],
            )
            .context("Failed to update data source options")?;

        if rows_affected == 0 {
            return Err(QueryError::not_found(format!("Data source {}", id)));
        }

        self.find_data_source(id)?
            .ok_or_else(|| QueryError::not_found(format!("Data source {}", id)))
    }
}

#[async_trait]
impl AppStore for SqliteStore {
    async fn find_one_or_fail(&self, id: &str) -> Result<App> {
        let organization_id: Option<String> = self
            .conn()?
            .query_row(
                "SELECT organization_id FROM apps WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query app")?;

        organization_id
            .map(|organization_id| App {
                id: id.to_string(),
                organization_id,
            })
            .ok_or_else(|| QueryError::not_found(format!("App {}", id)))
    }
}

#[async_trait]
impl DataQueryStore for SqliteStore {
    async fn find(&self, id: &str) -> Result<Option<DataQuery>> {
        let row = self
            .conn()?
            .query_row(
                &format!("SELECT {} FROM data_queries WHERE id = ?1", QueryRow::COLUMNS),
                params![id],
                QueryRow::from_row,
            )
            .optional()
            .context("Failed to query data query")?;

        row.map(QueryRow::into_query).transpose()
    }

    async fn save(&self, query: &DataQuery) -> Result<()> {
        let options = serde_json::to_string(&query.options).context("Failed to encode options")?;

        self.conn()?
            .execute(
                r#"
                INSERT INTO data_queries (
                    id, name, kind, options, app_id, data_source_id, app_version_id,
                    created_at, updated_at
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    kind = excluded.kind,
                    options = excluded.options,
                    data_source_id = excluded.data_source_id,
                    app_version_id = excluded.app_version_id,
                    updated_at = excluded.updated_at
                "#,
                params![
                    query.id,
                    query.name,
                    query.kind,
                    options,
                    query.app_id,
                    query.data_source_id,
                    query.app_version_id,
                    timestamp(&query.created_at),
                    timestamp(&query.updated_at),
                ],
            )
            .context("Failed to save data query")?;

        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let rows_affected = self
            .conn()?
            .execute("DELETE FROM data_queries WHERE id = ?1", params![id])
            .context("Failed to delete data query")?;
        Ok(rows_affected > 0)
    }

    async fn list(&self, app_id: &str, app_version_id: Option<&str>) -> Result<Vec<DataQuery>> {
        let rows = {
            let conn = self.conn()?;
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM data_queries
                     WHERE app_id = ?1 AND (?2 IS NULL OR app_version_id = ?2)
                     ORDER BY created_at DESC",
                    QueryRow::COLUMNS
                ))
                .context("Failed to prepare query")?;

            let rows = stmt
                .query_map(params![app_id, app_version_id], QueryRow::from_row)
                .context("Failed to execute query")?
                .collect::<rusqlite::Result<Vec<QueryRow>>>()
                .context("Failed to read results")?;
            rows
        };

        rows.into_iter().map(QueryRow::into_query).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SourceOption;
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use chrono::Duration;
    use serde_json::json;

    fn create_test_store() -> SqliteStore {
        let cipher = ColumnCipher::new(&BASE64.encode([0u8; 32])).unwrap();
        SqliteStore::new(":memory:", Arc::new(cipher)).expect("Failed to create test store")
    }

    fn make_query(id: &str, app_version_id: Option<&str>, created_at: DateTime<Utc>) -> DataQuery {
        DataQuery {
            id: id.to_string(),
            name: format!("query_{}", id),
            kind: "restapi".to_string(),
            options: json!({"url": "{{components.input.value}}"}),
            app_id: "app-1".to_string(),
            data_source_id: None,
            app_version_id: app_version_id.map(str::to_string),
            created_at,
            updated_at: created_at,
        }
    }

    #[tokio::test]
    async fn test_credential_create_get_update() {
        let store = create_test_store();

        let id = store.create("s3cr3t").await.unwrap();
        assert_eq!(store.get_value(&id).await.unwrap(), "s3cr3t");

        store.update(&id, "rotated").await.unwrap();
        assert_eq!(store.get_value(&id).await.unwrap(), "rotated");
    }

    #[tokio::test]
    async fn test_credential_is_encrypted_at_rest() {
        let store = create_test_store();
        let id = store.create("s3cr3t").await.unwrap();

        let raw: String = store
            .conn()
            .unwrap()
            .query_row(
                "SELECT value_ciphertext FROM credentials WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .unwrap();
        assert!(!raw.contains("s3cr3t"));
    }

    #[tokio::test]
    async fn test_unknown_credential_is_not_found() {
        let store = create_test_store();
        assert!(store.get_value("missing").await.unwrap_err().is_not_found());
        assert!(store.update("missing", "x").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_env_variable_upsert_and_lookup() {
        let store = create_test_store();
        store
            .set_env_variable(VariableType::Server, "org-1", "DB_HOST", "10.0.0.1")
            .unwrap();
        store
            .set_env_variable(VariableType::Server, "org-1", "DB_HOST", "10.0.0.2")
            .unwrap();

        let found = store
            .find_one(VariableType::Server, "org-1", "DB_HOST")
            .await
            .unwrap()
            .expect("variable not found");
        assert_eq!(found.variable_name, "DB_HOST");
        assert_ne!(found.value, "10.0.0.2");

        // Scoped by organization and type
        assert!(store
            .find_one(VariableType::Server, "org-2", "DB_HOST")
            .await
            .unwrap()
            .is_none());
        assert!(store
            .find_one(VariableType::Client, "org-1", "DB_HOST")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_app_lookup() {
        let store = create_test_store();
        store
            .insert_app(&App {
                id: "app-1".to_string(),
                organization_id: "org-1".to_string(),
            })
            .unwrap();

        assert_eq!(
            store.find_one_or_fail("app-1").await.unwrap().organization_id,
            "org-1"
        );
        assert!(store.find_one_or_fail("app-2").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_data_source_save_options_bumps_updated_at() {
        let store = create_test_store();
        let before = Utc::now() - Duration::hours(1);
        let mut options = SourceOptions::new();
        options.insert("url".to_string(), SourceOption::plain(json!("https://api.example.com")));

        store
            .insert_data_source(&DataSource {
                id: "ds-1".to_string(),
                name: "api".to_string(),
                kind: "restapi".to_string(),
                options: options.clone(),
                updated_at: before,
            })
            .unwrap();

        options.insert("tokenData".to_string(), SourceOption::plain(json!({"access_token": "t"})));
        let saved = store.save_options("ds-1", &options).await.unwrap();

        assert_eq!(saved.options, options);
        assert!(saved.updated_at > before);
        assert!(store
            .save_options("ds-missing", &options)
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_query_list_filters_and_orders_newest_first() {
        let store = create_test_store();
        let now = Utc::now();

        store.save(&make_query("q1", Some("v1"), now - Duration::minutes(3))).await.unwrap();
        store.save(&make_query("q2", Some("v1"), now - Duration::minutes(1))).await.unwrap();
        store.save(&make_query("q3", Some("v2"), now - Duration::minutes(2))).await.unwrap();

        let all: Vec<String> = store
            .list("app-1", None)
            .await
            .unwrap()
            .into_iter()
            .map(|q| q.id)
            .collect();
        assert_eq!(all, vec!["q2", "q3", "q1"]);

        let v1: Vec<String> = store
            .list("app-1", Some("v1"))
            .await
            .unwrap()
            .into_iter()
            .map(|q| q.id)
            .collect();
        assert_eq!(v1, vec!["q2", "q1"]);

        assert!(store.list("app-2", None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_query_save_find_delete() {
        let store = create_test_store();
        let query = make_query("q1", None, Utc::now());

        store.save(&query).await.unwrap();
        let found = DataQueryStore::find(&store, "q1").await.unwrap().unwrap();
        assert_eq!(found.options, query.options);
        assert_eq!(found.app_version_id, None);

        assert!(DataQueryStore::delete(&store, "q1").await.unwrap());
        assert!(!DataQueryStore::delete(&store, "q1").await.unwrap());
        assert!(DataQueryStore::find(&store, "q1").await.unwrap().is_none());
    }
}
