//! Data source option handling.
//!
//! Stored options are a map of `{value}` or `{encrypted, credential_id}`
//! entries. Connectors never see that shape: [`DataSourceService::parse_source_options`]
//! flattens it into a plain value map, fetching every encrypted entry from the
//! credential store.

use crate::error::{QueryError, Result};
use crate::model::{DataSource, OptionEntry, SourceOption, SourceOptions, TokenBundle, TOKEN_DATA_KEY};
use crate::store::{CredentialStore, DataSourceStore};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info};

/// Reads and updates data source options.
#[derive(Clone)]
pub struct DataSourceService {
    data_sources: Arc<dyn DataSourceStore>,
    credentials: Arc<dyn CredentialStore>,
}

impl DataSourceService {
    pub fn new(data_sources: Arc<dyn DataSourceStore>, credentials: Arc<dyn CredentialStore>) -> Self {
        Self {
            data_sources,
            credentials,
        }
    }

    /// Loads a data source, failing with `NotFound` when it does not exist.
    pub async fn find(&self, id: &str) -> Result<DataSource> {
        self.data_sources
            .find(id)
            .await?
            .ok_or_else(|| QueryError::not_found(format!("Data source {}", id)))
    }

    /// Flattens stored options into a connector-ready value map.
    ///
    /// `None` (adhoc queries without a persisted source) yields an empty map.
    /// Credentials are fetched one key at a time; a failing lookup aborts the parse.
    pub async fn parse_source_options(&self, options: Option<&SourceOptions>) -> Result<Map<String, Value>> {
        let mut parsed = Map::new();
        let Some(options) = options else {
            return Ok(parsed);
        };

        for (key, option) in options {
            let value = if option.encrypted {
                let credential_id = option.credential_id.as_deref().ok_or_else(|| {
                    QueryError::credential(format!("Encrypted option '{}' has no credential_id", key))
                })?;
                Value::String(self.credentials.get_value(credential_id).await?)
            } else {
                option.value.clone().unwrap_or(Value::Null)
            };
            parsed.insert(key.clone(), value);
        }

        Ok(parsed)
    }

    /// Writes option entries onto a data source.
    ///
    /// Encrypted entries go through the credential store: an existing
    /// credential for the key is updated in place, otherwise a new one is
    /// created. Plain entries replace the stored value. Keys not mentioned
    /// are left untouched.
    pub async fn update_options(&self, data_source_id: &str, entries: &[OptionEntry]) -> Result<DataSource> {
        let data_source = self.find(data_source_id).await?;
        let mut options = data_source.options;

        for entry in entries {
            let option = if entry.encrypted {
                let plaintext = match &entry.value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                let existing = options
                    .get(&entry.key)
                    .filter(|o| o.encrypted)
                    .and_then(|o| o.credential_id.clone());
                let credential_id = match existing {
                    Some(id) => {
                        self.credentials.update(&id, &plaintext).await?;
                        id
                    }
                    None => self.credentials.create(&plaintext).await?,
                };
                SourceOption::credential(credential_id)
            } else {
                SourceOption::plain(entry.value.clone())
            };
            options.insert(entry.key.clone(), option);
        }

        debug!(
            data_source_id = %data_source_id,
            keys = entries.len(),
            "Updating data source options"
        );

        self.data_sources.save_options(data_source_id, &options).await
    }

    /// Persists refreshed OAuth tokens for a data source.
    ///
    /// Sources that keep `access_token` / `refresh_token` as credential
    /// references get those credentials rotated (the refresh token only when
    /// the bundle carries one). Every other source gets the bundle upserted as
    /// an unencrypted `tokenData` option.
    pub async fn update_oauth_access_token(
        &self,
        token: &TokenBundle,
        prior_options: &SourceOptions,
        data_source_id: &str,
    ) -> Result<()> {
        let access_credential = credential_reference(prior_options, "access_token");

        if let (Some(credential_id), Some(access_token)) = (access_credential, &token.access_token) {
            self.credentials.update(credential_id, access_token).await?;

            if let (Some(refresh_id), Some(refresh_token)) = (
                credential_reference(prior_options, "refresh_token"),
                &token.refresh_token,
            ) {
                self.credentials.update(refresh_id, refresh_token).await?;
            }

            info!(
                data_source_id = %data_source_id,
                has_refresh_token = token.refresh_token.is_some(),
                "Rotated OAuth credentials"
            );
            return Ok(());
        }

        let token_value = serde_json::to_value(token)
            .map_err(|e| QueryError::bad_request(format!("Invalid token data: {}", e)))?;
        self.update_options(
            data_source_id,
            &[OptionEntry {
                key: TOKEN_DATA_KEY.to_string(),
                value: token_value,
                encrypted: false,
            }],
        )
        .await?;

        info!(
            data_source_id = %data_source_id,
            has_refresh_token = token.refresh_token.is_some(),
            "Stored OAuth token data"
        );
        Ok(())
    }
}

fn credential_reference<'a>(options: &'a SourceOptions, key: &str) -> Option<&'a str> {
    options
        .get(key)
        .filter(|o| o.encrypted)
        .and_then(|o| o.credential_id.as_deref())
}
