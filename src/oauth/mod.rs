//! OAuth 2.0 authorization for data sources.
//!
//! Implements the authorization code flow for sources configured with their
//! own token endpoint:
//! 1. User authorizes on the provider's site
//! 2. Provider redirects to `<host>/oauth2/authorize` with a code
//! 3. Exchange the code at the source's `access_token_url`
//! 4. Store the tokens as the source's unencrypted `tokenData` option

mod exchange;

pub use exchange::{is_form_urlencoded, parse_error_response, sanitize_custom_params, TokenRequest};

use crate::config::ServerConfig;
use crate::datasource::DataSourceService;
use crate::error::{QueryError, Result};
use crate::model::{DataSource, OptionEntry, TokenBundle, TOKEN_DATA_KEY};
use tracing::{error, info};

/// Exchanges authorization codes and persists the resulting tokens.
#[derive(Clone)]
pub struct OAuthAuthorizer {
    data_sources: DataSourceService,
    http_client: reqwest::Client,
    redirect_uri: String,
}

impl OAuthAuthorizer {
    /// The redirect URI is fixed at construction from the platform host.
    pub fn new(data_sources: DataSourceService, server: &ServerConfig) -> Self {
        Self {
            data_sources,
            http_client: reqwest::Client::new(),
            redirect_uri: server.oauth_redirect_uri(),
        }
    }

    pub fn redirect_uri(&self) -> &str {
        &self.redirect_uri
    }

    /// Exchanges `code` for tokens using the source's OAuth configuration.
    ///
    /// Failures come back as `BadRequest` whose message is a JSON object with
    /// the upstream error and `status_code`.
    pub async fn exchange_code(&self, data_source: &DataSource, code: &str) -> Result<TokenBundle> {
        let source_options = self
            .data_sources
            .parse_source_options(Some(&data_source.options))
            .await?;

        let request = TokenRequest::build(&source_options, code, &self.redirect_uri)?;

        request.send(&self.http_client).await.map_err(|e| {
            error!(
                data_source_id = %data_source.id,
                error = %e,
                "Token exchange failed"
            );
            e
        })
    }

    /// Exchanges `code` and stores the tokens as the source's `tokenData` option.
    pub async fn authorize(&self, data_source: &DataSource, code: &str) -> Result<DataSource> {
        let token = self.exchange_code(data_source, code).await?;

        let value = serde_json::to_value(&token)
            .map_err(|e| QueryError::bad_request(format!("Invalid token data: {}", e)))?;

        let updated = self
            .data_sources
            .update_options(
                &data_source.id,
                &[OptionEntry {
                    key: TOKEN_DATA_KEY.to_string(),
                    value,
                    encrypted: false,
                }],
            )
            .await?;

        info!(
            data_source_id = %data_source.id,
            has_refresh_token = token.refresh_token.is_some(),
            "OAuth authorization completed"
        );

        Ok(updated)
    }
}
