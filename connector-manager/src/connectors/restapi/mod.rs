use crate::{Connector, ConnectorError};
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dataquery::model::{TokenBundle, TOKEN_DATA_KEY};
use reqwest::{Client, Method};
use serde_json::{json, Map, Value};
use tracing::{debug, info};

/// Generic HTTP connector.
///
/// Source options: `url` (base), `headers` and `url_params` as `[key, value]`
/// lists, `auth_type`, `tokenData` after an OAuth authorization, and
/// `access_token_url`/`client_id`/`client_secret` for token refresh.
///
/// Query options: `method`, `url` (appended to the base), `url_params`,
/// `headers` and a JSON `body`.
pub struct RestApiConnector {
    http_client: Client,
}

impl RestApiConnector {
    pub const KIND: &'static str = "restapi";

    pub fn new() -> Self {
        Self {
            http_client: Client::new(),
        }
    }
}

impl Default for RestApiConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for RestApiConnector {
    fn kind(&self) -> &str {
        Self::KIND
    }

    async fn run(
        &self,
        source_options: &Map<String, Value>,
        query_options: &Value,
        data_source_id: Option<&str>,
        _data_source_updated_at: Option<DateTime<Utc>>,
    ) -> Result<Value, ConnectorError> {
        let url = request_url(source_options, query_options)?;
        let method = request_method(query_options)?;

        let mut params = pairs(source_options.get("url_params"));
        params.extend(pairs(query_options.get("url_params")));

        let mut request = self.http_client.request(method.clone(), &url).query(&params);

        for (name, value) in pairs(source_options.get("headers"))
            .into_iter()
            .chain(pairs(query_options.get("headers")))
        {
            request = request.header(name, value);
        }

        match access_token(source_options) {
            Some(token) => request = request.bearer_auth(token),
            None if is_oauth2(source_options) => {
                return Err(ConnectorError::OAuthUnauthorizedClient(
                    "Data source has no access token".to_string(),
                ))
            }
            None => {}
        }

        if let Some(body) = query_options.get("body").filter(|body| !body.is_null()) {
            request = request.json(body);
        }

        debug!(
            data_source_id = data_source_id.unwrap_or("adhoc"),
            method = %method,
            url = %url,
            "Sending REST API request"
        );

        let response = request
            .send()
            .await
            .with_context(|| format!("Failed to send {} {}", method, url))?;

        let status = response.status();
        let data = read_body(response).await?;

        if !status.is_success() {
            return Err(ConnectorError::query(
                format!("Server responded with status {}", status.as_u16()),
                Some(status.as_u16()),
                Some(data),
            ));
        }

        Ok(json!({ "status": "ok", "data": data }))
    }

    /// POSTs `grant_type=refresh_token` to `access_token_url`.
    ///
    /// The stored refresh token is kept when the provider does not rotate it.
    async fn refresh_token(
        &self,
        source_options: &Map<String, Value>,
        data_source_id: Option<&str>,
    ) -> Result<TokenBundle, ConnectorError> {
        let token_url = string_option(source_options, "access_token_url")
            .ok_or_else(|| anyhow!("access_token_url is not configured"))?;

        let current_refresh_token = source_options
            .get(TOKEN_DATA_KEY)
            .and_then(|token| token.get("refresh_token"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                ConnectorError::OAuthUnauthorizedClient("Data source has no refresh token".to_string())
            })?;

        let mut form = vec![
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", current_refresh_token.clone()),
        ];
        for key in ["client_id", "client_secret"] {
            if let Some(value) = string_option(source_options, key) {
                form.push((key, value.to_string()));
            }
        }

        info!(
            data_source_id = data_source_id.unwrap_or("adhoc"),
            "Refreshing OAuth token"
        );

        let response = self
            .http_client
            .post(token_url)
            .header("Accept", "application/json")
            .form(&form)
            .send()
            .await
            .context("Failed to send token refresh request")?;

        let status = response.status();
        let data = read_body(response).await?;

        if !status.is_success() {
            return Err(ConnectorError::query(
                format!("Token refresh failed with status {}", status.as_u16()),
                Some(status.as_u16()),
                Some(data),
            ));
        }

        let mut token: TokenBundle =
            serde_json::from_value(data).context("Failed to parse token refresh response")?;

        if token.access_token.is_none() {
            return Err(anyhow!("Token refresh response has no access_token").into());
        }

        // Keep the existing refresh token if the provider did not rotate it
        if token.refresh_token.is_none() {
            token.refresh_token = Some(current_refresh_token);
        }

        Ok(token)
    }
}

fn request_url(source_options: &Map<String, Value>, query_options: &Value) -> Result<String, ConnectorError> {
    let base = string_option(source_options, "url").unwrap_or_default();
    let path = query_options.get("url").and_then(Value::as_str).unwrap_or_default();

    if base.is_empty() && path.is_empty() {
        return Err(ConnectorError::query("Request URL is missing", None, None));
    }
    Ok(format!("{}{}", base, path))
}

fn request_method(query_options: &Value) -> Result<Method, ConnectorError> {
    let method = query_options
        .get("method")
        .and_then(Value::as_str)
        .unwrap_or("get")
        .to_uppercase();

    Method::from_bytes(method.as_bytes())
        .map_err(|_| ConnectorError::query(format!("Unsupported HTTP method: {}", method), None, None))
}

/// `[[key, value], ...]` lists, skipping rows with an empty key.
fn pairs(value: Option<&Value>) -> Vec<(String, String)> {
    let Some(rows) = value.and_then(Value::as_array) else {
        return Vec::new();
    };

    rows.iter()
        .filter_map(|row| {
            let key = row.get(0)?.as_str()?;
            if key.is_empty() {
                return None;
            }
            let value = match row.get(1) {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Null) | None => String::new(),
                Some(other) => other.to_string(),
            };
            Some((key.to_string(), value))
        })
        .collect()
}

fn access_token(source_options: &Map<String, Value>) -> Option<&str> {
    source_options
        .get(TOKEN_DATA_KEY)?
        .get("access_token")?
        .as_str()
        .filter(|token| !token.is_empty())
}

fn is_oauth2(source_options: &Map<String, Value>) -> bool {
    string_option(source_options, "auth_type") == Some("oauth2")
}

fn string_option<'a>(source_options: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    source_options
        .get(key)
        .and_then(Value::as_str)
        .filter(|value| !value.is_empty())
}

/// Response body as JSON when it parses, otherwise as text.
async fn read_body(response: reqwest::Response) -> Result<Value, ConnectorError> {
    let text = response.text().await.context("Failed to read response body")?;
    Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
}
