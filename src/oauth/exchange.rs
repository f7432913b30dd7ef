//! OAuth authorization code exchange.
//!
//! Builds the token request from a data source's parsed options. The request
//! body is JSON unless the source declares a form-urlencoded content type.

use crate::error::{QueryError, Result};
use crate::model::TokenBundle;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use serde_json::{Map, Value};
use tracing::debug;

const FORM_URLENCODED: &str = "application/x-www-form-urlencoded";
const JSON: &str = "application/json";

/// Converts a list of `[key, value]` pairs into a map, dropping empty-string values.
///
/// Later duplicates win. Entries that are not two-element arrays with a string
/// key are ignored.
pub fn sanitize_custom_params(pairs: Option<&Value>) -> Map<String, Value> {
    let mut params = Map::new();
    let Some(Value::Array(pairs)) = pairs else {
        return params;
    };

    for pair in pairs {
        if let Some([Value::String(key), value]) = pair.as_array().map(Vec::as_slice) {
            params.insert(key.clone(), value.clone());
        }
    }

    params.retain(|_, value| value.as_str() != Some(""));
    params
}

/// True when a `content-type`/`Content-Type` pair equals `application/x-www-form-urlencoded`.
pub fn is_form_urlencoded(headers: &Map<String, Value>) -> bool {
    headers
        .get("content-type")
        .or_else(|| headers.get("Content-Type"))
        .and_then(Value::as_str)
        == Some(FORM_URLENCODED)
}

/// Builds the client-error message for a failed exchange.
///
/// The upstream body is kept as a JSON object when it parses as one, otherwise
/// it is carried as text under `error_details`. `status_code` is always set.
pub fn parse_error_response(body: &str, status_code: Option<u16>) -> String {
    let mut error = match serde_json::from_str::<Value>(body) {
        Ok(Value::Object(map)) => map,
        Ok(other) => {
            let mut map = Map::new();
            map.insert("error_details".to_string(), other);
            map
        }
        Err(_) => {
            let mut map = Map::new();
            map.insert("error_details".to_string(), Value::String(body.to_string()));
            map
        }
    };
    error.insert(
        "status_code".to_string(),
        status_code.map(Value::from).unwrap_or(Value::Null),
    );
    Value::Object(error).to_string()
}

/// Token endpoint request derived from parsed source options.
#[derive(Debug)]
pub struct TokenRequest {
    pub url: String,
    pub form_encoded: bool,
    pub headers: Map<String, Value>,
    pub body: Map<String, Value>,
}

impl TokenRequest {
    /// Assembles the request for `code`.
    ///
    /// Body: `code`, `client_id`, `client_secret`, `grant_type`,
    /// `redirect_uri`, then custom auth params (which may override any of them).
    pub fn build(source_options: &Map<String, Value>, code: &str, redirect_uri: &str) -> Result<Self> {
        let url = source_options
            .get("access_token_url")
            .and_then(Value::as_str)
            .filter(|url| !url.is_empty())
            .ok_or_else(|| QueryError::bad_request("Data source has no access_token_url"))?
            .to_string();

        let custom_params = sanitize_custom_params(source_options.get("custom_auth_params"));
        let headers = sanitize_custom_params(source_options.get("access_token_custom_headers"));

        let form_encoded = is_form_urlencoded(&sanitize_custom_params(source_options.get("headers")))
            || is_form_urlencoded(&headers);

        let mut body = Map::new();
        body.insert("code".to_string(), Value::String(code.to_string()));
        for key in ["client_id", "client_secret", "grant_type"] {
            match source_options.get(key) {
                Some(Value::Null) | None => {}
                Some(value) => {
                    body.insert(key.to_string(), value.clone());
                }
            }
        }
        body.insert(
            "redirect_uri".to_string(),
            Value::String(redirect_uri.to_string()),
        );
        body.extend(custom_params);

        Ok(Self {
            url,
            form_encoded,
            headers,
            body,
        })
    }

    /// `Content-Type` first, then custom headers (which replace it when they set one).
    fn header_map(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static(if self.form_encoded { FORM_URLENCODED } else { JSON }),
        );

        for (name, value) in &self.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| QueryError::bad_request(format!("Invalid header name '{}': {}", name, e)))?;
            let value = HeaderValue::from_str(&value_text(value))
                .map_err(|e| QueryError::bad_request(format!("Invalid value for header '{}': {}", name, e)))?;
            headers.insert(name, value);
        }

        Ok(headers)
    }

    fn encoded_body(&self) -> Result<Vec<u8>> {
        if self.form_encoded {
            let pairs: Vec<(&str, String)> = self
                .body
                .iter()
                .map(|(key, value)| (key.as_str(), value_text(value)))
                .collect();
            let encoded = serde_urlencoded::to_string(pairs)
                .map_err(|e| QueryError::bad_request(format!("Failed to encode token request: {}", e)))?;
            Ok(encoded.into_bytes())
        } else {
            serde_json::to_vec(&self.body)
                .map_err(|e| QueryError::bad_request(format!("Failed to encode token request: {}", e)))
        }
    }

    /// Sends the request and extracts `access_token` / `refresh_token`.
    pub async fn send(&self, client: &reqwest::Client) -> Result<TokenBundle> {
        debug!(
            url = %self.url,
            form_encoded = self.form_encoded,
            "Exchanging authorization code for token"
        );

        let response = client
            .post(&self.url)
            .headers(self.header_map()?)
            .body(self.encoded_body()?)
            .send()
            .await
            .map_err(|e| QueryError::bad_request(parse_error_response(&e.to_string(), None)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| QueryError::bad_request(parse_error_response(&e.to_string(), Some(status.as_u16()))))?;

        if !status.is_success() {
            return Err(QueryError::bad_request(parse_error_response(
                &body,
                Some(status.as_u16()),
            )));
        }

        let result: Value = serde_json::from_str(&body)
            .map_err(|_| QueryError::bad_request(parse_error_response(&body, Some(status.as_u16()))))?;

        let token = |key: &str| result.get(key).and_then(Value::as_str).map(str::to_string);

        Ok(TokenBundle {
            access_token: token("access_token"),
            refresh_token: token("refresh_token"),
            extra: Map::new(),
        })
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
