//! Template interpolation over query options.
//!
//! Query options are arbitrary JSON whose string leaves may carry two kinds
//! of tokens:
//!
//! - `{{expr}}`: bound to the caller-supplied options map
//! - `%%expr%%`: bound to the options map, or for `%%server.NAME%%` to an
//!   organization server variable
//!
//! Tokens are looked up by their literal delimited text, so a caller binds
//! `{{x}}` by inserting the key `"{{x}}"`, not `"x"`.
//!
//! Each string is matched against four shapes, first match wins:
//!
//! 1. whole-string `{{expr}}` (exactly one `{{`): replaced by the bound
//!    value itself, keeping its JSON type
//! 2. any embedded `{{expr}}`: each token replaced by the bound value as text
//! 3. whole-string `%%expr%%` (exactly two `%%`): server variable or bound value
//! 4. any embedded `%%expr%%`: each token replaced as text
//!
//! Newlines are turned into spaces before matching. A string matching none of
//! the shapes is returned as it was.

mod variables;

pub use variables::VariableResolver;

use crate::error::Result;
use crate::model::QueryOptions;
use futures::future::{BoxFuture, FutureExt};
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{Map, Value};

lazy_static! {
    static ref DOUBLE_BRACE: Regex = Regex::new(r"\{\{(.*?)\}\}").unwrap();
    static ref DOUBLE_PERCENT: Regex = Regex::new(r"%%(.*?)%%").unwrap();
}

/// Marker selecting the variable resolver inside a `%%...%%` token.
const SERVER_PREFIX: &str = "server.";

/// Text substituted for an embedded token with no binding.
const UNBOUND_TEXT: &str = "undefined";

/// Resolves template tokens in query options.
///
/// Interpolation never touches its input: every call builds a new value, so
/// the stored query options stay as the user wrote them.
#[derive(Clone)]
pub struct TemplateEngine {
    resolver: VariableResolver,
}

impl TemplateEngine {
    pub fn new(resolver: VariableResolver) -> Self {
        Self { resolver }
    }

    /// Interpolates `value` against `options` for an organization.
    ///
    /// A whole-token lookup with no binding yields an absent value: the key is
    /// dropped from its object, becomes `null` in an array, and the call returns
    /// `null` when the top-level value itself is unbound.
    pub async fn parse_query_options(
        &self,
        value: &Value,
        options: &QueryOptions,
        organization_id: &str,
    ) -> Result<Value> {
        Ok(self
            .interpolate(value, options, organization_id)
            .await?
            .unwrap_or(Value::Null))
    }

    /// Recursive walk. `None` means "absent".
    ///
    /// Keys and elements are resolved one after another; each server variable
    /// lookup completes before the next one starts.
    fn interpolate<'a>(
        &'a self,
        value: &'a Value,
        options: &'a QueryOptions,
        organization_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<Value>>> {
        async move {
            match value {
                Value::Object(map) => {
                    let mut resolved = Map::with_capacity(map.len());
                    for (key, child) in map {
                        if let Some(child) = self.interpolate(child, options, organization_id).await? {
                            resolved.insert(key.clone(), child);
                        }
                    }
                    Ok(Some(Value::Object(resolved)))
                }
                Value::Array(items) => {
                    let mut resolved = Vec::with_capacity(items.len());
                    for item in items {
                        let item = self.interpolate(item, options, organization_id).await?;
                        resolved.push(item.unwrap_or(Value::Null));
                    }
                    Ok(Some(Value::Array(resolved)))
                }
                Value::String(s) => self.interpolate_str(s, options, organization_id).await,
                scalar => Ok(Some(scalar.clone())),
            }
        }
        .boxed()
    }

    async fn interpolate_str(
        &self,
        original: &str,
        options: &QueryOptions,
        organization_id: &str,
    ) -> Result<Option<Value>> {
        let text = original.replace('\n', " ");

        if is_whole_token(&text, "{{", "}}", 1) {
            return Ok(options.get(&text).cloned());
        }

        if DOUBLE_BRACE.is_match(&text) {
            let mut rendered = text.clone();
            for token in DOUBLE_BRACE.find_iter(&text) {
                let replacement = coerce_to_text(options.get(token.as_str()));
                rendered = rendered.replacen(token.as_str(), &replacement, 1);
            }
            return Ok(Some(Value::String(rendered)));
        }

        if is_whole_token(&text, "%%", "%%", 2) {
            if text.contains(SERVER_PREFIX) {
                let secret = self.resolver.resolve(&text, organization_id).await?;
                return Ok(Some(Value::String(secret)));
            }
            return Ok(options.get(&text).cloned());
        }

        if DOUBLE_PERCENT.is_match(&text) {
            let tokens: Vec<&str> = DOUBLE_PERCENT.find_iter(&text).map(|m| m.as_str()).collect();
            let mut rendered = text.clone();
            for token in tokens {
                let replacement = if token.contains(SERVER_PREFIX) {
                    self.resolver.resolve(token, organization_id).await?
                } else {
                    coerce_to_text(options.get(token))
                };
                rendered = rendered.replacen(token, &replacement, 1);
            }
            return Ok(Some(Value::String(rendered)));
        }

        Ok(Some(Value::String(original.to_string())))
    }
}

/// True when `text` is delimited by `open`/`close` and `open` occurs exactly `count` times.
fn is_whole_token(text: &str, open: &str, close: &str, count: usize) -> bool {
    text.starts_with(open) && text.ends_with(close) && text.matches(open).count() == count
}

/// Text form of a bound value for embedded substitution.
///
/// Strings are inserted raw, other JSON values as their JSON text.
fn coerce_to_text(value: Option<&Value>) -> String {
    match value {
        None => UNBOUND_TEXT.to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}
