//! Query runs through the registry, including the OAuth refresh-and-retry path.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Utc};
use connector_manager::{Connector, ConnectorError, ConnectorRegistry, QueryRunner, RunError};
use dataquery::credentials::ColumnCipher;
use dataquery::model::{
    App, DataQuery, DataSource, QueryOptions, SourceOption, SourceOptions, TokenBundle, User, VariableType,
};
use dataquery::store::{DataSourceStore, SqliteStore};
use dataquery::{DataSourceService, QueryError, TemplateEngine, VariableResolver};
use mockito::{Matcher, Server};
use serde_json::{json, Map, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Shared behaviour of every connector instance the registry hands out.
#[derive(Default)]
struct Script {
    runs: AtomicUsize,
    refreshes: AtomicUsize,
    failures: Mutex<VecDeque<ConnectorError>>,
    refresh_failure: Mutex<Option<ConnectorError>>,
    seen_tokens: Mutex<Vec<Value>>,
}

impl Script {
    fn failing_with(errors: Vec<ConnectorError>) -> Arc<Self> {
        Arc::new(Self {
            failures: Mutex::new(errors.into()),
            ..Default::default()
        })
    }
}

struct ScriptedConnector {
    script: Arc<Script>,
}

#[async_trait]
impl Connector for ScriptedConnector {
    fn kind(&self) -> &str {
        "scripted"
    }

    async fn run(
        &self,
        source_options: &Map<String, Value>,
        query_options: &Value,
        _data_source_id: Option<&str>,
        _data_source_updated_at: Option<DateTime<Utc>>,
    ) -> Result<Value, ConnectorError> {
        self.script.runs.fetch_add(1, Ordering::SeqCst);
        self.script
            .seen_tokens
            .lock()
            .unwrap()
            .push(source_options.get("tokenData").cloned().unwrap_or(Value::Null));

        if let Some(error) = self.script.failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        Ok(json!({"status": "ok", "data": query_options}))
    }

    async fn refresh_token(
        &self,
        _source_options: &Map<String, Value>,
        _data_source_id: Option<&str>,
    ) -> Result<TokenBundle, ConnectorError> {
        self.script.refreshes.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.script.refresh_failure.lock().unwrap().take() {
            return Err(error);
        }
        Ok(TokenBundle {
            access_token: Some("fresh".to_string()),
            refresh_token: Some("refresh-1".to_string()),
            extra: Map::new(),
        })
    }
}

/// Data source store wrapper counting option writes.
struct CountingSources {
    inner: Arc<SqliteStore>,
    saves: AtomicUsize,
}

#[async_trait]
impl DataSourceStore for CountingSources {
    async fn find(&self, id: &str) -> dataquery::Result<Option<DataSource>> {
        DataSourceStore::find(self.inner.as_ref(), id).await
    }

    async fn save_options(&self, id: &str, options: &SourceOptions) -> dataquery::Result<DataSource> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        self.inner.save_options(id, options).await
    }
}

struct Harness {
    store: Arc<SqliteStore>,
    sources: Arc<CountingSources>,
    runner: QueryRunner,
}

fn harness(registry: ConnectorRegistry) -> Harness {
    let cipher = Arc::new(ColumnCipher::new(&BASE64.encode([9u8; 32])).unwrap());
    let store = Arc::new(SqliteStore::new(":memory:", cipher.clone()).unwrap());
    let sources = Arc::new(CountingSources {
        inner: store.clone(),
        saves: AtomicUsize::new(0),
    });

    store
        .insert_app(&App {
            id: "app-1".to_string(),
            organization_id: "org-1".to_string(),
        })
        .unwrap();

    let runner = QueryRunner::new(
        registry,
        DataSourceService::new(sources.clone(), store.clone()),
        store.clone(),
        TemplateEngine::new(VariableResolver::new(store.clone(), cipher)),
    );

    Harness { store, sources, runner }
}

fn scripted_registry(script: &Arc<Script>) -> ConnectorRegistry {
    let mut registry = ConnectorRegistry::with_builtins();
    let script = script.clone();
    registry.register("scripted", move || {
        Box::new(ScriptedConnector {
            script: script.clone(),
        })
    });
    registry
}

fn insert_source(store: &SqliteStore, kind: &str, options: Value) -> DataSource {
    let options: SourceOptions = match options {
        Value::Object(map) => map
            .into_iter()
            .map(|(key, value)| (key, SourceOption::plain(value)))
            .collect(),
        _ => panic!("expected object"),
    };
    let data_source = DataSource {
        id: "ds-1".to_string(),
        name: "source".to_string(),
        kind: kind.to_string(),
        options,
        updated_at: Utc::now(),
    };
    store.insert_data_source(&data_source).unwrap();
    data_source
}

fn query(kind: &str, data_source_id: Option<&str>, options: Value) -> DataQuery {
    let now = Utc::now();
    DataQuery {
        id: "q-1".to_string(),
        name: "query".to_string(),
        kind: kind.to_string(),
        options,
        app_id: "app-1".to_string(),
        data_source_id: data_source_id.map(str::to_string),
        app_version_id: None,
        created_at: now,
        updated_at: now,
    }
}

fn bindings(value: Value) -> QueryOptions {
    match value {
        Value::Object(map) => map,
        _ => panic!("expected object"),
    }
}

#[tokio::test]
async fn test_refresh_then_retry_once() {
    let script = Script::failing_with(vec![ConnectorError::OAuthUnauthorizedClient(
        "token expired".into(),
    )]);
    let h = harness(scripted_registry(&script));
    insert_source(
        &h.store,
        "scripted",
        json!({"tokenData": {"access_token": "stale", "refresh_token": "refresh-1"}}),
    );

    let result = h
        .runner
        .run_query(
            None,
            &query("scripted", Some("ds-1"), json!({"q": "{{input}}"})),
            &bindings(json!({"{{input}}": 42})),
        )
        .await
        .unwrap();

    assert_eq!(result, json!({"status": "ok", "data": {"q": 42}}));
    assert_eq!(script.runs.load(Ordering::SeqCst), 2);
    assert_eq!(script.refreshes.load(Ordering::SeqCst), 1);
    assert_eq!(h.sources.saves.load(Ordering::SeqCst), 1);

    // The retry sees the persisted token, not the stale one
    let seen = script.seen_tokens.lock().unwrap().clone();
    assert_eq!(seen[0]["access_token"], json!("stale"));
    assert_eq!(seen[1]["access_token"], json!("fresh"));

    let stored = DataSourceStore::find(h.store.as_ref(), "ds-1").await.unwrap().unwrap();
    assert_eq!(
        stored.options["tokenData"].value,
        Some(json!({"access_token": "fresh", "refresh_token": "refresh-1"}))
    );
}

#[tokio::test]
async fn test_retry_failure_is_final() {
    let script = Script::failing_with(vec![
        ConnectorError::OAuthUnauthorizedClient("token expired".into()),
        ConnectorError::OAuthUnauthorizedClient("still expired".into()),
    ]);
    let h = harness(scripted_registry(&script));
    insert_source(&h.store, "scripted", json!({"tokenData": {"access_token": "stale"}}));

    let err = h
        .runner
        .run_query(None, &query("scripted", Some("ds-1"), json!({})), &QueryOptions::new())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        RunError::Connector(ConnectorError::OAuthUnauthorizedClient(ref msg)) if msg == "still expired"
    ));
    assert_eq!(script.runs.load(Ordering::SeqCst), 2);
    assert_eq!(script.refreshes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_other_errors_propagate_without_refresh() {
    let script = Script::failing_with(vec![ConnectorError::query("syntax error", Some(400), None)]);
    let h = harness(scripted_registry(&script));
    insert_source(&h.store, "scripted", json!({"tokenData": {"access_token": "t"}}));

    let err = h
        .runner
        .run_query(None, &query("scripted", Some("ds-1"), json!({})), &QueryOptions::new())
        .await
        .unwrap_err();

    assert_eq!(err.to_string(), "Query could not be completed: syntax error");
    assert_eq!(script.runs.load(Ordering::SeqCst), 1);
    assert_eq!(script.refreshes.load(Ordering::SeqCst), 0);
    assert_eq!(h.sources.saves.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_401_without_token_data_does_not_refresh() {
    let script = Script::failing_with(vec![ConnectorError::query("Unauthorized", Some(401), None)]);
    let h = harness(scripted_registry(&script));
    insert_source(&h.store, "scripted", json!({"api_key": "k"}));

    let err = h
        .runner
        .run_query(None, &query("scripted", Some("ds-1"), json!({})), &QueryOptions::new())
        .await
        .unwrap_err();

    assert!(matches!(err, RunError::Connector(ref e) if e.status_code() == Some(401)));
    assert_eq!(script.refreshes.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_401_with_token_data_refreshes() {
    let script = Script::failing_with(vec![ConnectorError::query("Unauthorized", Some(401), None)]);
    let h = harness(scripted_registry(&script));
    insert_source(&h.store, "scripted", json!({"tokenData": {"access_token": "stale"}}));

    h.runner
        .run_query(None, &query("scripted", Some("ds-1"), json!({})), &QueryOptions::new())
        .await
        .unwrap();

    assert_eq!(script.runs.load(Ordering::SeqCst), 2);
    assert_eq!(script.refreshes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_refresh_failure_propagates() {
    let script = Script::failing_with(vec![ConnectorError::OAuthUnauthorizedClient("expired".into())]);
    *script.refresh_failure.lock().unwrap() = Some(ConnectorError::query("invalid_grant", Some(400), None));
    let h = harness(scripted_registry(&script));
    insert_source(&h.store, "scripted", json!({"tokenData": {"access_token": "stale"}}));

    let err = h
        .runner
        .run_query(None, &query("scripted", Some("ds-1"), json!({})), &QueryOptions::new())
        .await
        .unwrap_err();

    assert!(matches!(err, RunError::Connector(ref e) if e.status_code() == Some(400)));
    assert_eq!(script.runs.load(Ordering::SeqCst), 1);
    assert_eq!(h.sources.saves.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_adhoc_query_has_no_source_options() {
    let script = Arc::new(Script::default());
    let h = harness(scripted_registry(&script));

    let result = h
        .runner
        .run_query(None, &query("scripted", None, json!({"x": 1})), &QueryOptions::new())
        .await
        .unwrap();

    assert_eq!(result["data"], json!({"x": 1}));
    assert_eq!(script.seen_tokens.lock().unwrap()[0], Value::Null);
}

#[tokio::test]
async fn test_unknown_kind() {
    let h = harness(ConnectorRegistry::with_builtins());

    let err = h
        .runner
        .run_query(None, &query("mongodb", None, json!({})), &QueryOptions::new())
        .await
        .unwrap_err();

    assert!(matches!(err, RunError::UnsupportedKind(ref kind) if kind == "mongodb"));
}

#[tokio::test]
async fn test_missing_app_without_user() {
    let script = Arc::new(Script::default());
    let h = harness(scripted_registry(&script));
    let mut orphan = query("scripted", None, json!({}));
    orphan.app_id = "missing-app".to_string();

    let err = h
        .runner
        .run_query(None, &orphan, &QueryOptions::new())
        .await
        .unwrap_err();

    assert!(matches!(err, RunError::Query(ref e) if e.is_not_found()));
    assert_eq!(script.runs.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_user_organization_resolves_server_variables() {
    let script = Arc::new(Script::default());
    let h = harness(scripted_registry(&script));
    h.store
        .set_env_variable(VariableType::Server, "org-2", "DB_HOST", "db.internal")
        .unwrap();

    let user = User {
        id: "user-1".to_string(),
        organization_id: "org-2".to_string(),
    };
    let result = h
        .runner
        .run_query(
            Some(&user),
            &query("scripted", None, json!({"host": "%%server.DB_HOST%%"})),
            &QueryOptions::new(),
        )
        .await
        .unwrap();

    assert_eq!(result["data"], json!({"host": "db.internal"}));
}

#[tokio::test]
async fn test_missing_data_source() {
    let h = harness(ConnectorRegistry::with_builtins());

    let err = h
        .runner
        .run_query(None, &query("restapi", Some("nope"), json!({})), &QueryOptions::new())
        .await
        .unwrap_err();

    assert!(matches!(err, RunError::Query(QueryError::NotFound(_))));
}

#[tokio::test]
async fn test_restapi_refresh_flow() {
    let mut server = Server::new_async().await;
    let stale = server
        .mock("GET", "/profile")
        .match_header("authorization", "Bearer stale")
        .with_status(401)
        .with_body(r#"{"error": "expired"}"#)
        .expect(1)
        .create_async()
        .await;
    let token = server
        .mock("POST", "/token")
        .match_body(Matcher::UrlEncoded("refresh_token".into(), "refresh-1".into()))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"access_token": "fresh"}"#)
        .expect(1)
        .create_async()
        .await;
    let fresh = server
        .mock("GET", "/profile")
        .match_header("authorization", "Bearer fresh")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"name": "Ada"}"#)
        .expect(1)
        .create_async()
        .await;

    let h = harness(ConnectorRegistry::with_builtins());
    insert_source(
        &h.store,
        "restapi",
        json!({
            "url": server.url(),
            "auth_type": "oauth2",
            "access_token_url": format!("{}/token", server.url()),
            "tokenData": {"access_token": "stale", "refresh_token": "refresh-1"}
        }),
    );

    let result = h
        .runner
        .run_query(
            None,
            &query("restapi", Some("ds-1"), json!({"method": "get", "url": "/profile"})),
            &QueryOptions::new(),
        )
        .await
        .unwrap();

    stale.assert_async().await;
    token.assert_async().await;
    fresh.assert_async().await;
    assert_eq!(result, json!({"status": "ok", "data": {"name": "Ada"}}));

    let stored = DataSourceStore::find(h.store.as_ref(), "ds-1").await.unwrap().unwrap();
    assert_eq!(
        stored.options["tokenData"].value,
        Some(json!({"access_token": "fresh", "refresh_token": "refresh-1"}))
    );
}
