use anyhow::{bail, Context, Result};
use connector_manager::{ConnectorRegistry, QueryRunner};
use dataquery::config::{load_config, ServiceConfig};
use dataquery::credentials::ColumnCipher;
use dataquery::model::QueryOptions;
use dataquery::store::SqliteStore;
use dataquery::{DataQueryService, DataSourceService, OAuthAuthorizer, TemplateEngine, VariableResolver};
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

const USAGE: &str = "usage:
  connector-manager run <query-id> [options-json]
  connector-manager authorize <data-source-id> <code>";

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "connector_manager=info,dataquery=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();

    // Configuration file is optional; defaults cover local runs
    let config = match std::env::var("DATAQUERY_CONFIG") {
        Ok(path) => load_config(&path)?,
        Err(_) => ServiceConfig::default(),
    };

    let master_key = config.encryption.master_key()?;
    let cipher = Arc::new(ColumnCipher::new(&master_key).context("Invalid master key")?);
    let store = Arc::new(
        SqliteStore::new(&config.database.path, Arc::clone(&cipher))
            .context("Failed to open query database")?,
    );

    info!(
        database = %config.database.path,
        host = %config.server.host,
        "Configuration loaded"
    );

    let data_sources = DataSourceService::new(store.clone(), store.clone());

    match args.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
        ["run", query_id, rest @ ..] => {
            let query_options = match rest {
                [] => QueryOptions::new(),
                [json] => serde_json::from_str(json).context("options-json must be a JSON object")?,
                _ => bail!(USAGE),
            };

            let queries = DataQueryService::new(store.clone());
            let query = queries.find_one(query_id).await?;

            let templates = TemplateEngine::new(VariableResolver::new(store.clone(), cipher));
            let runner = QueryRunner::new(
                ConnectorRegistry::with_builtins(),
                data_sources,
                store.clone(),
                templates,
            );

            let result = runner.run_query(None, &query, &query_options).await?;
            print_json(&result)?;
        }
        ["authorize", data_source_id, code] => {
            let data_source = data_sources.find(data_source_id).await?;
            let authorizer = OAuthAuthorizer::new(data_sources, &config.server);
            let updated = authorizer.authorize(&data_source, code).await?;
            info!(data_source_id = %updated.id, "Data source authorized");
            print_json(&serde_json::to_value(&updated)?)?;
        }
        _ => bail!(USAGE),
    }

    Ok(())
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
