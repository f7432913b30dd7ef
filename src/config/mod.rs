use anyhow::{Context, Result};
use serde::Deserialize;

/// Complete query service configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub encryption: EncryptionConfig,
}

/// Platform host configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Public base URL of the platform; OAuth redirect URIs are built from it
    #[serde(default = "default_host")]
    pub host: String,
}

fn default_host() -> String {
    "http://localhost:8082".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
        }
    }
}

impl ServerConfig {
    /// Redirect URI registered with OAuth providers.
    pub fn oauth_redirect_uri(&self) -> String {
        format!("{}/oauth2/authorize", self.host.trim_end_matches('/'))
    }
}

/// SQLite store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_path")]
    pub path: String,
}

fn default_database_path() -> String {
    "queries.db".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

/// Column encryption configuration
#[derive(Debug, Clone, Deserialize)]
pub struct EncryptionConfig {
    /// Environment variable holding the base64-encoded 32-byte master key
    #[serde(default = "default_master_key_env")]
    pub master_key_env: String,
}

fn default_master_key_env() -> String {
    "DATAQUERY_MASTER_KEY".to_string()
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            master_key_env: default_master_key_env(),
        }
    }
}

impl EncryptionConfig {
    /// Reads the master key from the configured environment variable.
    pub fn master_key(&self) -> Result<String> {
        std::env::var(&self.master_key_env).with_context(|| {
            format!(
                "{} is required (base64-encoded 32-byte key)",
                self.master_key_env
            )
        })
    }
}

/// Load configuration from TOML file
pub fn load_config(path: &str) -> Result<ServiceConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path))?;
    let config: ServiceConfig =
        toml::from_str(&contents).with_context(|| format!("Failed to parse {}", path))?;
    Ok(config)
}
