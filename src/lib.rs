// Configuration loading
pub mod config;

// Error types
pub mod error;

// Queries, data sources, organization variables
pub mod model;

// Column encryption for credentials and variables
pub mod credentials;

// Persistence collaborators and the SQLite store
pub mod store;

// Source option parsing and updates
pub mod datasource;

// {{ }} / %% %% interpolation and server variables
pub mod template;

// OAuth authorization code flow
pub mod oauth;

// Data query CRUD
pub mod queries;

pub use datasource::DataSourceService;
pub use error::{QueryError, Result};
pub use oauth::OAuthAuthorizer;
pub use queries::{DataQueryService, NewDataQuery};
pub use template::{TemplateEngine, VariableResolver};
