//! Connector Manager - runs data queries against their data sources.
//!
//! This crate defines the interface connectors implement and the runner that
//! drives them. Option resolution, credential decryption and token persistence
//! come from the `dataquery` crate.
//!
//! # Architecture
//!
//! ```text
//!   DataQuery + caller bindings
//!          ↓
//! ┌─────────────────────────────────────────┐
//! │       QueryRunner                        │
//! │  - Resolve organization                  │
//! │  - Parse source options                  │
//! │  - Interpolate query options             │
//! │  - Refresh OAuth token once on failure   │
//! └─────────────────────────────────────────┘
//!          ↓
//! ┌─────────────────────────────────────────┐
//! │       Connector (from the registry)      │
//! │  - Execute against the data source       │
//! └─────────────────────────────────────────┘
//!          ↓
//!   Connector result (JSON)
//! ```
//!
//! # Core Types
//!
//! - [`Connector`] - Trait that all connectors must implement
//! - [`ConnectorRegistry`] - Kind-to-connector lookup
//! - [`QueryRunner`] - Query execution with token refresh
//! - [`ConnectorError`] / [`RunError`] - Failures raised by connectors and runs

mod connector;
mod types;
pub mod connectors;
pub mod registry;
pub mod runner;

pub use connector::Connector;
pub use registry::ConnectorRegistry;
pub use runner::QueryRunner;
pub use types::{ConnectorError, RunError};
