//! Built-in connectors.

pub mod restapi;
