//! Server variable resolution for `%%server.NAME%%` references.

use crate::credentials::{ColumnCipher, ORG_ENV_VARIABLES_TABLE};
use crate::error::Result;
use crate::model::VariableType;
use crate::store::EnvVariableStore;
use lazy_static::lazy_static;
use regex::Regex;
use std::sync::Arc;
use tracing::debug;

lazy_static! {
    static ref SERVER_REFERENCE: Regex = Regex::new(r"^server\.([A-Za-z0-9_]+)$").unwrap();
}

/// Resolves organization server variables to their decrypted values.
///
/// A reference that is not of the form `server.NAME`, or whose variable does
/// not exist in the organization, resolves to the reference text itself.
/// Decryption failures propagate.
#[derive(Clone)]
pub struct VariableResolver {
    variables: Arc<dyn EnvVariableStore>,
    cipher: Arc<ColumnCipher>,
}

impl VariableResolver {
    pub fn new(variables: Arc<dyn EnvVariableStore>, cipher: Arc<ColumnCipher>) -> Self {
        Self { variables, cipher }
    }

    /// Resolves `reference` (with or without the `%%` delimiters) for an organization.
    pub async fn resolve(&self, reference: &str, organization_id: &str) -> Result<String> {
        let stripped = reference.replace("%%", "");

        let Some(captures) = SERVER_REFERENCE.captures(&stripped) else {
            return Ok(reference.to_string());
        };
        let variable_name = &captures[1];

        let variable = self
            .variables
            .find_one(VariableType::Server, organization_id, variable_name)
            .await?;

        match variable {
            Some(variable) => self.cipher.decrypt_column_value(
                ORG_ENV_VARIABLES_TABLE,
                organization_id,
                &variable.value,
            ),
            None => {
                debug!(
                    organization_id = %organization_id,
                    variable = %variable_name,
                    "Server variable not found, leaving reference unresolved"
                );
                Ok(reference.to_string())
            }
        }
    }
}
