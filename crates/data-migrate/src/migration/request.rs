//! Migration requests as submitted by callers.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::config::MigrationDefaults;
use crate::core::{validate_all, validate_sql_identifier, IdentifierRole};
use crate::error::{MigrateError, Result};
use crate::load::LoadStrategy;
use crate::validation::ValidationRule;

/// Source column copied to a target column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMapping {
    pub source: String,
    /// Target column name (default: same as source).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

impl ColumnMapping {
    pub fn target_name(&self) -> &str {
        self.target.as_deref().unwrap_or(&self.source)
    }
}

/// Declared shape of a target field, used by SCHEMA and DATA_TYPE rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDefinition {
    pub name: String,
    pub data_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    #[serde(default)]
    pub required: bool,
}

/// One logical dataset moved by a migration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySpec {
    /// Logical name; also the default source and target table.
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_schema: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_table: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_schema: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_table: Option<String>,

    /// Columns to move. Empty means every source column, unrenamed.
    #[serde(default)]
    pub columns: Vec<ColumnMapping>,

    /// Target key columns (conflict target for UPSERT, delete key for rollback).
    #[serde(default)]
    pub key_columns: Vec<String>,

    /// Named transformers applied in order.
    #[serde(default)]
    pub transformations: Vec<String>,

    /// Target columns that must be non-null after transformation.
    #[serde(default)]
    pub required_columns: Vec<String>,

    /// Declared target fields.
    #[serde(default)]
    pub fields: Vec<FieldDefinition>,

    /// Per-entity strategy override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_strategy: Option<LoadStrategy>,
}

impl EntitySpec {
    pub fn source_table(&self) -> &str {
        self.source_table.as_deref().unwrap_or(&self.name)
    }

    pub fn target_table(&self) -> &str {
        self.target_table.as_deref().unwrap_or(&self.name)
    }

    pub fn source_columns(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.source.clone()).collect()
    }

    pub fn target_columns(&self) -> Vec<String> {
        self.columns
            .iter()
            .map(|c| c.target_name().to_string())
            .collect()
    }

    /// Check every name that may end up in generated SQL.
    pub fn validate_identifiers(&self) -> Result<()> {
        validate_sql_identifier(&self.name, IdentifierRole::Table)?;
        validate_sql_identifier(self.source_table(), IdentifierRole::Table)?;
        validate_sql_identifier(self.target_table(), IdentifierRole::Table)?;
        for schema in [&self.source_schema, &self.target_schema].into_iter().flatten() {
            validate_sql_identifier(schema, IdentifierRole::Schema)?;
        }
        for mapping in &self.columns {
            validate_sql_identifier(&mapping.source, IdentifierRole::Column)?;
            validate_sql_identifier(mapping.target_name(), IdentifierRole::Column)?;
        }
        validate_all(&self.key_columns, IdentifierRole::KeyColumn)?;
        validate_all(&self.required_columns, IdentifierRole::Column)?;
        Ok(())
    }
}

/// A request to create and run a migration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationRequest {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Data source id to extract from.
    pub source_system: String,

    /// Data source id to load into.
    pub target_system: String,

    pub entities: Vec<EntitySpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallelism: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_attempts: Option<u32>,

    #[serde(default = "default_true")]
    pub rollback_enabled: bool,

    #[serde(default)]
    pub strict_validation: bool,

    /// Abort a STREAMING batch on its first row error.
    #[serde(default)]
    pub fail_fast: bool,

    #[serde(default)]
    pub load_strategy: LoadStrategy,

    #[serde(default)]
    pub validation_rules: Vec<ValidationRule>,
}

impl MigrationRequest {
    /// Load a request from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&content)?)
    }

    /// Reject malformed requests before anything is persisted.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(MigrateError::InvalidRequest("name is required".into()));
        }
        if self.source_system.trim().is_empty() {
            return Err(MigrateError::InvalidRequest(
                "source_system is required".into(),
            ));
        }
        if self.target_system.trim().is_empty() {
            return Err(MigrateError::InvalidRequest(
                "target_system is required".into(),
            ));
        }
        if let Some(0) = self.batch_size {
            return Err(MigrateError::InvalidRequest(
                "batch_size must be at least 1".into(),
            ));
        }
        if let Some(0) = self.parallelism {
            return Err(MigrateError::InvalidRequest(
                "parallelism must be at least 1".into(),
            ));
        }
        if self.entities.is_empty() {
            return Err(MigrateError::InvalidRequest(
                "at least one entity is required".into(),
            ));
        }

        let mut names = std::collections::HashSet::new();
        for entity in &self.entities {
            entity.validate_identifiers()?;
            if !names.insert(entity.name.as_str()) {
                return Err(MigrateError::InvalidRequest(format!(
                    "duplicate entity '{}'",
                    entity.name
                )));
            }
            let strategy = entity.load_strategy.unwrap_or(self.load_strategy);
            if strategy == LoadStrategy::Upsert && entity.key_columns.is_empty() {
                return Err(MigrateError::InvalidRequest(format!(
                    "entity '{}' uses UPSERT but declares no key_columns",
                    entity.name
                )));
            }
        }

        for rule in &self.validation_rules {
            if let Some(entity) = &rule.entity {
                if !names.contains(entity.as_str()) {
                    return Err(MigrateError::InvalidRequest(format!(
                        "validation rule '{}' refers to unknown entity '{}'",
                        rule.name, entity
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn resolved_batch_size(&self, defaults: &MigrationDefaults) -> usize {
        self.batch_size.unwrap_or_else(|| defaults.get_batch_size())
    }

    pub fn resolved_parallelism(&self, defaults: &MigrationDefaults) -> usize {
        self.parallelism.unwrap_or_else(|| defaults.get_parallelism())
    }

    pub fn resolved_retry_attempts(&self, defaults: &MigrationDefaults) -> u32 {
        self.retry_attempts
            .unwrap_or_else(|| defaults.get_retry_attempts())
    }
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_yaml() -> &'static str {
        r#"
name: customer-move
source_system: erp
target_system: warehouse
batch_size: 100
entities:
  - name: customers
    columns:
      - source: cust_id
        target: id
      - source: email
    key_columns: [id]
    transformations: [trim_strings]
validation_rules:
  - name: ids-unique
    kind: UNIQUENESS
    entity: customers
    fields: [id]
"#
    }

    #[test]
    fn test_parse_request_yaml() {
        let req: MigrationRequest = serde_yaml::from_str(request_yaml()).unwrap();
        assert!(req.validate().is_ok());
        assert!(req.rollback_enabled);
        assert!(!req.strict_validation);
        assert_eq!(req.load_strategy, LoadStrategy::Batch);
        let entity = &req.entities[0];
        assert_eq!(entity.target_columns(), vec!["id", "email"]);
        assert_eq!(entity.source_columns(), vec!["cust_id", "email"]);
        assert_eq!(entity.target_table(), "customers");
    }

    #[test]
    fn test_injection_in_entity_name_rejected() {
        let mut req: MigrationRequest = serde_yaml::from_str(request_yaml()).unwrap();
        req.entities[0].name = "users; DROP TABLE users--".into();
        req.validation_rules.clear();
        let err = req.validate().unwrap_err();
        assert!(matches!(
            err,
            MigrateError::InvalidIdentifier {
                role: IdentifierRole::Table,
                ..
            }
        ));
    }

    #[test]
    fn test_bad_key_column_rejected() {
        let mut req: MigrationRequest = serde_yaml::from_str(request_yaml()).unwrap();
        req.entities[0].key_columns = vec!["id--".into()];
        assert!(matches!(
            req.validate().unwrap_err(),
            MigrateError::InvalidIdentifier {
                role: IdentifierRole::KeyColumn,
                ..
            }
        ));
    }

    #[test]
    fn test_upsert_without_keys_rejected() {
        let mut req: MigrationRequest = serde_yaml::from_str(request_yaml()).unwrap();
        req.load_strategy = LoadStrategy::Upsert;
        req.entities[0].key_columns.clear();
        assert!(matches!(
            req.validate().unwrap_err(),
            MigrateError::InvalidRequest(_)
        ));
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let mut req: MigrationRequest = serde_yaml::from_str(request_yaml()).unwrap();
        req.batch_size = Some(0);
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_rule_for_unknown_entity_rejected() {
        let mut req: MigrationRequest = serde_yaml::from_str(request_yaml()).unwrap();
        req.validation_rules[0].entity = Some("orders".into());
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_resolved_values_fall_back_to_defaults() {
        let mut req: MigrationRequest = serde_yaml::from_str(request_yaml()).unwrap();
        req.parallelism = None;
        let defaults = MigrationDefaults::default();
        assert_eq!(req.resolved_batch_size(&defaults), 100);
        assert_eq!(req.resolved_parallelism(&defaults), 4);
        assert_eq!(req.resolved_retry_attempts(&defaults), 3);
    }
}
