//! Execution plans generated during the PLANNING phase.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{EntitySpec, MigrationPhase};
use crate::load::LoadStrategy;
use crate::validation::ValidationRule;

/// Read one entity from the source into staging.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionTask {
    pub entity: String,
    pub source_schema: Option<String>,
    pub source_table: String,
    /// Empty means all columns.
    pub columns: Vec<String>,
    pub staging_key: String,
}

/// Turn an extracted staging set into a load-ready one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformationTask {
    pub entity: String,
    pub input_key: String,
    pub output_key: String,
    /// (source, target) pairs; empty keeps every column unrenamed.
    pub projection: Vec<(String, String)>,
    pub transformers: Vec<String>,
    pub required_columns: Vec<String>,
}

/// Write a transformed staging set to a target table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadTask {
    pub entity: String,
    pub input_key: String,
    pub schema: Option<String>,
    pub table: String,
    /// Empty means the columns of the first staged record.
    pub columns: Vec<String>,
    pub key_columns: Vec<String>,
    pub strategy: LoadStrategy,
}

/// Ordered work for one execution attempt. Never edited after generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationPlan {
    pub extraction_tasks: Vec<ExtractionTask>,
    pub transformation_tasks: Vec<TransformationTask>,
    pub load_tasks: Vec<LoadTask>,
    pub validation_rules: Vec<ValidationRule>,
    pub generated_at: DateTime<Utc>,
}

/// Staging key for an entity's output of a phase.
pub fn staging_key(migration_id: Uuid, phase: MigrationPhase, entity: &str) -> String {
    format!("{}/{}/{}", migration_id, phase.slug(), entity)
}

impl MigrationPlan {
    /// Derive the plan from the migration's entities.
    pub fn build(
        migration_id: Uuid,
        entities: &[EntitySpec],
        default_strategy: LoadStrategy,
        rules: &[ValidationRule],
    ) -> Self {
        let mut extraction_tasks = Vec::with_capacity(entities.len());
        let mut transformation_tasks = Vec::with_capacity(entities.len());
        let mut load_tasks = Vec::with_capacity(entities.len());

        for entity in entities {
            let extracted = staging_key(migration_id, MigrationPhase::Extraction, &entity.name);
            let transformed =
                staging_key(migration_id, MigrationPhase::Transformation, &entity.name);

            extraction_tasks.push(ExtractionTask {
                entity: entity.name.clone(),
                source_schema: entity.source_schema.clone(),
                source_table: entity.source_table().to_string(),
                columns: entity.source_columns(),
                staging_key: extracted.clone(),
            });

            transformation_tasks.push(TransformationTask {
                entity: entity.name.clone(),
                input_key: extracted,
                output_key: transformed.clone(),
                projection: entity
                    .columns
                    .iter()
                    .map(|c| (c.source.clone(), c.target_name().to_string()))
                    .collect(),
                transformers: entity.transformations.clone(),
                required_columns: entity.required_columns.clone(),
            });

            load_tasks.push(LoadTask {
                entity: entity.name.clone(),
                input_key: transformed,
                schema: entity.target_schema.clone(),
                table: entity.target_table().to_string(),
                columns: entity.target_columns(),
                key_columns: entity.key_columns.clone(),
                strategy: entity.load_strategy.unwrap_or(default_strategy),
            });
        }

        Self {
            extraction_tasks,
            transformation_tasks,
            load_tasks,
            validation_rules: rules.to_vec(),
            generated_at: Utc::now(),
        }
    }
}
