//! Record transformation between extraction and validation.
//!
//! Transformation logic is supplied from outside as named [`Transformer`]s.
//! The pipeline for an entity projects and renames columns, runs the named
//! transformers in order, then rejects rows whose required columns are null.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::core::{ControlSignal, Record, SqlValue};
use crate::error::{MigrateError, Result};
use crate::migration::TransformationTask;
use crate::staging::StagingArea;

/// Rejection messages kept per entity; the count is always exact.
const MAX_RECORDED_REJECTIONS: usize = 100;

/// A named, reusable row transformation.
pub trait Transformer: Send + Sync {
    fn name(&self) -> &str;

    /// Rewrite `record` in place. `Err` rejects the row with a reason.
    fn apply(&self, record: &mut Record) -> std::result::Result<(), String>;
}

/// Trims surrounding whitespace from every text value.
pub struct TrimStrings;

impl Transformer for TrimStrings {
    fn name(&self) -> &str {
        "trim_strings"
    }

    fn apply(&self, record: &mut Record) -> std::result::Result<(), String> {
        for value in record.values_mut() {
            if let SqlValue::Text(s) = value {
                let trimmed = s.trim();
                if trimmed.len() != s.len() {
                    *s = trimmed.to_string();
                }
            }
        }
        Ok(())
    }
}

/// Turns empty strings into NULL.
pub struct EmptyToNull;

impl Transformer for EmptyToNull {
    fn name(&self) -> &str {
        "empty_to_null"
    }

    fn apply(&self, record: &mut Record) -> std::result::Result<(), String> {
        for value in record.values_mut() {
            if matches!(value, SqlValue::Text(s) if s.is_empty()) {
                *value = SqlValue::Null;
            }
        }
        Ok(())
    }
}

/// Rejects rows with a NULL (or missing) value in any listed column.
pub struct DropNullsIn {
    columns: Vec<String>,
}

impl DropNullsIn {
    pub fn new(columns: Vec<String>) -> Self {
        Self { columns }
    }
}

impl Transformer for DropNullsIn {
    fn name(&self) -> &str {
        "drop_nulls_in"
    }

    fn apply(&self, record: &mut Record) -> std::result::Result<(), String> {
        match self
            .columns
            .iter()
            .find(|c| record.get(*c).map_or(true, SqlValue::is_null))
        {
            Some(column) => Err(format!("required column {} is null", column)),
            None => Ok(()),
        }
    }
}

/// Transformers addressable by name.
#[derive(Clone)]
pub struct TransformRegistry {
    transformers: HashMap<String, Arc<dyn Transformer>>,
}

impl Default for TransformRegistry {
    fn default() -> Self {
        let mut registry = Self {
            transformers: HashMap::new(),
        };
        registry.register(Arc::new(TrimStrings));
        registry.register(Arc::new(EmptyToNull));
        registry
    }
}

impl TransformRegistry {
    /// A registry holding the built-in transformers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a transformer under its own name.
    pub fn register(&mut self, transformer: Arc<dyn Transformer>) {
        self.transformers
            .insert(transformer.name().to_string(), transformer);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Transformer>> {
        self.transformers.get(name).cloned().ok_or_else(|| {
            MigrateError::InvalidRequest(format!("Unknown transformation '{}'", name))
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.transformers.contains_key(name)
    }
}

/// The resolved steps for one entity.
pub struct TransformPipeline {
    projection: Vec<(String, String)>,
    steps: Vec<Arc<dyn Transformer>>,
}

impl TransformPipeline {
    pub fn build(task: &TransformationTask, registry: &TransformRegistry) -> Result<Self> {
        let mut steps = task
            .transformers
            .iter()
            .map(|name| registry.get(name))
            .collect::<Result<Vec<_>>>()?;
        if !task.required_columns.is_empty() {
            steps.push(Arc::new(DropNullsIn::new(task.required_columns.clone())));
        }
        Ok(Self {
            projection: task.projection.clone(),
            steps,
        })
    }

    fn project(&self, record: Record) -> Record {
        if self.projection.is_empty() {
            return record;
        }
        let mut record = record;
        self.projection
            .iter()
            .map(|(source, target)| {
                let value = record.remove(source).unwrap_or(SqlValue::Null);
                (target.clone(), value)
            })
            .collect()
    }

    pub fn apply(&self, record: Record) -> std::result::Result<Record, String> {
        let mut record = self.project(record);
        for step in &self.steps {
            step.apply(&mut record)
                .map_err(|reason| format!("{}: {}", step.name(), reason))?;
        }
        Ok(record)
    }
}

/// Outcome of transforming one entity's staging set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransformSummary {
    pub entity: String,
    pub transformed: u64,
    pub rejected: u64,
    pub errors: Vec<String>,
}

/// Read `task.input_key` in batches, transform, and write `task.output_key`.
///
/// Any previous output for the key is replaced. Pause and cancel are
/// honoured between batches.
pub async fn run_transformation(
    task: &TransformationTask,
    registry: &TransformRegistry,
    staging: &dyn StagingArea,
    batch_size: usize,
    control: &ControlSignal,
) -> Result<TransformSummary> {
    let pipeline = TransformPipeline::build(task, registry)?;
    let batch_size = batch_size.max(1);
    let mut summary = TransformSummary {
        entity: task.entity.clone(),
        ..Default::default()
    };

    staging.clear(&task.output_key).await?;
    let mut offset = 0;
    loop {
        let batch = staging.read_range(&task.input_key, offset, batch_size).await?;
        if batch.is_empty() {
            break;
        }
        let read = batch.len();
        let mut out = Vec::with_capacity(read);
        for (idx, record) in batch.into_iter().enumerate() {
            match pipeline.apply(record) {
                Ok(r) => out.push(r),
                Err(reason) => {
                    summary.rejected += 1;
                    if summary.errors.len() < MAX_RECORDED_REJECTIONS {
                        summary.errors.push(format!("record {}: {}", offset + idx, reason));
                    }
                }
            }
        }
        summary.transformed += out.len() as u64;
        staging.append(&task.output_key, &out).await?;
        debug!("Transformed {} of {} records of {}", out.len(), read, task.entity);

        offset += read;
        if read < batch_size {
            break;
        }
        control.checkpoint()?;
    }

    info!(
        "Transformed {} records of {} ({} rejected)",
        summary.transformed, task.entity, summary.rejected
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::staging::MemoryStaging;

    fn task(transformers: &[&str], required: &[&str]) -> TransformationTask {
        TransformationTask {
            entity: "customers".into(),
            input_key: "m/extraction/customers".into(),
            output_key: "m/transformation/customers".into(),
            projection: vec![
                ("id".into(), "customer_id".into()),
                ("email".into(), "email".into()),
            ],
            transformers: transformers.iter().map(|s| s.to_string()).collect(),
            required_columns: required.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn rec(id: i64, email: &str) -> Record {
        Record::from([
            ("id".to_string(), SqlValue::Int(id)),
            ("email".to_string(), SqlValue::Text(email.to_string())),
            ("ignored".to_string(), SqlValue::Bool(true)),
        ])
    }

    #[test]
    fn test_pipeline_projects_and_trims() {
        let registry = TransformRegistry::new();
        let pipeline = TransformPipeline::build(&task(&["trim_strings"], &[]), &registry).unwrap();
        let out = pipeline.apply(rec(1, "  a@x.io ")).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out.get("customer_id"), Some(&SqlValue::Int(1)));
        assert_eq!(out.get("email"), Some(&SqlValue::Text("a@x.io".into())));
    }

    #[test]
    fn test_required_columns_reject_nulls() {
        let registry = TransformRegistry::new();
        let pipeline =
            TransformPipeline::build(&task(&["empty_to_null"], &["email"]), &registry).unwrap();
        let err = pipeline.apply(rec(1, "")).unwrap_err();
        assert!(err.contains("email"));
    }

    #[test]
    fn test_unknown_transformer_is_invalid_request() {
        let registry = TransformRegistry::new();
        let err = TransformPipeline::build(&task(&["soundex"], &[]), &registry)
            .err()
            .unwrap();
        assert!(matches!(err, MigrateError::InvalidRequest(_)));
    }

    struct Uppercase;

    impl Transformer for Uppercase {
        fn name(&self) -> &str {
            "uppercase"
        }

        fn apply(&self, record: &mut Record) -> std::result::Result<(), String> {
            for value in record.values_mut() {
                if let SqlValue::Text(s) = value {
                    *s = s.to_uppercase();
                }
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_run_transformation_with_custom_transformer() {
        let staging = MemoryStaging::new();
        staging
            .append(
                "m/extraction/customers",
                &[rec(1, "a@x.io"), rec(2, ""), rec(3, "c@x.io")],
            )
            .await
            .unwrap();
        let mut registry = TransformRegistry::new();
        registry.register(Arc::new(Uppercase));

        let summary = run_transformation(
            &task(&["empty_to_null", "uppercase"], &["email"]),
            &registry,
            &staging,
            2,
            &ControlSignal::detached(),
        )
        .await
        .unwrap();

        assert_eq!(summary.transformed, 2);
        assert_eq!(summary.rejected, 1);
        let out = staging.read_all("m/transformation/customers").await.unwrap();
        assert_eq!(out[1].get("email"), Some(&SqlValue::Text("C@X.IO".into())));
    }
}
