//! Rule-based validation of transformed data before it is loaded.
//!
//! A [`ValidationContext`] carries, per entity, the source schema observed in
//! the staged sample, the declared target schema and the sampled records,
//! plus named reference sets and business predicates. [`validate`] runs every
//! rule independently and folds the findings into a scored
//! [`ValidationResult`]:
//!
//! - CRITICAL errors cost 20 points, MAJOR 10, MINOR 5, warnings 2
//! - the score is clamped to `0..=100`
//! - the result passes iff there is no CRITICAL or MAJOR error

mod rules;
mod types;

pub use types::TypeFamily;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::core::{Record, SqlValue};
use crate::migration::FieldDefinition;

/// Default COMPLETENESS threshold when neither rule nor config sets one.
pub const DEFAULT_COMPLETENESS_THRESHOLD: f64 = 0.95;

/// How bad a validation error is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Critical,
    Major,
    Minor,
}

impl Severity {
    pub fn penalty(&self) -> u32 {
        match self {
            Severity::Critical => 20,
            Severity::Major => 10,
            Severity::Minor => 5,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "CRITICAL",
            Severity::Major => "MAJOR",
            Severity::Minor => "MINOR",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Points lost per warning.
pub const WARNING_PENALTY: u32 = 2;

/// A per-field check inside a CONSTRAINTS rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Constraint {
    NotNull,
    MinValue { value: f64 },
    MaxValue { value: f64 },
    Pattern { pattern: String },
}

impl Constraint {
    pub fn severity(&self) -> Severity {
        match self {
            Constraint::NotNull => Severity::Critical,
            _ => Severity::Major,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldConstraint {
    pub field: String,
    #[serde(flatten)]
    pub constraint: Constraint,
}

/// A foreign-key style check: every value of `field` must be in the named
/// reference set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceCheck {
    pub field: String,
    pub reference: String,
}

/// What a rule checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleSpec {
    /// Declared target fields exist in the source with compatible types and lengths.
    Schema,
    /// Sampled values fit the declared target types.
    DataType,
    Constraints { constraints: Vec<FieldConstraint> },
    Referential { checks: Vec<ReferenceCheck> },
    /// A registered [`BusinessPredicate`] holds for every sampled record.
    Business {
        predicate: String,
        #[serde(default)]
        critical: bool,
    },
    /// Non-null ratio of each field is at least `threshold`.
    Completeness {
        fields: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        threshold: Option<f64>,
    },
    /// No duplicate non-null values within each field.
    Uniqueness { fields: Vec<String> },
    /// Non-null values of `field` match `pattern`.
    Format { field: String, pattern: String },
}

impl RuleSpec {
    pub fn kind(&self) -> &'static str {
        match self {
            RuleSpec::Schema => "SCHEMA",
            RuleSpec::DataType => "DATA_TYPE",
            RuleSpec::Constraints { .. } => "CONSTRAINTS",
            RuleSpec::Referential { .. } => "REFERENTIAL",
            RuleSpec::Business { .. } => "BUSINESS",
            RuleSpec::Completeness { .. } => "COMPLETENESS",
            RuleSpec::Uniqueness { .. } => "UNIQUENESS",
            RuleSpec::Format { .. } => "FORMAT",
        }
    }
}

/// A named rule, optionally scoped to one entity (all entities otherwise).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationRule {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity: Option<String>,
    #[serde(flatten)]
    pub spec: RuleSpec,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationError {
    /// `entity.field`, or the rule name when no single field is at fault.
    pub field: String,
    pub message: String,
    pub severity: Severity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationWarning {
    pub field: String,
    pub message: String,
}

/// Scored outcome of one validation pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub passed: bool,
    pub score: u32,
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<ValidationWarning>,
    pub summary: String,
    pub rules_evaluated: usize,
    pub records_sampled: usize,
}

impl ValidationResult {
    pub fn from_findings(
        errors: Vec<ValidationError>,
        warnings: Vec<ValidationWarning>,
        rules_evaluated: usize,
        records_sampled: usize,
    ) -> Self {
        let score = score(&errors, warnings.len());
        let passed = !errors
            .iter()
            .any(|e| matches!(e.severity, Severity::Critical | Severity::Major));
        let summary = summarize(passed, score, &errors, warnings.len());
        Self {
            passed,
            score,
            errors,
            warnings,
            summary,
            rules_evaluated,
            records_sampled,
        }
    }

    pub fn count(&self, severity: Severity) -> usize {
        self.errors.iter().filter(|e| e.severity == severity).count()
    }
}

/// 100 minus the severity penalties, clamped to `0..=100`.
pub fn score(errors: &[ValidationError], warnings: usize) -> u32 {
    let penalty: u64 = errors
        .iter()
        .map(|e| e.severity.penalty() as u64)
        .sum::<u64>()
        + warnings as u64 * WARNING_PENALTY as u64;
    100u64.saturating_sub(penalty) as u32
}

fn summarize(passed: bool, score: u32, errors: &[ValidationError], warnings: usize) -> String {
    let count = |s: Severity| errors.iter().filter(|e| e.severity == s).count();
    format!(
        "{} (score {}): {} critical, {} major, {} minor errors; {} warnings",
        if passed { "passed" } else { "failed" },
        score,
        count(Severity::Critical),
        count(Severity::Major),
        count(Severity::Minor),
        warnings
    )
}

/// A named check evaluated against each sampled record of an entity.
pub trait BusinessPredicate: Send + Sync {
    fn name(&self) -> &str;

    /// `Ok(false)` marks the record as violating the rule. `Err` means the
    /// predicate could not be evaluated at all.
    fn check(&self, record: &Record) -> std::result::Result<bool, String>;
}

/// Business predicates addressable by name.
#[derive(Clone, Default)]
pub struct BusinessRegistry {
    predicates: HashMap<String, Arc<dyn BusinessPredicate>>,
}

impl BusinessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, predicate: Arc<dyn BusinessPredicate>) {
        self.predicates
            .insert(predicate.name().to_string(), predicate);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn BusinessPredicate>> {
        self.predicates.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.predicates.keys().cloned().collect();
        names.sort();
        names
    }
}

impl fmt::Debug for BusinessRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusinessRegistry")
            .field("predicates", &self.names())
            .finish()
    }
}

/// Observed shape of a source column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedField {
    /// `None` when every sampled value was NULL.
    pub family: Option<TypeFamily>,
    /// Longest text value seen, in chars.
    pub max_length: Option<usize>,
}

/// Everything validation knows about one entity.
#[derive(Debug, Clone, Default)]
pub struct EntitySample {
    pub source_schema: BTreeMap<String, ObservedField>,
    pub target_schema: Vec<FieldDefinition>,
    pub records: Vec<Record>,
}

impl EntitySample {
    /// Build from sampled records, inferring the source schema from them.
    pub fn from_records(records: Vec<Record>, target_schema: Vec<FieldDefinition>) -> Self {
        Self {
            source_schema: infer_schema(&records),
            target_schema,
            records,
        }
    }

    /// Non-null values of `field` across the sample (missing counts as NULL).
    pub fn values<'a>(&'a self, field: &'a str) -> impl Iterator<Item = &'a SqlValue> + 'a {
        self.records
            .iter()
            .filter_map(move |r| r.get(field))
            .filter(|v| !v.is_null())
    }
}

/// Column families and text lengths as observed in a sample.
pub fn infer_schema(records: &[Record]) -> BTreeMap<String, ObservedField> {
    let mut schema: BTreeMap<String, ObservedField> = BTreeMap::new();
    for record in records {
        for (column, value) in record {
            let entry = schema.entry(column.clone()).or_insert(ObservedField {
                family: None,
                max_length: None,
            });
            if entry.family.is_none() {
                entry.family = TypeFamily::of_value(value);
            }
            if let SqlValue::Text(s) = value {
                let len = s.chars().count();
                entry.max_length = Some(entry.max_length.map_or(len, |m| m.max(len)));
            }
        }
    }
    schema
}

/// Input of one validation pass.
#[derive(Debug, Clone)]
pub struct ValidationContext {
    pub rules: Vec<ValidationRule>,
    pub entities: BTreeMap<String, EntitySample>,
    /// Named value sets for REFERENTIAL rules, compared as text.
    pub reference_sets: HashMap<String, HashSet<String>>,
    pub business: BusinessRegistry,
    pub completeness_threshold: f64,
}

impl Default for ValidationContext {
    fn default() -> Self {
        Self {
            rules: Vec::new(),
            entities: BTreeMap::new(),
            reference_sets: HashMap::new(),
            business: BusinessRegistry::default(),
            completeness_threshold: DEFAULT_COMPLETENESS_THRESHOLD,
        }
    }
}

impl ValidationContext {
    pub fn new(rules: Vec<ValidationRule>) -> Self {
        Self {
            rules,
            ..Default::default()
        }
    }

    pub fn with_entity(mut self, name: impl Into<String>, sample: EntitySample) -> Self {
        self.entities.insert(name.into(), sample);
        self
    }

    pub fn with_reference_set(mut self, name: impl Into<String>, values: HashSet<String>) -> Self {
        self.reference_sets.insert(name.into(), values);
        self
    }

    pub fn with_business(mut self, business: BusinessRegistry) -> Self {
        self.business = business;
        self
    }

    pub fn with_completeness_threshold(mut self, threshold: f64) -> Self {
        self.completeness_threshold = threshold;
        self
    }

    fn records_sampled(&self) -> usize {
        self.entities.values().map(|e| e.records.len()).sum()
    }
}

/// Findings of a single rule against a single entity.
#[derive(Debug, Default)]
pub(crate) struct Findings {
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<ValidationWarning>,
}

impl Findings {
    pub fn error(&mut self, field: impl Into<String>, message: impl Into<String>, severity: Severity) {
        self.errors.push(ValidationError {
            field: field.into(),
            message: message.into(),
            severity,
        });
    }

    pub fn warn(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.warnings.push(ValidationWarning {
            field: field.into(),
            message: message.into(),
        });
    }
}

/// Run every rule and score the findings.
///
/// A rule that cannot be executed (bad regex, unknown predicate, missing
/// reference set or entity) yields one CRITICAL error for that rule; the
/// other rules still run.
pub fn validate(context: &ValidationContext) -> ValidationResult {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    for rule in &context.rules {
        let targets: Vec<(&String, &EntitySample)> = match &rule.entity {
            Some(name) => match context.entities.get_key_value(name) {
                Some(pair) => vec![pair],
                None => {
                    errors.push(ValidationError {
                        field: rule.name.clone(),
                        message: format!("rule '{}': no data for entity '{}'", rule.name, name),
                        severity: Severity::Critical,
                    });
                    continue;
                }
            },
            None => context.entities.iter().collect(),
        };

        for (entity, sample) in targets {
            match rules::evaluate(rule, entity, sample, context) {
                Ok(findings) => {
                    debug!(
                        "Rule {} ({}) on {}: {} errors, {} warnings",
                        rule.name,
                        rule.spec.kind(),
                        entity,
                        findings.errors.len(),
                        findings.warnings.len()
                    );
                    errors.extend(findings.errors);
                    warnings.extend(findings.warnings);
                }
                Err(reason) => {
                    warn!("Rule {} could not run on {}: {}", rule.name, entity, reason);
                    errors.push(ValidationError {
                        field: rule.name.clone(),
                        message: format!("rule '{}' failed to execute: {}", rule.name, reason),
                        severity: Severity::Critical,
                    });
                }
            }
        }
    }

    let result = ValidationResult::from_findings(
        errors,
        warnings,
        context.rules.len(),
        context.records_sampled(),
    );
    info!("Validation {}", result.summary);
    result
}
