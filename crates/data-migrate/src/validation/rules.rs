//! Evaluation of each rule kind against one entity's sample.

use regex::Regex;
use std::collections::HashSet;

use super::{
    Constraint, EntitySample, Findings, ReferenceCheck, RuleSpec, Severity, TypeFamily,
    ValidationContext, ValidationRule,
};
use crate::core::SqlValue;

/// Offending values quoted in one message.
const MAX_EXAMPLES: usize = 5;

type RuleResult = std::result::Result<Findings, String>;

pub(crate) fn evaluate(
    rule: &ValidationRule,
    entity: &str,
    sample: &EntitySample,
    ctx: &ValidationContext,
) -> RuleResult {
    match &rule.spec {
        RuleSpec::Schema => Ok(schema(entity, sample)),
        RuleSpec::DataType => Ok(data_type(entity, sample)),
        RuleSpec::Constraints { constraints } => {
            let mut findings = Findings::default();
            for c in constraints {
                constraint(&mut findings, entity, sample, &c.field, &c.constraint)?;
            }
            Ok(findings)
        }
        RuleSpec::Referential { checks } => {
            let mut findings = Findings::default();
            for check in checks {
                referential(&mut findings, entity, sample, check, ctx)?;
            }
            Ok(findings)
        }
        RuleSpec::Business { predicate, critical } => {
            business(entity, sample, predicate, *critical, ctx)
        }
        RuleSpec::Completeness { fields, threshold } => {
            let threshold = threshold.unwrap_or(ctx.completeness_threshold);
            if !(0.0..=1.0).contains(&threshold) {
                return Err(format!("threshold {} is outside 0..=1", threshold));
            }
            Ok(completeness(entity, sample, fields, threshold))
        }
        RuleSpec::Uniqueness { fields } => Ok(uniqueness(entity, sample, fields)),
        RuleSpec::Format { field, pattern } => format(entity, sample, field, pattern),
    }
}

fn qualified(entity: &str, field: &str) -> String {
    format!("{}.{}", entity, field)
}

fn examples<'a>(values: impl Iterator<Item = &'a SqlValue>) -> String {
    values
        .take(MAX_EXAMPLES)
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn schema(entity: &str, sample: &EntitySample) -> Findings {
    let mut findings = Findings::default();
    for field in &sample.target_schema {
        let name = qualified(entity, &field.name);
        let Some(observed) = sample.source_schema.get(&field.name) else {
            if field.required {
                findings.error(name, "required field is missing from the source", Severity::Critical);
            } else {
                findings.warn(name, "field is missing from the source");
            }
            continue;
        };

        if let (Some(target), Some(source)) =
            (TypeFamily::from_declared(&field.data_type), observed.family)
        {
            if !target.accepts_family(source) {
                findings.error(
                    name.clone(),
                    format!(
                        "source {} values are incompatible with target type {}",
                        source.as_str(),
                        field.data_type
                    ),
                    Severity::Major,
                );
            }
        }

        if let (Some(max), Some(seen)) = (field.max_length, observed.max_length) {
            if seen > max {
                findings.warn(
                    name,
                    format!("source values up to {} chars exceed target length {}", seen, max),
                );
            }
        }
    }
    findings
}

fn data_type(entity: &str, sample: &EntitySample) -> Findings {
    let mut findings = Findings::default();
    for field in &sample.target_schema {
        let Some(family) = TypeFamily::from_declared(&field.data_type) else {
            continue;
        };
        let bad: Vec<&SqlValue> = sample
            .values(&field.name)
            .filter(|v| !family.accepts_value(v))
            .collect();
        if !bad.is_empty() {
            findings.error(
                qualified(entity, &field.name),
                format!(
                    "{} sampled values do not fit {} (e.g. {})",
                    bad.len(),
                    field.data_type,
                    examples(bad.into_iter())
                ),
                Severity::Major,
            );
        }
    }
    findings
}

fn compile(pattern: &str) -> std::result::Result<Regex, String> {
    Regex::new(pattern).map_err(|e| format!("invalid pattern {:?}: {}", pattern, e))
}

fn constraint(
    findings: &mut Findings,
    entity: &str,
    sample: &EntitySample,
    field: &str,
    constraint: &Constraint,
) -> std::result::Result<(), String> {
    let name = qualified(entity, field);
    let severity = constraint.severity();
    match constraint {
        Constraint::NotNull => {
            let nulls = sample
                .records
                .iter()
                .filter(|r| r.get(field).map_or(true, SqlValue::is_null))
                .count();
            if nulls > 0 {
                findings.error(name, format!("{} sampled records are null", nulls), severity);
            }
        }
        Constraint::MinValue { value } | Constraint::MaxValue { value } => {
            let is_min = matches!(constraint, Constraint::MinValue { .. });
            let mut bad = Vec::new();
            for v in sample.values(field) {
                let n = v
                    .as_f64()
                    .ok_or_else(|| format!("{} holds non-numeric value {}", name, v))?;
                if (is_min && n < *value) || (!is_min && n > *value) {
                    bad.push(v);
                }
            }
            if !bad.is_empty() {
                findings.error(
                    name,
                    format!(
                        "{} sampled values are {} {} (e.g. {})",
                        bad.len(),
                        if is_min { "below" } else { "above" },
                        value,
                        examples(bad.into_iter())
                    ),
                    severity,
                );
            }
        }
        Constraint::Pattern { pattern } => {
            let re = compile(pattern)?;
            let bad = non_matching(sample, field, &re);
            if !bad.is_empty() {
                findings.error(
                    name,
                    format!(
                        "{} sampled values do not match {} (e.g. {})",
                        bad.len(),
                        pattern,
                        examples(bad.into_iter())
                    ),
                    severity,
                );
            }
        }
    }
    Ok(())
}

fn non_matching<'a>(sample: &'a EntitySample, field: &'a str, re: &Regex) -> Vec<&'a SqlValue> {
    sample
        .values(field)
        .filter(|v| v.as_text().map_or(false, |t| !re.is_match(&t)))
        .collect()
}

fn referential(
    findings: &mut Findings,
    entity: &str,
    sample: &EntitySample,
    check: &ReferenceCheck,
    ctx: &ValidationContext,
) -> std::result::Result<(), String> {
    let reference = ctx
        .reference_sets
        .get(&check.reference)
        .ok_or_else(|| format!("unknown reference set '{}'", check.reference))?;
    let mut missing: Vec<String> = Vec::new();
    let mut seen = HashSet::new();
    for value in sample.values(&check.field) {
        if let Some(text) = value.as_text() {
            if !reference.contains(&text) && seen.insert(text.clone()) {
                missing.push(text);
            }
        }
    }
    if !missing.is_empty() {
        findings.error(
            qualified(entity, &check.field),
            format!(
                "{} values have no match in {} (e.g. {})",
                missing.len(),
                check.reference,
                missing
                    .iter()
                    .take(MAX_EXAMPLES)
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            Severity::Critical,
        );
    }
    Ok(())
}

fn business(
    entity: &str,
    sample: &EntitySample,
    predicate: &str,
    critical: bool,
    ctx: &ValidationContext,
) -> RuleResult {
    let check = ctx
        .business
        .get(predicate)
        .ok_or_else(|| format!("unknown business predicate '{}'", predicate))?;
    let mut violations = 0;
    for record in &sample.records {
        if !check.check(record)? {
            violations += 1;
        }
    }
    let mut findings = Findings::default();
    if violations > 0 {
        findings.error(
            qualified(entity, predicate),
            format!(
                "{} of {} sampled records violate {}",
                violations,
                sample.records.len(),
                predicate
            ),
            if critical {
                Severity::Critical
            } else {
                Severity::Major
            },
        );
    }
    Ok(findings)
}

fn completeness(entity: &str, sample: &EntitySample, fields: &[String], threshold: f64) -> Findings {
    let mut findings = Findings::default();
    let total = sample.records.len();
    if total == 0 {
        return findings;
    }
    for field in fields {
        let present = sample.values(field).count();
        let ratio = present as f64 / total as f64;
        if ratio < threshold {
            findings.warn(
                qualified(entity, field),
                format!(
                    "{:.1}% non-null, below the {:.1}% threshold",
                    ratio * 100.0,
                    threshold * 100.0
                ),
            );
        }
    }
    findings
}

fn uniqueness(entity: &str, sample: &EntitySample, fields: &[String]) -> Findings {
    let mut findings = Findings::default();
    for field in fields {
        let mut seen = HashSet::new();
        let mut duplicates: Vec<String> = Vec::new();
        for value in sample.values(field) {
            let key = format!("{}:{}", value.type_name(), value);
            if !seen.insert(key) && !duplicates.contains(&value.to_string()) {
                duplicates.push(value.to_string());
            }
        }
        if !duplicates.is_empty() {
            findings.error(
                qualified(entity, field),
                format!(
                    "{} duplicated values (e.g. {})",
                    duplicates.len(),
                    duplicates
                        .iter()
                        .take(MAX_EXAMPLES)
                        .cloned()
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
                Severity::Critical,
            );
        }
    }
    findings
}

fn format(entity: &str, sample: &EntitySample, field: &str, pattern: &str) -> RuleResult {
    let re = compile(pattern)?;
    let bad = non_matching(sample, field, &re);
    let mut findings = Findings::default();
    if !bad.is_empty() {
        findings.warn(
            qualified(entity, field),
            format!(
                "{} sampled values do not match {} (e.g. {})",
                bad.len(),
                pattern,
                examples(bad.into_iter())
            ),
        );
    }
    Ok(findings)
}
