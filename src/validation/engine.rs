//! Rule compilation and batch evaluation.
//!
//! Rules are declared in configuration and compiled once per sheet at job
//! start: regexes are built, rule ids resolved, and priorities fixed. The
//! engine itself is synchronous; duplicate-in-db and reference lookups are
//! described as grouped `LookupSpec`s, resolved by the caller in one query
//! per rule per batch, and handed back through the context.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use regex::Regex;
use tracing::warn;

use super::{ErrorKind, LookupKey, LookupSpec, RowError};
use crate::config::{
    ConfigError, DbCheckTarget, MigrationConfig, NormalizeKind, RuleDef, SheetTypeConfig,
};
use crate::mapping::{parse_date, parse_month, parse_number, RawRecord};

const SLOW_RULE_MS: u128 = 100;

/// Verdict for one row: empty errors means valid.
#[derive(Debug, Clone)]
pub struct RowOutcome {
    pub row_number: i64,
    pub business_key: String,
    pub errors: Vec<RowError>,
}

impl RowOutcome {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

#[derive(Debug)]
enum Check {
    RequiredField {
        fields: Vec<String>,
    },
    DataType {
        field: String,
        kind: NormalizeKind,
    },
    Pattern {
        field: String,
        regex: Regex,
    },
    Enumeration {
        field: String,
        allowed: Vec<String>,
    },
    UniqueInFile {
        field: Option<String>,
    },
    UniqueInDb {
        field: Option<String>,
        table: String,
        key: LookupKey,
    },
    ReferenceExists {
        field: String,
        table: String,
        column: String,
    },
    NonNegativeNumber {
        field: String,
    },
    DateNotInFuture {
        field: String,
    },
}

#[derive(Debug)]
struct CompiledRule {
    id: String,
    priority: u32,
    check: Check,
}

/// Per-job state shared across batches: the in-file seen-sets, plus the
/// per-batch grouped lookup results.
#[derive(Debug, Default)]
pub struct JobValidationContext {
    seen: HashMap<String, HashSet<String>>,
    existing: HashMap<String, HashSet<String>>,
}

impl JobValidationContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the result of one grouped lookup before validating a batch.
    pub fn set_existing(&mut self, rule_id: &str, keys: HashSet<String>) {
        self.existing.insert(rule_id.to_string(), keys);
    }
}

pub struct ValidationEngine {
    rules: Vec<CompiledRule>,
}

impl ValidationEngine {
    /// Compile the sheet's declared rule ids, ordered by priority.
    pub fn for_sheet(
        config: &MigrationConfig,
        sheet: &SheetTypeConfig,
    ) -> Result<Self, ConfigError> {
        let mut rules = Vec::new();
        for (id, rule_config) in config.rules_for(sheet) {
            let check = compile_check(&rule_config.rule, sheet, id)?;
            rules.push(CompiledRule {
                id: id.to_string(),
                priority: rule_config.priority,
                check,
            });
        }
        rules.sort_by_key(|r| r.priority);
        Ok(Self { rules })
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Grouped DB lookups this batch needs, one spec per db-backed rule.
    pub fn lookup_specs(&self, batch: &[RawRecord]) -> Vec<LookupSpec> {
        let mut specs = Vec::new();
        for rule in &self.rules {
            match &rule.check {
                Check::UniqueInDb { field, table, key } => {
                    let keys: Vec<String> = batch
                        .iter()
                        .filter_map(|r| dedup_key(r, field.as_deref()))
                        .collect();
                    if !keys.is_empty() {
                        specs.push(LookupSpec {
                            rule_id: rule.id.clone(),
                            table: table.clone(),
                            key: key.clone(),
                            keys,
                        });
                    }
                }
                Check::ReferenceExists { field, table, column } => {
                    let keys: Vec<String> = batch
                        .iter()
                        .filter_map(|r| r.value(field).map(str::to_string))
                        .collect();
                    if !keys.is_empty() {
                        specs.push(LookupSpec {
                            rule_id: rule.id.clone(),
                            table: table.clone(),
                            key: LookupKey::Column(column.clone()),
                            keys,
                        });
                    }
                }
                _ => {}
            }
        }
        specs
    }

    /// Run every rule over every record, collecting all errors per row.
    pub fn validate_batch(
        &self,
        batch: &[RawRecord],
        ctx: &mut JobValidationContext,
    ) -> Vec<RowOutcome> {
        batch
            .iter()
            .map(|record| {
                let mut errors = Vec::new();
                for rule in &self.rules {
                    let started = Instant::now();
                    self.apply(rule, record, ctx, &mut errors);
                    let elapsed = started.elapsed().as_millis();
                    if elapsed > SLOW_RULE_MS {
                        warn!(
                            rule = %rule.id,
                            row = record.row_number,
                            elapsed_ms = elapsed as u64,
                            "slow validation rule"
                        );
                    }
                }
                RowOutcome {
                    row_number: record.row_number,
                    business_key: record.business_key.clone(),
                    errors,
                }
            })
            .collect()
    }

    fn apply(
        &self,
        rule: &CompiledRule,
        record: &RawRecord,
        ctx: &mut JobValidationContext,
        errors: &mut Vec<RowError>,
    ) {
        match &rule.check {
            Check::RequiredField { fields } => {
                for field in fields {
                    if record.value(field).is_none() {
                        errors.push(row_error(
                            rule,
                            ErrorKind::RequiredMissing,
                            field,
                            None,
                            format!("{field} is required"),
                        ));
                    }
                }
            }
            Check::DataType { field, kind } => {
                if let Some(value) = record.value(field) {
                    match kind {
                        NormalizeKind::Date => {
                            if parse_date(value).is_none() {
                                errors.push(row_error(
                                    rule,
                                    ErrorKind::InvalidDate,
                                    field,
                                    Some(value),
                                    format!("{field} is not a recognized date: {value}"),
                                ));
                            }
                        }
                        NormalizeKind::Month => {
                            if parse_month(value).is_none() {
                                errors.push(row_error(
                                    rule,
                                    ErrorKind::InvalidDate,
                                    field,
                                    Some(value),
                                    format!("{field} is not a recognized month: {value}"),
                                ));
                            }
                        }
                        NormalizeKind::Number => {
                            if parse_number(value).is_none() {
                                errors.push(row_error(
                                    rule,
                                    ErrorKind::FieldValidation,
                                    field,
                                    Some(value),
                                    format!("{field} is not numeric: {value}"),
                                ));
                            }
                        }
                        NormalizeKind::Text => {}
                    }
                }
            }
            Check::Pattern { field, regex } => {
                if let Some(value) = record.value(field) {
                    if !regex.is_match(value) {
                        errors.push(row_error(
                            rule,
                            ErrorKind::InvalidPattern,
                            field,
                            Some(value),
                            format!("{field} does not match {}", regex.as_str()),
                        ));
                    }
                }
            }
            Check::Enumeration { field, allowed } => {
                if let Some(value) = record.value(field) {
                    if !allowed.iter().any(|a| a == value) {
                        errors.push(row_error(
                            rule,
                            ErrorKind::InvalidEnum,
                            field,
                            Some(value),
                            format!("{field} must be one of [{}]", allowed.join(", ")),
                        ));
                    }
                }
            }
            Check::UniqueInFile { field } => {
                if let Some(key) = dedup_key(record, field.as_deref()) {
                    let seen = ctx.seen.entry(rule.id.clone()).or_default();
                    if !seen.insert(key.clone()) {
                        errors.push(row_error(
                            rule,
                            ErrorKind::DupInFile,
                            field.as_deref().unwrap_or("business_key"),
                            Some(&key),
                            format!("duplicate within file: {key}"),
                        ));
                    }
                }
            }
            Check::UniqueInDb { field, .. } => {
                if let Some(key) = dedup_key(record, field.as_deref()) {
                    if ctx
                        .existing
                        .get(&rule.id)
                        .map(|set| set.contains(&key))
                        .unwrap_or(false)
                    {
                        errors.push(row_error(
                            rule,
                            ErrorKind::DupInDb,
                            field.as_deref().unwrap_or("business_key"),
                            Some(&key),
                            format!("already persisted: {key}"),
                        ));
                    }
                }
            }
            Check::ReferenceExists { field, table, .. } => {
                if let Some(value) = record.value(field) {
                    let found = ctx
                        .existing
                        .get(&rule.id)
                        .map(|set| set.contains(value))
                        .unwrap_or(false);
                    if !found {
                        errors.push(row_error(
                            rule,
                            ErrorKind::RefNotFound,
                            field,
                            Some(value),
                            format!("{field}={value} not found in {table}"),
                        ));
                    }
                }
            }
            Check::NonNegativeNumber { field } => {
                if let Some(value) = record.value(field) {
                    if parse_number(value).map(|n| n < 0.0).unwrap_or(false) {
                        errors.push(row_error(
                            rule,
                            ErrorKind::BusinessRule,
                            field,
                            Some(value),
                            format!("{field} must not be negative"),
                        ));
                    }
                }
            }
            Check::DateNotInFuture { field } => {
                if let Some(value) = record.value(field) {
                    if let Some(date) = parse_date(value) {
                        if date > chrono::Utc::now().date_naive() {
                            errors.push(row_error(
                                rule,
                                ErrorKind::BusinessRule,
                                field,
                                Some(value),
                                format!("{field} must not be in the future"),
                            ));
                        }
                    }
                }
            }
        }
    }
}

/// The key a duplicate rule tracks: an explicit field's value, or the
/// business key. Rows whose key is empty are skipped; empties would all
/// collide, and the required-field rule owns that failure.
fn dedup_key(record: &RawRecord, field: Option<&str>) -> Option<String> {
    let key = match field {
        Some(f) => record.value(f)?.to_string(),
        None => record.business_key.clone(),
    };
    if key.chars().all(|c| c == '_' || c.is_whitespace()) {
        None
    } else {
        Some(key)
    }
}

fn row_error(
    rule: &CompiledRule,
    kind: ErrorKind,
    field: &str,
    value: Option<&str>,
    message: String,
) -> RowError {
    RowError {
        kind,
        field: field.to_string(),
        value: value.map(str::to_string),
        message,
        rule_id: rule.id.clone(),
    }
}

fn compile_check(
    rule: &RuleDef,
    sheet: &SheetTypeConfig,
    id: &str,
) -> Result<Check, ConfigError> {
    Ok(match rule {
        RuleDef::RequiredField { fields } => Check::RequiredField {
            fields: fields.clone(),
        },
        RuleDef::DataType { field, data_type } => Check::DataType {
            field: field.clone(),
            kind: *data_type,
        },
        RuleDef::Pattern { field, regex } => Check::Pattern {
            field: field.clone(),
            regex: Regex::new(regex).map_err(|e| {
                ConfigError::Invalid(format!("rule {id}: bad pattern {regex}: {e}"))
            })?,
        },
        RuleDef::Enumeration { field, allowed } => Check::Enumeration {
            field: field.clone(),
            allowed: allowed.clone(),
        },
        RuleDef::UniqueInFile { field } => Check::UniqueInFile {
            field: field.clone(),
        },
        RuleDef::UniqueInDb { field, against } => {
            let (table, key) = match against {
                DbCheckTarget::Master => (sheet.master_table.clone(), db_key(field)),
                DbCheckTarget::ValidStaging => (sheet.valid_table.clone(), db_key(field)),
            };
            Check::UniqueInDb {
                field: field.clone(),
                table,
                key,
            }
        }
        RuleDef::ReferenceExists { field, table, column } => Check::ReferenceExists {
            field: field.clone(),
            table: table.clone(),
            column: column.clone(),
        },
        RuleDef::BusinessRule { name, params } => match name.as_str() {
            "non_negative_number" => Check::NonNegativeNumber {
                field: required_param(id, params, "field")?,
            },
            "date_not_in_future" => Check::DateNotInFuture {
                field: required_param(id, params, "field")?,
            },
            other => {
                return Err(ConfigError::Invalid(format!(
                    "rule {id}: unknown business rule {other}"
                )))
            }
        },
    })
}

fn db_key(field: &Option<String>) -> LookupKey {
    match field {
        Some(f) => LookupKey::PayloadField(f.clone()),
        None => LookupKey::BusinessKey,
    }
}

fn required_param(
    id: &str,
    params: &std::collections::HashMap<String, String>,
    key: &str,
) -> Result<String, ConfigError> {
    params
        .get(key)
        .cloned()
        .ok_or_else(|| ConfigError::Invalid(format!("rule {id}: missing param {key}")))
}
