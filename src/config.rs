//! Declarative configuration: sheet types, validation rules, pipeline policy.
//!
//! The whole migration is driven by one YAML file loaded at startup. Sheet
//! types bind a workbook sheet name to its column mapping, staging tables,
//! validation rules and business-key recipe; the global sections control
//! upload limits, pipeline policy and the job pool.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config io: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
    /// Rule definitions by id; sheet types reference them by id.
    #[serde(default)]
    pub rules: HashMap<String, RuleConfig>,
    pub sheet_types: Vec<SheetTypeConfig>,
}

impl MigrationConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Enabled sheet types in execution order.
    pub fn enabled_sheets(&self) -> Vec<&SheetTypeConfig> {
        let mut sheets: Vec<_> = self.sheet_types.iter().filter(|s| s.enabled).collect();
        sheets.sort_by_key(|s| s.order);
        sheets
    }

    pub fn sheet(&self, name: &str) -> Option<&SheetTypeConfig> {
        self.sheet_types.iter().find(|s| s.name == name)
    }

    /// Resolve a sheet's rule ids to their definitions, in declared order.
    /// Unknown ids were already rejected at load.
    pub fn rules_for<'a>(&'a self, sheet: &'a SheetTypeConfig) -> Vec<(&'a str, &'a RuleConfig)> {
        sheet
            .rules
            .iter()
            .filter_map(|id| self.rules.get(id).map(|r| (id.as_str(), r)))
            .collect()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.sheet_types.is_empty() {
            return Err(ConfigError::Invalid("no sheet types configured".into()));
        }

        let mut names = HashSet::new();
        for sheet in &self.sheet_types {
            if !names.insert(sheet.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate sheet type name: {}",
                    sheet.name
                )));
            }
            if sheet.columns.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "sheet type {} has an empty column mapping",
                    sheet.name
                )));
            }
            let mut columns = HashSet::new();
            for mapping in &sheet.columns {
                if !columns.insert(mapping.column.as_str()) {
                    return Err(ConfigError::Invalid(format!(
                        "sheet type {}: duplicate canonical column {}",
                        sheet.name, mapping.column
                    )));
                }
            }
            for rule_id in &sheet.rules {
                if !self.rules.contains_key(rule_id) {
                    return Err(ConfigError::Invalid(format!(
                        "sheet type {}: unknown rule id {rule_id}",
                        sheet.name
                    )));
                }
            }
            sheet.business_key.validate(&sheet.name, &columns)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    #[serde(default = "default_upload_dir")]
    pub dir: String,
    #[serde(default = "default_max_payload")]
    pub max_payload_bytes: u64,
    #[serde(default = "default_extensions")]
    pub allowed_extensions: Vec<String>,
    /// Per-sheet data-row cap enforced at pre-save; 0 disables the check.
    #[serde(default = "default_max_rows")]
    pub max_rows_per_sheet: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            dir: default_upload_dir(),
            max_payload_bytes: default_max_payload(),
            allowed_extensions: default_extensions(),
            max_rows_per_sheet: default_max_rows(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub use_parallel_sheet_processing: bool,
    #[serde(default = "default_max_concurrent_sheets")]
    pub max_concurrent_sheets: usize,
    #[serde(default = "default_true")]
    pub continue_on_sheet_failure: bool,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_ingest_timeout")]
    pub ingest_timeout_ms: u64,
    #[serde(default = "default_validation_timeout")]
    pub validation_timeout_ms: u64,
    #[serde(default = "default_insert_timeout")]
    pub insert_timeout_ms: u64,
    #[serde(default = "default_sheet_timeout")]
    pub sheet_timeout_ms: u64,
    #[serde(default = "default_retry_attempts")]
    pub retry_max_attempts: u32,
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            use_parallel_sheet_processing: false,
            max_concurrent_sheets: default_max_concurrent_sheets(),
            continue_on_sheet_failure: true,
            batch_size: default_batch_size(),
            ingest_timeout_ms: default_ingest_timeout(),
            validation_timeout_ms: default_validation_timeout(),
            insert_timeout_ms: default_insert_timeout(),
            sheet_timeout_ms: default_sheet_timeout(),
            retry_max_attempts: default_retry_attempts(),
            retry_backoff_ms: default_retry_backoff(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    #[serde(default = "default_core_pool")]
    pub core_pool_size: usize,
    #[serde(default = "default_max_pool")]
    pub max_pool_size: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_circuit_threshold")]
    pub circuit_failure_threshold: u32,
    #[serde(default = "default_circuit_cooldown")]
    pub circuit_cooldown_ms: u64,
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_ms: u64,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            core_pool_size: default_core_pool(),
            max_pool_size: default_max_pool(),
            queue_capacity: default_queue_capacity(),
            circuit_failure_threshold: default_circuit_threshold(),
            circuit_cooldown_ms: default_circuit_cooldown(),
            shutdown_grace_ms: default_shutdown_grace(),
        }
    }
}

/// One sheet type: workbook sheet name bound to mapping, rules and tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SheetTypeConfig {
    pub name: String,
    pub order: u32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub raw_table: String,
    pub valid_table: String,
    pub error_table: String,
    pub master_table: String,
    /// Overrides the global pipeline batch size when set.
    #[serde(default)]
    pub batch_size: Option<usize>,
    /// Eligible for parallel dispatch when the global switch is on.
    #[serde(default)]
    pub parallel: bool,
    pub columns: Vec<ColumnMapping>,
    #[serde(default)]
    pub rules: Vec<String>,
    pub business_key: BusinessKeyRecipe,
}

impl SheetTypeConfig {
    pub fn effective_batch_size(&self, pipeline: &PipelineConfig) -> usize {
        self.batch_size.unwrap_or(pipeline.batch_size).max(1)
    }

    /// Expected header labels in mapping order, for the template check.
    pub fn expected_headers(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.header.as_str()).collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnMapping {
    /// Localized header label as it appears in the workbook.
    pub header: String,
    /// Canonical target column name.
    pub column: String,
    #[serde(default)]
    pub kind: NormalizeKind,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NormalizeKind {
    #[default]
    Text,
    Number,
    Date,
    Month,
}

/// Business-key recipe, optionally conditional on a discriminator column.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusinessKeyRecipe {
    #[serde(default)]
    pub discriminator: Option<String>,
    #[serde(default)]
    pub cases: Vec<KeyCase>,
    pub default: KeyParts,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyCase {
    /// Discriminator values this case applies to.
    pub when: Vec<String>,
    pub parts: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyParts {
    pub parts: Vec<String>,
}

impl BusinessKeyRecipe {
    fn validate(&self, sheet: &str, columns: &HashSet<&str>) -> Result<(), ConfigError> {
        if !self.cases.is_empty() && self.discriminator.is_none() {
            return Err(ConfigError::Invalid(format!(
                "sheet type {sheet}: key cases declared without a discriminator"
            )));
        }
        let check = |parts: &[String]| -> Result<(), ConfigError> {
            for part in parts {
                if !columns.contains(part.as_str()) {
                    return Err(ConfigError::Invalid(format!(
                        "sheet type {sheet}: business-key part {part} is not a mapped column"
                    )));
                }
            }
            Ok(())
        };
        check(&self.default.parts)?;
        for case in &self.cases {
            check(&case.parts)?;
        }
        Ok(())
    }
}

/// A validation rule definition: shared priority plus the typed payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    #[serde(default = "default_priority")]
    pub priority: u32,
    #[serde(flatten)]
    pub rule: RuleDef,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleDef {
    /// Listed fields must be non-null.
    RequiredField { fields: Vec<String> },

    /// Field must parse as the declared kind when present.
    DataType {
        field: String,
        data_type: NormalizeKind,
    },

    Pattern { field: String, regex: String },

    Enumeration {
        field: String,
        allowed: Vec<String>,
    },

    /// Duplicate detection within the file; defaults to the business key.
    UniqueInFile {
        #[serde(default)]
        field: Option<String>,
    },

    /// Duplicate detection against already-persisted keys.
    UniqueInDb {
        #[serde(default)]
        field: Option<String>,
        #[serde(default)]
        against: DbCheckTarget,
    },

    /// Field value must exist in a master relation column.
    ReferenceExists {
        field: String,
        table: String,
        column: String,
    },

    /// Named built-in predicate with free-form parameters.
    BusinessRule {
        name: String,
        #[serde(default)]
        params: HashMap<String, String>,
    },
}

/// Which relation duplicate-in-db checks compare against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DbCheckTarget {
    #[default]
    Master,
    ValidStaging,
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_upload_dir() -> String {
    "./uploads".to_string()
}

fn default_max_payload() -> u64 {
    100 * 1024 * 1024
}

fn default_extensions() -> Vec<String> {
    vec!["xlsx".to_string(), "xls".to_string()]
}

fn default_max_rows() -> u64 {
    10_000
}

fn default_max_concurrent_sheets() -> usize {
    3
}

fn default_true() -> bool {
    true
}

fn default_batch_size() -> usize {
    5_000
}

fn default_ingest_timeout() -> u64 {
    5 * 60 * 1000
}

fn default_validation_timeout() -> u64 {
    10 * 60 * 1000
}

fn default_insert_timeout() -> u64 {
    30 * 60 * 1000
}

fn default_sheet_timeout() -> u64 {
    30 * 60 * 1000
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_backoff() -> u64 {
    5_000
}

fn default_core_pool() -> usize {
    2
}

fn default_max_pool() -> usize {
    5
}

fn default_queue_capacity() -> usize {
    100
}

fn default_circuit_threshold() -> u32 {
    5
}

fn default_circuit_cooldown() -> u64 {
    30_000
}

fn default_shutdown_grace() -> u64 {
    5 * 60 * 1000
}

fn default_priority() -> u32 {
    100
}
