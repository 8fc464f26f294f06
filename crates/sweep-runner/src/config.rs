use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use sweep_core::{Attributes, PartitionPlan, SweepError};

#[derive(Debug, Clone, Deserialize)]
pub struct SweepConfig {
    #[serde(default)]
    pub version: Option<String>,
    pub experiment: ExperimentSection,
    pub dataset: DatasetSection,
    pub process: ProcessSection,
    pub partition: PartitionSection,
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub reconcile: ReconcileSection,
    /// Directory of the sweep file; relative paths resolve against it.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExperimentSection {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatasetSection {
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub grid: Option<BTreeMap<String, Value>>,
    #[serde(default = "default_repeat")]
    pub repeat: usize,
    #[serde(default)]
    pub standard_attributes: bool,
    #[serde(default)]
    pub attributes: Attributes,
    #[serde(default)]
    pub required_attributes: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProcessSection {
    pub command: Vec<String>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PartitionSection {
    pub rows_per_shard: usize,
    pub seed: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreSection {
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    #[serde(default = "default_read_attempts")]
    pub read_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            log_dir: None,
            read_attempts: default_read_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct ReconcileSection {
    #[serde(default)]
    pub lenient: bool,
    #[serde(default)]
    pub strict: bool,
}

fn default_repeat() -> usize {
    1
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("results")
}

fn default_read_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    5_000
}

/// Command-line values that win over the sweep file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub seed: Option<u64>,
    pub rows_per_shard: Option<usize>,
    /// Relative values resolve against the working directory, not the
    /// sweep file.
    pub output_dir: Option<PathBuf>,
    pub lenient: bool,
    pub strict: bool,
}

impl SweepConfig {
    pub fn output_dir(&self) -> PathBuf {
        self.resolve(&self.store.output_dir)
    }

    pub fn log_dir(&self) -> PathBuf {
        match &self.store.log_dir {
            Some(dir) => self.resolve(dir),
            None => self.output_dir().join("logs"),
        }
    }

    pub fn dataset_path(&self) -> Option<PathBuf> {
        self.dataset.path.as_ref().map(|p| self.resolve(p))
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.store.retry_delay_ms)
    }

    pub fn plan_for(&self, total_rows: usize) -> Result<PartitionPlan> {
        Ok(PartitionPlan::new(
            total_rows,
            self.partition.rows_per_shard,
            self.partition.seed,
        )?)
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    fn apply_overrides(&mut self, overrides: &ConfigOverrides) -> Result<()> {
        if let Some(seed) = overrides.seed {
            self.partition.seed = seed;
        }
        if let Some(rows) = overrides.rows_per_shard {
            self.partition.rows_per_shard = rows;
        }
        if let Some(dir) = &overrides.output_dir {
            self.store.output_dir = if dir.is_absolute() {
                dir.clone()
            } else {
                std::env::current_dir()
                    .context("failed to resolve the working directory")?
                    .join(dir)
            };
        }
        self.reconcile.lenient |= overrides.lenient;
        self.reconcile.strict |= overrides.strict;
        Ok(())
    }
}

pub fn load_sweep_config(path: &Path, overrides: &ConfigOverrides) -> Result<SweepConfig> {
    let raw_yaml = fs::read_to_string(path)
        .with_context(|| format!("failed to read sweep file {}", path.display()))?;
    let yaml_value: serde_yaml::Value = serde_yaml::from_str(&raw_yaml)
        .with_context(|| format!("failed to parse sweep file {}", path.display()))?;
    let json_value: Value = serde_json::to_value(yaml_value)?;
    validate_required_fields(&json_value)?;
    let mut config: SweepConfig = serde_json::from_value(json_value)
        .map_err(|e| SweepError::contract(format!("invalid sweep file: {}", e)))?;
    config.base_dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."))
        .to_path_buf();
    config.apply_overrides(overrides)?;
    validate_values(&config)?;
    Ok(config)
}

fn validate_required_fields(json_value: &Value) -> Result<()> {
    let mut missing = Vec::new();
    if json_value
        .pointer("/experiment/id")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().is_empty())
        .unwrap_or(true)
    {
        missing.push("/experiment/id");
    }
    let has_path = json_value.pointer("/dataset/path").is_some_and(|v| v.is_string());
    let has_grid = json_value.pointer("/dataset/grid").is_some_and(|v| v.is_object());
    if !has_path && !has_grid {
        missing.push("/dataset/path or /dataset/grid");
    }
    if json_value
        .pointer("/process/command")
        .and_then(|v| v.as_array())
        .map(|a| a.is_empty())
        .unwrap_or(true)
    {
        missing.push("/process/command");
    }
    if json_value
        .pointer("/partition/rows_per_shard")
        .and_then(|v| v.as_u64())
        .is_none()
    {
        missing.push("/partition/rows_per_shard");
    }
    if json_value
        .pointer("/partition/seed")
        .and_then(|v| v.as_u64())
        .is_none()
    {
        missing.push("/partition/seed");
    }
    if missing.is_empty() {
        return Ok(());
    }
    Err(SweepError::contract(format!(
        "sweep file is missing required fields: {}",
        missing.join(", ")
    ))
    .into())
}

fn validate_values(config: &SweepConfig) -> Result<()> {
    let mut problems = Vec::new();
    if config.partition.rows_per_shard == 0 {
        problems.push("partition.rows_per_shard must be > 0".to_string());
    }
    if config.dataset.path.is_some() && config.dataset.grid.is_some() {
        problems.push("dataset.path and dataset.grid are mutually exclusive".to_string());
    }
    if config.dataset.repeat == 0 {
        problems.push("dataset.repeat must be > 0".to_string());
    }
    if config.store.read_attempts == 0 {
        problems.push("store.read_attempts must be > 0".to_string());
    }
    if config.reconcile.lenient && config.reconcile.strict {
        problems.push("reconcile.lenient and reconcile.strict cannot both be set".to_string());
    }
    if problems.is_empty() {
        return Ok(());
    }
    Err(SweepError::contract(problems.join("; ")).into())
}

pub const SWEEP_TEMPLATE: &str = "\
version: '1'
experiment:
  id: ''                      # REQUIRED
dataset:
  grid:                       # cartesian product of the listed values
    a: [0, 1]
    b: [0, 1]
  # path: rows.jsonl          # alternative: one JSON object per line
  repeat: 1
  standard_attributes: true   # adds seed, datetime and commit
  attributes: {}
  required_attributes: []
process:
  command: []                 # REQUIRED: e.g. [python3, experiment.py]
partition:
  rows_per_shard: 1
  seed: 1234
store:
  output_dir: results
  read_attempts: 3
  retry_delay_ms: 5000
reconcile:
  lenient: false
  strict: false
";

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use sweep_core::ensure_dir;

    fn temp_root(tag: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!(
            "sweep_config_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ensure_dir(&root).expect("temp dir");
        root
    }

    #[test]
    fn template_with_id_and_command_loads() {
        let root = temp_root("template");
        let path = root.join("sweep.yaml");
        let yaml = SWEEP_TEMPLATE
            .replace("id: ''", "id: demo")
            .replace("command: []", "command: [sh, run.sh]");
        fs::write(&path, yaml).expect("write");
        let config = load_sweep_config(&path, &ConfigOverrides::default()).expect("load");
        assert_eq!(config.experiment.id, "demo");
        assert_eq!(config.partition.seed, 1234);
        assert_eq!(config.store.read_attempts, 3);
        assert_eq!(config.retry_delay(), Duration::from_secs(5));
        assert_eq!(config.output_dir(), root.join("results"));
        assert_eq!(config.log_dir(), root.join("results").join("logs"));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn missing_fields_are_reported_together() {
        let root = temp_root("missing");
        let path = root.join("sweep.yaml");
        fs::write(&path, "experiment: {}\ndataset: {}\nprocess: {}\npartition: {}\n")
            .expect("write");
        let err = load_sweep_config(&path, &ConfigOverrides::default()).expect_err("must fail");
        let msg = err.to_string();
        for field in [
            "/experiment/id",
            "/dataset/path or /dataset/grid",
            "/process/command",
            "/partition/rows_per_shard",
            "/partition/seed",
        ] {
            assert!(msg.contains(field), "missing {}: {}", field, msg);
        }
        assert!(matches!(
            err.downcast_ref::<SweepError>(),
            Some(SweepError::Contract(_))
        ));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn negative_seed_is_rejected() {
        let root = temp_root("seed");
        let path = root.join("sweep.yaml");
        fs::write(
            &path,
            "experiment: {id: x}
dataset: {grid: {a: [1]}}
process: {command: [sh]}
partition: {rows_per_shard: 2, seed: -1}
",
        )
        .expect("write");
        let err = load_sweep_config(&path, &ConfigOverrides::default()).expect_err("must fail");
        assert!(err.to_string().contains("/partition/seed"), "{}", err);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn overrides_win_and_zero_budget_fails() {
        let root = temp_root("overrides");
        let path = root.join("sweep.yaml");
        fs::write(
            &path,
            "experiment: {id: x}
dataset: {grid: {a: [1, 2]}}
process: {command: [sh]}
partition: {rows_per_shard: 2, seed: 9}
",
        )
        .expect("write");
        let overrides = ConfigOverrides {
            seed: Some(42),
            rows_per_shard: Some(5),
            output_dir: Some(PathBuf::from("/tmp/elsewhere")),
            ..Default::default()
        };
        let config = load_sweep_config(&path, &overrides).expect("load");
        assert_eq!(config.partition.seed, 42);
        assert_eq!(config.partition.rows_per_shard, 5);
        assert_eq!(config.output_dir(), PathBuf::from("/tmp/elsewhere"));

        let zero = ConfigOverrides {
            rows_per_shard: Some(0),
            ..Default::default()
        };
        let err = load_sweep_config(&path, &zero).expect_err("zero budget");
        assert!(err.to_string().contains("rows_per_shard must be > 0"), "{}", err);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn relative_output_dir_flag_resolves_against_working_directory() {
        let root = temp_root("cwd_override");
        let path = root.join("sweep.yaml");
        fs::write(
            &path,
            "experiment: {id: x}
dataset: {grid: {a: [1]}}
process: {command: [sh]}
partition: {rows_per_shard: 1, seed: 9}
store: {output_dir: from_file}
",
        )
        .expect("write");
        let from_file = load_sweep_config(&path, &ConfigOverrides::default()).expect("load");
        assert_eq!(from_file.output_dir(), root.join("from_file"));

        let overrides = ConfigOverrides {
            output_dir: Some(PathBuf::from("from_flag")),
            ..Default::default()
        };
        let config = load_sweep_config(&path, &overrides).expect("load");
        let cwd = std::env::current_dir().expect("cwd");
        assert_eq!(config.output_dir(), cwd.join("from_flag"));
        let _ = fs::remove_dir_all(root);
    }
}
