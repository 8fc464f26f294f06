//! The two-function contract between the harness and user code.
//!
//! `build` produces the full ordered dataset; `process` maps one merged row
//! to its output fields. In-process implementations implement the trait
//! directly; [`CommandExperiment`] drives an external program described in a
//! sweep file.

use crate::config::SweepConfig;
use crate::provenance::standard_attributes;
use anyhow::{anyhow, Context, Result};
use serde_json::Value;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use sweep_core::{Attributes, Dataset, Fields, SweepError};

pub trait Experiment {
    fn build(&self) -> Result<Dataset>;

    fn process(&self, input: &Fields) -> Result<Fields>;

    /// Attribute names `process` relies on. Executing a shard whose dataset
    /// lacks one of them is a setup error.
    fn required_attributes(&self) -> Vec<String> {
        Vec::new()
    }
}

pub struct CommandExperiment {
    command: Vec<String>,
    working_dir: PathBuf,
    source: RowSource,
    repeat: usize,
    attributes: Attributes,
    standard_attributes: Option<u64>,
    required_attributes: Vec<String>,
}

enum RowSource {
    Grid(Vec<(String, Vec<Value>)>),
    JsonLines(PathBuf),
}

impl CommandExperiment {
    pub fn from_config(config: &SweepConfig) -> Result<Self> {
        let source = match (&config.dataset.grid, config.dataset_path()) {
            (Some(grid), None) => RowSource::Grid(
                grid.iter()
                    .map(|(k, v)| (k.clone(), grid_values(v)))
                    .collect(),
            ),
            (None, Some(path)) => RowSource::JsonLines(path),
            _ => {
                return Err(SweepError::contract(
                    "dataset needs exactly one of dataset.path or dataset.grid",
                )
                .into())
            }
        };
        if config.process.command.is_empty() {
            return Err(SweepError::contract("process.command is empty").into());
        }
        Ok(Self {
            command: config.process.command.clone(),
            working_dir: config.base_dir.clone(),
            source,
            repeat: config.dataset.repeat,
            attributes: config.dataset.attributes.clone(),
            standard_attributes: config
                .dataset
                .standard_attributes
                .then_some(config.partition.seed),
            required_attributes: config.dataset.required_attributes.clone(),
        })
    }

    fn base_rows(&self) -> Result<Vec<Fields>> {
        match &self.source {
            RowSource::Grid(axes) => Ok(grid_rows(axes)),
            RowSource::JsonLines(path) => load_rows(path),
        }
    }
}

impl Experiment for CommandExperiment {
    fn build(&self) -> Result<Dataset> {
        let base = self.base_rows()?;
        let mut rows = Vec::with_capacity(base.len() * self.repeat);
        for _ in 0..self.repeat {
            rows.extend(base.iter().cloned());
        }
        let mut attributes = Attributes::new();
        if let Some(seed) = self.standard_attributes {
            attributes.extend(standard_attributes(seed, &self.working_dir));
        }
        attributes.extend(self.attributes.clone());
        let dataset = Dataset::from_fields(rows, attributes);
        dataset.validate()?;
        Ok(dataset)
    }

    fn process(&self, input: &Fields) -> Result<Fields> {
        run_row_command(&self.command, &self.working_dir, input)
    }

    fn required_attributes(&self) -> Vec<String> {
        self.required_attributes.clone()
    }
}

fn grid_values(value: &Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items.clone(),
        other => vec![other.clone()],
    }
}

/// Cartesian product of the axes; the last axis varies fastest.
fn grid_rows(axes: &[(String, Vec<Value>)]) -> Vec<Fields> {
    let mut rows = vec![Fields::new()];
    for (name, values) in axes {
        let mut next = Vec::with_capacity(rows.len() * values.len());
        for row in &rows {
            for value in values {
                let mut extended = row.clone();
                extended.insert(name.clone(), value.clone());
                next.push(extended);
            }
        }
        rows = next;
    }
    rows
}

fn load_rows(path: &Path) -> Result<Vec<Fields>> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("failed to read dataset {}", path.display()))?;
    let mut rows = Vec::new();
    for (lineno, line) in data.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let value: Value = serde_json::from_str(line)
            .with_context(|| format!("{}:{}: invalid JSON", path.display(), lineno + 1))?;
        match value {
            Value::Object(map) => rows.push(map.into_iter().collect()),
            other => {
                return Err(SweepError::contract(format!(
                    "{}:{}: row must be a JSON object, got {}",
                    path.display(),
                    lineno + 1,
                    value_type_name(&other)
                ))
                .into())
            }
        }
    }
    Ok(rows)
}

/// Runs the row command with the merged input on stdin and parses the last
/// non-empty stdout line as the row's output object.
fn run_row_command(command: &[String], working_dir: &Path, input: &Fields) -> Result<Fields> {
    let (program, args) = command
        .split_first()
        .ok_or_else(|| anyhow!("process command is empty"))?;
    let mut payload = serde_json::to_vec(input)?;
    payload.push(b'\n');

    let mut child = Command::new(program)
        .args(args)
        .current_dir(working_dir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("failed to spawn {:?}", command))?;
    if let Some(mut stdin) = child.stdin.take() {
        // A child that exits without reading its input closes the pipe early;
        // its exit status decides the outcome.
        let _ = stdin.write_all(&payload);
    }
    let output = child.wait_with_output()?;

    let stderr_tail = String::from_utf8_lossy(&output.stderr)
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("")
        .to_string();
    if !output.status.success() {
        let status = output
            .status
            .code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        return Err(anyhow!(
            "process command exited with status {}: {}",
            status,
            stderr_tail
        ));
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    let last = stdout
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .ok_or_else(|| anyhow!("process command produced no output"))?;
    match serde_json::from_str::<Value>(last.trim()) {
        Ok(Value::Object(map)) => Ok(map.into_iter().collect()),
        Ok(other) => Err(anyhow!(
            "process output must be a JSON object, got {}",
            value_type_name(&other)
        )),
        Err(e) => Err(anyhow!("process output is not JSON ({}): {}", e, last.trim())),
    }
}

fn value_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn grid_is_a_cartesian_product_with_scalars_wrapped() {
        let axes = vec![
            ("a".to_string(), grid_values(&json!([0, 1]))),
            ("b".to_string(), grid_values(&json!([0, 1]))),
            ("c".to_string(), grid_values(&json!("fixed"))),
        ];
        let rows = grid_rows(&axes);
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[0]["a"], json!(0));
        assert_eq!(rows[1]["b"], json!(1));
        assert_eq!(rows[2]["a"], json!(1));
        assert!(rows.iter().all(|r| r["c"] == json!("fixed")));
    }

    #[test]
    fn empty_axis_yields_no_rows() {
        let axes = vec![("a".to_string(), Vec::new())];
        assert!(grid_rows(&axes).is_empty());
    }

    #[test]
    fn jsonl_rows_must_be_objects() {
        let root = std::env::temp_dir().join(format!(
            "sweep_jsonl_test_{}_{}",
            std::process::id(),
            chrono::Utc::now().timestamp_micros()
        ));
        sweep_core::ensure_dir(&root).expect("dir");
        let good = root.join("good.jsonl");
        fs::write(&good, "{\"a\": 1}\n\n{\"a\": 2}\n").expect("write");
        let rows = load_rows(&good).expect("rows");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1]["a"], json!(2));

        let bad = root.join("bad.jsonl");
        fs::write(&bad, "{\"a\": 1}\n[1, 2]\n").expect("write");
        let err = load_rows(&bad).expect_err("array row");
        assert!(err.to_string().contains("must be a JSON object"), "{}", err);
        let _ = fs::remove_dir_all(root);
    }

    #[cfg(unix)]
    #[test]
    fn row_command_parses_last_stdout_line() {
        let command = vec![
            "sh".to_string(),
            "-c".to_string(),
            "cat > /dev/null; echo progress; echo '{\"result\": 3}'".to_string(),
        ];
        let input: Fields = serde_json::from_value(json!({"a": 1, "b": 2})).expect("fields");
        let out = run_row_command(&command, Path::new("."), &input).expect("output");
        assert_eq!(out["result"], json!(3));
    }

    #[cfg(unix)]
    #[test]
    fn row_command_failure_carries_stderr_tail() {
        let command = vec![
            "sh".to_string(),
            "-c".to_string(),
            "cat > /dev/null; echo 'division by zero' >&2; exit 3".to_string(),
        ];
        let err = run_row_command(&command, Path::new("."), &Fields::new()).expect_err("fail");
        let msg = err.to_string();
        assert!(msg.contains("status 3"), "{}", msg);
        assert!(msg.contains("division by zero"), "{}", msg);
    }

    #[cfg(unix)]
    #[test]
    fn row_command_rejects_non_object_output() {
        let command = vec![
            "sh".to_string(),
            "-c".to_string(),
            "cat > /dev/null; echo '[1]'".to_string(),
        ];
        let err = run_row_command(&command, Path::new("."), &Fields::new()).expect_err("fail");
        assert!(err.to_string().contains("must be a JSON object"), "{}", err);
    }
}
