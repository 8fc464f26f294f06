use chrono::Utc;
use serde_json::{json, Value};
use std::fs;
use std::path::Path;
use std::process::Command;
use sweep_core::{Attributes, PartitionPlan};
use tracing::{debug, warn};

pub fn current_commit(project_dir: &Path) -> Option<String> {
    let output = match Command::new("git")
        .args(["rev-parse", "HEAD"])
        .current_dir(project_dir)
        .output()
    {
        Ok(output) => output,
        Err(err) => {
            warn!(error = %err, dir = %project_dir.display(), "could not run git to obtain commit");
            return None;
        }
    };
    if !output.status.success() {
        warn!(
            dir = %project_dir.display(),
            stderr = %String::from_utf8_lossy(&output.stderr).trim(),
            "error obtaining current commit hash"
        );
        return None;
    }
    let commit = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!commit.is_empty()).then_some(commit)
}

/// `seed`, `datetime` (day resolution) and `commit`, added at build time
/// when the sweep asks for them.
pub fn standard_attributes(seed: u64, project_dir: &Path) -> Attributes {
    let mut attrs = Attributes::new();
    attrs.insert("seed".to_string(), json!(seed));
    attrs.insert(
        "datetime".to_string(),
        json!(Utc::now().format("%Y-%m-%d").to_string()),
    );
    attrs.insert(
        "commit".to_string(),
        current_commit(project_dir).map(Value::String).unwrap_or(Value::Null),
    );
    attrs
}

/// Concatenates every regular file under `log_dir`, ordered by path, each
/// preceded by a header line naming it. A missing log area yields "".
pub fn collect_logs(log_dir: &Path) -> String {
    if !log_dir.is_dir() {
        debug!(dir = %log_dir.display(), "no log area");
        return String::new();
    }
    let mut files: Vec<_> = walkdir::WalkDir::new(log_dir)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(e) => Some(e),
            Err(err) => {
                warn!(error = %err, "skipping unreadable log entry");
                None
            }
        })
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .collect();
    files.sort();
    let mut out = String::new();
    for path in files {
        match fs::read(&path) {
            Ok(bytes) => {
                let rel = path.strip_prefix(log_dir).unwrap_or(&path);
                out.push_str(&format!("==> {} <==\n", rel.display()));
                out.push_str(&String::from_utf8_lossy(&bytes));
                if !out.ends_with('\n') {
                    out.push('\n');
                }
            }
            Err(err) => warn!(error = %err, path = %path.display(), "skipping unreadable log file"),
        }
    }
    out
}

/// Run-level metadata merged over the dataset attributes at reconciliation.
#[derive(Debug, Clone, PartialEq)]
pub struct RunMetadata {
    pub plan: PartitionPlan,
    pub commit: Option<String>,
    pub logs: String,
    pub reconciled_at: String,
}

impl RunMetadata {
    pub fn capture(plan: PartitionPlan, project_dir: &Path, log_dir: &Path) -> Self {
        Self {
            plan,
            commit: current_commit(project_dir),
            logs: collect_logs(log_dir),
            reconciled_at: Utc::now().to_rfc3339(),
        }
    }

    pub fn to_attributes(&self) -> Attributes {
        let mut attrs = Attributes::new();
        attrs.insert("seed".to_string(), json!(self.plan.seed));
        attrs.insert("rows_per_shard".to_string(), json!(self.plan.rows_per_shard));
        attrs.insert("commit".to_string(), json!(self.commit));
        attrs.insert("logs".to_string(), json!(self.logs));
        attrs.insert("reconciled_at".to_string(), json!(self.reconciled_at));
        attrs
    }
}
