//! Reassembly of shard outputs against the full dataset.
//!
//! Every original row appears exactly once in the combined result, sorted by
//! row index. `found` records whether its shard output was available; gaps
//! are data, not failure. Overlapping shards, rows that do not belong to the
//! shard that reported them, or artifacts produced under another plan abort
//! reconciliation.

use crate::store::ShardStore;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use sweep_core::{
    atomic_write_json_pretty, merge_attributes, Attributes, CombinedResult, CombinedRow,
    CombinedSummary, Dataset, PartitionPlan, RunStatus, ShardId, ShardResult,
    ShardRow, SweepError, SweepResult, COMBINED_RESULT_SCHEMA,
};
use tracing::{info, warn};

pub const COMBINED_FILE: &str = "combined_results.json";
pub const MISSING_ROWS_FILE: &str = "MISSING_ROWS.json";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileOptions {
    /// Skip shards whose reads exhaust their retries instead of failing.
    pub lenient: bool,
    /// Fail once the artifacts are written if any row is missing.
    pub strict: bool,
}

#[derive(Debug, Default)]
pub struct CollectedShards {
    pub results: Vec<ShardResult>,
    pub skipped: Vec<ShardId>,
}

#[derive(Debug, Clone)]
pub struct ReconcileOutcome {
    pub combined: CombinedResult,
    pub combined_path: PathBuf,
    pub missing_path: Option<PathBuf>,
    pub skipped: Vec<ShardId>,
}

impl ReconcileOutcome {
    pub fn status(&self) -> RunStatus {
        self.combined.summary.status
    }
}

pub fn collect_shards(store: &dyn ShardStore, lenient: bool) -> SweepResult<CollectedShards> {
    let mut collected = CollectedShards::default();
    for shard_id in store.list_shards()? {
        match store.read(shard_id) {
            Ok(Some(result)) => collected.results.push(result),
            Ok(None) => {
                warn!(shard_id = %shard_id, "listed shard artifact disappeared before it was read");
            }
            Err(err @ SweepError::RetriesExhausted { .. }) if lenient => {
                warn!(shard_id = %shard_id, error = %err, "skipping unreadable shard artifact");
                collected.skipped.push(shard_id);
            }
            Err(err) => return Err(err),
        }
    }
    Ok(collected)
}

/// Merges `shards` into the full row set of `dataset`. `metadata` is laid
/// over the dataset attributes.
pub fn reconcile(
    dataset: &Dataset,
    plan: &PartitionPlan,
    shards: &[ShardResult],
    metadata: &Attributes,
) -> SweepResult<CombinedResult> {
    dataset.validate()?;
    if plan.total_rows != dataset.len() {
        return Err(SweepError::contract(format!(
            "plan covers {} rows but the dataset has {}",
            plan.total_rows,
            dataset.len()
        )));
    }

    let owners = plan.owners();
    let mut by_index: BTreeMap<usize, (ShardId, &ShardRow)> = BTreeMap::new();
    let mut output_columns: BTreeSet<String> = BTreeSet::new();
    let mut shards_present: BTreeSet<ShardId> = BTreeSet::new();
    for shard in shards {
        if !plan.matches(shard.total_rows, shard.rows_per_shard, shard.seed) {
            return Err(SweepError::corrupt(format!(
                "shard {} was produced for total_rows={} rows_per_shard={} seed={}, \
                 but reconciliation uses total_rows={} rows_per_shard={} seed={}",
                shard.shard_id,
                shard.total_rows,
                shard.rows_per_shard,
                shard.seed,
                plan.total_rows,
                plan.rows_per_shard,
                plan.seed
            )));
        }
        if !shards_present.insert(shard.shard_id) {
            return Err(SweepError::corrupt(format!(
                "shard {} was supplied more than once",
                shard.shard_id
            )));
        }
        output_columns.extend(shard.output_columns.iter().cloned());
        for row in &shard.rows {
            check_row(dataset, &owners, shard.shard_id, row)?;
            if let Some((first, _)) = by_index.insert(row.index, (shard.shard_id, row)) {
                return Err(SweepError::corrupt(format!(
                    "row {} appears more than once (shard {} and shard {})",
                    row.index, first, shard.shard_id
                )));
            }
        }
    }

    let rows: Vec<CombinedRow> = dataset
        .rows
        .iter()
        .map(|row| match by_index.get(&row.index) {
            Some((_, shard_row)) => {
                let mut outputs = shard_row.outputs.clone();
                for col in &output_columns {
                    outputs.entry(col.clone()).or_insert(Value::Null);
                }
                CombinedRow {
                    index: row.index,
                    fields: row.fields.clone(),
                    found: true,
                    outputs: Some(outputs),
                    error: shard_row.error.clone(),
                }
            }
            None => CombinedRow {
                index: row.index,
                fields: row.fields.clone(),
                found: false,
                outputs: None,
                error: None,
            },
        })
        .collect();

    let found_rows = rows.iter().filter(|r| r.found).count();
    let error_rows = rows.iter().filter(|r| r.error.is_some()).count();
    let missing_rows = rows.len() - found_rows;
    let missing_shards: Vec<ShardId> = plan
        .shard_ids()
        .filter(|id| !shards_present.contains(id))
        .collect();
    let status = if missing_rows == 0 {
        RunStatus::Complete
    } else {
        RunStatus::CompleteWithGaps
    };

    Ok(CombinedResult {
        schema_version: COMBINED_RESULT_SCHEMA.to_string(),
        attributes: merge_attributes(&dataset.attributes, metadata),
        input_columns: dataset.columns(),
        output_columns: output_columns.into_iter().collect(),
        rows,
        summary: CombinedSummary {
            total_rows: plan.total_rows,
            found_rows,
            missing_rows,
            error_rows,
            num_shards: plan.num_shards(),
            shards_present: shards_present.into_iter().collect(),
            missing_shards,
            status,
        },
    })
}

fn check_row(
    dataset: &Dataset,
    owners: &[ShardId],
    shard_id: ShardId,
    row: &ShardRow,
) -> SweepResult<()> {
    let Some(original) = dataset.rows.get(row.index) else {
        return Err(SweepError::corrupt(format!(
            "shard {} reports row {} but the dataset has {} rows",
            shard_id,
            row.index,
            dataset.len()
        )));
    };
    if owners[row.index] != shard_id {
        return Err(SweepError::corrupt(format!(
            "shard {} reports row {} which the plan assigns to shard {}",
            shard_id, row.index, owners[row.index]
        )));
    }
    if original.fields != row.fields {
        return Err(SweepError::corrupt(format!(
            "row {} in shard {} does not match the dataset; it changed after execution",
            row.index, shard_id
        )));
    }
    Ok(())
}

/// Writes the combined result and, when rows are missing, the missing-rows
/// artifact. A missing-rows artifact left by an earlier, less complete
/// reconciliation is removed once nothing is missing.
pub fn persist(
    output_dir: &Path,
    combined: &CombinedResult,
) -> SweepResult<(PathBuf, Option<PathBuf>)> {
    let combined_path = output_dir.join(COMBINED_FILE);
    atomic_write_json_pretty(&combined_path, combined)?;
    let missing_path = output_dir.join(MISSING_ROWS_FILE);
    match combined.missing_rows() {
        Some(missing) => {
            atomic_write_json_pretty(&missing_path, &missing)?;
            Ok((combined_path, Some(missing_path)))
        }
        None => {
            match fs::remove_file(&missing_path) {
                Ok(()) => info!(
                    path = %missing_path.display(),
                    "removed stale missing-rows artifact"
                ),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(SweepError::storage(&missing_path, e)),
            }
            Ok((combined_path, None))
        }
    }
}

/// Collects, reconciles and persists. In strict mode a gap becomes
/// `SweepError::Incomplete` after both artifacts are on disk.
pub fn reconcile_run(
    dataset: &Dataset,
    plan: &PartitionPlan,
    store: &dyn ShardStore,
    output_dir: &Path,
    metadata: &Attributes,
    options: ReconcileOptions,
) -> SweepResult<ReconcileOutcome> {
    let collected = collect_shards(store, options.lenient)?;
    let combined = reconcile(dataset, plan, &collected.results, metadata)?;
    let (combined_path, missing_path) = persist(output_dir, &combined)?;
    let summary = &combined.summary;
    if let Some(path) = &missing_path {
        warn!(
            missing_rows = summary.missing_rows,
            total_rows = summary.total_rows,
            missing_shards = ?summary.missing_shards,
            path = %path.display(),
            "could not find all shard results; see the missing rows artifact"
        );
    } else {
        info!(
            total_rows = summary.total_rows,
            error_rows = summary.error_rows,
            path = %combined_path.display(),
            "all shard results found"
        );
    }
    if options.strict && summary.missing_rows > 0 {
        return Err(SweepError::Incomplete {
            missing: summary.missing_rows,
            total: summary.total_rows,
            shards: summary.missing_shards.iter().map(|id| id.get()).collect(),
        });
    }
    Ok(ReconcileOutcome {
        combined,
        combined_path,
        missing_path,
        skipped: collected.skipped,
    })
}
