use crate::error::{SweepError, SweepResult};
use crate::fsutil::canonical_json_digest;
use crate::plan::{PartitionPlan, ShardId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Range;

pub const SHARD_RESULT_SCHEMA: &str = "shard_result_v1";
pub const COMBINED_RESULT_SCHEMA: &str = "combined_result_v1";
pub const MISSING_ROWS_SCHEMA: &str = "missing_rows_v1";

pub type Fields = BTreeMap<String, Value>;
pub type Attributes = BTreeMap<String, Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub index: usize,
    pub fields: Fields,
}

/// The Builder's output: ordered rows plus attributes shared by all of them.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Dataset {
    pub rows: Vec<Row>,
    pub attributes: Attributes,
}

impl Dataset {
    /// Builds a dataset from field maps, assigning each row its position as
    /// its index.
    pub fn from_fields(rows: Vec<Fields>, attributes: Attributes) -> Self {
        let rows = rows
            .into_iter()
            .enumerate()
            .map(|(index, fields)| Row { index, fields })
            .collect();
        Self { rows, attributes }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Checks the Builder contract: non-empty, and every row's index equals
    /// its position.
    pub fn validate(&self) -> SweepResult<()> {
        if self.rows.is_empty() {
            return Err(SweepError::contract("builder returned no rows"));
        }
        for (pos, row) in self.rows.iter().enumerate() {
            if row.index != pos {
                return Err(SweepError::contract(format!(
                    "row at position {} carries index {}",
                    pos, row.index
                )));
            }
        }
        Ok(())
    }

    /// Sorted union of field names across all rows.
    pub fn columns(&self) -> Vec<String> {
        let cols: BTreeSet<&String> = self.rows.iter().flat_map(|r| r.fields.keys()).collect();
        cols.into_iter().cloned().collect()
    }

    /// Input handed to the process function: attributes first, then row
    /// fields, so a row field wins over an attribute with the same name.
    pub fn merged_input(&self, row: &Row) -> Fields {
        let mut merged = self.attributes.clone();
        for (k, v) in &row.fields {
            merged.insert(k.clone(), v.clone());
        }
        merged
    }
}

/// Result of processing one row.
pub type RowOutcome = std::result::Result<Fields, String>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardRow {
    pub index: usize,
    pub fields: Fields,
    /// Every output column of the shard; `null` where the row has no value.
    pub outputs: Fields,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRange {
    pub start: usize,
    pub end: usize,
}

impl From<Range<usize>> for IndexRange {
    fn from(r: Range<usize>) -> Self {
        Self {
            start: r.start,
            end: r.end,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardResult {
    pub schema_version: String,
    pub shard_id: ShardId,
    pub total_rows: usize,
    pub rows_per_shard: usize,
    pub seed: u64,
    pub range: IndexRange,
    pub input_columns: Vec<String>,
    pub output_columns: Vec<String>,
    pub created_at: String,
    pub rows: Vec<ShardRow>,
    pub digest: String,
}

impl ShardResult {
    /// Joins input rows with their outcomes. Output columns are the sorted
    /// union of all successful rows' keys, and every row is expanded to that
    /// column set.
    pub fn assemble(
        plan: &PartitionPlan,
        shard_id: ShardId,
        processed: Vec<(Row, RowOutcome)>,
    ) -> SweepResult<Self> {
        let range = plan.shard_range(shard_id)?;
        let input_columns: BTreeSet<String> = processed
            .iter()
            .flat_map(|(row, _)| row.fields.keys().cloned())
            .collect();
        let output_columns: BTreeSet<String> = processed
            .iter()
            .filter_map(|(_, outcome)| outcome.as_ref().ok())
            .flat_map(|out| out.keys().cloned())
            .collect();
        let rows: Vec<ShardRow> = processed
            .into_iter()
            .map(|(row, outcome)| {
                let (mut outputs, error) = match outcome {
                    Ok(out) => (out, None),
                    Err(desc) => (Fields::new(), Some(desc)),
                };
                for col in &output_columns {
                    outputs.entry(col.clone()).or_insert(Value::Null);
                }
                ShardRow {
                    index: row.index,
                    fields: row.fields,
                    outputs,
                    error,
                }
            })
            .collect();
        let digest = canonical_json_digest(&rows)?;
        Ok(Self {
            schema_version: SHARD_RESULT_SCHEMA.to_string(),
            shard_id,
            total_rows: plan.total_rows,
            rows_per_shard: plan.rows_per_shard,
            seed: plan.seed,
            range: range.into(),
            input_columns: input_columns.into_iter().collect(),
            output_columns: output_columns.into_iter().collect(),
            created_at: chrono::Utc::now().to_rfc3339(),
            rows,
            digest,
        })
    }

    pub fn verify_digest(&self) -> SweepResult<bool> {
        Ok(canonical_json_digest(&self.rows)? == self.digest)
    }

    pub fn error_rows(&self) -> usize {
        self.rows.iter().filter(|r| r.error.is_some()).count()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombinedRow {
    pub index: usize,
    pub fields: Fields,
    pub found: bool,
    pub outputs: Option<Fields>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Complete,
    CompleteWithGaps,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Complete => "complete",
            RunStatus::CompleteWithGaps => "complete_with_gaps",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombinedSummary {
    pub total_rows: usize,
    pub found_rows: usize,
    pub missing_rows: usize,
    pub error_rows: usize,
    pub num_shards: usize,
    pub shards_present: Vec<ShardId>,
    pub missing_shards: Vec<ShardId>,
    pub status: RunStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombinedResult {
    pub schema_version: String,
    pub attributes: Attributes,
    pub input_columns: Vec<String>,
    pub output_columns: Vec<String>,
    pub rows: Vec<CombinedRow>,
    pub summary: CombinedSummary,
}

impl CombinedResult {
    pub fn missing(&self) -> impl Iterator<Item = &CombinedRow> {
        self.rows.iter().filter(|r| !r.found)
    }

    pub fn missing_rows(&self) -> Option<MissingRows> {
        let rows: Vec<Row> = self
            .missing()
            .map(|r| Row {
                index: r.index,
                fields: r.fields.clone(),
            })
            .collect();
        if rows.is_empty() {
            return None;
        }
        Some(MissingRows {
            schema_version: MISSING_ROWS_SCHEMA.to_string(),
            rows,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissingRows {
    pub schema_version: String,
    pub rows: Vec<Row>,
}

/// Override union: keys in `overlay` replace keys in `base`.
pub fn merge_attributes(base: &Attributes, overlay: &Attributes) -> Attributes {
    let mut merged = base.clone();
    for (k, v) in overlay {
        merged.insert(k.clone(), v.clone());
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(v: Value) -> Fields {
        serde_json::from_value(v).expect("object")
    }

    #[test]
    fn row_fields_take_precedence_over_attributes() {
        let dataset = Dataset::from_fields(
            vec![fields(json!({"a": 1, "seed": 7})), fields(json!({"a": 2}))],
            fields(json!({"seed": 1234, "commit": "abc"})),
        );
        let first = dataset.merged_input(&dataset.rows[0]);
        assert_eq!(first["seed"], json!(7));
        assert_eq!(first["commit"], json!("abc"));
        let second = dataset.merged_input(&dataset.rows[1]);
        assert_eq!(second["seed"], json!(1234));
        assert_eq!(second["a"], json!(2));
    }

    #[test]
    fn validate_rejects_empty_and_misnumbered_rows() {
        assert!(Dataset::default().validate().is_err());
        let mut dataset =
            Dataset::from_fields(vec![Fields::new(), Fields::new()], Attributes::new());
        dataset.validate().expect("valid dataset");
        dataset.rows[1].index = 5;
        assert!(matches!(dataset.validate(), Err(SweepError::Contract(_))));
    }

    #[test]
    fn assemble_expands_output_columns_and_records_errors() {
        let plan = PartitionPlan::new(3, 3, 1).expect("plan");
        let shard = ShardId::new(1).expect("id");
        let processed = vec![
            (
                Row {
                    index: 0,
                    fields: fields(json!({"a": 0})),
                },
                Ok(fields(json!({"x": 1}))),
            ),
            (
                Row {
                    index: 1,
                    fields: fields(json!({"a": 1})),
                },
                Err("boom".to_string()),
            ),
            (
                Row {
                    index: 2,
                    fields: fields(json!({"a": 2})),
                },
                Ok(fields(json!({"y": 2}))),
            ),
        ];
        let result = ShardResult::assemble(&plan, shard, processed).expect("assemble");
        assert_eq!(result.output_columns, vec!["x".to_string(), "y".to_string()]);
        assert_eq!(result.rows[0].outputs, fields(json!({"x": 1, "y": null})));
        assert_eq!(result.rows[1].outputs, fields(json!({"x": null, "y": null})));
        assert_eq!(result.rows[1].error.as_deref(), Some("boom"));
        assert_eq!(result.error_rows(), 1);
        assert!(result.verify_digest().expect("digest"));

        let mut tampered = result.clone();
        tampered.rows.pop();
        assert!(!tampered.verify_digest().expect("digest"));
    }

    #[test]
    fn merge_attributes_prefers_overlay() {
        let base = fields(json!({"seed": 1, "keep": true}));
        let overlay = fields(json!({"seed": 2, "commit": null}));
        let merged = merge_attributes(&base, &overlay);
        assert_eq!(merged, fields(json!({"seed": 2, "keep": true, "commit": null})));
    }
}
