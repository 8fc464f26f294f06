use crate::experiment::Experiment;
use crate::store::ShardStore;
use anyhow::Result;
use std::any::Any;
use std::ops::Range;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use sweep_core::{
    Dataset, Fields, PartitionPlan, Row, RowOutcome, ShardId, ShardResult, SweepError,
};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct ShardExecution {
    pub shard_id: ShardId,
    pub range: Range<usize>,
    pub rows: usize,
    pub error_rows: usize,
    pub artifact_path: PathBuf,
}

/// Processes every row of `shard_id` and writes the shard's artifact.
///
/// Setup problems (bad shard id, plan that does not match the dataset,
/// missing required attribute) fail before any row runs. Once rows run, a
/// failing row only becomes an error marker in the artifact.
pub fn execute_shard(
    experiment: &dyn Experiment,
    dataset: &Dataset,
    plan: &PartitionPlan,
    shard_id: ShardId,
    store: &dyn ShardStore,
) -> Result<ShardExecution> {
    dataset.validate()?;
    if plan.total_rows != dataset.len() {
        return Err(SweepError::contract(format!(
            "plan covers {} rows but the dataset has {}",
            plan.total_rows,
            dataset.len()
        ))
        .into());
    }
    let missing: Vec<String> = experiment
        .required_attributes()
        .into_iter()
        .filter(|name| !dataset.attributes.contains_key(name))
        .collect();
    if !missing.is_empty() {
        return Err(SweepError::contract(format!(
            "dataset is missing required attributes: {}",
            missing.join(", ")
        ))
        .into());
    }

    let range = plan.shard_range(shard_id)?;
    let indices = plan.shard_rows(shard_id)?;
    let mut processed: Vec<(Row, RowOutcome)> = Vec::with_capacity(indices.len());
    for index in indices {
        let row = &dataset.rows[index];
        let input = dataset.merged_input(row);
        let outcome = process_row(experiment, &input);
        if let Err(desc) = &outcome {
            warn!(shard_id = %shard_id, row = index, error = %desc, "row processing failed");
        } else {
            debug!(shard_id = %shard_id, row = index, "row processed");
        }
        processed.push((row.clone(), outcome));
    }

    let result = ShardResult::assemble(plan, shard_id, processed)?;
    let artifact_path = store.write(&result)?;
    let execution = ShardExecution {
        shard_id,
        range: range.clone(),
        rows: result.rows.len(),
        error_rows: result.error_rows(),
        artifact_path,
    };
    info!(
        shard_id = %shard_id,
        start = range.start,
        end = range.end,
        error_rows = execution.error_rows,
        path = %execution.artifact_path.display(),
        "processed rows {} to {}",
        range.start,
        range.end
    );
    Ok(execution)
}

/// Runs `process` for one merged input, turning both errors and panics into
/// a failure description.
pub fn process_row(experiment: &dyn Experiment, input: &Fields) -> RowOutcome {
    match panic::catch_unwind(AssertUnwindSafe(|| experiment.process(input))) {
        Ok(Ok(outputs)) => Ok(outputs),
        Ok(Err(err)) => Err(format!("{:?}", err)),
        Err(payload) => Err(format!("panic: {}", panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
