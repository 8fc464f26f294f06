pub mod config;
pub mod executor;
pub mod experiment;
pub mod provenance;
pub mod reconcile;
pub mod store;

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use sweep_core::{Dataset, PartitionPlan};
use tracing::info;

pub use config::{load_sweep_config, ConfigOverrides, SweepConfig, SWEEP_TEMPLATE};
pub use executor::{execute_shard, ShardExecution};
pub use experiment::{CommandExperiment, Experiment};
pub use provenance::RunMetadata;
pub use reconcile::{ReconcileOptions, ReconcileOutcome};
pub use store::{FsShardStore, RetryPolicy, ShardStore, Sleeper, ThreadSleeper};
pub use sweep_core::{RunStatus, ShardId, SweepError};

#[derive(Debug)]
pub struct SweepSummary {
    pub exp_id: String,
    pub total_rows: usize,
    pub rows_per_shard: usize,
    pub seed: u64,
    pub num_shards: usize,
    pub columns: Vec<String>,
    pub attributes: Vec<String>,
    pub output_dir: PathBuf,
    pub shards_present: Vec<ShardId>,
}

#[derive(Debug)]
pub struct ShardRunResult {
    pub shard_id: ShardId,
    pub start: usize,
    pub end: usize,
    pub rows: usize,
    pub error_rows: usize,
    pub artifact_path: PathBuf,
}

#[derive(Debug)]
pub struct ReconcileResult {
    pub status: RunStatus,
    pub total_rows: usize,
    pub found_rows: usize,
    pub missing_rows: usize,
    pub error_rows: usize,
    pub missing_shards: Vec<ShardId>,
    pub skipped_shards: Vec<ShardId>,
    pub combined_path: PathBuf,
    pub missing_path: Option<PathBuf>,
}

#[derive(Debug)]
pub struct LocalRunResult {
    pub shards: Vec<ShardRunResult>,
    pub reconcile: ReconcileResult,
}

/// A loaded sweep: configuration, the experiment behind it, the dataset it
/// built and the partition plan derived from them.
pub struct Sweep {
    config: SweepConfig,
    experiment: Box<dyn Experiment>,
    dataset: Dataset,
    plan: PartitionPlan,
}

impl Sweep {
    pub fn open(path: &Path, overrides: &ConfigOverrides) -> Result<Self> {
        let config = load_sweep_config(path, overrides)?;
        let experiment = CommandExperiment::from_config(&config)?;
        Self::with_experiment(config, Box::new(experiment))
    }

    pub fn with_experiment(config: SweepConfig, experiment: Box<dyn Experiment>) -> Result<Self> {
        let dataset = experiment
            .build()
            .with_context(|| format!("dataset builder for {} failed", config.experiment.id))?;
        dataset.validate()?;
        let plan = config.plan_for(dataset.len())?;
        Ok(Self {
            config,
            experiment,
            dataset,
            plan,
        })
    }

    pub fn plan(&self) -> &PartitionPlan {
        &self.plan
    }

    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    pub fn store(&self) -> FsShardStore {
        FsShardStore::new(self.config.output_dir()).with_retry(RetryPolicy {
            max_attempts: self.config.store.read_attempts,
            delay: self.config.retry_delay(),
        })
    }

    pub fn describe(&self) -> Result<SweepSummary> {
        Ok(SweepSummary {
            exp_id: self.config.experiment.id.clone(),
            total_rows: self.plan.total_rows,
            rows_per_shard: self.plan.rows_per_shard,
            seed: self.plan.seed,
            num_shards: self.plan.num_shards(),
            columns: self.dataset.columns(),
            attributes: self.dataset.attributes.keys().cloned().collect(),
            output_dir: self.config.output_dir(),
            shards_present: self.store().list_shards()?,
        })
    }

    pub fn run_shard(&self, shard_id: usize) -> Result<ShardRunResult> {
        let shard_id = ShardId::new(shard_id)?;
        let store = self.store();
        let execution = execute_shard(
            self.experiment.as_ref(),
            &self.dataset,
            &self.plan,
            shard_id,
            &store,
        )?;
        Ok(shard_run_result(execution))
    }

    pub fn reconcile(&self) -> Result<ReconcileResult> {
        let store = self.store();
        let metadata =
            RunMetadata::capture(self.plan, &self.config.base_dir, &self.config.log_dir());
        let options = ReconcileOptions {
            lenient: self.config.reconcile.lenient,
            strict: self.config.reconcile.strict,
        };
        let outcome = reconcile::reconcile_run(
            &self.dataset,
            &self.plan,
            &store,
            store.root(),
            &metadata.to_attributes(),
            options,
        )?;
        Ok(reconcile_result(outcome))
    }

    /// Executes every shard in order, then reconciles.
    pub fn run_local(&self) -> Result<LocalRunResult> {
        let mut shards = Vec::with_capacity(self.plan.num_shards());
        for shard_id in self.plan.shard_ids() {
            shards.push(self.run_shard(shard_id.get())?);
        }
        info!(shards = shards.len(), "all shards executed locally");
        let reconcile = self.reconcile()?;
        Ok(LocalRunResult { shards, reconcile })
    }
}

pub fn count_shards(path: &Path, overrides: &ConfigOverrides) -> Result<usize> {
    Ok(Sweep::open(path, overrides)?.plan().num_shards())
}

pub fn describe_sweep(path: &Path, overrides: &ConfigOverrides) -> Result<SweepSummary> {
    Sweep::open(path, overrides)?.describe()
}

pub fn run_shard(
    path: &Path,
    shard_id: usize,
    overrides: &ConfigOverrides,
) -> Result<ShardRunResult> {
    Sweep::open(path, overrides)?.run_shard(shard_id)
}

pub fn reconcile_sweep(path: &Path, overrides: &ConfigOverrides) -> Result<ReconcileResult> {
    Sweep::open(path, overrides)?.reconcile()
}

pub fn run_local(path: &Path, overrides: &ConfigOverrides) -> Result<LocalRunResult> {
    Sweep::open(path, overrides)?.run_local()
}

fn shard_run_result(execution: ShardExecution) -> ShardRunResult {
    ShardRunResult {
        shard_id: execution.shard_id,
        start: execution.range.start,
        end: execution.range.end,
        rows: execution.rows,
        error_rows: execution.error_rows,
        artifact_path: execution.artifact_path,
    }
}

fn reconcile_result(outcome: ReconcileOutcome) -> ReconcileResult {
    let summary = &outcome.combined.summary;
    ReconcileResult {
        status: summary.status,
        total_rows: summary.total_rows,
        found_rows: summary.found_rows,
        missing_rows: summary.missing_rows,
        error_rows: summary.error_rows,
        missing_shards: summary.missing_shards.clone(),
        skipped_shards: outcome.skipped.clone(),
        combined_path: outcome.combined_path.clone(),
        missing_path: outcome.missing_path.clone(),
    }
}
