//! Shard artifact persistence.
//!
//! One artifact per shard id at `shard_<id>/processed_<id>.json`. Writes are
//! atomic renames; reads classify failures so that torn or truncated
//! artifacts are retried while absent ones are reported as "not present".

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use sweep_core::{
    atomic_write_json_pretty, ShardId, ShardResult, SweepError, SweepResult, SHARD_RESULT_SCHEMA,
};
use tracing::{debug, warn};

pub trait ShardStore {
    /// Persists the shard's result, replacing any earlier artifact for the
    /// same id.
    fn write(&self, result: &ShardResult) -> SweepResult<PathBuf>;

    /// Shard ids with an artifact present, ascending.
    fn list_shards(&self) -> SweepResult<Vec<ShardId>>;

    /// `Ok(None)` when no artifact exists for the id.
    fn read(&self, shard_id: ShardId) -> SweepResult<Option<ShardResult>>;
}

pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Runs `op` until it succeeds, fails with a non-transient error, or
    /// `max_attempts` transient failures have been seen. Sleeps `delay`
    /// between attempts, never after the last one.
    pub fn run<T>(
        &self,
        sleeper: &dyn Sleeper,
        path: &Path,
        mut op: impl FnMut() -> SweepResult<T>,
    ) -> SweepResult<T> {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op() {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() => {
                    if attempt >= attempts {
                        return Err(SweepError::RetriesExhausted {
                            path: path.to_path_buf(),
                            attempts,
                            last: err.to_string(),
                        });
                    }
                    warn!(
                        attempt,
                        max_attempts = attempts,
                        delay_ms = self.delay.as_millis() as u64,
                        error = %err,
                        "shard read failed, retrying"
                    );
                    sleeper.sleep(self.delay);
                }
                Err(err) => return Err(err),
            }
        }
    }
}

pub struct FsShardStore {
    root: PathBuf,
    retry: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
}

impl FsShardStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            retry: RetryPolicy::default(),
            sleeper: Arc::new(ThreadSleeper),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn shard_path(&self, shard_id: ShardId) -> PathBuf {
        self.root
            .join(format!("shard_{}", shard_id))
            .join(format!("processed_{}.json", shard_id))
    }

    fn read_once(&self, shard_id: ShardId, path: &Path) -> SweepResult<Option<ShardResult>> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) if is_transient_io(e.kind()) => {
                return Err(SweepError::Transient {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                })
            }
            Err(e) => return Err(SweepError::storage(path, e)),
        };
        parse_artifact(shard_id, path, &bytes).map(Some)
    }
}

impl ShardStore for FsShardStore {
    fn write(&self, result: &ShardResult) -> SweepResult<PathBuf> {
        let path = self.shard_path(result.shard_id);
        atomic_write_json_pretty(&path, result)?;
        debug!(shard_id = %result.shard_id, path = %path.display(), "shard artifact written");
        Ok(path)
    }

    fn list_shards(&self) -> SweepResult<Vec<ShardId>> {
        if !self.root.is_dir() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in walkdir::WalkDir::new(&self.root).min_depth(2).max_depth(2) {
            let entry = entry.map_err(|e| {
                let path = e.path().unwrap_or(&self.root).to_path_buf();
                SweepError::storage(path, std::io::Error::other(e.to_string()))
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(id) = artifact_shard_id(entry.path()) else {
                continue;
            };
            ids.push(id);
        }
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    fn read(&self, shard_id: ShardId) -> SweepResult<Option<ShardResult>> {
        let path = self.shard_path(shard_id);
        self.retry
            .run(self.sleeper.as_ref(), &path, || self.read_once(shard_id, &path))
    }
}

fn is_transient_io(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::Interrupted | ErrorKind::UnexpectedEof | ErrorKind::BrokenPipe
    )
}

/// Matches `shard_<n>/processed_<n>.json` with equal ids; temp files and
/// anything else in the output tree are ignored.
fn artifact_shard_id(path: &Path) -> Option<ShardId> {
    let file = path.file_name()?.to_str()?;
    let dir = path.parent()?.file_name()?.to_str()?;
    let file_id: usize = file
        .strip_prefix("processed_")?
        .strip_suffix(".json")?
        .parse()
        .ok()?;
    let dir_id: usize = dir.strip_prefix("shard_")?.parse().ok()?;
    if file_id != dir_id {
        return None;
    }
    ShardId::new(file_id).ok()
}

fn parse_artifact(shard_id: ShardId, path: &Path, bytes: &[u8]) -> SweepResult<ShardResult> {
    let transient = |reason: String| SweepError::Transient {
        path: path.to_path_buf(),
        reason,
    };
    if bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(transient("empty artifact".to_string()));
    }
    let result: ShardResult = match serde_json::from_slice(bytes) {
        Ok(result) => result,
        Err(e) if e.is_eof() => return Err(transient(format!("truncated artifact: {}", e))),
        Err(e) => {
            return Err(SweepError::corrupt(format!(
                "{} is not a shard artifact: {}",
                path.display(),
                e
            )))
        }
    };
    if result.schema_version != SHARD_RESULT_SCHEMA {
        return Err(SweepError::corrupt(format!(
            "{} has schema {}, expected {}",
            path.display(),
            result.schema_version,
            SHARD_RESULT_SCHEMA
        )));
    }
    if result.shard_id != shard_id {
        return Err(SweepError::corrupt(format!(
            "{} holds shard {}, expected shard {}",
            path.display(),
            result.shard_id,
            shard_id
        )));
    }
    if !result.verify_digest()? {
        return Err(transient("digest mismatch".to_string()));
    }
    Ok(result)
}
