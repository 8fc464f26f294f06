//! Data model, partition planning and artifact primitives shared by the
//! sweep runner and CLI.

pub mod error;
pub mod fsutil;
pub mod model;
pub mod plan;

pub use error::{SweepError, SweepResult};
pub use fsutil::{
    atomic_write_bytes, atomic_write_json_pretty, canonical_json_digest, ensure_dir, sha256_bytes,
};
pub use model::{
    merge_attributes, Attributes, CombinedResult, CombinedRow, CombinedSummary, Dataset, Fields,
    IndexRange, MissingRows, Row, RowOutcome, RunStatus, ShardResult, ShardRow,
    COMBINED_RESULT_SCHEMA, MISSING_ROWS_SCHEMA, SHARD_RESULT_SCHEMA,
};
pub use plan::{canonical_order, num_shards, shard_range, PartitionPlan, ShardId};
