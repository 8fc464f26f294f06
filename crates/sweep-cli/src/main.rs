use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Parser)]
#[command(name = "sweep", version, about = "Sharded parameter sweep harness")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone, Default)]
struct OverrideArgs {
    /// Seed of the canonical row shuffle.
    #[arg(long)]
    seed: Option<u64>,
    /// Rows each shard processes.
    #[arg(long)]
    rows_per_shard: Option<usize>,
    /// Output directory; a relative path resolves against the working
    /// directory.
    #[arg(long)]
    output_dir: Option<PathBuf>,
}

impl OverrideArgs {
    fn into_overrides(self, lenient: bool, strict: bool) -> sweep_runner::ConfigOverrides {
        sweep_runner::ConfigOverrides {
            seed: self.seed,
            rows_per_shard: self.rows_per_shard,
            output_dir: self.output_dir,
            lenient,
            strict,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Print the number of shards the sweep splits into.
    Shards {
        sweep: PathBuf,
        #[command(flatten)]
        overrides: OverrideArgs,
        #[arg(long)]
        json: bool,
    },
    /// Process one shard and write its artifact.
    RunShard {
        sweep: PathBuf,
        #[arg(long, env = "SLURM_ARRAY_TASK_ID")]
        shard_id: usize,
        #[command(flatten)]
        overrides: OverrideArgs,
        #[arg(long)]
        json: bool,
    },
    /// Merge all shard artifacts into the combined result.
    Reconcile {
        sweep: PathBuf,
        #[command(flatten)]
        overrides: OverrideArgs,
        /// Skip shard artifacts that stay unreadable after retries.
        #[arg(long)]
        lenient: bool,
        /// Fail when any row has no shard output.
        #[arg(long, conflicts_with = "lenient")]
        strict: bool,
        #[arg(long)]
        json: bool,
    },
    /// Run every shard in this process, then reconcile.
    RunLocal {
        sweep: PathBuf,
        #[command(flatten)]
        overrides: OverrideArgs,
        /// Skip shard artifacts that stay unreadable after retries.
        #[arg(long)]
        lenient: bool,
        /// Fail when any row has no shard output.
        #[arg(long, conflicts_with = "lenient")]
        strict: bool,
        #[arg(long)]
        json: bool,
    },
    /// Print the plan, dataset columns and shards already written.
    Describe {
        sweep: PathBuf,
        #[command(flatten)]
        overrides: OverrideArgs,
        #[arg(long)]
        json: bool,
    },
    /// Write a sweep file template.
    Init {
        #[arg(long, default_value = "sweep.yaml")]
        path: PathBuf,
        #[arg(long)]
        force: bool,
    },
}

fn main() -> Result<()> {
    let ansi = std::io::stderr().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_ansi(ansi)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error(error_code(&err), format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Shards {
            sweep,
            overrides,
            json,
        } => {
            let shards =
                sweep_runner::count_shards(&sweep, &overrides.into_overrides(false, false))?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "shards",
                    "num_shards": shards
                })));
            }
            println!("{}", shards);
        }
        Commands::RunShard {
            sweep,
            shard_id,
            overrides,
            json,
        } => {
            let result =
                sweep_runner::run_shard(&sweep, shard_id, &overrides.into_overrides(false, false))?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run-shard",
                    "shard": shard_result_to_json(&result)
                })));
            }
            println!("shard_id: {}", result.shard_id);
            println!("rows: {} to {}", result.start, result.end);
            println!("error_rows: {}", result.error_rows);
            println!("artifact: {}", result.artifact_path.display());
        }
        Commands::Reconcile {
            sweep,
            overrides,
            lenient,
            strict,
            json,
        } => {
            let result =
                sweep_runner::reconcile_sweep(&sweep, &overrides.into_overrides(lenient, strict))?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "reconcile",
                    "reconcile": reconcile_result_to_json(&result)
                })));
            }
            print_reconcile(&result);
        }
        Commands::RunLocal {
            sweep,
            overrides,
            lenient,
            strict,
            json,
        } => {
            let result =
                sweep_runner::run_local(&sweep, &overrides.into_overrides(lenient, strict))?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run-local",
                    "shards": result.shards.iter().map(shard_result_to_json).collect::<Vec<_>>(),
                    "reconcile": reconcile_result_to_json(&result.reconcile)
                })));
            }
            println!("shards_run: {}", result.shards.len());
            print_reconcile(&result.reconcile);
        }
        Commands::Describe {
            sweep,
            overrides,
            json,
        } => {
            let summary =
                sweep_runner::describe_sweep(&sweep, &overrides.into_overrides(false, false))?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "summary": summary_to_json(&summary)
                })));
            }
            print_summary(&summary);
        }
        Commands::Init { path, force } => {
            write_template(&path, force)?;
            println!("wrote: {}", path.display());
            println!(
                "next: edit {} and fill in all fields marked REQUIRED",
                path.display()
            );
            println!("next: sweep describe {}", path.display());
        }
    }
    Ok(None)
}

fn write_template(path: &Path, force: bool) -> Result<()> {
    if !force && path.exists() {
        return Err(anyhow::anyhow!(
            "sweep file already exists (use --force): {}",
            path.display()
        ));
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, sweep_runner::SWEEP_TEMPLATE)?;
    Ok(())
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn error_code(err: &anyhow::Error) -> &'static str {
    use sweep_runner::SweepError;
    match err.downcast_ref::<SweepError>() {
        Some(SweepError::Contract(_)) => "contract_violation",
        Some(SweepError::Transient { .. }) | Some(SweepError::RetriesExhausted { .. }) => {
            "storage_unavailable"
        }
        Some(SweepError::Storage { .. }) => "storage_error",
        Some(SweepError::Corrupt(_)) => "corrupt_data",
        Some(SweepError::Incomplete { .. }) => "incomplete",
        Some(SweepError::Serialization(_)) => "serialization_error",
        None => "command_failed",
    }
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Shards { json, .. }
        | Commands::RunShard { json, .. }
        | Commands::Reconcile { json, .. }
        | Commands::RunLocal { json, .. }
        | Commands::Describe { json, .. } => *json,
        Commands::Init { .. } => false,
    }
}

fn shard_result_to_json(result: &sweep_runner::ShardRunResult) -> Value {
    json!({
        "shard_id": result.shard_id.get(),
        "start": result.start,
        "end": result.end,
        "rows": result.rows,
        "error_rows": result.error_rows,
        "artifact": result.artifact_path.display().to_string()
    })
}

fn reconcile_result_to_json(result: &sweep_runner::ReconcileResult) -> Value {
    json!({
        "status": result.status.as_str(),
        "total_rows": result.total_rows,
        "found_rows": result.found_rows,
        "missing_rows": result.missing_rows,
        "error_rows": result.error_rows,
        "missing_shards": result.missing_shards.iter().map(|id| id.get()).collect::<Vec<_>>(),
        "skipped_shards": result.skipped_shards.iter().map(|id| id.get()).collect::<Vec<_>>(),
        "combined": result.combined_path.display().to_string(),
        "missing_rows_artifact": result.missing_path.as_ref().map(|p| p.display().to_string())
    })
}

fn print_reconcile(result: &sweep_runner::ReconcileResult) {
    println!("status: {}", result.status.as_str());
    println!("total_rows: {}", result.total_rows);
    println!("found_rows: {}", result.found_rows);
    println!("missing_rows: {}", result.missing_rows);
    println!("error_rows: {}", result.error_rows);
    if !result.missing_shards.is_empty() {
        let ids: Vec<String> = result.missing_shards.iter().map(|id| id.to_string()).collect();
        println!("missing_shards: {}", ids.join(","));
    }
    if !result.skipped_shards.is_empty() {
        let ids: Vec<String> = result.skipped_shards.iter().map(|id| id.to_string()).collect();
        println!("skipped_shards: {}", ids.join(","));
    }
    println!("combined: {}", result.combined_path.display());
    if let Some(path) = &result.missing_path {
        warn!(
            missing_rows = result.missing_rows,
            "could not find all shard results"
        );
        println!("missing_rows_artifact: {}", path.display());
    }
}

fn summary_to_json(summary: &sweep_runner::SweepSummary) -> Value {
    json!({
        "experiment": summary.exp_id,
        "total_rows": summary.total_rows,
        "rows_per_shard": summary.rows_per_shard,
        "seed": summary.seed,
        "num_shards": summary.num_shards,
        "columns": summary.columns,
        "attributes": summary.attributes,
        "output_dir": summary.output_dir.display().to_string(),
        "shards_present": summary.shards_present.iter().map(|id| id.get()).collect::<Vec<_>>()
    })
}

fn print_summary(summary: &sweep_runner::SweepSummary) {
    println!("experiment: {}", summary.exp_id);
    println!("total_rows: {}", summary.total_rows);
    println!("rows_per_shard: {}", summary.rows_per_shard);
    println!("seed: {}", summary.seed);
    println!("num_shards: {}", summary.num_shards);
    println!("columns: {}", summary.columns.join(","));
    println!("attributes: {}", summary.attributes.join(","));
    println!("output_dir: {}", summary.output_dir.display());
    println!(
        "shards_present: {}/{}",
        summary.shards_present.len(),
        summary.num_shards
    );
}
