//! measdb CLI: inspect, export and maintain measurement stores.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use comfy_table::{presets::UTF8_FULL, Table};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use measdb_core::schema::{self, CURRENT_VERSION};
use measdb_core::{RunStore, StoreConfig, Value};

#[derive(Parser)]
#[command(
    name = "measdb",
    about = "measdb: transactional store for measurement runs",
    version,
    author
)]
struct Cli {
    /// Path to the store file
    #[arg(long, global = true, default_value = "./measurements.db")]
    db: PathBuf,
    /// YAML store config (overrides --db)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Refuse to migrate older files on open
    #[arg(long, global = true)]
    no_upgrade: bool,
    /// Write logs to this file instead of stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List runs in the store
    List,
    /// Inspect a run: layout, metadata and last recorded row
    Inspect {
        run_id: i64,
    },
    /// Export a completed run
    Export {
        run_id: i64,
        /// Output format
        #[arg(long, short, default_value = "csv", value_parser = ["csv", "json", "parquet"])]
        format: String,
        /// Only export this dependent parameter and its setpoints
        #[arg(long, short)]
        param: Option<String>,
        /// Output file (default: stdout; required for parquet)
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// Delete a run and all of its rows
    Delete {
        run_id: i64,
        /// Actually delete (default: dry run)
        #[arg(long)]
        force: bool,
    },
    /// Migrate the store to the current schema version
    Upgrade,
    /// Show the store's schema version without modifying it
    Info,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_tracing(cli.log_file.as_deref())?;
    let config = store_config(&cli)?;

    match cli.command {
        Commands::List => cmd_list(&open_store(config)?)?,
        Commands::Inspect { run_id } => cmd_inspect(&open_store(config)?, run_id)?,
        Commands::Export {
            run_id,
            format,
            param,
            output,
        } => cmd_export(&open_store(config)?, run_id, &format, param, output)?,
        Commands::Delete { run_id, force } => cmd_delete(&open_store(config)?, run_id, force)?,
        Commands::Upgrade => cmd_upgrade(&config.path)?,
        Commands::Info => cmd_info(config)?,
    }

    Ok(())
}

fn init_tracing(log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or(Path::new("."));
            let name = path
                .file_name()
                .ok_or_else(|| anyhow!("Invalid log file path: {}", path.display()))?;
            let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer)
                .init();
            Ok(Some(guard))
        }
        None => {
            // stdout carries command output; logs go to stderr.
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .compact()
                .init();
            Ok(None)
        }
    }
}

fn store_config(cli: &Cli) -> Result<StoreConfig> {
    let config = match &cli.config {
        Some(path) => StoreConfig::from_yaml_file(path)?,
        None => StoreConfig::new(cli.db.clone()),
    };
    Ok(if cli.no_upgrade {
        config.with_auto_upgrade(false)
    } else {
        config
    })
}

/// Open an existing store. Read commands never create a new file.
fn open_store(config: StoreConfig) -> Result<RunStore> {
    if !config.path.exists() {
        bail!("Store not found: {}", config.path.display());
    }
    Ok(RunStore::open_with_config(config)?)
}

// ─── Command implementations ──────────────────────────────────────────────────

fn cmd_list(store: &RunStore) -> Result<()> {
    let runs = store.list_runs()?;
    if runs.is_empty() {
        println!("No runs found in '{}'", store.path().display());
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(["Run", "Name", "State", "Rows", "Created", "Completed"]);
    for run in &runs {
        table.add_row([
            run.run_id.to_string(),
            run.name.clone(),
            run.state.to_string(),
            run.result_count.to_string(),
            format_time(run.created_at),
            run.completed_at.map(format_time).unwrap_or_else(|| "-".to_string()),
        ]);
    }

    println!("Runs in: {}", store.path().display());
    println!("{}", table);
    Ok(())
}

fn cmd_inspect(store: &RunStore, run_id: i64) -> Result<()> {
    let run = store.get_run(run_id)?;
    println!("Run: {} ({})", run.run_id, run.name);
    println!("GUID: {}", run.guid);
    println!("State: {}", run.state);
    println!("Created: {}", format_time(run.created_at));
    if let Some(started) = run.started_at {
        println!("Started: {}", format_time(started));
    }
    if let Some(d) = run.duration_secs() {
        println!("Duration: {}", format_duration(d));
    }
    println!("Rows: {}", run.result_count);
    println!();

    println!("── Parameters ({}) ─────────────────────", run.specs.len());
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(["Name", "Type", "Unit", "Label", "Depends on", "Inferred from"]);
    for spec in &run.specs {
        table.add_row([
            spec.name.clone(),
            spec.param_type.to_string(),
            spec.unit.clone(),
            spec.label.clone(),
            spec.depends_on.join(", "),
            spec.inferred_from.join(", "),
        ]);
    }
    println!("{}", table);

    if !run.metadata.is_empty() {
        println!();
        println!("── Metadata ────────────────────────────");
        println!("{}", serde_json::to_string_pretty(&run.metadata)?);
    }

    let rows = store.get_results(run_id)?;
    if let Some(last) = rows.last() {
        println!();
        println!("── Last Row ({} total rows) ─────────────", rows.len());
        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_header(["Parameter", "Value"]);
        for spec in &run.specs {
            if let Some(v) = last.get(&spec.name) {
                table.add_row([spec.name.clone(), format_value(v)]);
            }
        }
        println!("{}", table);
    }

    Ok(())
}

fn cmd_export(
    store: &RunStore,
    run_id: i64,
    format: &str,
    param: Option<String>,
    output: Option<PathBuf>,
) -> Result<()> {
    let mut table = store.export(run_id)?;
    if let Some(name) = param {
        table = table.parameter_data(&name)?;
    }

    let content = match format {
        "parquet" => {
            let Some(path) = output else {
                bail!("--output is required for parquet export");
            };
            table.write_parquet(&path)?;
            println!("Exported {} rows to {}", table.num_rows(), path.display());
            return Ok(());
        }
        "json" => serde_json::to_string_pretty(&table.to_json_rows())? + "\n",
        "csv" => table.to_csv(),
        _ => bail!("Unknown format: {}", format),
    };

    match output {
        Some(path) => {
            std::fs::write(&path, &content)?;
            println!("Exported {} rows to {}", table.num_rows(), path.display());
        }
        None => print!("{}", content),
    }

    Ok(())
}

fn cmd_delete(store: &RunStore, run_id: i64, force: bool) -> Result<()> {
    let run = store.get_run(run_id)?;
    println!(
        "Will delete run {} '{}' ({}, {} rows)",
        run.run_id, run.name, run.state, run.result_count
    );

    if !force {
        println!("\nDry run. Use --force to actually delete.");
        return Ok(());
    }

    store.delete_run(run_id)?;
    println!("  ✓ Deleted run {}", run_id);
    Ok(())
}

fn cmd_upgrade(path: &Path) -> Result<()> {
    let (before, after) = RunStore::upgrade(path)?;
    if before == after {
        println!("{} is already at schema version {}", path.display(), after);
    } else {
        println!(
            "Upgraded {} from schema version {} to {}",
            path.display(),
            before,
            after
        );
    }
    Ok(())
}

fn cmd_info(config: StoreConfig) -> Result<()> {
    let version = schema::inspect_version(&config.path)?;
    println!("Store: {}", config.path.display());
    println!("Schema version: {} (supported: {})", version, CURRENT_VERSION);

    if version > CURRENT_VERSION {
        println!("Status: written by a newer measdb; this build will not open it");
    } else if version < CURRENT_VERSION {
        println!("Status: needs upgrade (run `measdb upgrade`)");
    } else {
        println!("Status: current");
        let store = RunStore::open_with_config(config)?;
        println!("Runs: {}", store.list_runs()?.len());
    }
    Ok(())
}

// ─── Utilities ────────────────────────────────────────────────────────────────

fn format_time(t: DateTime<Utc>) -> String {
    t.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn format_value(v: &Value) -> String {
    match v {
        Value::Numeric(f) => f.to_string(),
        Value::Text(s) => s.clone(),
        Value::Array(a) => format!("array {:?} ({} values)", a.shape(), a.len()),
    }
}

fn format_duration(secs: f64) -> String {
    let secs = secs as u64;
    let h = secs / 3600;
    let m = (secs % 3600) / 60;
    let s = secs % 60;
    if h > 0 {
        format!("{}h {}m", h, m)
    } else if m > 0 {
        format!("{}m {}s", m, s)
    } else {
        format!("{}s", s)
    }
}
