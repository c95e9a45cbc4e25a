//! Example of recording a gate sweep with measdb-core directly from Rust.

use std::path::Path;
use std::thread;
use std::time::Duration;

use measdb_core::{Metadata, ParamSpec, ResultRow, ResultWriter, RunStore, Value, WriterConfig};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .compact()
        .init();

    // 1. Open (or create) the store
    let store = RunStore::open("./measurements.db")?;

    // 2. Register the run layout: current and a trace depend on the gate voltage
    let mut metadata = Metadata::new();
    metadata.insert("sample".to_string(), serde_json::json!("device_A3"));
    let run_id = store.create_run(
        "gate_sweep",
        vec![
            ParamSpec::numeric("gate").with_unit("V").with_label("Gate voltage"),
            ParamSpec::numeric("current").with_unit("A").depends_on(["gate"]),
            ParamSpec::array("trace").with_unit("V").depends_on(["gate"]),
        ],
        metadata,
    )?;
    println!("Created run {run_id}");

    // 3. The writer starts the run and commits in the background
    let writer = ResultWriter::new(store.clone(), run_id, WriterConfig::default())?;

    for i in 0..100 {
        let gate = -1.0 + i as f64 * 0.02;
        let current = 1e-9 * (gate * 4.0).tanh();
        let trace: Vec<f64> = (0..16).map(|k| (k as f64 * 0.4 + gate).sin()).collect();
        writer.add_result(ResultRow::from_pairs([
            ("gate", Value::from(gate)),
            ("current", Value::from(current)),
            ("trace", Value::from(trace)),
        ]))?;
        thread::sleep(Duration::from_millis(5));
    }

    // 4. Final commit and completion
    let rows = writer.close(true)?;
    println!("Committed {rows} rows");

    // 5. Read the completed run back
    let table = store.export(run_id)?;
    table.parameter_data("current")?.write_parquet(Path::new("gate_sweep_current.parquet"))?;
    println!("Wrote {} rows to gate_sweep_current.parquet", table.num_rows());

    Ok(())
}
