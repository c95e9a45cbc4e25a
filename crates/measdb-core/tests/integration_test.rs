//! Integration tests for measdb-core.

use std::thread;
use std::time::Duration;

use measdb_core::{
    ArrayValue, MeasdbError, Metadata, NonFinitePolicy, ParamSpec, ResultRow, ResultWriter,
    RunState, RunStore, StoreConfig, Value, WriterConfig,
};
use tempfile::TempDir;

fn open_store(tmp: &TempDir) -> RunStore {
    RunStore::open(tmp.path().join("lab.db")).expect("Failed to open store")
}

fn iv_run(store: &RunStore) -> i64 {
    let id = store
        .create_run(
            "iv_curve",
            vec![
                ParamSpec::numeric("V").with_unit("V"),
                ParamSpec::numeric("I").with_unit("A").depends_on(["V"]),
            ],
            Metadata::new(),
        )
        .unwrap();
    store.mark_started(id).unwrap();
    id
}

#[test]
fn test_specs_round_trip_through_get_run() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp);
    let specs = vec![
        ParamSpec::numeric("gate").with_unit("V").with_label("Gate voltage"),
        ParamSpec::array("freq").with_unit("Hz"),
        ParamSpec::array("s21").depends_on(["gate", "freq"]),
        ParamSpec::array("s21_db").depends_on(["gate", "freq"]).inferred_from(["s21"]),
        ParamSpec::text("comment"),
    ];
    let mut metadata = Metadata::new();
    metadata.insert("sample".to_string(), serde_json::json!("wafer-7"));
    metadata.insert("fridge".to_string(), serde_json::json!({"T_mK": 12}));

    let id = store.create_run("vna_sweep", specs.clone(), metadata.clone()).unwrap();
    let run = store.get_run(id).unwrap();

    assert_eq!(run.specs, specs, "Specs should come back in registration order");
    assert_eq!(run.metadata, metadata);
    assert_eq!(run.state, RunState::Created);
    assert_eq!(run.result_count, 0);
    assert!(!run.guid.is_empty(), "Every run gets a guid");
}

#[test]
fn test_invalid_spec_creates_nothing() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp);
    let err = store
        .create_run(
            "broken",
            vec![ParamSpec::numeric("I").depends_on(["V"]), ParamSpec::numeric("V")],
            Metadata::new(),
        )
        .unwrap_err();
    assert!(matches!(err, MeasdbError::InvalidSpec(_)));
    assert!(store.list_runs().unwrap().is_empty());
}

#[test]
fn test_malformed_row_rejects_whole_batch() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp);
    let id = iv_run(&store);
    store
        .add_results(id, &[ResultRow::from_pairs([("V", 0.0), ("I", 0.0)])])
        .unwrap();

    let batch = vec![
        ResultRow::from_pairs([("V", 1.0), ("I", 0.5)]),
        ResultRow::from_pairs([("V", 2.0), ("I", 1.0)]),
        // Dependent without its setpoint.
        ResultRow::from_pairs([("I", 1.5)]),
    ];
    let err = store.add_results(id, &batch).unwrap_err();
    match err {
        MeasdbError::RowShapeMismatch { row, .. } => assert_eq!(row, 2),
        other => panic!("Expected RowShapeMismatch, got {other:?}"),
    }
    assert_eq!(store.result_count(id).unwrap(), 1, "Rejected batch must not change the count");

    let wrong_type = [ResultRow::from_pairs([("V", Value::from("high"))])];
    assert!(store.add_results(id, &wrong_type).is_err());
    let unknown = [ResultRow::from_pairs([("B", 0.1)])];
    assert!(store.add_results(id, &unknown).is_err());
    assert_eq!(store.result_count(id).unwrap(), 1);
}

#[test]
fn test_array_shapes_are_checked() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp);
    let id = store
        .create_run(
            "spectrum",
            vec![
                ParamSpec::array("freq"),
                ParamSpec::array("power").depends_on(["freq"]),
            ],
            Metadata::new(),
        )
        .unwrap();
    store.mark_started(id).unwrap();

    let mismatched = ResultRow::from_pairs([
        ("freq", Value::from(vec![1.0, 2.0, 3.0])),
        ("power", Value::from(vec![0.1, 0.2])),
    ]);
    assert!(store.add_results(id, &[mismatched]).is_err());

    let grid = ArrayValue::new(vec![2, 2], vec![1.0, 2.0, 3.0, 4.0]).unwrap();
    let ok = ResultRow::from_pairs([
        ("freq", Value::from(grid.clone())),
        ("power", Value::from(grid.clone())),
    ]);
    store.add_results(id, &[ok]).unwrap();

    let rows = store.get_results(id).unwrap();
    assert_eq!(rows[0].get("power").and_then(Value::as_array), Some(&grid));
}

#[test]
fn test_second_completion_fails() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp);
    let id = iv_run(&store);
    store.mark_completed(id).unwrap();

    assert!(matches!(store.mark_completed(id), Err(MeasdbError::AlreadyCompleted(_))));
    let row = [ResultRow::from_pairs([("V", 1.0)])];
    assert!(matches!(store.add_results(id, &row), Err(MeasdbError::AlreadyCompleted(_))));
    assert!(matches!(store.begin_batch(id), Err(MeasdbError::AlreadyCompleted(_))));
}

#[test]
fn test_export_requires_completed_run() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp);
    let id = iv_run(&store);
    store
        .add_results(id, &[ResultRow::from_pairs([("V", 1.0), ("I", 0.5)])])
        .unwrap();

    assert!(matches!(store.export(id), Err(MeasdbError::RunNotComplete(_))));
    assert!(matches!(store.export(id + 100), Err(MeasdbError::RunNotFound(_))));
    // Committed rows are still readable while the run is open.
    assert_eq!(store.get_results(id).unwrap().len(), 1);
}

#[test]
fn test_non_finite_values_round_trip_by_default() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp);
    let id = iv_run(&store);
    store
        .add_results(
            id,
            &[
                ResultRow::from_pairs([("V", 1.0), ("I", f64::NAN)]),
                ResultRow::from_pairs([("V", f64::INFINITY), ("I", f64::NEG_INFINITY)]),
            ],
        )
        .unwrap();
    store.mark_completed(id).unwrap();

    let table = store.export(id).unwrap();
    let current = table.column("I").unwrap();
    let first = current[0].and_then(Value::as_f64).expect("NaN must not become null");
    assert!(first.is_nan());
    assert_eq!(current[1].and_then(Value::as_f64), Some(f64::NEG_INFINITY));
    assert_eq!(table.column("V").unwrap()[1].and_then(Value::as_f64), Some(f64::INFINITY));
}

#[test]
fn test_negative_zero_keeps_its_sign() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp);
    let id = iv_run(&store);
    store
        .add_results(id, &[ResultRow::from_pairs([("V", -0.0), ("I", 0.0)])])
        .unwrap();

    let rows = store.get_results(id).unwrap();
    let v = rows[0].get("V").and_then(Value::as_f64).unwrap();
    let i = rows[0].get("I").and_then(Value::as_f64).unwrap();
    assert!(v.is_sign_negative(), "-0.0 must not read back as 0.0");
    assert_eq!(i.to_bits(), 0.0f64.to_bits());
}

#[test]
fn test_null_policy_stores_null() {
    let tmp = TempDir::new().unwrap();
    let config = StoreConfig::new(tmp.path().join("null.db")).with_non_finite(NonFinitePolicy::Null);
    let store = RunStore::open_with_config(config).unwrap();
    let id = iv_run(&store);
    store
        .add_results(id, &[ResultRow::from_pairs([("V", 1.0), ("I", f64::NAN)])])
        .unwrap();
    store.mark_completed(id).unwrap();

    let table = store.export(id).unwrap();
    assert_eq!(table.column("I").unwrap(), vec![None]);
    assert!(table.to_json_rows()[0]["I"].is_null());
}

#[test]
fn test_iv_scenario_exports_single_row() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp);
    let id = iv_run(&store);
    store
        .add_results(id, &[ResultRow::from_pairs([("V", 1.0), ("I", 0.5)])])
        .unwrap();
    store.mark_completed(id).unwrap();

    let table = store.export(id).unwrap();
    assert_eq!(table.column_names(), ["V", "I"]);
    assert_eq!(table.num_rows(), 1);
    assert_eq!(
        table.rows[0],
        vec![Some(Value::Numeric(1.0)), Some(Value::Numeric(0.5))]
    );

    let batch = table.parameter_data("I").unwrap().to_record_batch(false).unwrap();
    assert_eq!(batch.num_columns(), 2);
    assert_eq!(batch.num_rows(), 1);
}

#[test]
fn test_reader_sees_whole_batches() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("shared.db");
    let writer_store = RunStore::open(&path).unwrap();
    let id = iv_run(&writer_store);

    let writer = thread::spawn(move || {
        for b in 0..20 {
            let rows: Vec<ResultRow> = (0..10)
                .map(|i| {
                    let v = (b * 10 + i) as f64;
                    ResultRow::from_pairs([("V", v), ("I", v / 2.0)])
                })
                .collect();
            writer_store.add_results(id, &rows).unwrap();
        }
        writer_store.mark_completed(id).unwrap();
    });

    let reader = RunStore::open(&path).unwrap();
    loop {
        let count = reader.result_count(id).unwrap();
        assert_eq!(count % 10, 0, "Reader saw a partial batch ({count} rows)");
        if reader.get_run(id).unwrap().is_completed() {
            break;
        }
        thread::sleep(Duration::from_millis(1));
    }
    writer.join().unwrap();
    assert_eq!(reader.result_count(id).unwrap(), 200);
}

#[test]
fn test_newer_file_is_never_opened() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("future.db");
    {
        let store = RunStore::open(&path).unwrap();
        iv_run(&store);
    }
    let conn = rusqlite::Connection::open(&path).unwrap();
    conn.execute_batch("PRAGMA user_version = 42;").unwrap();
    drop(conn);

    let err = RunStore::open(&path).err().expect("Open should fail");
    assert!(matches!(err, MeasdbError::VersionMismatch { found: 42, .. }));
    assert_eq!(measdb_core::schema::inspect_version(&path).unwrap(), 42);
}

#[test]
fn test_store_opens_from_yaml_config() {
    let tmp = TempDir::new().unwrap();
    let yaml = tmp.path().join("measdb.yaml");
    std::fs::write(&yaml, "path: data/lab.db\njournal_mode: delete\n").unwrap();

    let config = StoreConfig::from_yaml_file(&yaml).unwrap();
    let store = RunStore::open_with_config(config).unwrap();
    iv_run(&store);
    assert!(tmp.path().join("data").join("lab.db").exists());
    assert_eq!(store.list_runs().unwrap().len(), 1);
}

#[test]
fn test_writer_engine_flushes_and_completes() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp);
    let id = store
        .create_run(
            "ramp",
            vec![ParamSpec::numeric("V"), ParamSpec::numeric("I").depends_on(["V"])],
            Metadata::new(),
        )
        .unwrap();

    let writer = ResultWriter::new(
        store.clone(),
        id,
        WriterConfig {
            flush_interval_rows: 7,
            flush_interval_ms: 20,
        },
    )
    .unwrap();
    assert_eq!(store.get_run(id).unwrap().state, RunState::Writing);

    for i in 0..30 {
        writer
            .add_result(ResultRow::from_pairs([("V", i as f64), ("I", i as f64 * 0.1)]))
            .unwrap();
    }
    assert_eq!(writer.flush_blocking().unwrap(), 30);
    assert_eq!(writer.close(true).unwrap(), 30);

    let table = store.export(id).unwrap();
    assert_eq!(table.num_rows(), 30);
}

#[test]
fn test_text_values_and_timestamps_survive() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp);
    let id = store
        .create_run(
            "log",
            vec![ParamSpec::text("event"), ParamSpec::numeric("T")],
            Metadata::new(),
        )
        .unwrap();
    store.mark_started(id).unwrap();

    let ts = chrono::DateTime::parse_from_rfc3339("2024-03-01T12:00:00.123456Z")
        .unwrap()
        .with_timezone(&chrono::Utc);
    let row = ResultRow::from_pairs([("event", Value::from("valve, open"))]).with_timestamp(ts);
    store.add_results(id, &[row.clone()]).unwrap();

    let back = store.get_results(id).unwrap();
    assert_eq!(back, vec![row]);
}
