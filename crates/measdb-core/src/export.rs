//! Exporter: completed runs as tables, Arrow batches, Parquet, CSV and JSON.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, Float64Array, Float64Builder, ListBuilder, StringArray, TimestampMicrosecondArray,
};
use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use arrow::record_batch::{RecordBatch, RecordBatchOptions};
use chrono::{DateTime, Utc};
use parquet::arrow::arrow_writer::ArrowWriter;
use parquet::file::properties::WriterProperties;

use crate::error::{MeasdbError, Result};
use crate::models::{ParamSpec, ParamType, Value};
use crate::store::RunStore;

/// A completed run in tabular form.
///
/// `columns` follow the run's spec registration order and every row has one
/// slot per column; `None` marks a value the row did not record.
#[derive(Debug, Clone, PartialEq)]
pub struct RunTable {
    pub run_id: i64,
    pub columns: Vec<ParamSpec>,
    pub timestamps: Vec<DateTime<Utc>>,
    pub rows: Vec<Vec<Option<Value>>>,
}

impl RunStore {
    /// Export a completed run. Fails with `RunNotComplete` otherwise.
    pub fn export(&self, run_id: i64) -> Result<RunTable> {
        let snapshot = self.snapshot(run_id)?;
        if !snapshot.run.is_completed() {
            return Err(MeasdbError::RunNotComplete(run_id));
        }
        let (timestamps, rows): (Vec<_>, Vec<_>) = snapshot.rows.into_iter().unzip();
        Ok(RunTable {
            run_id,
            columns: snapshot.run.specs,
            timestamps,
            rows,
        })
    }
}

impl RunTable {
    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// All values of one column, top to bottom.
    pub fn column(&self, name: &str) -> Option<Vec<Option<&Value>>> {
        let idx = self.column_index(name)?;
        Some(self.rows.iter().map(|r| r[idx].as_ref()).collect())
    }

    /// The dependent parameter with its setpoints, restricted to rows where
    /// the dependent was recorded. Columns keep registration order.
    pub fn parameter_data(&self, dependent: &str) -> Result<RunTable> {
        let dep_idx = self.column_index(dependent).ok_or_else(|| {
            MeasdbError::Other(format!("run {} has no parameter '{dependent}'", self.run_id))
        })?;
        let dep = &self.columns[dep_idx];

        let keep: Vec<usize> = self
            .columns
            .iter()
            .enumerate()
            .filter(|(i, c)| *i == dep_idx || dep.depends_on.contains(&c.name))
            .map(|(i, _)| i)
            .collect();

        let mut timestamps = Vec::new();
        let mut rows = Vec::new();
        for (ts, row) in self.timestamps.iter().zip(&self.rows) {
            if row[dep_idx].is_none() {
                continue;
            }
            timestamps.push(*ts);
            rows.push(keep.iter().map(|&i| row[i].clone()).collect());
        }

        Ok(RunTable {
            run_id: self.run_id,
            columns: keep.iter().map(|&i| self.columns[i].clone()).collect(),
            timestamps,
            rows,
        })
    }

    /// Arrow form: `Float64`, `List<Float64>` or `Utf8` per parameter,
    /// optionally followed by a UTC `timestamp` column.
    pub fn to_record_batch(&self, include_timestamp: bool) -> Result<RecordBatch> {
        let mut fields = Vec::with_capacity(self.columns.len() + 1);
        let mut arrays: Vec<ArrayRef> = Vec::with_capacity(self.columns.len() + 1);

        for (idx, spec) in self.columns.iter().enumerate() {
            match spec.param_type {
                ParamType::Numeric => {
                    let vals: Vec<Option<f64>> = self
                        .rows
                        .iter()
                        .map(|r| r[idx].as_ref().and_then(Value::as_f64))
                        .collect();
                    fields.push(Field::new(&spec.name, DataType::Float64, true));
                    arrays.push(Arc::new(Float64Array::from(vals)));
                }
                ParamType::Text => {
                    let vals: Vec<Option<&str>> = self
                        .rows
                        .iter()
                        .map(|r| r[idx].as_ref().and_then(Value::as_text))
                        .collect();
                    fields.push(Field::new(&spec.name, DataType::Utf8, true));
                    arrays.push(Arc::new(StringArray::from(vals)));
                }
                ParamType::Array => {
                    let mut builder = ListBuilder::new(Float64Builder::new());
                    for row in &self.rows {
                        match row[idx].as_ref().and_then(Value::as_array) {
                            Some(arr) => {
                                builder.values().append_slice(arr.data());
                                builder.append(true);
                            }
                            None => builder.append(false),
                        }
                    }
                    let list = builder.finish();
                    fields.push(Field::new(&spec.name, list.data_type().clone(), true));
                    arrays.push(Arc::new(list));
                }
            }
        }

        if include_timestamp {
            let micros: Vec<i64> = self.timestamps.iter().map(|t| t.timestamp_micros()).collect();
            fields.push(Field::new(
                "timestamp",
                DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
                false,
            ));
            arrays.push(Arc::new(
                TimestampMicrosecondArray::from(micros).with_timezone_opt(Some("UTC".to_string())),
            ));
        }

        let schema = Arc::new(Schema::new(fields));
        // A run without parameters still has a row count.
        let options = RecordBatchOptions::new().with_row_count(Some(self.num_rows()));
        Ok(RecordBatch::try_new_with_options(schema, arrays, &options)?)
    }

    /// Write the table (with timestamps) to a Snappy-compressed Parquet file.
    pub fn write_parquet(&self, path: &Path) -> Result<()> {
        let batch = self.to_record_batch(true)?;
        let file = fs::File::create(path)?;
        let props = WriterProperties::builder()
            .set_compression(parquet::basic::Compression::SNAPPY)
            .build();
        let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props))?;
        writer.write(&batch)?;
        writer.close()?;
        Ok(())
    }

    /// CSV with a header row; the timestamp column comes last.
    pub fn to_csv(&self) -> String {
        let mut header: Vec<String> = self.columns.iter().map(|c| csv_field(&c.name)).collect();
        header.push("timestamp".to_string());
        let mut out = header.join(",") + "\n";
        for (ts, row) in self.timestamps.iter().zip(&self.rows) {
            let mut vals: Vec<String> = row
                .iter()
                .map(|v| match v {
                    None => String::new(),
                    Some(Value::Numeric(f)) => format_f64(*f),
                    Some(Value::Text(s)) => csv_field(s),
                    Some(Value::Array(a)) => csv_field(&format!(
                        "[{}]",
                        a.data().iter().map(|f| format_f64(*f)).collect::<Vec<_>>().join(" ")
                    )),
                })
                .collect();
            vals.push(ts.to_rfc3339());
            out += &(vals.join(",") + "\n");
        }
        out
    }

    /// One JSON object per row. JSON has no NaN or infinity, so those are
    /// written as the strings `"NaN"`, `"inf"` and `"-inf"`.
    pub fn to_json_rows(&self) -> Vec<serde_json::Map<String, serde_json::Value>> {
        self.timestamps
            .iter()
            .zip(&self.rows)
            .map(|(ts, row)| {
                let mut obj = serde_json::Map::new();
                for (spec, v) in self.columns.iter().zip(row) {
                    let json = match v {
                        None => serde_json::Value::Null,
                        Some(Value::Numeric(f)) => json_f64(*f),
                        Some(Value::Text(s)) => serde_json::json!(s),
                        Some(Value::Array(a)) => serde_json::Value::Array(
                            a.data().iter().map(|f| json_f64(*f)).collect(),
                        ),
                    };
                    obj.insert(spec.name.clone(), json);
                }
                obj.insert("timestamp".to_string(), serde_json::json!(ts.to_rfc3339()));
                obj
            })
            .collect()
    }
}

fn format_f64(f: f64) -> String {
    // Display already gives "NaN", "inf" and "-inf".
    f.to_string()
}

fn json_f64(f: f64) -> serde_json::Value {
    if f.is_finite() {
        serde_json::json!(f)
    } else {
        serde_json::Value::String(format_f64(f))
    }
}

fn csv_field(s: &str) -> String {
    if s.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}
