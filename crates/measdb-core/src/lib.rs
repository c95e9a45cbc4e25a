//! measdb-core: transactional storage engine for measurement runs.
//!
//! Runs, their parameter specs and their result rows live in one versioned
//! SQLite file. Result batches commit atomically, completed runs are
//! immutable, and NaN / infinity round-trip through storage unchanged.

mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod export;
pub mod models;
pub mod schema;
pub mod store;
pub mod validate;

pub use config::{JournalMode, NonFinitePolicy, StoreConfig, WriterConfig};
pub use engine::ResultWriter;
pub use error::{MeasdbError, Result};
pub use export::RunTable;
pub use models::{ArrayValue, Metadata, ParamSpec, ParamType, ResultRow, Run, RunState, RunSummary, Value};
pub use store::{Batch, RunStore};
pub use validate::{validate_specs, Layout};
