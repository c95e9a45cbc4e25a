//! Buffered result writer.
//!
//! `ResultWriter::new()` spawns a background tokio task that owns the
//! pending-row buffer. `add_result()` checks the row against the run's
//! layout and then does a channel send, so acquisition loops never wait on
//! SQLite. The task commits the buffer as one atomic batch every
//! `flush_interval_rows` rows or `flush_interval_ms` milliseconds.

use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Runtime;
use tokio::sync::{mpsc, oneshot};
use tokio::time::interval;
use tracing::{error, info};

use crate::config::WriterConfig;
use crate::error::{MeasdbError, Result};
use crate::models::{ResultRow, RunState};
use crate::store::RunStore;
use crate::validate::Layout;

/// Commands sent to the background writer task.
enum WriteCommand {
    /// Buffer one validated row.
    Row(ResultRow),
    /// Commit the buffer now and report the rows committed so far.
    Flush(oneshot::Sender<Result<u64>>),
    /// Commit the buffer, optionally complete the run, and stop.
    Shutdown {
        complete: bool,
        reply: oneshot::Sender<Result<u64>>,
    },
}

/// Non-blocking writer for one run.
///
/// Internally holds a sender to a tokio mpsc channel. All SQLite writes
/// happen in a background task on a dedicated runtime thread. The writer
/// must be created and dropped outside of any async context.
pub struct ResultWriter {
    sender: mpsc::UnboundedSender<WriteCommand>,
    /// Keep the runtime alive as long as the writer exists.
    runtime: Arc<Runtime>,
    layout: Layout,
    run_id: i64,
}

impl ResultWriter {
    /// Create a writer for `run_id`, starting the run if it is still
    /// `Created`. Completed runs are refused.
    pub fn new(store: RunStore, run_id: i64, config: WriterConfig) -> Result<Self> {
        match store.get_run(run_id)?.state {
            RunState::Created => store.mark_started(run_id)?,
            RunState::Writing => {}
            RunState::Completed => return Err(MeasdbError::AlreadyCompleted(run_id)),
        }
        let layout = store.layout(run_id)?;

        let runtime = Arc::new(
            tokio::runtime::Builder::new_multi_thread()
                .worker_threads(1)
                .thread_name("measdb-writer")
                .enable_all()
                .build()?,
        );

        let (sender, receiver) = mpsc::unbounded_channel::<WriteCommand>();
        runtime.spawn(background_task(receiver, store, run_id, config.clone()));

        info!(
            run_id,
            flush_rows = config.flush_interval_rows,
            flush_ms = config.flush_interval_ms,
            "ResultWriter initialized"
        );

        Ok(Self {
            sender,
            runtime,
            layout,
            run_id,
        })
    }

    pub fn run_id(&self) -> i64 {
        self.run_id
    }

    /// Queue one row. The row is checked here; a bad row is refused
    /// immediately and never reaches the buffer.
    pub fn add_result(&self, row: ResultRow) -> Result<()> {
        self.layout.validate_row(0, &row)?;
        self.sender
            .send(WriteCommand::Row(row))
            .map_err(|_| MeasdbError::ChannelClosed)
    }

    /// Commit everything buffered so far. Returns the total number of rows
    /// this writer has committed, or the error of a failed background flush.
    pub async fn flush(&self) -> Result<u64> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(WriteCommand::Flush(tx))
            .map_err(|_| MeasdbError::ChannelClosed)?;
        rx.await.map_err(|_| MeasdbError::ChannelClosed)?
    }

    /// [`flush`](Self::flush) for synchronous callers.
    pub fn flush_blocking(&self) -> Result<u64> {
        self.runtime.block_on(self.flush())
    }

    /// Commit what is buffered and stop the background task. With
    /// `complete`, the run is marked completed after the final commit.
    /// Blocks until done.
    pub fn close(&self, complete: bool) -> Result<u64> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(WriteCommand::Shutdown { complete, reply: tx })
            .map_err(|_| MeasdbError::ChannelClosed)?;
        self.runtime
            .block_on(rx)
            .map_err(|_| MeasdbError::ChannelClosed)?
    }
}

impl Drop for ResultWriter {
    fn drop(&mut self) {
        // Best-effort commit on drop; the run stays open.
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(WriteCommand::Shutdown {
                complete: false,
                reply: tx,
            })
            .is_ok()
        {
            let _ = self
                .runtime
                .block_on(async { tokio::time::timeout(Duration::from_secs(5), rx).await });
        }
    }
}

// ─── Background task ─────────────────────────────────────────────────────────

/// State owned by the background task.
struct Buffer {
    store: RunStore,
    run_id: i64,
    rows: Vec<ResultRow>,
    committed: u64,
    /// First failure since the last report to a caller.
    failure: Option<MeasdbError>,
}

impl Buffer {
    fn commit(&mut self) {
        if self.rows.is_empty() {
            return;
        }
        match self.store.add_results(self.run_id, &self.rows) {
            Ok(n) => self.committed += n as u64,
            Err(e) => {
                error!(run_id = self.run_id, rows = self.rows.len(), "Failed to commit results: {}", e);
                if self.failure.is_none() {
                    self.failure = Some(e);
                }
            }
        }
        self.rows.clear();
    }

    /// Committed so far, or the pending failure (which is then cleared).
    fn report(&mut self) -> Result<u64> {
        match self.failure.take() {
            Some(e) => Err(e),
            None => Ok(self.committed),
        }
    }
}

async fn background_task(
    mut receiver: mpsc::UnboundedReceiver<WriteCommand>,
    store: RunStore,
    run_id: i64,
    config: WriterConfig,
) {
    let flush_rows = config.flush_interval_rows.max(1);
    let mut buffer = Buffer {
        store,
        run_id,
        rows: Vec::with_capacity(flush_rows * 2),
        committed: 0,
        failure: None,
    };
    let mut flush_ticker = interval(Duration::from_millis(config.flush_interval_ms.max(1)));
    flush_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            // Prioritize incoming commands
            biased;

            cmd = receiver.recv() => {
                match cmd {
                    None => {
                        // Writer dropped without shutdown.
                        buffer.commit();
                        break;
                    }
                    Some(WriteCommand::Row(row)) => {
                        buffer.rows.push(row);
                        if buffer.rows.len() >= flush_rows {
                            buffer.commit();
                        }
                    }
                    Some(WriteCommand::Flush(reply)) => {
                        buffer.commit();
                        let _ = reply.send(buffer.report());
                    }
                    Some(WriteCommand::Shutdown { complete, reply }) => {
                        buffer.commit();
                        let mut result = buffer.report();
                        if complete && result.is_ok() {
                            if let Err(e) = buffer.store.mark_completed(run_id) {
                                result = Err(e);
                            }
                        }
                        info!(run_id, committed = buffer.committed, complete, "ResultWriter closed");
                        let _ = reply.send(result);
                        break;
                    }
                }
            }

            // Periodic flush
            _ = flush_ticker.tick() => {
                buffer.commit();
            }
        }
    }
}
