//! Batch orchestrator: drives sources through the fallback chain and the
//! checkpoint manager.
//!
//! Sources are processed sequentially; items within a batch run
//! concurrently under a semaphore. Batches within a source are processed
//! and checkpointed in index order, so a resume reading
//! `last_batch_index = N` may assume batches 0..=N are fully reflected
//! in the output. An unhandled error mid-batch and an external interrupt
//! both force an immediate checkpoint before surfacing, bounding loss to
//! the one in-flight batch.

use crate::backend::{ChainOutcome, FallbackChain};
use crate::checkpoint::{Checkpoint, CheckpointManager, SessionState, SourceStatus};
use crate::models::{EnrichedItem, Item, PipelineError, Result, RunStats};
use crate::pipeline::ItemSource;
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

/// Orchestrator tunables, extracted from the pipeline config.
#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    /// Items per batch
    pub batch_size: usize,
    /// Max concurrent items within a batch
    pub batch_concurrency: usize,
    /// Path for the final merged output
    pub output_path: PathBuf,
}

enum SourceRun {
    Completed,
    Interrupted,
}

/// Drives one session to completion, checkpointing along the way.
///
/// Exclusively owns the session state and per-source lifecycle; the
/// checkpoint manager exclusively owns the on-disk artifacts.
pub struct BatchOrchestrator {
    chain: Arc<FallbackChain>,
    checkpoint: Arc<Mutex<CheckpointManager>>,
    state: SessionState,
    items: BTreeMap<String, EnrichedItem>,
    options: OrchestratorOptions,
    /// Set by the caller's interrupt handler; checked between batches
    shutdown: Arc<AtomicBool>,
    batches_run: u64,
    batches_skipped: u64,
}

impl BatchOrchestrator {
    /// Start a fresh session.
    pub fn new(
        chain: FallbackChain,
        checkpoint: CheckpointManager,
        state: SessionState,
        options: OrchestratorOptions,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            chain: Arc::new(chain),
            checkpoint: Arc::new(Mutex::new(checkpoint)),
            state,
            items: BTreeMap::new(),
            options,
            shutdown,
            batches_run: 0,
            batches_skipped: 0,
        }
    }

    /// Resume from a loaded, validated checkpoint.
    pub fn resume(
        chain: FallbackChain,
        checkpoint: CheckpointManager,
        loaded: Checkpoint,
        options: OrchestratorOptions,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            chain: Arc::new(chain),
            checkpoint: Arc::new(Mutex::new(checkpoint)),
            state: loaded.state,
            items: loaded.items,
            options,
            shutdown,
            batches_run: 0,
            batches_skipped: 0,
        }
    }

    /// Session id of the run being driven.
    pub fn session_id(&self) -> &str {
        &self.state.session_id
    }

    /// Current session state (for reporting).
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Process all sources to a terminal status.
    ///
    /// Returns `Interrupted` when the shutdown flag was raised; any other
    /// error aborted the run. Both paths leave a freshly forced
    /// checkpoint behind.
    pub async fn run(&mut self, sources: &[Arc<dyn ItemSource>]) -> Result<RunStats> {
        let start = Instant::now();

        for source in sources {
            self.state.ensure_source(source.id());
        }

        for source in sources {
            if self.shutdown.load(Ordering::SeqCst) {
                return self.interrupt().await;
            }

            let id = source.id().to_string();
            let status = self.state.ensure_source(&id).status;
            if status == SourceStatus::Completed {
                info!(source = %id, "Source already completed, skipping");
                continue;
            }

            let skip = self.state.ensure_source(&id).batches_done();
            self.batches_skipped += skip;
            if skip > 0 {
                info!(
                    source = %id,
                    batches_skipped = skip,
                    resume_at_batch = skip,
                    "Resuming source from checkpoint"
                );
            }
            self.state.begin_source(&id);

            match self.run_source(source.as_ref(), skip).await {
                Ok(SourceRun::Completed) => {
                    self.state.finish_source(&id, SourceStatus::Completed);
                    info!(source = %id, "Source completed");
                }
                Ok(SourceRun::Interrupted) => {
                    return self.interrupt().await;
                }
                Err(e) => {
                    // Forced checkpoint, then re-raise. A save failure here
                    // must not mask the original error.
                    self.state.finish_source(&id, SourceStatus::Failed);
                    if let Err(save_err) = self.checkpoint_now().await {
                        error!(
                            error = %save_err,
                            "Forced checkpoint failed while handling a batch error"
                        );
                    } else {
                        info!(
                            session_id = %self.state.session_id,
                            "Progress checkpointed before surfacing error"
                        );
                    }
                    return Err(e);
                }
            }
        }

        self.finish(start).await
    }

    /// Process one source from `start_index` until exhaustion.
    async fn run_source(&mut self, source: &dyn ItemSource, start_index: u64) -> Result<SourceRun> {
        let total_batches = source
            .total_items()
            .map(|n| (n as u64).div_ceil(self.options.batch_size as u64));
        let pb = progress_bar(total_batches);
        pb.set_position(start_index);
        if let Some(total) = total_batches {
            info!(
                source = %source.id(),
                batches_total = total,
                batches_to_run = total.saturating_sub(start_index),
                "Starting source"
            );
        }

        let mut index = start_index;
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                pb.abandon_with_message("interrupted");
                return Ok(SourceRun::Interrupted);
            }

            let batch = source.fetch_batch(index, self.options.batch_size).await?;
            if batch.is_empty() {
                break;
            }
            let batch_len = batch.len();

            let outcomes = self.process_batch(batch).await?;

            let mut enriched = 0u64;
            let mut low_confidence = 0u64;
            let mut failed = 0u64;
            for outcome in outcomes {
                match (outcome.low_confidence, outcome.result.success) {
                    (false, _) => enriched += 1,
                    (true, true) => low_confidence += 1,
                    (true, false) => failed += 1,
                }
                self.items.insert(outcome.item_id.clone(), outcome.into_enriched());
            }

            self.state
                .ensure_source(source.id())
                .record_batch(index, enriched, low_confidence, failed);
            self.state.total_cost_usd = self.chain.ledger().spent_usd();
            self.batches_run += 1;

            pb.set_position(index + 1);
            pb.set_message(format!(
                "cost ${:.4}",
                self.state.total_cost_usd
            ));

            if self.should_checkpoint()? {
                self.checkpoint_now().await?;
            }

            if batch_len < self.options.batch_size {
                break;
            }
            index += 1;
        }

        pb.finish_and_clear();
        Ok(SourceRun::Completed)
    }

    /// Run one batch of items through the chain, concurrently, preserving
    /// item order in the returned outcomes.
    async fn process_batch(&self, batch: Vec<Item>) -> Result<Vec<ChainOutcome>> {
        let semaphore = Arc::new(Semaphore::new(self.options.batch_concurrency.max(1)));
        let mut handles = Vec::with_capacity(batch.len());

        for item in batch {
            let chain = Arc::clone(&self.chain);
            let semaphore = Arc::clone(&semaphore);
            handles.push(tokio::spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| PipelineError::Internal("semaphore closed".to_string()))?;
                Ok::<_, PipelineError>(chain.process(&item).await)
            }));
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        for handle in handles {
            let outcome = handle
                .await
                .map_err(|e| PipelineError::Internal(format!("item task failed: {e}")))??;
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    fn should_checkpoint(&self) -> Result<bool> {
        Ok(self.lock_checkpoint()?.should_checkpoint())
    }

    /// Forced checkpoint save, bypassing the time interval. Runs on a
    /// blocking thread; completion is awaited so the caller can treat the
    /// batch as durably saved.
    async fn checkpoint_now(&self) -> Result<()> {
        let manager = Arc::clone(&self.checkpoint);
        let state = self.state.clone();
        let items = self.items.clone();

        tokio::task::spawn_blocking(move || {
            let mut manager = manager
                .lock()
                .map_err(|_| PipelineError::Internal("checkpoint manager poisoned".to_string()))?;
            manager.save(&state, &items).map_err(PipelineError::from)
        })
        .await
        .map_err(|e| PipelineError::Internal(format!("checkpoint task failed: {e}")))?
    }

    fn lock_checkpoint(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, CheckpointManager>> {
        self.checkpoint
            .lock()
            .map_err(|_| PipelineError::Internal("checkpoint manager poisoned".to_string()))
    }

    /// Interrupt path: forced checkpoint, then the distinct error.
    async fn interrupt(&mut self) -> Result<RunStats> {
        warn!(
            session_id = %self.state.session_id,
            "Interrupt received, forcing checkpoint"
        );
        self.checkpoint_now().await?;
        info!(
            session_id = %self.state.session_id,
            "Progress saved; resume with this session id"
        );
        Err(PipelineError::Interrupted)
    }

    /// All sources terminal: write the merged output, then drop the
    /// checkpoint artifacts.
    async fn finish(&mut self, start: Instant) -> Result<RunStats> {
        self.write_output().await?;

        if self.state.is_complete() {
            self.lock_checkpoint()?.cleanup()?;
        }

        let (enriched, low_confidence, failed) = self.state.item_counts();
        let mut stats = RunStats {
            total_items: self.items.len(),
            accepted: enriched as usize,
            low_confidence: low_confidence as usize,
            failed: failed as usize,
            batches_run: self.batches_run,
            batches_skipped: self.batches_skipped,
            total_cost_usd: self.chain.ledger().spent_usd(),
            runtime_secs: start.elapsed().as_secs_f64(),
            ..Default::default()
        };
        stats.finalize();

        info!(
            session_id = %self.state.session_id,
            items = stats.total_items,
            accepted = stats.accepted,
            low_confidence = stats.low_confidence,
            cost = format!("${:.4}", stats.total_cost_usd),
            "Run complete"
        );
        Ok(stats)
    }

    async fn write_output(&self) -> Result<()> {
        let path = self.options.output_path.clone();
        let items = self.items.clone();

        tokio::task::spawn_blocking(move || {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| PipelineError::io("creating output directory", e))?;
                }
            }
            let file = std::fs::File::create(&path)
                .map_err(|e| PipelineError::io("creating output file", e))?;
            let writer = std::io::BufWriter::new(file);
            serde_json::to_writer_pretty(writer, &items)
                .map_err(|e| PipelineError::Internal(format!("serializing output: {e}")))?;
            Ok::<_, PipelineError>(())
        })
        .await
        .map_err(|e| PipelineError::Internal(format!("output task failed: {e}")))?
    }
}

fn progress_bar(total_batches: Option<u64>) -> ProgressBar {
    match total_batches {
        Some(total) => {
            let pb = ProgressBar::new(total);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} batches {msg}")
                    .unwrap()
                    .progress_chars("##-"),
            );
            pb
        }
        None => ProgressBar::new_spinner(),
    }
}
