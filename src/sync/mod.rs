//! Ingestion engine: walks the chain forward one block at a time and commits
//! each block's write set atomically

mod node_client;
mod processor;
mod shutdown;

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use futures::stream::{self, StreamExt, TryStreamExt};
use std::time::{Duration, Instant};

use crate::db::LedgerRepository;
use crate::error::{IndexError, IndexResult, SourceError};
use crate::models::ResumePoint;
pub use node_client::{BlockPayload, ChainSource, NodeClient, TransactionPayload};
pub use shutdown::{shutdown_channel, Shutdown, ShutdownTrigger};

#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Wait between polls while the cursor sits on the chain tip
    pub poll_interval: Duration,
    pub retry_initial: Duration,
    pub retry_max: Duration,
    /// Attempts per transaction fetch, and consecutive malformed block responses tolerated
    pub fetch_attempts: u32,
    pub fetch_concurrency: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(20),
            retry_initial: Duration::from_millis(500),
            retry_max: Duration::from_secs(30),
            fetch_attempts: 5,
            fetch_concurrency: 8,
        }
    }
}

impl EngineSettings {
    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.retry_initial)
            .with_max_interval(self.retry_max)
            .with_max_elapsed_time(None)
            .build()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub blocks_ingested: u64,
    pub blocks_skipped: u64,
    pub transactions: u64,
    pub outputs: u64,
    pub linked_inputs: u64,
    pub unlinked_inputs: u64,
    pub tip_polls: u64,
    pub fetch_retries: u64,
}

/// Outcome of one pass through fetch → transform → persist
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Ingested { height: i64, hash: String },
    /// Already stored block met while walking forward from a revisited parent
    Skipped { hash: String },
    /// The block at the cursor has no successor yet; nothing was written
    AtTip { hash: String },
    /// The fetch failed transiently; the cursor did not move
    Retry { delay: Duration },
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Position {
    cursor: String,
    /// Height the next inserted block must have: the number of blocks stored
    expected_height: i64,
    revisiting: bool,
}

pub struct IngestEngine<S> {
    source: S,
    ledger: LedgerRepository,
    settings: EngineSettings,
    shutdown: Shutdown,
    position: Option<Position>,
    backoff: ExponentialBackoff,
    malformed_streak: u32,
    failed_fetches: u32,
    stats: IngestStats,
}

impl<S: ChainSource> IngestEngine<S> {
    pub fn new(source: S, ledger: LedgerRepository, settings: EngineSettings, shutdown: Shutdown) -> Self {
        Self {
            backoff: settings.backoff(),
            source,
            ledger,
            settings,
            shutdown,
            position: None,
            malformed_streak: 0,
            failed_fetches: 0,
            stats: IngestStats::default(),
        }
    }

    pub fn stats(&self) -> &IngestStats {
        &self.stats
    }

    /// Hash the next fetch will request, once resumed
    pub fn cursor(&self) -> Option<&str> {
        self.position.as_ref().map(|p| p.cursor.as_str())
    }

    /// Consumes the engine, releasing its hold on the store
    pub fn close(self) -> IngestStats {
        drop(self.ledger);
        self.stats
    }

    /// Ingests until shutdown or a fatal error. Never returns `Ok` on its own.
    pub async fn run(&mut self) -> IndexResult<()> {
        self.resume().await?;

        loop {
            match self.step().await? {
                Step::Ingested { .. } | Step::Skipped { .. } => {}
                Step::AtTip { .. } => self.shutdown.sleep(self.settings.poll_interval).await?,
                Step::Retry { delay } => self.shutdown.sleep(delay).await?,
            }
        }
    }

    /// Derives the traversal cursor from persisted state
    pub async fn resume(&mut self) -> IndexResult<()> {
        let cursor = self.ledger.cursor()?;
        let stored = self.ledger.block_count()?;

        let (hash, revisiting) = match cursor.resume_point() {
            ResumePoint::Genesis => {
                let genesis = self.genesis_hash().await?;
                tracing::info!(hash = %genesis, "Empty ledger, starting from genesis");
                (genesis, false)
            }
            ResumePoint::Revisit(previous) => {
                tracing::info!(
                    hash = %previous,
                    "Last stored block had no successor, walking forward from its parent"
                );
                (previous, true)
            }
            ResumePoint::Next(next) => (next, false),
        };

        match self.shutdown.guard(self.source.chain_tip()).await? {
            Ok(tip) => tracing::info!(
                stored,
                tip,
                behind = (tip + 1 - stored).max(0),
                cursor = %hash,
                "Resuming ingestion"
            ),
            Err(e) => tracing::warn!(cursor = %hash, error = %e, "Could not read chain tip"),
        }

        self.position = Some(Position {
            cursor: hash,
            expected_height: stored,
            revisiting,
        });
        Ok(())
    }

    async fn genesis_hash(&mut self) -> IndexResult<String> {
        loop {
            match self.shutdown.guard(self.source.block_hash_at_height(0)).await? {
                Ok(hash) => {
                    self.reset_retries();
                    return Ok(hash);
                }
                Err(e) => {
                    let delay = self.retry_delay(e, "height 0")?;
                    self.shutdown.sleep(delay).await?;
                }
            }
        }
    }

    /// One fetch → transform → persist → advance pass at the current cursor
    pub async fn step(&mut self) -> IndexResult<Step> {
        if self.position.is_none() {
            self.resume().await?;
        }
        let position = match self.position.clone() {
            Some(position) => position,
            None => return Err(IndexError::Cancelled),
        };
        let started = Instant::now();

        let block = match self.shutdown.guard(self.source.block_by_hash(&position.cursor)).await? {
            Ok(block) => block,
            Err(e) => {
                let delay = self.retry_delay(e, &position.cursor)?;
                return Ok(Step::Retry { delay });
            }
        };
        self.reset_retries();

        if position.revisiting && self.ledger.contains_block(&block.hash.to_ascii_lowercase())? {
            return Ok(match block.successor() {
                Some(next) => {
                    tracing::debug!(height = block.height, hash = %block.hash, "Already stored, skipping");
                    self.stats.blocks_skipped += 1;
                    self.position = Some(Position {
                        cursor: next.to_string(),
                        ..position
                    });
                    Step::Skipped { hash: block.hash }
                }
                None => {
                    self.stats.tip_polls += 1;
                    Step::AtTip { hash: block.hash }
                }
            });
        }

        let next = match block.successor() {
            Some(next) => next.to_string(),
            None => {
                tracing::debug!(height = block.height, hash = %block.hash, "At chain tip, waiting");
                self.stats.tip_polls += 1;
                return Ok(Step::AtTip { hash: block.hash });
            }
        };

        if block.height != position.expected_height {
            return Err(IndexError::OutOfOrder {
                hash: block.hash,
                expected: position.expected_height,
                found: block.height,
            });
        }

        let transactions = if block.height == 0 {
            Vec::new()
        } else {
            self.fetch_transactions(&block).await?
        };

        let set = processor::transform(&block, &transactions)?;
        let report = self.ledger.persist(&set, &self.shutdown).map_err(|e| {
            if e.is_fatal() {
                tracing::error!(height = block.height, hash = %block.hash, error = %e, "Block write aborted");
            }
            e
        })?;

        self.stats.blocks_ingested += 1;
        self.stats.transactions += report.transactions as u64;
        self.stats.outputs += report.outputs as u64;
        self.stats.linked_inputs += report.linked_inputs as u64;
        self.stats.unlinked_inputs += report.unlinked_inputs.len() as u64;

        if !report.unlinked_inputs.is_empty() {
            tracing::warn!(
                height = block.height,
                count = report.unlinked_inputs.len(),
                inputs = ?report.unlinked_inputs,
                "Inputs spend outputs that are not in the store"
            );
        }

        tracing::info!(
            height = block.height,
            hash = %block.hash,
            confirmations = block.confirmations,
            transactions = report.transactions,
            outputs = report.outputs,
            next = %next,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Block indexed"
        );

        self.position = Some(Position {
            cursor: next,
            expected_height: position.expected_height + 1,
            revisiting: false,
        });

        Ok(Step::Ingested {
            height: block.height,
            hash: block.hash,
        })
    }

    /// Backoff delay for a failed fetch that keeps the cursor in place.
    /// Malformed responses are only tolerated a bounded number of times in a row.
    fn retry_delay(&mut self, error: SourceError, cursor: &str) -> IndexResult<Duration> {
        self.failed_fetches += 1;
        if let SourceError::Malformed(_) = error {
            self.malformed_streak += 1;
            if self.malformed_streak >= self.settings.fetch_attempts {
                tracing::error!(
                    cursor = %cursor,
                    attempts = self.malformed_streak,
                    error = %error,
                    "Source keeps returning malformed data"
                );
                return Err(error.into());
            }
        }

        let delay = self.backoff.next_backoff().unwrap_or(self.settings.retry_max);
        self.stats.fetch_retries += 1;
        tracing::warn!(
            cursor = %cursor,
            attempt = self.failed_fetches,
            error = %error,
            delay_ms = delay.as_millis() as u64,
            "Fetch failed, retrying"
        );
        Ok(delay)
    }

    fn reset_retries(&mut self) {
        self.backoff.reset();
        self.malformed_streak = 0;
        self.failed_fetches = 0;
    }

    /// Fetches every listed transaction, keeping the listed order
    async fn fetch_transactions(&self, block: &BlockPayload) -> IndexResult<Vec<TransactionPayload>> {
        stream::iter(block.transactions.iter())
            .map(|txid| self.fetch_transaction(txid, block.height))
            .buffered(self.settings.fetch_concurrency.max(1))
            .try_collect()
            .await
    }

    async fn fetch_transaction(&self, txid: &str, height: i64) -> IndexResult<TransactionPayload> {
        let mut backoff = self.settings.backoff();
        let mut attempt = 1;

        loop {
            match self.shutdown.guard(self.source.transaction_by_id(txid)).await? {
                Ok(tx) => return Ok(tx),
                Err(e) if attempt < self.settings.fetch_attempts => {
                    let delay = backoff.next_backoff().unwrap_or(self.settings.retry_max);
                    tracing::warn!(
                        txid,
                        height,
                        attempt,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "Transaction fetch failed, retrying"
                    );
                    self.shutdown.sleep(delay).await?;
                    attempt += 1;
                }
                Err(e) => {
                    tracing::error!(txid, height, attempts = attempt, error = %e, "Transaction fetch failed");
                    return Err(e.into());
                }
            }
        }
    }
}
