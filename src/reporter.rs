use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex as SyncMutex;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::chain::ChainClient;
use crate::errors::OracleResult;
use crate::proofs::ProofStore;
use crate::scoring::EpochScorer;
use crate::storage::Storage;
use crate::types::{current_timestamp, Contribution};

pub const REPORT_TICK: Duration = Duration::from_secs(60);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CycleStats {
    pub reported: usize,
    pub failed: usize,
}

/// Drives the exactly-once-per-epoch contribution write.
///
/// The block gate (`report_interval_blocks`) advances only after a fully
/// successful batch, and the scorer's epoch accumulators are reset on the
/// same condition, so any partial failure leaves the next tick retrying the
/// identical batch. The on-chain contract is idempotent under repeated
/// reports for the same `(agent, epoch)`.
pub struct ReporterCore {
    storage: Storage,
    chain: Arc<dyn ChainClient>,
    scorer: Arc<EpochScorer>,
    proofs: ProofStore,
    report_interval_blocks: u64,
    last_report_block: SyncMutex<Option<u64>>,
    is_running: AtomicBool,
}

impl ReporterCore {
    pub fn new(
        storage: Storage,
        chain: Arc<dyn ChainClient>,
        scorer: Arc<EpochScorer>,
        proofs: ProofStore,
        report_interval_blocks: u64,
    ) -> Self {
        Self {
            storage,
            chain,
            scorer,
            proofs,
            report_interval_blocks,
            last_report_block: SyncMutex::new(None),
            is_running: AtomicBool::new(false),
        }
    }

    /// One tick. Returns the cycle stats when a report cycle actually ran.
    pub async fn tick(&self) -> OracleResult<Option<CycleStats>> {
        // A slow cycle must never overlap the next tick.
        if self
            .is_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("previous report cycle still running, skipping tick");
            return Ok(None);
        }
        let result = self.gated_cycle().await;
        self.is_running.store(false, Ordering::Release);
        result
    }

    async fn gated_cycle(&self) -> OracleResult<Option<CycleStats>> {
        let block = self.chain.current_block().await?;
        {
            let mut last = self.last_report_block.lock();
            match *last {
                None => {
                    // First tick only records where we are.
                    *last = Some(block);
                    return Ok(None);
                }
                Some(reference) if block.saturating_sub(reference) < self.report_interval_blocks => {
                    return Ok(None);
                }
                Some(_) => {}
            }
        }

        let stats = self.run_cycle().await?;
        if stats.failed == 0 {
            self.scorer.reset_epoch();
            *self.last_report_block.lock() = Some(block);
            info!(
                reported = stats.reported,
                block, "contribution report cycle complete"
            );
        } else {
            warn!(
                reported = stats.reported,
                failed = stats.failed,
                "partial report cycle, retrying next tick"
            );
        }
        Ok(Some(stats))
    }

    /// Reports every active agent for the current epoch. Per-agent failures
    /// are counted and skipped; they never abort the batch.
    pub async fn run_cycle(&self) -> OracleResult<CycleStats> {
        let epoch = self.chain.current_epoch().await?;
        let agents = self.chain.active_agents().await?;
        let mut stats = CycleStats::default();

        for agent in agents {
            match self.report_agent(&agent, epoch).await {
                Ok(()) => stats.reported += 1,
                Err(err) => {
                    stats.failed += 1;
                    warn!(agent = %agent, epoch, %err, "contribution report failed");
                }
            }
        }
        Ok(stats)
    }

    async fn report_agent(&self, agent: &str, epoch: u64) -> OracleResult<()> {
        let metrics = self.storage.get_metrics(agent, epoch)?;
        let verified_tokens = self.proofs.verified_token_count(agent, epoch)?;
        let score = self
            .scorer
            .compute(&agent.to_string(), metrics.as_ref(), verified_tokens)?;

        self.chain
            .report_contribution(
                agent,
                score.task_count,
                score.uptime_seconds,
                score.response_score,
                score.processed_tokens,
                score.avg_latency_inv,
            )
            .await?;

        // Only after inclusion does the local row move.
        self.storage.put_contribution(&Contribution {
            address: agent.to_string(),
            epoch,
            task_count: score.task_count,
            uptime_seconds: score.uptime_seconds,
            response_score: score.response_score,
            processed_tokens: score.processed_tokens,
            avg_latency_inv: score.avg_latency_inv,
            last_updated: current_timestamp(),
        })
    }
}

/// Ticker wrapper owning the background task.
pub struct ContributionReporter {
    shutdown: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ContributionReporter {
    pub fn start(core: Arc<ReporterCore>) -> Self {
        let (tx, mut rx) = watch::channel(false);
        let worker = tokio::spawn(async move {
            let mut ticker = time::interval(REPORT_TICK);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = core.tick().await {
                            warn!(%err, "report tick failed");
                        }
                    }
                    changed = rx.changed() => {
                        if changed.is_ok() && *rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });
        Self {
            shutdown: tx,
            worker: Mutex::new(Some(worker)),
        }
    }

    pub async fn shutdown(&self) {
        if self.shutdown.send(true).is_err() {
            return;
        }
        if let Some(handle) = self.worker.lock().await.take() {
            if let Err(err) = handle.await {
                debug!(?err, "reporter worker exited with error");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::testing::MockChainClient;
    use crate::types::{Address, EpochMetrics, TaskRecord};
    use tempfile::tempdir;

    struct Fixture {
        _dir: tempfile::TempDir,
        storage: Storage,
        chain: MockChainClient,
        scorer: Arc<EpochScorer>,
        core: ReporterCore,
    }

    fn fixture(interval: u64) -> Fixture {
        let dir = tempdir().unwrap();
        let storage = Storage::open(dir.path(), false).unwrap();
        let chain = MockChainClient::new();
        chain.state.lock().epoch = 41;
        let scorer = Arc::new(EpochScorer::new(storage.clone()));
        let core = ReporterCore::new(
            storage.clone(),
            Arc::new(chain.clone()),
            scorer.clone(),
            ProofStore::new(storage.clone()),
            interval,
        );
        Fixture {
            _dir: dir,
            storage,
            chain,
            scorer,
            core,
        }
    }

    fn agents(fixture: &Fixture, count: usize) -> Vec<Address> {
        (0..count)
            .map(|index| {
                let address = format!("0x{:040x}", index + 1);
                fixture.chain.register(&address);
                let mut metrics = EpochMetrics::new(address.clone(), 41);
                metrics.tokens_processed = 100 * (index as u64 + 1);
                fixture.storage.put_metrics(&metrics).unwrap();
                address
            })
            .collect()
    }

    #[tokio::test]
    async fn first_tick_only_records_the_block_position() {
        let fixture = fixture(10);
        fixture.chain.state.lock().block = 100;
        assert_eq!(fixture.core.tick().await.unwrap(), None);
        assert!(fixture.chain.state.lock().report_calls.is_empty());

        // Not enough blocks elapsed yet.
        fixture.chain.state.lock().block = 105;
        assert_eq!(fixture.core.tick().await.unwrap(), None);

        fixture.chain.state.lock().block = 110;
        agents(&fixture, 1);
        let stats = fixture.core.tick().await.unwrap().unwrap();
        assert_eq!(stats.reported, 1);
    }

    #[tokio::test]
    async fn successful_cycle_writes_contributions_and_resets_accumulators() {
        let fixture = fixture(0);
        let addresses = agents(&fixture, 3);
        fixture
            .scorer
            .record_task(&addresses[0], TaskRecord {
                challenge_id: 7,
                solved_at: 0,
                solve_time_secs: 12.0,
            });
        fixture.chain.state.lock().block = 1;
        fixture.core.tick().await.unwrap();
        fixture.chain.state.lock().block = 2;
        let stats = fixture.core.tick().await.unwrap().unwrap();
        assert_eq!(stats.reported, 3);
        assert_eq!(stats.failed, 0);

        let contribution = fixture
            .storage
            .get_contribution(&addresses[0], 41)
            .unwrap()
            .unwrap();
        assert_eq!(contribution.task_count, 1);
        // Accumulators reset after the fully successful batch.
        assert_eq!(fixture.scorer.task_count(&addresses[0]), 0);
    }

    #[tokio::test]
    async fn partial_failure_keeps_accumulators_and_retries_all_agents() {
        let fixture = fixture(0);
        let addresses = agents(&fixture, 10);
        fixture
            .scorer
            .record_task(&addresses[2], TaskRecord {
                challenge_id: 9,
                solved_at: 0,
                solve_time_secs: 30.0,
            });
        fixture.chain.state.lock().failing_reports.insert(7);

        fixture.chain.state.lock().block = 1;
        fixture.core.tick().await.unwrap();
        fixture.chain.state.lock().block = 2;
        let stats = fixture.core.tick().await.unwrap().unwrap();
        assert_eq!(stats.reported, 9);
        assert_eq!(stats.failed, 1);
        // Score map intact.
        assert_eq!(fixture.scorer.task_count(&addresses[2]), 1);

        // Next tick retries the whole batch of ten.
        fixture.chain.state.lock().block = 3;
        let stats = fixture.core.tick().await.unwrap().unwrap();
        assert_eq!(stats.reported, 10);
        assert_eq!(stats.failed, 0);
        assert_eq!(fixture.chain.state.lock().report_calls.len(), 20);
        assert_eq!(fixture.scorer.task_count(&addresses[2]), 0);
    }
}
