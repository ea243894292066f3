use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex as SyncMutex;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::chain::{ChainClient, EpochCursor};
use crate::errors::OracleResult;
use crate::storage::Storage;
use crate::types::{current_timestamp, Contribution, Epoch, Stake};

pub const DISTRIBUTION_TICK: Duration = Duration::from_secs(60);

/// Detects epoch rollover, triggers on-chain reward distribution for the
/// closed epoch, and back-fills the local contribution rows from the
/// contract's final tallies.
pub struct DistributorCore {
    storage: Storage,
    chain: Arc<dyn ChainClient>,
    epoch_cursor: Arc<EpochCursor>,
    last_checked_epoch: SyncMutex<Option<u64>>,
}

impl DistributorCore {
    pub fn new(storage: Storage, chain: Arc<dyn ChainClient>, epoch_cursor: Arc<EpochCursor>) -> Self {
        Self {
            storage,
            chain,
            epoch_cursor,
            last_checked_epoch: SyncMutex::new(None),
        }
    }

    pub async fn tick(&self) -> OracleResult<()> {
        let current = self.chain.current_epoch().await?;
        self.epoch_cursor.set(current);

        let from = {
            let mut last = self.last_checked_epoch.lock();
            match *last {
                None => {
                    *last = Some(current);
                    return Ok(());
                }
                Some(last_checked) if current <= last_checked => return Ok(()),
                Some(last_checked) => last_checked,
            }
        };

        // Close every epoch we slept through, oldest first.
        for epoch in from..current {
            self.close_epoch(epoch).await?;
            *self.last_checked_epoch.lock() = Some(epoch + 1);
        }
        Ok(())
    }

    /// `syncRewards` then `distributeRewards`, submitted serially with
    /// inclusion waits between, the ordering the contract requires.
    async fn close_epoch(&self, epoch: u64) -> OracleResult<()> {
        if self.chain.epoch_distributed(epoch).await? {
            debug!(epoch, "epoch already distributed, back-filling only");
        } else {
            self.chain.sync_rewards().await?;
            self.chain.distribute_rewards(epoch).await?;
            info!(epoch, "distributed epoch rewards");
        }
        self.backfill(epoch).await
    }

    /// The contract's tallies are authoritative once the epoch is closed;
    /// local rows converge to them.
    async fn backfill(&self, epoch: u64) -> OracleResult<()> {
        let agents = self.chain.epoch_agents(epoch).await?;
        let now = current_timestamp();
        for agent in &agents {
            let Some(onchain) = self.chain.epoch_contribution(epoch, agent).await? else {
                continue;
            };
            self.storage.put_contribution(&Contribution {
                address: agent.clone(),
                epoch,
                task_count: onchain.task_count,
                uptime_seconds: onchain.uptime_seconds,
                response_score: onchain.response_score,
                processed_tokens: onchain.processed_tokens,
                avg_latency_inv: onchain.avg_latency_inv,
                last_updated: now,
            })?;
        }
        self.storage.put_epoch(&Epoch {
            number: epoch,
            reward: Stake::zero(),
            agent_count: agents.len() as u64,
            distributed: true,
            synced_at: now,
        })?;
        Ok(())
    }
}

/// Ticker wrapper owning the background task.
pub struct EpochDistributor {
    shutdown: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl EpochDistributor {
    pub fn start(core: Arc<DistributorCore>) -> Self {
        let (tx, mut rx) = watch::channel(false);
        let worker = tokio::spawn(async move {
            let mut ticker = time::interval(DISTRIBUTION_TICK);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = core.tick().await {
                            warn!(%err, "distribution tick failed");
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
                debug!(?err, "distributor worker exited with error");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::testing::MockChainClient;
    use crate::chain::ChainContribution;
    use tempfile::tempdir;

    fn core(chain: &MockChainClient, dir: &tempfile::TempDir) -> DistributorCore {
        let storage = Storage::open(dir.path(), false).unwrap();
        DistributorCore::new(
            storage,
            Arc::new(chain.clone()),
            Arc::new(EpochCursor::new(0)),
        )
    }

    #[tokio::test]
    async fn rollover_triggers_sync_then_distribute_and_backfill() {
        let dir = tempdir().unwrap();
        let chain = MockChainClient::new();
        let address = format!("0x{:040x}", 7);
        {
            let mut state = chain.state.lock();
            state.epoch = 41;
            state.epoch_agents.insert(41, vec![address.clone()]);
            state.contributions.insert(
                (41, address.clone()),
                ChainContribution {
                    task_count: 4,
                    uptime_seconds: 3_000,
                    response_score: 88,
                    processed_tokens: 5_000,
                    avg_latency_inv: 9_000,
                },
            );
        }
        let core = core(&chain, &dir);

        // First tick only latches the cursor.
        core.tick().await.unwrap();
        assert_eq!(chain.state.lock().sync_calls, 0);

        chain.state.lock().epoch = 42;
        core.tick().await.unwrap();

        let state = chain.state.lock();
        assert_eq!(state.sync_calls, 1);
        assert_eq!(state.distribute_calls, vec![41]);
        drop(state);

        let row = core.storage.get_contribution(&address, 41).unwrap().unwrap();
        assert_eq!(row.task_count, 4);
        assert_eq!(row.processed_tokens, 5_000);
        let epoch = core.storage.get_epoch(41).unwrap().unwrap();
        assert!(epoch.distributed);
        assert_eq!(epoch.agent_count, 1);
        assert_eq!(core.epoch_cursor.get(), 42);
    }

    #[tokio::test]
    async fn already_distributed_epoch_skips_the_writes() {
        let dir = tempdir().unwrap();
        let chain = MockChainClient::new();
        {
            let mut state = chain.state.lock();
            state.epoch = 41;
            state.distributed.insert(41);
        }
        let core = core(&chain, &dir);
        core.tick().await.unwrap();
        chain.state.lock().epoch = 42;
        core.tick().await.unwrap();

        let state = chain.state.lock();
        assert_eq!(state.sync_calls, 0);
        assert!(state.distribute_calls.is_empty());
    }

    #[tokio::test]
    async fn multiple_missed_epochs_are_closed_oldest_first() {
        let dir = tempdir().unwrap();
        let chain = MockChainClient::new();
        chain.state.lock().epoch = 40;
        let core = core(&chain, &dir);
        core.tick().await.unwrap();
        chain.state.lock().epoch = 43;
        core.tick().await.unwrap();
        assert_eq!(chain.state.lock().distribute_calls, vec![40, 41, 42]);
    }
}
