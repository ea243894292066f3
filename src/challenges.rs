use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex as SyncMutex;
use rand::Rng;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::chain::{ChainClient, ChallengeEvent};
use crate::errors::OracleResult;
use crate::scoring::EpochScorer;
use crate::storage::Storage;
use crate::types::{current_timestamp, Challenge, Stake, TaskRecord};

const CHALLENGE_DIFFICULTY: u32 = 3;
const CHALLENGE_DURATION_SECS: u64 = 600;

/// Rotates on-chain challenges and feeds solved events into the scorer's
/// task log.
pub struct ChallengeCore {
    storage: Storage,
    chain: Arc<dyn ChainClient>,
    scorer: Arc<EpochScorer>,
    next_event_block: SyncMutex<u64>,
}

impl ChallengeCore {
    pub fn new(storage: Storage, chain: Arc<dyn ChainClient>, scorer: Arc<EpochScorer>) -> Self {
        Self {
            storage,
            chain,
            scorer,
            next_event_block: SyncMutex::new(0),
        }
    }

    pub async fn tick(&self) -> OracleResult<()> {
        self.drain_events().await?;
        self.rotate().await
    }

    async fn drain_events(&self) -> OracleResult<()> {
        let head = self.chain.current_block().await?;
        let from = *self.next_event_block.lock();
        if from > head {
            return Ok(());
        }
        let events = self.chain.challenge_events(from, head).await?;
        for event in events {
            if let Err(err) = self.apply_event(&event) {
                warn!(%err, "challenge event dropped");
            }
        }
        *self.next_event_block.lock() = head + 1;
        Ok(())
    }

    fn apply_event(&self, event: &ChallengeEvent) -> OracleResult<()> {
        match event {
            ChallengeEvent::Created { challenge, .. } => {
                self.storage.put_challenge(&Challenge {
                    id: challenge.id,
                    difficulty: challenge.difficulty,
                    seed: challenge.seed.clone(),
                    created_at: challenge.created_at,
                    expires_at: challenge.expires_at,
                    solved: false,
                    solver: None,
                    reward_bonus: challenge.reward_bonus.clone(),
                })?;
                debug!(id = challenge.id, "challenge created");
            }
            ChallengeEvent::Solved {
                challenge_id,
                solver,
                solve_time_secs,
                ..
            } => {
                if let Some(mut challenge) = self.storage.get_challenge(*challenge_id)? {
                    challenge.solved = true;
                    challenge.solver = Some(solver.clone());
                    self.storage.put_challenge(&challenge)?;
                }
                self.scorer.record_task(
                    solver,
                    TaskRecord {
                        challenge_id: *challenge_id,
                        solved_at: current_timestamp(),
                        solve_time_secs: *solve_time_secs,
                    },
                );
                info!(id = challenge_id, solver = %solver, "challenge solved");
            }
        }
        Ok(())
    }

    /// Keeps exactly one live challenge on-chain.
    async fn rotate(&self) -> OracleResult<()> {
        let now = current_timestamp();
        let current = self.chain.current_challenge().await?;
        let needs_new = match &current {
            None => true,
            Some(challenge) => challenge.solved || now >= challenge.expires_at,
        };
        if !needs_new {
            return Ok(());
        }
        let seed = hex::encode(rand::thread_rng().gen::<[u8; 16]>());
        let id = self
            .chain
            .create_challenge(CHALLENGE_DIFFICULTY, &seed, CHALLENGE_DURATION_SECS)
            .await?;
        self.storage.put_challenge(&Challenge {
            id,
            difficulty: CHALLENGE_DIFFICULTY,
            seed,
            created_at: now,
            expires_at: now + CHALLENGE_DURATION_SECS,
            solved: false,
            solver: None,
            reward_bonus: Stake::zero(),
        })?;
        info!(id, "rotated challenge");
        Ok(())
    }
}

/// Ticker wrapper owning the background task.
pub struct ChallengeService {
    shutdown: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ChallengeService {
    pub fn start(core: Arc<ChallengeCore>, cadence: Duration) -> Self {
        let (tx, mut rx) = watch::channel(false);
        let worker = tokio::spawn(async move {
            let mut ticker = time::interval(cadence);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = core.tick().await {
                            warn!(%err, "challenge tick failed");
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
                debug!(?err, "challenge worker exited with error");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::testing::MockChainClient;
    use tempfile::tempdir;

    #[tokio::test]
    async fn rotation_creates_a_challenge_when_none_is_live() {
        let dir = tempdir().unwrap();
        let storage = Storage::open(dir.path(), false).unwrap();
        let chain = MockChainClient::new();
        let scorer = Arc::new(EpochScorer::new(storage.clone()));
        let core = ChallengeCore::new(storage.clone(), Arc::new(chain.clone()), scorer);

        core.tick().await.unwrap();
        assert!(chain.state.lock().challenge.is_some());
        assert_eq!(storage.load_challenges().unwrap().len(), 1);

        // Live challenge present: second tick must not rotate.
        core.tick().await.unwrap();
        assert_eq!(storage.load_challenges().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn solved_events_land_in_the_task_log() {
        let dir = tempdir().unwrap();
        let storage = Storage::open(dir.path(), false).unwrap();
        let chain = MockChainClient::new();
        let scorer = Arc::new(EpochScorer::new(storage.clone()));
        let solver = format!("0x{:040x}", 9);
        chain.state.lock().events.push(ChallengeEvent::Solved {
            challenge_id: 5,
            solver: solver.clone(),
            solve_time_secs: 42.0,
            block: 1,
        });
        let core = ChallengeCore::new(storage, Arc::new(chain.clone()), scorer.clone());
        core.tick().await.unwrap();
        assert_eq!(scorer.task_count(&solver), 1);
    }
}
