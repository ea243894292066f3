use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k256::ecdsa::SigningKey;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::crypto::{sign_message, signer_address};
use crate::errors::{OracleError, OracleResult};
use crate::types::{Address, Stake};

/// Fixed-address precompiles exposed by the chain.
pub const PRECOMPILE_VERIFY_INFERENCE: &str = "0x0000000000000000000000000000000000000020";
pub const PRECOMPILE_AGENT_REGISTER: &str = "0x0000000000000000000000000000000000000021";
pub const PRECOMPILE_AGENT_HEARTBEAT: &str = "0x0000000000000000000000000000000000000022";
pub const PRECOMPILE_CLAIM_REWARD: &str = "0x0000000000000000000000000000000000000023";

const RECEIPT_POLL_INTERVAL: Duration = Duration::from_millis(500);
const RECEIPT_POLL_ATTEMPTS: u32 = 120;
const BLOCK_POLL_INTERVAL: Duration = Duration::from_secs(2);
const BLOCK_POLL_MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Shared cache of the chain's current epoch, refreshed by the epoch
/// distributor tick.
#[derive(Debug, Default)]
pub struct EpochCursor(AtomicU64);

impl EpochCursor {
    pub fn new(epoch: u64) -> Self {
        Self(AtomicU64::new(epoch))
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    pub fn set(&self, epoch: u64) {
        self.0.store(epoch, Ordering::Release);
    }
}

/// Registry-side view of an agent.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChainAgent {
    pub node_id: String,
    pub metadata: String,
    pub registered_at: u64,
    pub last_heartbeat: u64,
    pub status: String,
    pub stake: Stake,
}

/// Contribution tuple as the reward pool returns it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChainContribution {
    pub task_count: u64,
    pub uptime_seconds: u64,
    pub response_score: u64,
    pub processed_tokens: u64,
    pub avg_latency_inv: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChainChallenge {
    pub id: u64,
    pub difficulty: u32,
    pub seed: String,
    pub created_at: u64,
    pub expires_at: u64,
    pub solved: bool,
    pub solver: Option<Address>,
    pub reward_bonus: Stake,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChallengeEvent {
    Created {
        challenge: ChainChallenge,
        block: u64,
    },
    Solved {
        challenge_id: u64,
        solver: Address,
        solve_time_secs: f64,
        block: u64,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogView {
    pub address: String,
    pub topics: Vec<String>,
    pub data: String,
}

/// A transaction with its receipt outcome folded in; the watcher only ever
/// needs the two together.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TxView {
    pub hash: String,
    pub from: String,
    pub to: Option<String>,
    pub input: String,
    pub status: bool,
    #[serde(default)]
    pub logs: Vec<LogView>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BlockView {
    pub number: u64,
    pub transactions: Vec<TxView>,
}

/// Contract surface the oracle consumes. Write methods await inclusion and
/// return the transaction hash; a revert surfaces as [`OracleError::Chain`].
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn current_epoch(&self) -> OracleResult<u64>;
    async fn current_block(&self) -> OracleResult<u64>;
    async fn balance(&self, address: &str) -> OracleResult<Stake>;

    async fn active_agents(&self) -> OracleResult<Vec<Address>>;
    async fn all_agents(&self) -> OracleResult<Vec<Address>>;
    async fn agent_info(&self, address: &str) -> OracleResult<Option<ChainAgent>>;
    async fn is_agent_account(&self, address: &str) -> OracleResult<bool>;
    async fn agent_meta(&self, address: &str) -> OracleResult<Option<Value>>;

    async fn report_contribution(
        &self,
        address: &str,
        task_count: u64,
        uptime_seconds: u64,
        response_score: u64,
        processed_tokens: u64,
        avg_latency_inv: u64,
    ) -> OracleResult<String>;
    async fn sync_rewards(&self) -> OracleResult<String>;
    async fn distribute_rewards(&self, epoch: u64) -> OracleResult<String>;
    async fn epoch_distributed(&self, epoch: u64) -> OracleResult<bool>;
    async fn epoch_agents(&self, epoch: u64) -> OracleResult<Vec<Address>>;
    async fn epoch_contribution(
        &self,
        epoch: u64,
        address: &str,
    ) -> OracleResult<Option<ChainContribution>>;
    async fn pending_reward(&self, address: &str) -> OracleResult<Stake>;

    async fn current_challenge(&self) -> OracleResult<Option<ChainChallenge>>;
    async fn create_challenge(
        &self,
        difficulty: u32,
        seed: &str,
        duration_secs: u64,
    ) -> OracleResult<u64>;
    async fn challenge_history(&self, offset: u64, count: u64)
        -> OracleResult<Vec<ChainChallenge>>;
    async fn challenge_events(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> OracleResult<Vec<ChallengeEvent>>;

    async fn sponsored_heartbeat(&self, address: &str) -> OracleResult<String>;
    async fn block_by_number(&self, number: u64) -> OracleResult<Option<BlockView>>;

    /// Ordered stream of sealed blocks. The implementation reconnects with
    /// backoff; the channel closes only on shutdown.
    async fn subscribe_blocks(&self) -> OracleResult<mpsc::Receiver<BlockView>>;
}

/// JSON-RPC implementation over HTTP. Writes are authenticated with the
/// oracle's secp256k1 signature over the canonical call payload; the chain
/// only accepts them from the signer registered as oracle.
#[derive(Clone)]
pub struct HttpChainClient {
    client: reqwest::Client,
    url: String,
    chain_id: u64,
    signer: SigningKey,
    signer_address: Address,
    request_id: Arc<AtomicU64>,
}

impl HttpChainClient {
    pub fn new(url: String, chain_id: u64, signer: SigningKey) -> Self {
        let signer_address = signer_address(&signer);
        Self {
            client: reqwest::Client::new(),
            url,
            chain_id,
            signer,
            signer_address,
            request_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn signer_address(&self) -> &str {
        &self.signer_address
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> OracleResult<T> {
        let id = self.request_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|err| OracleError::Chain(format!("rpc transport: {err}")))?;
        let envelope: Value = response
            .json()
            .await
            .map_err(|err| OracleError::Chain(format!("rpc decode: {err}")))?;
        if let Some(error) = envelope.get("error") {
            return Err(OracleError::Chain(format!("{method} failed: {error}")));
        }
        let result = envelope
            .get("result")
            .cloned()
            .ok_or_else(|| OracleError::Chain(format!("{method} returned no result")))?;
        serde_json::from_value(result)
            .map_err(|err| OracleError::Chain(format!("{method} result decode: {err}")))
    }

    /// Submits a signed write call and polls until the transaction is
    /// included. Reverts map to `OracleError::Chain`.
    async fn submit(&self, method: &str, mut params: Value) -> OracleResult<String> {
        let canonical = serde_json::to_string(&json!({
            "chain_id": self.chain_id,
            "method": method,
            "params": params,
            "sender": self.signer_address,
        }))
        .map_err(|err| OracleError::Chain(format!("canonical encode: {err}")))?;
        let signature = sign_message(&self.signer, canonical.as_bytes())?;
        params["sender"] = json!(self.signer_address);
        params["signature"] = json!(signature);
        let tx_hash: String = self.call(method, params).await?;
        self.await_receipt(&tx_hash).await?;
        Ok(tx_hash)
    }

    async fn await_receipt(&self, tx_hash: &str) -> OracleResult<()> {
        for _ in 0..RECEIPT_POLL_ATTEMPTS {
            let receipt: Option<Value> = self
                .call("chain_getTransactionReceipt", json!([tx_hash]))
                .await?;
            if let Some(receipt) = receipt {
                let status = receipt
                    .get("status")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                if status {
                    return Ok(());
                }
                return Err(OracleError::Chain(format!("transaction {tx_hash} reverted")));
            }
            tokio::time::sleep(RECEIPT_POLL_INTERVAL).await;
        }
        Err(OracleError::Chain(format!(
            "transaction {tx_hash} not included in time"
        )))
    }

    /// 32-byte block with the address right-aligned, the calling convention
    /// every precompile uses.
    fn pad_address(address: &str) -> OracleResult<Vec<u8>> {
        let raw = hex::decode(address.trim_start_matches("0x"))
            .map_err(|err| OracleError::Chain(format!("invalid address: {err}")))?;
        if raw.len() != 20 {
            return Err(OracleError::Chain(format!(
                "invalid address length: {}",
                raw.len()
            )));
        }
        let mut padded = vec![0u8; 12];
        padded.extend_from_slice(&raw);
        Ok(padded)
    }
}

#[async_trait]
impl ChainClient for HttpChainClient {
    async fn current_epoch(&self) -> OracleResult<u64> {
        self.call("chain_getCurrentEpoch", json!([])).await
    }

    async fn current_block(&self) -> OracleResult<u64> {
        self.call("chain_getCurrentBlock", json!([])).await
    }

    async fn balance(&self, address: &str) -> OracleResult<Stake> {
        let raw: String = self.call("chain_getBalance", json!([address])).await?;
        raw.parse()
            .map_err(|_| OracleError::Chain(format!("invalid balance: {raw}")))
    }

    async fn active_agents(&self) -> OracleResult<Vec<Address>> {
        self.call("registry_getActiveAgents", json!([])).await
    }

    async fn all_agents(&self) -> OracleResult<Vec<Address>> {
        self.call("registry_getAllAgents", json!([])).await
    }

    async fn agent_info(&self, address: &str) -> OracleResult<Option<ChainAgent>> {
        self.call("registry_getAgent", json!([address])).await
    }

    async fn is_agent_account(&self, address: &str) -> OracleResult<bool> {
        self.call("agent_isAgentAccount", json!([address])).await
    }

    async fn agent_meta(&self, address: &str) -> OracleResult<Option<Value>> {
        self.call("agent_getAgentMeta", json!([address])).await
    }

    async fn report_contribution(
        &self,
        address: &str,
        task_count: u64,
        uptime_seconds: u64,
        response_score: u64,
        processed_tokens: u64,
        avg_latency_inv: u64,
    ) -> OracleResult<String> {
        self.submit(
            "rewards_reportContribution",
            json!({
                "agent": address,
                "task_count": task_count,
                "uptime": uptime_seconds,
                "response_score": response_score,
                "processed_tokens": processed_tokens,
                "avg_latency_inv": avg_latency_inv,
            }),
        )
        .await
    }

    async fn sync_rewards(&self) -> OracleResult<String> {
        self.submit("rewards_syncRewards", json!({})).await
    }

    async fn distribute_rewards(&self, epoch: u64) -> OracleResult<String> {
        self.submit("rewards_distributeRewards", json!({ "epoch": epoch }))
            .await
    }

    async fn epoch_distributed(&self, epoch: u64) -> OracleResult<bool> {
        self.call("rewards_epochDistributed", json!([epoch])).await
    }

    async fn epoch_agents(&self, epoch: u64) -> OracleResult<Vec<Address>> {
        self.call("rewards_getEpochAgents", json!([epoch])).await
    }

    async fn epoch_contribution(
        &self,
        epoch: u64,
        address: &str,
    ) -> OracleResult<Option<ChainContribution>> {
        self.call("rewards_getEpochContribution", json!([epoch, address]))
            .await
    }

    async fn pending_reward(&self, address: &str) -> OracleResult<Stake> {
        let raw: String = self
            .call("rewards_getPendingReward", json!([address]))
            .await?;
        raw.parse()
            .map_err(|_| OracleError::Chain(format!("invalid reward: {raw}")))
    }

    async fn current_challenge(&self) -> OracleResult<Option<ChainChallenge>> {
        self.call("challenges_getCurrent", json!([])).await
    }

    async fn create_challenge(
        &self,
        difficulty: u32,
        seed: &str,
        duration_secs: u64,
    ) -> OracleResult<u64> {
        let tx_hash = self
            .submit(
                "challenges_create",
                json!({
                    "difficulty": difficulty,
                    "seed": seed,
                    "duration": duration_secs,
                }),
            )
            .await?;
        debug!(%tx_hash, "challenge creation included");
        let challenge: Option<ChainChallenge> = self.current_challenge().await?;
        challenge
            .map(|challenge| challenge.id)
            .ok_or_else(|| OracleError::Chain("challenge missing after creation".into()))
    }

    async fn challenge_history(
        &self,
        offset: u64,
        count: u64,
    ) -> OracleResult<Vec<ChainChallenge>> {
        self.call("challenges_getHistory", json!([offset, count]))
            .await
    }

    async fn challenge_events(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> OracleResult<Vec<ChallengeEvent>> {
        self.call("challenges_getEvents", json!([from_block, to_block]))
            .await
    }

    async fn sponsored_heartbeat(&self, address: &str) -> OracleResult<String> {
        let data = Self::pad_address(address)?;
        self.submit(
            "chain_sendRawCall",
            json!({
                "to": PRECOMPILE_AGENT_HEARTBEAT,
                "data": format!("0x{}", hex::encode(data)),
            }),
        )
        .await
    }

    async fn block_by_number(&self, number: u64) -> OracleResult<Option<BlockView>> {
        self.call("chain_getBlockByNumber", json!([number, true]))
            .await
    }

    async fn subscribe_blocks(&self) -> OracleResult<mpsc::Receiver<BlockView>> {
        let (tx, rx) = mpsc::channel(64);
        let client = self.clone();
        // Resume from the tip; historical blocks are the distributor's
        // back-sync problem, not the stream's.
        let mut next = client.current_block().await?.saturating_add(1);
        tokio::spawn(async move {
            let mut backoff = BLOCK_POLL_INTERVAL;
            loop {
                match client.block_by_number(next).await {
                    Ok(Some(block)) => {
                        backoff = BLOCK_POLL_INTERVAL;
                        next = block.number.saturating_add(1);
                        if tx.send(block).await.is_err() {
                            return;
                        }
                    }
                    Ok(None) => {
                        backoff = BLOCK_POLL_INTERVAL;
                        tokio::time::sleep(BLOCK_POLL_INTERVAL).await;
                    }
                    Err(err) => {
                        warn!(%err, block = next, "block stream poll failed, backing off");
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(BLOCK_POLL_MAX_BACKOFF);
                    }
                }
                if tx.is_closed() {
                    return;
                }
            }
        });
        Ok(rx)
    }
}

/// In-memory chain double for unit and scenario tests.
#[doc(hidden)]
pub mod testing {
    use std::collections::{HashMap, HashSet};
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;

    #[derive(Default)]
    pub struct MockChainState {
        pub epoch: u64,
        pub block: u64,
        pub registered: HashSet<Address>,
        pub active: Vec<Address>,
        pub distributed: HashSet<u64>,
        pub epoch_agents: HashMap<u64, Vec<Address>>,
        pub contributions: HashMap<(u64, Address), ChainContribution>,
        pub challenge: Option<ChainChallenge>,
        pub events: Vec<ChallengeEvent>,
        pub report_calls: Vec<Address>,
        pub heartbeat_calls: Vec<Address>,
        pub sync_calls: u64,
        pub distribute_calls: Vec<u64>,
        /// 1-based indices of `report_contribution` calls that revert.
        pub failing_reports: HashSet<u64>,
        pub blocks: Vec<BlockView>,
    }

    #[derive(Clone, Default)]
    pub struct MockChainClient {
        pub state: Arc<Mutex<MockChainState>>,
    }

    impl MockChainClient {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn register(&self, address: &str) {
            let mut state = self.state.lock();
            state.registered.insert(address.to_string());
            if !state.active.contains(&address.to_string()) {
                state.active.push(address.to_string());
            }
        }
    }

    #[async_trait]
    impl ChainClient for MockChainClient {
        async fn current_epoch(&self) -> OracleResult<u64> {
            Ok(self.state.lock().epoch)
        }

        async fn current_block(&self) -> OracleResult<u64> {
            Ok(self.state.lock().block)
        }

        async fn balance(&self, _address: &str) -> OracleResult<Stake> {
            Ok(Stake::zero())
        }

        async fn active_agents(&self) -> OracleResult<Vec<Address>> {
            Ok(self.state.lock().active.clone())
        }

        async fn all_agents(&self) -> OracleResult<Vec<Address>> {
            Ok(self.state.lock().registered.iter().cloned().collect())
        }

        async fn agent_info(&self, address: &str) -> OracleResult<Option<ChainAgent>> {
            let state = self.state.lock();
            Ok(state.registered.contains(address).then(|| ChainAgent {
                node_id: String::new(),
                metadata: String::new(),
                registered_at: 0,
                last_heartbeat: 0,
                status: "active".into(),
                stake: Stake::zero(),
            }))
        }

        async fn is_agent_account(&self, address: &str) -> OracleResult<bool> {
            Ok(self.state.lock().registered.contains(address))
        }

        async fn agent_meta(&self, _address: &str) -> OracleResult<Option<Value>> {
            Ok(None)
        }

        async fn report_contribution(
            &self,
            address: &str,
            task_count: u64,
            uptime_seconds: u64,
            response_score: u64,
            processed_tokens: u64,
            avg_latency_inv: u64,
        ) -> OracleResult<String> {
            let mut state = self.state.lock();
            state.report_calls.push(address.to_string());
            let call_index = state.report_calls.len() as u64;
            if state.failing_reports.contains(&call_index) {
                return Err(OracleError::Chain("transaction reverted".into()));
            }
            let epoch = state.epoch;
            state.contributions.insert(
                (epoch, address.to_string()),
                ChainContribution {
                    task_count,
                    uptime_seconds,
                    response_score,
                    processed_tokens,
                    avg_latency_inv,
                },
            );
            Ok(format!("0xreport{call_index}"))
        }

        async fn sync_rewards(&self) -> OracleResult<String> {
            self.state.lock().sync_calls += 1;
            Ok("0xsync".into())
        }

        async fn distribute_rewards(&self, epoch: u64) -> OracleResult<String> {
            let mut state = self.state.lock();
            state.distribute_calls.push(epoch);
            state.distributed.insert(epoch);
            Ok(format!("0xdistribute{epoch}"))
        }

        async fn epoch_distributed(&self, epoch: u64) -> OracleResult<bool> {
            Ok(self.state.lock().distributed.contains(&epoch))
        }

        async fn epoch_agents(&self, epoch: u64) -> OracleResult<Vec<Address>> {
            Ok(self
                .state
                .lock()
                .epoch_agents
                .get(&epoch)
                .cloned()
                .unwrap_or_default())
        }

        async fn epoch_contribution(
            &self,
            epoch: u64,
            address: &str,
        ) -> OracleResult<Option<ChainContribution>> {
            Ok(self
                .state
                .lock()
                .contributions
                .get(&(epoch, address.to_string()))
                .cloned())
        }

        async fn pending_reward(&self, _address: &str) -> OracleResult<Stake> {
            Ok(Stake::zero())
        }

        async fn current_challenge(&self) -> OracleResult<Option<ChainChallenge>> {
            Ok(self.state.lock().challenge.clone())
        }

        async fn create_challenge(
            &self,
            difficulty: u32,
            seed: &str,
            duration_secs: u64,
        ) -> OracleResult<u64> {
            let mut state = self.state.lock();
            let id = state.challenge.as_ref().map(|c| c.id + 1).unwrap_or(1);
            state.challenge = Some(ChainChallenge {
                id,
                difficulty,
                seed: seed.to_string(),
                created_at: 0,
                expires_at: duration_secs,
                solved: false,
                solver: None,
                reward_bonus: Stake::zero(),
            });
            Ok(id)
        }

        async fn challenge_history(
            &self,
            _offset: u64,
            _count: u64,
        ) -> OracleResult<Vec<ChainChallenge>> {
            Ok(Vec::new())
        }

        async fn challenge_events(
            &self,
            _from_block: u64,
            _to_block: u64,
        ) -> OracleResult<Vec<ChallengeEvent>> {
            Ok(std::mem::take(&mut self.state.lock().events))
        }

        async fn sponsored_heartbeat(&self, address: &str) -> OracleResult<String> {
            self.state.lock().heartbeat_calls.push(address.to_string());
            Ok("0xheartbeat".into())
        }

        async fn block_by_number(&self, number: u64) -> OracleResult<Option<BlockView>> {
            Ok(self
                .state
                .lock()
                .blocks
                .iter()
                .find(|block| block.number == number)
                .cloned())
        }

        async fn subscribe_blocks(&self) -> OracleResult<mpsc::Receiver<BlockView>> {
            let (tx, rx) = mpsc::channel(64);
            let blocks = self.state.lock().blocks.clone();
            tokio::spawn(async move {
                for block in blocks {
                    if tx.send(block).await.is_err() {
                        break;
                    }
                }
            });
            Ok(rx)
        }
    }
}
