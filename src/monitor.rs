use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::chain::{ChainClient, EpochCursor};
use crate::cluster::ClusterManager;
use crate::config::HEARTBEAT_TIMEOUT_SECS;
use crate::errors::OracleResult;
use crate::pipeline::PipelineAllocator;
use crate::storage::Storage;
use crate::types::{current_timestamp, Agent, AgentStatus, NetworkStats, NodeStatus};

/// Agents silent for longer than this are flagged inactive locally.
const AGENT_INACTIVE_AFTER_SECS: u64 = 300;
/// On-chain heartbeats older than this get a sponsored refresh.
const SPONSOR_THRESHOLD_SECS: u64 = 300;

pub const SPONSOR_INTERVAL: Duration = Duration::from_secs(300);
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// Liveness reconciliation between the chain registry, the local node
/// table, and the pipeline assignment table.
pub struct MonitorCore {
    storage: Storage,
    chain: Arc<dyn ChainClient>,
    allocator: Arc<PipelineAllocator>,
    clusters: Arc<ClusterManager>,
    epoch_cursor: Arc<EpochCursor>,
}

impl MonitorCore {
    pub fn new(
        storage: Storage,
        chain: Arc<dyn ChainClient>,
        allocator: Arc<PipelineAllocator>,
        clusters: Arc<ClusterManager>,
        epoch_cursor: Arc<EpochCursor>,
    ) -> Self {
        Self {
            storage,
            chain,
            allocator,
            clusters,
            epoch_cursor,
        }
    }

    /// Main reconcile pass: pull the on-chain registry, merge local node
    /// heartbeats into agent records, expire the silent, snapshot stats.
    pub async fn reconcile(&self) -> OracleResult<()> {
        let now = current_timestamp();
        let active = self.chain.active_agents().await?;
        for address in &active {
            let onchain = self.chain.agent_info(address).await?;
            let mut agent = self
                .storage
                .get_agent(address)?
                .unwrap_or_else(|| Agent::new(address.clone(), now));
            agent.status = AgentStatus::Active;
            if let Some(onchain) = onchain {
                agent.node_id = onchain.node_id;
                agent.metadata = onchain.metadata;
                agent.stake = onchain.stake;
                if onchain.registered_at > 0 {
                    agent.registered_at = onchain.registered_at;
                }
                agent.last_heartbeat = agent.last_heartbeat.max(onchain.last_heartbeat);
            }
            self.storage.put_agent(&agent)?;
        }

        for node in self.storage.load_nodes()? {
            if let Some(mut agent) = self.storage.get_agent(&node.address)? {
                if node.last_heartbeat > agent.last_heartbeat {
                    agent.last_heartbeat = node.last_heartbeat;
                    self.storage.put_agent(&agent)?;
                }
            }
            let stale = now.saturating_sub(node.last_heartbeat) > HEARTBEAT_TIMEOUT_SECS;
            if stale && node.status == NodeStatus::Active {
                let mut node = node;
                node.status = NodeStatus::Inactive;
                self.storage.put_node(&node)?;
            }
        }

        for mut agent in self.storage.load_agents()? {
            if agent.status == AgentStatus::Active
                && now.saturating_sub(agent.last_heartbeat) > AGENT_INACTIVE_AFTER_SECS
            {
                agent.status = AgentStatus::Inactive;
                self.storage.put_agent(&agent)?;
                debug!(agent = %agent.address, "agent marked inactive");
            }
        }

        self.snapshot_stats(now)
    }

    fn snapshot_stats(&self, now: u64) -> OracleResult<()> {
        let epoch = self.epoch_cursor.get();
        let agents = self.storage.load_agents()?;
        let nodes = self.storage.load_nodes()?;
        let metrics = self.storage.load_metrics_for_epoch(epoch)?;
        let assignments = self.storage.load_assignments()?;
        let mut clusters: Vec<u64> = assignments
            .iter()
            .filter_map(|row| row.cluster_id)
            .collect();
        clusters.sort_unstable();
        clusters.dedup();

        self.storage.put_network_stats(&NetworkStats {
            epoch,
            active_agents: agents
                .iter()
                .filter(|agent| agent.status == AgentStatus::Active)
                .count() as u64,
            active_nodes: nodes
                .iter()
                .filter(|node| node.status == NodeStatus::Active)
                .count() as u64,
            total_tokens_epoch: metrics.iter().map(|row| row.tokens_processed).sum(),
            total_requests_epoch: metrics.iter().map(|row| row.request_count).sum(),
            cluster_count: clusters.len() as u64,
            updated_at: now,
        })
    }

    /// Agents hold no balance for gas; the oracle refreshes their on-chain
    /// heartbeat on their behalf through the heartbeat precompile.
    pub async fn sponsor_heartbeats(&self) -> OracleResult<()> {
        let now = current_timestamp();
        for node in self.storage.load_nodes()? {
            if node.status != NodeStatus::Active {
                continue;
            }
            let stale_onchain = match self.chain.agent_info(&node.address).await? {
                Some(info) => now.saturating_sub(info.last_heartbeat) > SPONSOR_THRESHOLD_SECS,
                None => false,
            };
            if !stale_onchain {
                continue;
            }
            match self.chain.sponsored_heartbeat(&node.address).await {
                Ok(tx_hash) => {
                    debug!(agent = %node.address, %tx_hash, "sponsored heartbeat submitted")
                }
                Err(err) => {
                    warn!(agent = %node.address, %err, "sponsored heartbeat failed")
                }
            }
        }
        Ok(())
    }

    /// Deletes assignments whose unified heartbeat went silent, then
    /// re-allocates and re-checks clustering for every affected model.
    pub fn sweep_stale_assignments(&self) -> OracleResult<()> {
        let now = current_timestamp();
        let mut affected_models = Vec::new();
        for row in self.storage.load_assignments()? {
            if now.saturating_sub(row.updated_at) <= HEARTBEAT_TIMEOUT_SECS {
                continue;
            }
            info!(
                node = %row.node_address,
                model = %row.model_name,
                "sweeping stale pipeline assignment"
            );
            self.allocator.remove(&row.node_address, &row.model_name)?;
            affected_models.push(row.model_name);
        }
        affected_models.sort();
        affected_models.dedup();
        for model in affected_models {
            self.clusters.reform_model(&model)?;
        }
        Ok(())
    }
}

/// Owns the monitor, sponsored-heartbeat, and stale-sweep tickers.
pub struct Monitor {
    shutdown: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Monitor {
    pub fn start(core: Arc<MonitorCore>, monitor_interval: Duration) -> Self {
        let (tx, mut rx) = watch::channel(false);
        let worker = tokio::spawn(async move {
            let mut reconcile = time::interval(monitor_interval);
            reconcile.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut sponsor = time::interval(SPONSOR_INTERVAL);
            sponsor.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut sweep = time::interval(SWEEP_INTERVAL);
            sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = reconcile.tick() => {
                        if let Err(err) = core.reconcile().await {
                            warn!(%err, "monitor reconcile failed");
                        }
                    }
                    _ = sponsor.tick() => {
                        if let Err(err) = core.sponsor_heartbeats().await {
                            warn!(%err, "sponsored heartbeat pass failed");
                        }
                    }
                    _ = sweep.tick() => {
                        if let Err(err) = core.sweep_stale_assignments() {
                            warn!(%err, "stale sweep failed");
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
                debug!(?err, "monitor worker exited with error");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::testing::MockChainClient;
    use crate::config::OracleConfig;
    use crate::pipeline::TopologyBus;
    use crate::types::{AgentNode, NodeMode, PipelineAssignment};
    use tempfile::tempdir;

    struct Fixture {
        _dir: tempfile::TempDir,
        storage: Storage,
        chain: MockChainClient,
        core: MonitorCore,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let storage = Storage::open(dir.path(), false).unwrap();
        let chain = MockChainClient::new();
        let config = Arc::new(OracleConfig::default());
        let allocator = Arc::new(PipelineAllocator::new(
            storage.clone(),
            config.clone(),
            TopologyBus::new(),
        ));
        let clusters = Arc::new(ClusterManager::new(
            storage.clone(),
            config,
            allocator.clone(),
        ));
        let core = MonitorCore::new(
            storage.clone(),
            Arc::new(chain.clone()),
            allocator,
            clusters,
            Arc::new(EpochCursor::new(41)),
        );
        Fixture {
            _dir: dir,
            storage,
            chain,
            core,
        }
    }

    #[tokio::test]
    async fn reconcile_imports_chain_agents_and_expires_silent_ones() {
        let fixture = fixture();
        let live = format!("0x{:040x}", 1);
        fixture.chain.register(&live);

        let silent = format!("0x{:040x}", 2);
        let mut agent = Agent::new(silent.clone(), 1);
        agent.last_heartbeat = 1;
        fixture.storage.put_agent(&agent).unwrap();

        fixture.core.reconcile().await.unwrap();

        let live_row = fixture.storage.get_agent(&live).unwrap().unwrap();
        assert_eq!(live_row.status, AgentStatus::Active);
        let silent_row = fixture.storage.get_agent(&silent).unwrap().unwrap();
        assert_eq!(silent_row.status, AgentStatus::Inactive);

        let stats = fixture.storage.get_network_stats().unwrap().unwrap();
        assert_eq!(stats.active_agents, 1);
        assert_eq!(stats.epoch, 41);
    }

    #[tokio::test]
    async fn sponsored_heartbeat_targets_only_stale_onchain_entries() {
        let fixture = fixture();
        let now = current_timestamp();
        let address = format!("0x{:040x}", 3);
        fixture.chain.register(&address);
        // On-chain heartbeat is ancient (mock returns 0).
        let node = AgentNode::new(address.clone(), "http://n1".into(), now);
        fixture.storage.put_node(&node).unwrap();

        fixture.core.sponsor_heartbeats().await.unwrap();
        assert_eq!(fixture.chain.state.lock().heartbeat_calls, vec![address]);

        // Unknown on-chain agents are not sponsored.
        let unknown = format!("0x{:040x}", 4);
        let node = AgentNode::new(unknown, "http://n2".into(), now);
        fixture.storage.put_node(&node).unwrap();
        fixture.chain.state.lock().heartbeat_calls.clear();
        fixture.core.sponsor_heartbeats().await.unwrap();
        assert_eq!(fixture.chain.state.lock().heartbeat_calls.len(), 1);
    }

    #[tokio::test]
    async fn stale_sweep_removes_dead_assignments_and_reallocates() {
        let fixture = fixture();
        let now = current_timestamp();
        let dead = format!("0x{:040x}", 5);
        let live = format!("0x{:040x}", 6);
        for (address, updated_at) in [(&dead, now - HEARTBEAT_TIMEOUT_SECS - 60), (&live, now)] {
            fixture
                .storage
                .put_assignment(&PipelineAssignment {
                    node_address: address.clone(),
                    model_name: "llama-8b".into(),
                    layer_start: 0,
                    layer_end: 16,
                    total_layers: 32,
                    grpc_endpoint: format!("{address}:50051"),
                    http_endpoint: format!("{address}:8080"),
                    ram_mb: 8_192,
                    device: "cpu".into(),
                    vram_mb: 0,
                    benchmark_tok_per_sec: 5.0,
                    ready: true,
                    pipeline_order: 0,
                    node_mode: NodeMode::Standalone,
                    cluster_id: None,
                    rpc_port: 0,
                    lan_ip: None,
                    updated_at,
                })
                .unwrap();
        }

        fixture.core.sweep_stale_assignments().unwrap();

        assert!(fixture
            .storage
            .get_assignment(&dead, "llama-8b")
            .unwrap()
            .is_none());
        let survivor = fixture
            .storage
            .get_assignment(&live, "llama-8b")
            .unwrap()
            .unwrap();
        assert_eq!((survivor.layer_start, survivor.layer_end), (0, 32));
    }
}
