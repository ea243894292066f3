use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::info;

use crate::chain::{ChainClient, EpochCursor};
use crate::challenges::{ChallengeCore, ChallengeService};
use crate::cluster::ClusterManager;
use crate::config::OracleConfig;
use crate::crypto::recover_signer;
use crate::distributor::{DistributorCore, EpochDistributor};
use crate::errors::{OracleError, OracleResult, RejectReason};
use crate::ingest::{
    EndpointFamily, IngestOutcome, ReplayGuards, TelemetryIngestor, TelemetryReport,
};
use crate::monitor::{Monitor, MonitorCore};
use crate::pipeline::{PipelineAllocator, PipelineRegistration, TopologyBus, TopologyEvent};
use crate::proofs::ProofStore;
use crate::reporter::{ContributionReporter, ReporterCore};
use crate::scoring::{EpochScorer, ScoreWeights};
use crate::storage::Storage;
use crate::types::{
    canonical_address, current_timestamp, Address, Agent, AgentNode, AgentScore, Challenge,
    Contribution, Epoch, EpochMetrics, InferenceProof, NetworkStats, PipelineAssignment,
};
use crate::watcher::ChainWatcher;

/// Signed node-registration payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRegistration {
    pub address: String,
    pub endpoint: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub benchmark_tok_per_sec: f64,
    #[serde(default)]
    pub lan_ip: Option<String>,
    #[serde(default)]
    pub can_distribute: bool,
    pub timestamp: u64,
    pub signature: String,
}

impl NodeRegistration {
    /// Canonical signing payload; field order is part of the wire contract.
    pub fn signing_message(&self) -> String {
        format!(
            "{{\"address\":\"{}\",\"endpoint\":\"{}\",\"timestamp\":{}}}",
            self.address.to_ascii_lowercase(),
            self.endpoint,
            self.timestamp
        )
    }
}

/// Signed pipeline readiness confirmation.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadyCall {
    pub address: String,
    pub model_name: String,
    pub timestamp: u64,
    pub signature: String,
}

impl ReadyCall {
    pub fn signing_message(&self) -> String {
        format!(
            "{{\"address\":\"{}\",\"modelName\":\"{}\",\"timestamp\":{}}}",
            self.address.to_ascii_lowercase(),
            self.model_name,
            self.timestamp
        )
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ProofStats {
    pub total: usize,
    pub verified: usize,
    pub verified_tokens: u64,
}

/// The oracle process: storage, chain client, and every background service,
/// wired explicitly.
pub struct Oracle {
    inner: Arc<OracleInner>,
}

struct OracleInner {
    config: Arc<OracleConfig>,
    storage: Storage,
    chain: Arc<dyn ChainClient>,
    signer_address: Address,
    epoch_cursor: Arc<EpochCursor>,
    guards: Arc<ReplayGuards>,
    scorer: Arc<EpochScorer>,
    proofs: ProofStore,
    ingestor: TelemetryIngestor,
    allocator: Arc<PipelineAllocator>,
    clusters: Arc<ClusterManager>,
}

/// Cloneable facade the HTTP edge talks to.
#[derive(Clone)]
pub struct OracleHandle {
    inner: Arc<OracleInner>,
}

/// Running background services; dropping without `shutdown` aborts them
/// with the runtime.
pub struct OracleRuntime {
    reporter: ContributionReporter,
    distributor: EpochDistributor,
    challenges: ChallengeService,
    monitor: Monitor,
    watcher: ChainWatcher,
}

impl OracleRuntime {
    /// Graceful stop: tickers first, then the block stream.
    pub async fn shutdown(&self) {
        self.reporter.shutdown().await;
        self.distributor.shutdown().await;
        self.challenges.shutdown().await;
        self.monitor.shutdown().await;
        self.watcher.shutdown().await;
    }
}

impl Oracle {
    pub fn new(
        config: OracleConfig,
        chain: Arc<dyn ChainClient>,
        signer_address: Address,
    ) -> OracleResult<Self> {
        config.ensure_directories()?;
        let db_path = config.data_dir.join("db");
        let storage = Storage::open(&db_path, config.production)?;
        let config = Arc::new(config);

        let epoch_cursor = Arc::new(EpochCursor::default());
        let guards = Arc::new(ReplayGuards::default());
        let scorer = Arc::new(EpochScorer::new(storage.clone()));
        let proofs = ProofStore::new(storage.clone());
        let ingestor = TelemetryIngestor::new(
            storage.clone(),
            chain.clone(),
            scorer.clone(),
            proofs.clone(),
            epoch_cursor.clone(),
            guards.clone(),
        );
        let allocator = Arc::new(PipelineAllocator::new(
            storage.clone(),
            config.clone(),
            TopologyBus::new(),
        ));
        let clusters = Arc::new(ClusterManager::new(
            storage.clone(),
            config.clone(),
            allocator.clone(),
        ));

        // Every derived in-memory map is rebuilt from storage before any
        // request is served.
        ingestor.bootstrap()?;

        Ok(Self {
            inner: Arc::new(OracleInner {
                config,
                storage,
                chain,
                signer_address,
                epoch_cursor,
                guards,
                scorer,
                proofs,
                ingestor,
                allocator,
                clusters,
            }),
        })
    }

    pub fn handle(&self) -> OracleHandle {
        OracleHandle {
            inner: self.inner.clone(),
        }
    }

    /// Starts the background services. The epoch cursor is primed from the
    /// chain first so in-flight telemetry lands in the right epoch.
    pub async fn start(&self) -> OracleResult<OracleRuntime> {
        let inner = &self.inner;
        let epoch = inner.chain.current_epoch().await?;
        inner.epoch_cursor.set(epoch);
        info!(
            oracle = %inner.signer_address,
            epoch,
            "starting oracle services"
        );

        let reporter_core = Arc::new(ReporterCore::new(
            inner.storage.clone(),
            inner.chain.clone(),
            inner.scorer.clone(),
            inner.proofs.clone(),
            inner.config.report_interval_blocks,
        ));
        let distributor_core = Arc::new(DistributorCore::new(
            inner.storage.clone(),
            inner.chain.clone(),
            inner.epoch_cursor.clone(),
        ));
        let challenge_core = Arc::new(ChallengeCore::new(
            inner.storage.clone(),
            inner.chain.clone(),
            inner.scorer.clone(),
        ));
        let monitor_core = Arc::new(MonitorCore::new(
            inner.storage.clone(),
            inner.chain.clone(),
            inner.allocator.clone(),
            inner.clusters.clone(),
            inner.epoch_cursor.clone(),
        ));

        Ok(OracleRuntime {
            reporter: ContributionReporter::start(reporter_core),
            distributor: EpochDistributor::start(distributor_core),
            challenges: ChallengeService::start(
                challenge_core,
                Duration::from_millis(self.inner.config.challenge_interval_ms),
            ),
            monitor: Monitor::start(
                monitor_core,
                Duration::from_millis(self.inner.config.monitor_interval_ms),
            ),
            watcher: ChainWatcher::start(inner.storage.clone(), inner.chain.clone()).await?,
        })
    }
}

impl OracleHandle {
    pub fn signer_address(&self) -> &str {
        &self.inner.signer_address
    }

    pub fn current_epoch(&self) -> u64 {
        self.inner.epoch_cursor.get()
    }

    /// Operator key check for the metrics signature bypass.
    pub fn api_key_matches(&self, candidate: Option<&str>) -> bool {
        match (&self.inner.config.api_key, candidate) {
            (Some(expected), Some(candidate)) => expected == candidate,
            _ => false,
        }
    }

    pub async fn submit_metrics(
        &self,
        report: &TelemetryReport,
        signature_checked: bool,
    ) -> OracleResult<IngestOutcome> {
        self.inner.ingestor.ingest(report, signature_checked).await
    }

    /// Signed node registration: verify, replay-guard, upsert.
    pub fn register_node(&self, registration: &NodeRegistration) -> OracleResult<AgentNode> {
        let address = canonical_address(&registration.address)
            .map_err(|_| OracleError::Rejected(RejectReason::Payload))?;
        let message = registration.signing_message();
        let signer = recover_signer(message.as_bytes(), &registration.signature)
            .map_err(|_| OracleError::Rejected(RejectReason::Signature))?;
        if signer != address {
            return Err(OracleError::Rejected(RejectReason::Signature));
        }
        self.inner
            .guards
            .admit(EndpointFamily::NodeRegister, &address, registration.timestamp)?;

        let now = current_timestamp();
        let mut node = self
            .inner
            .storage
            .get_node(&address)?
            .unwrap_or_else(|| AgentNode::new(address.clone(), registration.endpoint.clone(), now));
        node.endpoint = registration.endpoint.clone();
        node.capabilities = registration.capabilities.clone();
        node.benchmark_tok_per_sec = registration.benchmark_tok_per_sec;
        node.lan_ip = registration.lan_ip.clone();
        node.can_distribute = registration.can_distribute;
        node.registration_signature = registration.signature.clone();
        node.last_heartbeat = now;
        node.status = crate::types::NodeStatus::Active;
        self.inner.storage.put_node(&node)?;
        info!(address = %address, endpoint = %node.endpoint, "node registered");
        Ok(node)
    }

    /// Signed pipeline registration: verify, replay-guard, allocate, and
    /// re-check clustering for the model.
    pub fn register_pipeline(&self, registration: &PipelineRegistration) -> OracleResult<()> {
        let address = canonical_address(&registration.address)
            .map_err(|_| OracleError::Rejected(RejectReason::Payload))?;
        let message = registration.signing_message();
        let signer = recover_signer(message.as_bytes(), &registration.signature)
            .map_err(|_| OracleError::Rejected(RejectReason::Signature))?;
        if signer != address {
            return Err(OracleError::Rejected(RejectReason::Signature));
        }
        self.inner.guards.admit(
            EndpointFamily::PipelineRegister,
            &address,
            registration.timestamp,
        )?;

        // The node row carries the clustering facts.
        let now = current_timestamp();
        let mut node = self
            .inner
            .storage
            .get_node(&address)?
            .unwrap_or_else(|| AgentNode::new(address.clone(), registration.http_endpoint.clone(), now));
        node.benchmark_tok_per_sec = registration.benchmark_tok_per_sec;
        node.lan_ip = registration.lan_ip.clone();
        node.can_distribute = registration.can_distribute;
        node.last_heartbeat = now;
        self.inner.storage.put_node(&node)?;

        self.inner.allocator.register(registration, &address)?;
        self.inner.clusters.reform_model(&registration.model_name)
    }

    pub fn pipeline_ready(&self, call: &ReadyCall) -> OracleResult<()> {
        let address = canonical_address(&call.address)
            .map_err(|_| OracleError::Rejected(RejectReason::Payload))?;
        let message = call.signing_message();
        let signer = recover_signer(message.as_bytes(), &call.signature)
            .map_err(|_| OracleError::Rejected(RejectReason::Signature))?;
        if signer != address {
            return Err(OracleError::Rejected(RejectReason::Signature));
        }
        self.inner
            .guards
            .admit(EndpointFamily::PipelineReady, &address, call.timestamp)?;
        self.inner.allocator.mark_ready(&address, &call.model_name)
    }

    pub fn topology(&self, model: &str) -> OracleResult<Vec<PipelineAssignment>> {
        self.inner.allocator.topology(model)
    }

    pub fn subscribe_topology(&self) -> broadcast::Receiver<TopologyEvent> {
        self.inner.allocator.bus().subscribe()
    }

    // --- read surface ---

    pub fn nodes(&self) -> OracleResult<Vec<AgentNode>> {
        self.inner.storage.load_nodes()
    }

    pub fn node(&self, address: &str) -> OracleResult<Option<AgentNode>> {
        self.inner.storage.get_node(&canonical_address(address)?)
    }

    pub fn agents(&self) -> OracleResult<Vec<Agent>> {
        self.inner.storage.load_agents()
    }

    pub fn agent(&self, address: &str) -> OracleResult<Option<Agent>> {
        self.inner.storage.get_agent(&canonical_address(address)?)
    }

    pub fn epochs(&self) -> OracleResult<Vec<Epoch>> {
        self.inner.storage.load_epochs()
    }

    pub fn epoch(&self, number: u64) -> OracleResult<Option<Epoch>> {
        self.inner.storage.get_epoch(number)
    }

    pub fn challenges(&self) -> OracleResult<Vec<Challenge>> {
        self.inner.storage.load_challenges()
    }

    pub fn contributions(&self, address: &str) -> OracleResult<Vec<Contribution>> {
        let address = canonical_address(address)?;
        let mut rows = Vec::new();
        for epoch in self.inner.storage.load_epochs()? {
            if let Some(row) = self.inner.storage.get_contribution(&address, epoch.number)? {
                rows.push(row);
            }
        }
        if let Some(row) = self
            .inner
            .storage
            .get_contribution(&address, self.current_epoch())?
        {
            if !rows.iter().any(|existing| existing.epoch == row.epoch) {
                rows.push(row);
            }
        }
        Ok(rows)
    }

    pub async fn pending_reward(&self, address: &str) -> OracleResult<crate::types::Stake> {
        self.inner
            .chain
            .pending_reward(&canonical_address(address)?)
            .await
    }

    pub fn formula(&self) -> ScoreWeights {
        self.inner.scorer.weights().clone()
    }

    pub fn stats(&self) -> OracleResult<NetworkStats> {
        Ok(self
            .inner
            .storage
            .get_network_stats()?
            .unwrap_or_default())
    }

    pub fn metrics(&self, address: &str) -> OracleResult<Option<EpochMetrics>> {
        self.inner
            .storage
            .get_metrics(&canonical_address(address)?, self.current_epoch())
    }

    pub fn proofs(&self, address: &str) -> OracleResult<Vec<InferenceProof>> {
        self.inner.proofs.proofs_for(&canonical_address(address)?)
    }

    pub fn proof_stats(&self, address: &str) -> OracleResult<ProofStats> {
        let address = canonical_address(address)?;
        let proofs = self.inner.proofs.proofs_for(&address)?;
        let verified = proofs.iter().filter(|proof| proof.verified).count();
        let verified_tokens = proofs
            .iter()
            .filter(|proof| proof.verified)
            .map(|proof| proof.token_count)
            .sum();
        Ok(ProofStats {
            total: proofs.len(),
            verified,
            verified_tokens,
        })
    }

    /// Current-epoch scores, best first.
    pub fn leaderboard(&self) -> OracleResult<Vec<AgentScore>> {
        let epoch = self.current_epoch();
        let mut scores = Vec::new();
        for metrics in self.inner.storage.load_metrics_for_epoch(epoch)? {
            let verified = self
                .inner
                .proofs
                .verified_token_count(&metrics.address, epoch)?;
            scores.push(self.inner.scorer.compute(
                &metrics.address,
                Some(&metrics),
                verified,
            )?);
        }
        scores.sort_by(|a, b| {
            b.total
                .partial_cmp(&a.total)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(scores)
    }
}
