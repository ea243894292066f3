use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::chain::{ChainClient, EpochCursor};
use crate::crypto::{recover_signer, telemetry_message};
use crate::errors::{OracleError, OracleResult, RejectReason};
use crate::proofs::{ProofStore, ProofSubmission};
use crate::scoring::EpochScorer;
use crate::storage::Storage;
use crate::types::{canonical_address, current_timestamp, Address, AgentNode, EpochMetrics};

/// Hard per-report ceiling on the cumulative token counter.
pub const MAX_TOKENS_PER_REPORT: u64 = 1_000_000_000;
/// Accepted clock skew between agent and oracle, both directions.
pub const FRESHNESS_WINDOW_SECS: u64 = 60;

/// Endpoint families with independent replay cursors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EndpointFamily {
    Metrics,
    NodeRegister,
    PipelineRegister,
    PipelineReady,
}

/// Per-address most-recent-accepted client timestamps plus the raw counter
/// snapshots. Purely a fast path: everything here is rebuilt from
/// `EpochMetrics` rows at boot.
#[derive(Default)]
pub struct ReplayGuards {
    cursors: Mutex<HashMap<(EndpointFamily, Address), u64>>,
    raw_counters: Mutex<HashMap<Address, (u64, u64)>>,
}

impl ReplayGuards {
    /// Rejects unless `timestamp` is strictly greater than the last accepted
    /// one for this `(family, address)`. Does not advance the cursor.
    pub fn check(&self, family: EndpointFamily, address: &Address, timestamp: u64) -> OracleResult<()> {
        let cursors = self.cursors.lock();
        match cursors.get(&(family, address.clone())) {
            Some(last) if timestamp <= *last => {
                Err(OracleError::Rejected(RejectReason::StaleOrReplay))
            }
            _ => Ok(()),
        }
    }

    /// Advances the cursor after the submission fully persisted. A second
    /// writer may have advanced it further in the meantime; keep the max.
    pub fn advance(&self, family: EndpointFamily, address: &Address, timestamp: u64) {
        let mut cursors = self.cursors.lock();
        let entry = cursors.entry((family, address.clone())).or_insert(0);
        if timestamp > *entry {
            *entry = timestamp;
        }
    }

    /// Checks freshness and replay in one step for the signed auxiliary
    /// endpoints (node/pipeline lifecycle).
    pub fn admit(
        &self,
        family: EndpointFamily,
        address: &Address,
        timestamp: u64,
    ) -> OracleResult<()> {
        check_freshness(timestamp, current_timestamp())?;
        self.check(family, address, timestamp)?;
        self.advance(family, address, timestamp);
        Ok(())
    }

    pub fn raw_counters(&self, address: &Address) -> (u64, u64) {
        self.raw_counters
            .lock()
            .get(address)
            .copied()
            .unwrap_or((0, 0))
    }

    pub fn set_raw_counters(&self, address: &Address, tokens: u64, requests: u64) {
        self.raw_counters
            .lock()
            .insert(address.clone(), (tokens, requests));
    }
}

fn check_freshness(timestamp: u64, now: u64) -> OracleResult<()> {
    let skew = now.abs_diff(timestamp);
    if skew > FRESHNESS_WINDOW_SECS {
        return Err(OracleError::Rejected(RejectReason::StaleOrReplay));
    }
    Ok(())
}

/// The signed telemetry envelope. `tokens_processed` and `request_count`
/// are cumulative counters maintained by the agent, not deltas.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryReport {
    pub address: String,
    pub tokens_processed: u64,
    pub avg_latency_ms: f64,
    pub request_count: u64,
    pub uptime_seconds: u64,
    pub timestamp: u64,
    pub signature: String,
    #[serde(default)]
    pub proofs: Vec<ProofSubmission>,
}

#[derive(Clone, Copy, Debug, Serialize)]
pub struct IngestOutcome {
    pub should_reset: bool,
}

/// Authenticates telemetry and folds cumulative counters into the current
/// epoch's metrics row.
pub struct TelemetryIngestor {
    storage: Storage,
    chain: Arc<dyn ChainClient>,
    scorer: Arc<EpochScorer>,
    proofs: ProofStore,
    epoch: Arc<EpochCursor>,
    guards: Arc<ReplayGuards>,
    /// Serializes the read-modify-write on one address's metrics row.
    row_locks: Mutex<HashMap<Address, Arc<Mutex<()>>>>,
}

impl TelemetryIngestor {
    pub fn new(
        storage: Storage,
        chain: Arc<dyn ChainClient>,
        scorer: Arc<EpochScorer>,
        proofs: ProofStore,
        epoch: Arc<EpochCursor>,
        guards: Arc<ReplayGuards>,
    ) -> Self {
        Self {
            storage,
            chain,
            scorer,
            proofs,
            epoch,
            guards,
            row_locks: Mutex::new(HashMap::new()),
        }
    }

    fn row_lock(&self, address: &Address) -> Arc<Mutex<()>> {
        self.row_locks
            .lock()
            .entry(address.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Rebuilds the replay cursors and raw-counter snapshots from the
    /// newest metrics row per address. Seeding `last_raw_*` from the
    /// agent's actual reported values (not the accumulated sum) is what
    /// keeps a restart from double-counting after an agent-side reset.
    pub fn bootstrap(&self) -> OracleResult<()> {
        let rows = self.storage.load_latest_metrics()?;
        let count = rows.len();
        for row in rows {
            self.guards
                .advance(EndpointFamily::Metrics, &row.address, row.last_updated);
            self.guards
                .set_raw_counters(&row.address, row.last_raw_tokens, row.last_raw_requests);
        }
        info!(addresses = count, "rehydrated telemetry replay state");
        Ok(())
    }

    /// Full ingest path. `signature_checked` is set when the edge already
    /// authenticated the caller through the operator API key.
    pub async fn ingest(
        &self,
        report: &TelemetryReport,
        signature_checked: bool,
    ) -> OracleResult<IngestOutcome> {
        let address = canonical_address(&report.address)
            .map_err(|_| OracleError::Rejected(RejectReason::Payload))?;

        if report.tokens_processed > MAX_TOKENS_PER_REPORT {
            return Err(OracleError::Rejected(RejectReason::Bounds));
        }
        check_freshness(report.timestamp, current_timestamp())?;
        self.guards
            .check(EndpointFamily::Metrics, &address, report.timestamp)?;

        if !signature_checked {
            let message =
                telemetry_message(&address, report.tokens_processed, report.timestamp);
            let signer = recover_signer(message.as_bytes(), &report.signature)
                .map_err(|_| OracleError::Rejected(RejectReason::Signature))?;
            if signer != address {
                return Err(OracleError::Rejected(RejectReason::Signature));
            }
        }

        if !self.chain.is_agent_account(&address).await? {
            return Err(OracleError::Rejected(RejectReason::Unregistered));
        }

        let epoch = self.epoch.get();
        let outcome = {
            let lock = self.row_lock(&address);
            let _held = lock.lock();
            // Re-check under the lock: a concurrent report may have been
            // accepted during the suspension points above.
            self.guards
                .check(EndpointFamily::Metrics, &address, report.timestamp)?;
            let outcome = self.apply(&address, epoch, report)?;
            // Persisted; only now may the replay cursor move.
            self.guards
                .advance(EndpointFamily::Metrics, &address, report.timestamp);
            self.guards.set_raw_counters(
                &address,
                report.tokens_processed,
                report.request_count,
            );
            outcome
        };

        self.scorer.record_uptime(&address, report.uptime_seconds);
        self.touch_node(&address, report)?;
        self.touch_assignments(&address)?;
        self.forward_proofs(&address, epoch, report);

        Ok(outcome)
    }

    /// Delta accumulation against the agent's last reported cumulative
    /// values. A lower reading means the agent-side counter was reset, so
    /// the full reading is new work.
    fn apply(
        &self,
        address: &Address,
        epoch: u64,
        report: &TelemetryReport,
    ) -> OracleResult<IngestOutcome> {
        let (last_tokens, last_requests) = self.guards.raw_counters(address);
        let token_delta = if report.tokens_processed >= last_tokens {
            report.tokens_processed - last_tokens
        } else {
            report.tokens_processed
        };
        let request_delta = if report.request_count >= last_requests {
            report.request_count - last_requests
        } else {
            report.request_count
        };

        let existing = self.storage.get_metrics(address, epoch)?;
        let should_reset = existing.is_none();
        let mut metrics =
            existing.unwrap_or_else(|| EpochMetrics::new(address.clone(), epoch));

        let prev_requests = metrics.request_count;
        metrics.tokens_processed += token_delta;
        metrics.request_count += request_delta;
        let weight = prev_requests + request_delta;
        metrics.avg_latency_ms = if weight == 0 {
            report.avg_latency_ms
        } else {
            (metrics.avg_latency_ms * prev_requests as f64
                + report.avg_latency_ms * request_delta as f64)
                / weight as f64
        };
        metrics.uptime_seconds = report.uptime_seconds;
        metrics.last_raw_tokens = report.tokens_processed;
        metrics.last_raw_requests = report.request_count;
        metrics.last_updated = report.timestamp;
        self.storage.put_metrics(&metrics)?;

        debug!(
            address = %address,
            epoch,
            token_delta,
            request_delta,
            total_tokens = metrics.tokens_processed,
            "accumulated telemetry"
        );
        Ok(IngestOutcome { should_reset })
    }

    /// Telemetry doubles as the unified heartbeat: refresh the node row
    /// (auto-registering on a first verified report) and the agent record.
    fn touch_node(&self, address: &Address, report: &TelemetryReport) -> OracleResult<()> {
        let now = current_timestamp();
        let mut node = self
            .storage
            .get_node(address)?
            .unwrap_or_else(|| AgentNode::new(address.clone(), String::new(), now));
        node.last_heartbeat = now;
        node.last_metric_report = report.timestamp;
        node.status = crate::types::NodeStatus::Active;
        self.storage.put_node(&node)?;

        let mut agent = self
            .storage
            .get_agent(address)?
            .unwrap_or_else(|| crate::types::Agent::new(address.clone(), now));
        agent.last_heartbeat = now;
        self.storage.put_agent(&agent)?;
        Ok(())
    }

    /// Advances `updated_at` on the node's pipeline assignments so the
    /// stale sweep sees the node as alive.
    fn touch_assignments(&self, address: &Address) -> OracleResult<()> {
        let now = current_timestamp();
        for mut assignment in self
            .storage
            .load_assignments()?
            .into_iter()
            .filter(|assignment| &assignment.node_address == address)
        {
            assignment.updated_at = now;
            self.storage.put_assignment(&assignment)?;
        }
        Ok(())
    }

    /// Proofs are auxiliary signal: forwarded in order, failures logged,
    /// ingest proceeds regardless.
    fn forward_proofs(&self, address: &Address, epoch: u64, report: &TelemetryReport) {
        for submission in &report.proofs {
            if let Err(err) = self.proofs.save(address, epoch, submission) {
                warn!(
                    address = %address,
                    epoch,
                    %err,
                    "attached proof rejected"
                );
            }
        }
    }
}
