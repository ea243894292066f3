use serde::{Deserialize, Serialize};

use super::agent::Stake;
use super::Address;

/// Accumulated telemetry for one agent within one epoch.
///
/// `tokens_processed` and `request_count` are sums of deltas recovered from
/// the agent's cumulative counters; they only ever grow within an epoch.
/// `last_raw_tokens` / `last_raw_requests` hold the agent's most recent
/// reported cumulative values so a restart cannot misread an agent-side
/// counter reset as fresh work.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EpochMetrics {
    pub address: Address,
    pub epoch: u64,
    pub tokens_processed: u64,
    pub request_count: u64,
    pub avg_latency_ms: f64,
    pub uptime_seconds: u64,
    pub last_raw_tokens: u64,
    pub last_raw_requests: u64,
    pub last_updated: u64,
}

impl EpochMetrics {
    pub fn new(address: Address, epoch: u64) -> Self {
        Self {
            address,
            epoch,
            tokens_processed: 0,
            request_count: 0,
            avg_latency_ms: 0.0,
            uptime_seconds: 0,
            last_raw_tokens: 0,
            last_raw_requests: 0,
            last_updated: 0,
        }
    }
}

/// A stored inference proof. `verified` reflects the save-time plausibility
/// check only; cryptographic verification is deferred to an external
/// verifier calling back through `mark_verified`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InferenceProof {
    pub id: String,
    pub address: Address,
    pub epoch: u64,
    pub model_hash: String,
    pub input_hash: String,
    pub output_hash: String,
    pub token_count: u64,
    pub verified: bool,
    pub verification_tx_hash: Option<String>,
    pub created_at: u64,
    pub verified_at: Option<u64>,
}

/// Per-agent per-epoch contribution snapshot as published on-chain.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Contribution {
    pub address: Address,
    pub epoch: u64,
    pub task_count: u64,
    pub uptime_seconds: u64,
    pub response_score: u64,
    pub processed_tokens: u64,
    pub avg_latency_inv: u64,
    pub last_updated: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Epoch {
    pub number: u64,
    pub reward: Stake,
    pub agent_count: u64,
    pub distributed: bool,
    pub synced_at: u64,
}

/// One solved challenge, kept in the scorer's in-memory task log.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskRecord {
    pub challenge_id: u64,
    pub solved_at: u64,
    pub solve_time_secs: f64,
}

/// The score tuple submitted through `reportContribution`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentScore {
    pub address: Address,
    pub task_count: u64,
    pub uptime_seconds: u64,
    pub response_score: u64,
    pub processed_tokens: u64,
    pub avg_latency_inv: u64,
    pub total: f64,
}

/// Aggregate snapshot served by `/api/stats` and persisted so dashboards
/// survive restarts.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NetworkStats {
    pub epoch: u64,
    pub active_agents: u64,
    pub active_nodes: u64,
    pub total_tokens_epoch: u64,
    pub total_requests_epoch: u64,
    pub cluster_count: u64,
    pub updated_at: u64,
}
