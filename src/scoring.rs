use std::collections::HashMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::OracleResult;
use crate::storage::Storage;
use crate::types::{Address, AgentScore, EpochMetrics, TaskRecord};

/// Weights of the contribution formula, exposed read-only at `/api/formula`.
/// The serialized struct is the exact set the scorer computes with.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScoreWeights {
    pub task_weight: u32,
    pub uptime_weight: u32,
    pub response_weight: u32,
    pub idle_multiplier: f64,
    pub task_saturation: u64,
    pub uptime_saturation_secs: u64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            task_weight: 50,
            uptime_weight: 30,
            response_weight: 20,
            idle_multiplier: 0.1,
            task_saturation: 100,
            uptime_saturation_secs: 3_600,
        }
    }
}

/// Composes per-agent scores from epoch metrics, verified proof totals, and
/// the in-memory challenge task log.
///
/// The task log and uptime map are epoch accumulators: the reporter clears
/// them only after a fully successful report cycle, so a partial failure
/// retries with identical inputs.
pub struct EpochScorer {
    storage: Storage,
    weights: ScoreWeights,
    task_records: Mutex<HashMap<Address, Vec<TaskRecord>>>,
    uptime_seconds: Mutex<HashMap<Address, u64>>,
}

impl EpochScorer {
    pub fn new(storage: Storage) -> Self {
        Self {
            storage,
            weights: ScoreWeights::default(),
            task_records: Mutex::new(HashMap::new()),
            uptime_seconds: Mutex::new(HashMap::new()),
        }
    }

    pub fn weights(&self) -> &ScoreWeights {
        &self.weights
    }

    /// Ingestor callback: uptime is agent-authoritative, latest report wins.
    pub fn record_uptime(&self, address: &Address, uptime_seconds: u64) {
        self.uptime_seconds
            .lock()
            .insert(address.clone(), uptime_seconds);
    }

    /// Challenge-event callback.
    pub fn record_task(&self, address: &Address, record: TaskRecord) {
        self.task_records
            .lock()
            .entry(address.clone())
            .or_default()
            .push(record);
    }

    pub fn task_count(&self, address: &str) -> u64 {
        self.task_records
            .lock()
            .get(address)
            .map(|records| records.len() as u64)
            .unwrap_or(0)
    }

    /// Computes the score tuple for one agent and refreshes the node
    /// registry's display score. The registry column is a derived cache;
    /// the returned tuple is what goes on-chain.
    pub fn compute(
        &self,
        address: &Address,
        metrics: Option<&EpochMetrics>,
        verified_tokens: u64,
    ) -> OracleResult<AgentScore> {
        let (task_count, avg_solve_time) = {
            let records = self.task_records.lock();
            match records.get(address) {
                Some(records) if !records.is_empty() => {
                    let total: f64 = records.iter().map(|r| r.solve_time_secs).sum();
                    (records.len() as u64, total / records.len() as f64)
                }
                _ => (0, 0.0),
            }
        };
        let uptime_seconds = self
            .uptime_seconds
            .lock()
            .get(address)
            .copied()
            .unwrap_or_else(|| metrics.map(|m| m.uptime_seconds).unwrap_or(0));

        let response_score = if task_count == 0 {
            0
        } else {
            (100.0 - avg_solve_time / 10.0).clamp(0.0, 100.0).floor() as u64
        };
        let reported_tokens = metrics.map(|m| m.tokens_processed).unwrap_or(0);
        let processed_tokens = reported_tokens.max(verified_tokens);
        let avg_latency_ms = metrics.map(|m| m.avg_latency_ms).unwrap_or(0.0);
        let avg_latency_inv = (10_000.0 - avg_latency_ms).max(0.0).floor() as u64;

        let total = self.scalar(task_count, uptime_seconds, response_score, processed_tokens);

        if let Some(mut node) = self.storage.get_node(address)? {
            node.score = total;
            self.storage.put_node(&node)?;
        }

        debug!(
            address = %address,
            task_count,
            uptime_seconds,
            response_score,
            processed_tokens,
            score = total,
            "computed agent score"
        );

        Ok(AgentScore {
            address: address.clone(),
            task_count,
            uptime_seconds,
            response_score,
            processed_tokens,
            avg_latency_inv,
            total,
        })
    }

    /// The weighted, normalized scalar. The idle multiplier keeps a node
    /// that is merely online from harvesting uptime reward.
    fn scalar(
        &self,
        task_count: u64,
        uptime_seconds: u64,
        response_score: u64,
        processed_tokens: u64,
    ) -> f64 {
        let w = &self.weights;
        let task_n = ((task_count as f64 / w.task_saturation as f64) * 100.0).min(100.0);
        let up_n = ((uptime_seconds as f64 / w.uptime_saturation_secs as f64) * 100.0).min(100.0);
        let resp_n = (response_score as f64).min(100.0);
        let idle = if task_count > 0 || processed_tokens > 0 {
            1.0
        } else {
            w.idle_multiplier
        };
        (task_n * w.task_weight as f64
            + up_n * w.uptime_weight as f64 * idle
            + resp_n * w.response_weight as f64 * idle)
            / 100.0
    }

    /// Clears the epoch accumulators. Only the reporter calls this, and only
    /// after every agent in the batch reported successfully.
    pub fn reset_epoch(&self) {
        self.task_records.lock().clear();
        self.uptime_seconds.lock().clear();
    }
}
