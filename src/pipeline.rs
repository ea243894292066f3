use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::config::{OracleConfig, HEARTBEAT_TIMEOUT_SECS};
use crate::errors::{OracleError, OracleResult, RejectReason};
use crate::storage::Storage;
use crate::types::{current_timestamp, Address, NodeMode, PipelineAssignment};

/// Topology-change notifications consumed by the request router through the
/// WebSocket edge.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "event")]
pub enum TopologyEvent {
    #[serde(rename = "pipeline:topology")]
    Topology {
        model: String,
        assignments: Vec<PipelineAssignment>,
        timestamp: u64,
    },
    #[serde(rename = "pipeline:nodeStatus")]
    NodeStatus {
        model: String,
        address: Address,
        ready: bool,
        timestamp: u64,
    },
    #[serde(rename = "pipeline:nodeJoined")]
    NodeJoined {
        model: String,
        address: Address,
        timestamp: u64,
    },
    #[serde(rename = "pipeline:nodeLeft")]
    NodeLeft {
        model: String,
        address: Address,
        timestamp: u64,
    },
}

impl TopologyEvent {
    pub fn model(&self) -> &str {
        match self {
            TopologyEvent::Topology { model, .. }
            | TopologyEvent::NodeStatus { model, .. }
            | TopologyEvent::NodeJoined { model, .. }
            | TopologyEvent::NodeLeft { model, .. } => model,
        }
    }
}

/// Multi-subscriber fan-out for topology events. Slow subscribers lag and
/// drop rather than backpressure the allocator.
#[derive(Clone)]
pub struct TopologyBus {
    sender: broadcast::Sender<TopologyEvent>,
}

impl TopologyBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(256);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TopologyEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: TopologyEvent) {
        // Send fails only when nobody listens, which is fine.
        let _ = self.sender.send(event);
    }
}

impl Default for TopologyBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Signed pipeline registration payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineRegistration {
    pub address: String,
    pub model_name: String,
    pub grpc_endpoint: String,
    pub http_endpoint: String,
    pub ram_mb: u64,
    pub device: String,
    #[serde(default)]
    pub vram_mb: u64,
    #[serde(default)]
    pub benchmark_tok_per_sec: f64,
    #[serde(default)]
    pub rpc_port: u16,
    #[serde(default)]
    pub lan_ip: Option<String>,
    #[serde(default)]
    pub can_distribute: bool,
    pub timestamp: u64,
    pub signature: String,
}

impl PipelineRegistration {
    /// Canonical signing payload; field order is part of the wire contract.
    pub fn signing_message(&self) -> String {
        format!(
            "{{\"address\":\"{}\",\"modelName\":\"{}\",\"grpcEndpoint\":\"{}\",\"httpEndpoint\":\"{}\",\"timestamp\":{}}}",
            self.address.to_ascii_lowercase(),
            self.model_name,
            self.grpc_endpoint,
            self.http_endpoint,
            self.timestamp
        )
    }
}

/// Splits `[0, total_layers)` across nodes proportionally to `weights`. The
/// last node absorbs the remainder so the union always covers the range.
pub fn split_layers(weights: &[u64], total_layers: u32) -> Vec<(u32, u32)> {
    let n = weights.len();
    if n == 0 {
        return Vec::new();
    }
    if n == 1 {
        return vec![(0, total_layers)];
    }
    let total_weight: u64 = weights.iter().sum();
    let mut spans = Vec::with_capacity(n);
    let mut cursor = 0u32;
    for (index, weight) in weights.iter().enumerate() {
        let span = if index == n - 1 {
            total_layers - cursor
        } else if total_weight == 0 {
            total_layers / n as u32
        } else {
            ((total_layers as u64 * weight) / total_weight) as u32
        };
        spans.push((cursor, cursor + span));
        cursor += span;
    }
    spans
}

/// Per-model layer assignment across healthy, non-clustered pipeline nodes.
/// Cluster-owned rows are the cluster manager's to shape; the allocator
/// never touches them.
pub struct PipelineAllocator {
    storage: Storage,
    config: Arc<OracleConfig>,
    bus: TopologyBus,
}

impl PipelineAllocator {
    pub fn new(storage: Storage, config: Arc<OracleConfig>, bus: TopologyBus) -> Self {
        Self {
            storage,
            config,
            bus,
        }
    }

    pub fn bus(&self) -> &TopologyBus {
        &self.bus
    }

    /// Registration/update entry point. Hardware facts come from the agent;
    /// layer placement is recomputed for the whole model afterwards.
    pub fn register(&self, registration: &PipelineRegistration, address: &Address) -> OracleResult<()> {
        let now = current_timestamp();
        let existing = self
            .storage
            .get_assignment(address, &registration.model_name)?;
        let joined = existing.is_none();
        let mut assignment = existing.unwrap_or(PipelineAssignment {
            node_address: address.clone(),
            model_name: registration.model_name.clone(),
            layer_start: 0,
            layer_end: 0,
            total_layers: self.config.total_layers(&registration.model_name),
            grpc_endpoint: String::new(),
            http_endpoint: String::new(),
            ram_mb: 0,
            device: String::new(),
            vram_mb: 0,
            benchmark_tok_per_sec: 0.0,
            ready: false,
            pipeline_order: 0,
            node_mode: NodeMode::Standalone,
            cluster_id: None,
            rpc_port: 0,
            lan_ip: None,
            updated_at: now,
        });
        assignment.grpc_endpoint = registration.grpc_endpoint.clone();
        assignment.http_endpoint = registration.http_endpoint.clone();
        assignment.ram_mb = registration.ram_mb;
        assignment.device = registration.device.clone();
        assignment.vram_mb = registration.vram_mb;
        assignment.benchmark_tok_per_sec = registration.benchmark_tok_per_sec;
        assignment.rpc_port = registration.rpc_port;
        assignment.lan_ip = registration.lan_ip.clone();
        assignment.updated_at = now;
        self.storage.put_assignment(&assignment)?;

        if joined {
            info!(address = %address, model = %registration.model_name, "pipeline node joined");
            self.bus.publish(TopologyEvent::NodeJoined {
                model: registration.model_name.clone(),
                address: address.clone(),
                timestamp: now,
            });
        }
        self.allocate(&registration.model_name)
    }

    /// The node's explicit readiness call after loading its layer range.
    pub fn mark_ready(&self, address: &Address, model: &str) -> OracleResult<()> {
        let mut assignment = self
            .storage
            .get_assignment(address, model)?
            .ok_or(OracleError::Rejected(RejectReason::Payload))?;
        assignment.ready = true;
        assignment.updated_at = current_timestamp();
        self.storage.put_assignment(&assignment)?;
        self.bus.publish(TopologyEvent::NodeStatus {
            model: model.to_string(),
            address: address.clone(),
            ready: true,
            timestamp: assignment.updated_at,
        });
        Ok(())
    }

    /// Stale-sweep/dissolution removal; re-splits the survivors.
    pub fn remove(&self, address: &Address, model: &str) -> OracleResult<()> {
        self.storage.delete_assignment(address, model)?;
        self.bus.publish(TopologyEvent::NodeLeft {
            model: model.to_string(),
            address: address.clone(),
            timestamp: current_timestamp(),
        });
        self.allocate(model)
    }

    /// Recomputes the full split for one model and persists it as a single
    /// batch, so a partial layout is never observable.
    pub fn allocate(&self, model: &str) -> OracleResult<()> {
        let now = current_timestamp();
        let rows = self.storage.assignments_for_model(model)?;
        let mut active: Vec<PipelineAssignment> = rows
            .into_iter()
            .filter(|row| {
                row.cluster_id.is_none()
                    && row.updated_at + HEARTBEAT_TIMEOUT_SECS >= now
                    && row.has_distinct_transports()
            })
            .collect();
        if active.is_empty() {
            return Ok(());
        }
        active.sort_by(|a, b| a.node_address.cmp(&b.node_address));

        let total_layers = self.config.total_layers(model);
        let weights: Vec<u64> = active
            .iter()
            .map(|row| row.available_memory_mb())
            .collect();
        let spans = split_layers(&weights, total_layers);

        for (order, (row, (start, end))) in active.iter_mut().zip(spans).enumerate() {
            row.layer_start = start;
            row.layer_end = end;
            row.total_layers = total_layers;
            row.pipeline_order = order as u32;
            row.node_mode = NodeMode::Standalone;
            // Layer ranges moved; the node must confirm it reloaded them.
            row.ready = false;
            row.updated_at = now;
        }
        self.storage.put_assignment_batch(&active)?;
        debug!(model, nodes = active.len(), total_layers, "allocated pipeline layers");

        self.bus.publish(TopologyEvent::Topology {
            model: model.to_string(),
            assignments: active,
            timestamp: now,
        });
        Ok(())
    }

    /// Ordered active assignments including standalone single-endpoint
    /// fallback nodes, the router's view of the world.
    pub fn topology(&self, model: &str) -> OracleResult<Vec<PipelineAssignment>> {
        let now = current_timestamp();
        let mut rows = self.storage.assignments_for_model(model)?;
        rows.retain(|row| row.updated_at + HEARTBEAT_TIMEOUT_SECS >= now);
        rows.sort_by_key(|row| (row.cluster_id, row.pipeline_order));
        Ok(rows)
    }
}
