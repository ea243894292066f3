use std::fmt;

use serde::{Deserialize, Serialize};

use super::Address;

/// Role a node plays for one model.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum NodeMode {
    #[default]
    Standalone,
    Coordinator,
    RpcServer,
}

impl NodeMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeMode::Standalone => "standalone",
            NodeMode::Coordinator => "coordinator",
            NodeMode::RpcServer => "rpc-server",
        }
    }
}

impl fmt::Display for NodeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The `(node, model) -> [layer_start, layer_end)` mapping persisted in the
/// store. Within one cluster (or for a single standalone entry) the layer
/// intervals of all rows cover `[0, total_layers)` without overlap.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PipelineAssignment {
    pub node_address: Address,
    pub model_name: String,
    pub layer_start: u32,
    pub layer_end: u32,
    pub total_layers: u32,
    pub grpc_endpoint: String,
    pub http_endpoint: String,
    pub ram_mb: u64,
    pub device: String,
    pub vram_mb: u64,
    pub benchmark_tok_per_sec: f64,
    pub ready: bool,
    pub pipeline_order: u32,
    pub node_mode: NodeMode,
    pub cluster_id: Option<u64>,
    pub rpc_port: u16,
    pub lan_ip: Option<String>,
    pub updated_at: u64,
}

impl PipelineAssignment {
    /// Memory the node can actually dedicate to model layers: the GPU budget
    /// when one is reported, host RAM otherwise.
    pub fn available_memory_mb(&self) -> u64 {
        if self.is_gpu() && self.vram_mb > 0 {
            self.vram_mb
        } else {
            self.ram_mb
        }
    }

    pub fn is_gpu(&self) -> bool {
        let device = self.device.to_ascii_lowercase();
        device.contains("cuda") || device.contains("gpu") || device.contains("metal")
    }

    /// Rows that collapse both transports are standalone inference nodes;
    /// they are listed in topology but excluded from layer splitting.
    pub fn has_distinct_transports(&self) -> bool {
        !self.grpc_endpoint.is_empty()
            && !self.http_endpoint.is_empty()
            && self.grpc_endpoint != self.http_endpoint
    }

    /// First three octets of the LAN address, the clustering domain.
    pub fn subnet(&self) -> Option<String> {
        let lan_ip = self.lan_ip.as_deref()?;
        let octets: Vec<&str> = lan_ip.split('.').collect();
        if octets.len() != 4 {
            return None;
        }
        Some(format!("{}.{}.{}", octets[0], octets[1], octets[2]))
    }
}
