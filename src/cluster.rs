use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, info, warn};

use crate::config::{OracleConfig, HEARTBEAT_TIMEOUT_SECS};
use crate::errors::OracleResult;
use crate::pipeline::{PipelineAllocator, TopologyEvent};
use crate::storage::Storage;
use crate::types::{current_timestamp, NodeMode, PipelineAssignment};

/// A cluster younger than this is never reformed, whatever its membership
/// looks like right now.
pub const CLUSTER_MIN_AGE_SECS: u64 = 300;
/// A member silent for less than this is treated as transiently offline.
pub const NODE_OFFLINE_GRACE_SECS: u64 = 120;

/// Groups memory-constrained LAN peers into coordinator/worker clusters so
/// that nodes too small to serve a model alone can serve it jointly.
///
/// Operates per model in parallel to the plain layer allocator: rows carrying
/// a `cluster_id` belong to this manager, the rest to the allocator.
pub struct ClusterManager {
    storage: Storage,
    config: Arc<OracleConfig>,
    allocator: Arc<PipelineAllocator>,
    /// Formation times, keyed by cluster id. Rebuilt lazily after a restart:
    /// an unknown cluster is treated as formed now, which errs toward
    /// keeping it for another minimum-age window.
    formed_at: Mutex<HashMap<u64, u64>>,
}

impl ClusterManager {
    pub fn new(
        storage: Storage,
        config: Arc<OracleConfig>,
        allocator: Arc<PipelineAllocator>,
    ) -> Self {
        Self {
            storage,
            config,
            allocator,
            formed_at: Mutex::new(HashMap::new()),
        }
    }

    /// Rebalance pass over every model with at least one assignment.
    pub fn reform_all(&self) -> OracleResult<()> {
        let mut models: Vec<String> = self
            .storage
            .load_assignments()?
            .into_iter()
            .map(|row| row.model_name)
            .collect();
        models.sort();
        models.dedup();
        for model in models {
            if let Err(err) = self.reform_model(&model) {
                warn!(model = %model, %err, "cluster reformation failed");
            }
        }
        Ok(())
    }

    /// Full selection/shaping pass for one model.
    pub fn reform_model(&self, model: &str) -> OracleResult<()> {
        let Some(mem_req) = self.config.model_memory_requirement_mb(model) else {
            // No memory table entry means nothing to cluster against.
            return Ok(());
        };
        let now = current_timestamp();
        let dissolved = self.dissolve_stale_clusters(model, now)?;

        let rows = self.storage.assignments_for_model(model)?;
        let mut pool = Vec::new();
        for row in rows {
            if row.updated_at + HEARTBEAT_TIMEOUT_SECS < now {
                continue;
            }
            if row.lan_ip.is_none() {
                continue;
            }
            let distributes = self
                .storage
                .get_node(&row.node_address)?
                .map(|node| node.can_distribute)
                .unwrap_or(false);
            if distributes {
                pool.push(row);
            }
        }
        if pool.is_empty() {
            if dissolved {
                self.allocator.allocate(model)?;
            }
            return Ok(());
        }

        let total_layers = self.config.total_layers(model);
        let mut changed = dissolved;

        // Nodes that fit the model alone never need a cluster.
        for row in pool
            .iter()
            .filter(|row| row.available_memory_mb() >= mem_req)
        {
            if row.cluster_id.is_some() || row.node_mode != NodeMode::Standalone {
                let mut standalone = row.clone();
                standalone.cluster_id = None;
                standalone.node_mode = NodeMode::Standalone;
                standalone.layer_start = 0;
                standalone.layer_end = total_layers;
                standalone.total_layers = total_layers;
                standalone.pipeline_order = 0;
                standalone.ready = false;
                standalone.updated_at = now;
                self.storage.put_assignment(&standalone)?;
                changed = true;
            }
        }

        let needy: Vec<&PipelineAssignment> = pool
            .iter()
            .filter(|row| row.available_memory_mb() < mem_req)
            .collect();

        let mut by_subnet: HashMap<String, Vec<&PipelineAssignment>> = HashMap::new();
        for row in needy {
            if let Some(subnet) = row.subnet() {
                by_subnet.entry(subnet).or_default().push(row);
            }
        }

        for (subnet, members) in by_subnet {
            if self.keep_existing_cluster(&members, now) {
                continue;
            }
            if self.form_cluster(model, &subnet, &members, mem_req, total_layers, now)? {
                changed = true;
            }
        }

        if changed {
            // Clustering changed the non-clustered population too.
            self.allocator.allocate(model)?;
        }
        Ok(())
    }

    /// Hysteresis: keep a cluster that is either younger than the minimum
    /// age or fully attended, and forgive members that are only transiently
    /// silent.
    fn keep_existing_cluster(&self, members: &[&PipelineAssignment], now: u64) -> bool {
        let Some(cluster_id) = members.iter().find_map(|row| row.cluster_id) else {
            return false;
        };
        let formed = *self
            .formed_at
            .lock()
            .entry(cluster_id)
            .or_insert(now);
        if now.saturating_sub(formed) < CLUSTER_MIN_AGE_SECS {
            return true;
        }
        members
            .iter()
            .filter(|row| row.cluster_id == Some(cluster_id))
            .all(|row| now.saturating_sub(row.updated_at) < NODE_OFFLINE_GRACE_SECS)
    }

    /// Greedy formation: strongest nodes first until the model fits.
    fn form_cluster(
        &self,
        model: &str,
        subnet: &str,
        candidates: &[&PipelineAssignment],
        mem_req: u64,
        total_layers: u32,
        now: u64,
    ) -> OracleResult<bool> {
        let mut sorted: Vec<&PipelineAssignment> = candidates.to_vec();
        sorted.sort_by(|a, b| {
            b.benchmark_tok_per_sec
                .partial_cmp(&a.benchmark_tok_per_sec)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut selected = Vec::new();
        let mut memory = 0u64;
        for row in sorted {
            selected.push(row);
            memory += row.available_memory_mb();
            if memory >= mem_req {
                break;
            }
        }
        if selected.len() < 2 || memory < mem_req {
            debug!(
                model,
                subnet,
                candidates = candidates.len(),
                memory,
                mem_req,
                "subnet cannot host a cluster"
            );
            return Ok(false);
        }

        let cluster_id: u64 = rand::thread_rng().gen();
        let spans = cluster_layer_spans(
            &selected
                .iter()
                .map(|row| (row.benchmark_tok_per_sec, row.available_memory_mb()))
                .collect::<Vec<_>>(),
            mem_req,
            total_layers,
        );

        let mut shaped = Vec::with_capacity(selected.len());
        for (index, (row, (start, end))) in selected.iter().zip(spans).enumerate() {
            let mut member = (*row).clone();
            member.cluster_id = Some(cluster_id);
            member.node_mode = if index == 0 {
                NodeMode::Coordinator
            } else {
                NodeMode::RpcServer
            };
            member.layer_start = start;
            member.layer_end = end;
            member.total_layers = total_layers;
            // Iteration order matches data flow through the pipeline.
            member.pipeline_order = start;
            member.ready = false;
            member.updated_at = now;
            shaped.push(member);
        }
        self.storage.put_assignment_batch(&shaped)?;
        self.formed_at.lock().insert(cluster_id, now);

        info!(
            model,
            subnet,
            cluster_id,
            members = shaped.len(),
            coordinator = %shaped[0].node_address,
            "formed pipeline cluster"
        );
        self.allocator.bus().publish(TopologyEvent::Topology {
            model: model.to_string(),
            assignments: shaped,
            timestamp: now,
        });
        Ok(true)
    }

    /// A member silent past the offline grace dissolves its whole cluster;
    /// survivors fall back to standalone and the next reform pass regroups
    /// them. Returns whether anything was dissolved.
    fn dissolve_stale_clusters(&self, model: &str, now: u64) -> OracleResult<bool> {
        let rows = self.storage.assignments_for_model(model)?;
        let mut clusters: HashMap<u64, Vec<PipelineAssignment>> = HashMap::new();
        for row in rows {
            if let Some(cluster_id) = row.cluster_id {
                clusters.entry(cluster_id).or_default().push(row);
            }
        }
        let mut dissolved = false;
        for (cluster_id, members) in clusters {
            let expired = members
                .iter()
                .any(|row| now.saturating_sub(row.updated_at) > NODE_OFFLINE_GRACE_SECS);
            if !expired {
                continue;
            }
            info!(model, cluster_id, "dissolving cluster with offline member");
            for mut member in members {
                member.cluster_id = None;
                member.node_mode = NodeMode::Standalone;
                member.ready = false;
                self.storage.put_assignment(&member)?;
            }
            self.formed_at.lock().remove(&cluster_id);
            dissolved = true;
        }
        Ok(dissolved)
    }
}

/// Layer spans inside a cluster: proportional to throughput share, capped by
/// what each node's memory can hold, with the final member absorbing the
/// remainder.
fn cluster_layer_spans(
    members: &[(f64, u64)],
    mem_req: u64,
    total_layers: u32,
) -> Vec<(u32, u32)> {
    let n = members.len();
    let total_tok: f64 = members.iter().map(|(tok, _)| tok.max(0.0)).sum();
    let mut spans = Vec::with_capacity(n);
    let mut cursor = 0u32;
    for (index, (tok, memory)) in members.iter().enumerate() {
        let span = if index == n - 1 {
            total_layers - cursor
        } else {
            let share = if total_tok > 0.0 {
                ((total_layers as f64) * (tok / total_tok)).floor() as u32
            } else {
                total_layers / n as u32
            };
            let cap = ((*memory as u128 * total_layers as u128) / mem_req as u128) as u32;
            share.min(cap).min(total_layers - cursor)
        };
        spans.push((cursor, cursor + span));
        cursor += span;
    }
    spans
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::TopologyBus;
    use crate::types::{AgentNode, NodeStatus};
    use tempfile::tempdir;

    struct Fixture {
        _dir: tempfile::TempDir,
        storage: Storage,
        manager: ClusterManager,
    }

    const MODEL: &str = "llama-20b";
    const MEM_REQ: u64 = 18_000;

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let storage = Storage::open(dir.path(), false).unwrap();
        let mut config = OracleConfig::default();
        config.model_memory_mb.insert(MODEL.into(), MEM_REQ);
        let config = Arc::new(config);
        let allocator = Arc::new(PipelineAllocator::new(
            storage.clone(),
            config.clone(),
            TopologyBus::new(),
        ));
        let manager = ClusterManager::new(storage.clone(), config, allocator);
        Fixture {
            _dir: dir,
            storage,
            manager,
        }
    }

    fn lan_node(
        fixture: &Fixture,
        address: &str,
        lan_ip: &str,
        ram_mb: u64,
        tok_per_sec: f64,
    ) {
        let now = current_timestamp();
        let mut node = AgentNode::new(address.to_string(), format!("http://{lan_ip}:8080"), now);
        node.can_distribute = true;
        node.lan_ip = Some(lan_ip.to_string());
        node.status = NodeStatus::Active;
        fixture.storage.put_node(&node).unwrap();

        let assignment = PipelineAssignment {
            node_address: address.to_string(),
            model_name: MODEL.into(),
            layer_start: 0,
            layer_end: 0,
            total_layers: 32,
            grpc_endpoint: format!("{lan_ip}:50051"),
            http_endpoint: format!("{lan_ip}:8080"),
            ram_mb,
            device: "cpu".into(),
            vram_mb: 0,
            benchmark_tok_per_sec: tok_per_sec,
            ready: false,
            pipeline_order: 0,
            node_mode: NodeMode::Standalone,
            cluster_id: None,
            rpc_port: 50052,
            lan_ip: Some(lan_ip.to_string()),
            updated_at: now,
        };
        fixture.storage.put_assignment(&assignment).unwrap();
    }

    fn addr(tag: &str) -> String {
        format!("0x{}", tag.repeat(40 / tag.len()))
    }

    #[test]
    fn lan_peers_cluster_with_fastest_as_coordinator() {
        let fixture = fixture();
        let a = addr("1");
        let b = addr("2");
        lan_node(&fixture, &a, "192.168.0.10", 9_216, 60.0);
        lan_node(&fixture, &b, "192.168.0.11", 9_216, 40.0);
        // Different subnet, must not join.
        let c = addr("3");
        lan_node(&fixture, &c, "192.168.1.10", 9_216, 80.0);

        fixture.manager.reform_model(MODEL).unwrap();

        let rows = fixture.storage.assignments_for_model(MODEL).unwrap();
        let a_row = rows.iter().find(|r| r.node_address == a).unwrap();
        let b_row = rows.iter().find(|r| r.node_address == b).unwrap();
        let c_row = rows.iter().find(|r| r.node_address == c).unwrap();

        assert_eq!(a_row.node_mode, NodeMode::Coordinator);
        assert_eq!(b_row.node_mode, NodeMode::RpcServer);
        assert_eq!(a_row.cluster_id, b_row.cluster_id);
        assert!(a_row.cluster_id.is_some());
        assert!(c_row.cluster_id.is_none());

        // 60/40 throughput split capped at floor(9216*32/18000) = 16.
        assert_eq!((a_row.layer_start, a_row.layer_end), (0, 16));
        assert_eq!((b_row.layer_start, b_row.layer_end), (16, 32));
        assert_eq!(a_row.pipeline_order, 0);
        assert_eq!(b_row.pipeline_order, 16);
    }

    #[test]
    fn lone_needy_node_stays_unclustered() {
        let fixture = fixture();
        let a = addr("1");
        lan_node(&fixture, &a, "192.168.0.10", 9_216, 60.0);
        fixture.manager.reform_model(MODEL).unwrap();
        let rows = fixture.storage.assignments_for_model(MODEL).unwrap();
        assert!(rows[0].cluster_id.is_none());
    }

    #[test]
    fn insufficient_subnet_memory_forms_nothing() {
        let fixture = fixture();
        let a = addr("1");
        let b = addr("2");
        lan_node(&fixture, &a, "192.168.0.10", 4_096, 60.0);
        lan_node(&fixture, &b, "192.168.0.11", 4_096, 40.0);
        fixture.manager.reform_model(MODEL).unwrap();
        let rows = fixture.storage.assignments_for_model(MODEL).unwrap();
        assert!(rows.iter().all(|row| row.cluster_id.is_none()));
    }

    #[test]
    fn capable_node_is_left_standalone() {
        let fixture = fixture();
        let a = addr("1");
        lan_node(&fixture, &a, "192.168.0.10", 32_768, 60.0);
        fixture.manager.reform_model(MODEL).unwrap();
        let rows = fixture.storage.assignments_for_model(MODEL).unwrap();
        assert_eq!(rows[0].node_mode, NodeMode::Standalone);
        assert!(rows[0].cluster_id.is_none());
    }

    #[test]
    fn young_cluster_is_kept_despite_membership_change() {
        let fixture = fixture();
        let a = addr("1");
        let b = addr("2");
        lan_node(&fixture, &a, "192.168.0.10", 9_216, 60.0);
        lan_node(&fixture, &b, "192.168.0.11", 9_216, 40.0);
        fixture.manager.reform_model(MODEL).unwrap();
        let before = fixture.storage.assignments_for_model(MODEL).unwrap();
        let cluster_id = before[0].cluster_id;

        // A third peer appears; the young cluster must not be reshaped.
        let c = addr("3");
        lan_node(&fixture, &c, "192.168.0.12", 9_216, 90.0);
        fixture.manager.reform_model(MODEL).unwrap();
        let after = fixture.storage.assignments_for_model(MODEL).unwrap();
        let a_row = after.iter().find(|r| r.node_address == a).unwrap();
        assert_eq!(a_row.cluster_id, cluster_id);
        assert_eq!(a_row.node_mode, NodeMode::Coordinator);
    }

    #[test]
    fn offline_member_dissolves_the_cluster() {
        let fixture = fixture();
        let a = addr("1");
        let b = addr("2");
        lan_node(&fixture, &a, "192.168.0.10", 9_216, 60.0);
        lan_node(&fixture, &b, "192.168.0.11", 9_216, 40.0);
        fixture.manager.reform_model(MODEL).unwrap();

        // Push one member past the offline grace.
        let mut stale = fixture.storage.get_assignment(&b, MODEL).unwrap().unwrap();
        stale.updated_at = current_timestamp() - NODE_OFFLINE_GRACE_SECS - 30;
        fixture.storage.put_assignment(&stale).unwrap();

        fixture
            .manager
            .dissolve_stale_clusters(MODEL, current_timestamp())
            .unwrap();
        let rows = fixture.storage.assignments_for_model(MODEL).unwrap();
        assert!(rows.iter().all(|row| row.cluster_id.is_none()));
        assert!(rows
            .iter()
            .all(|row| row.node_mode == NodeMode::Standalone));
        assert!(rows.iter().all(|row| !row.ready));
    }

    #[test]
    fn span_caps_respect_member_memory() {
        // Fast node would take 19 layers by share, memory caps it at 16.
        let spans = cluster_layer_spans(&[(60.0, 9_216), (40.0, 9_216)], 18_000, 32);
        assert_eq!(spans, vec![(0, 16), (16, 32)]);
    }

    #[test]
    fn zero_benchmark_members_split_equally() {
        let spans = cluster_layer_spans(&[(0.0, 20_000), (0.0, 20_000)], 18_000, 32);
        assert_eq!(spans, vec![(0, 16), (16, 32)]);
    }
}
