use std::path::Path;
use std::sync::Arc;

use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, IteratorMode, MultiThreaded,
    Options, DB,
};

use crate::errors::{OracleError, OracleResult};
use crate::types::{
    Agent, AgentNode, Challenge, Contribution, Epoch, EpochMetrics, InferenceProof, NetworkStats,
    PipelineAssignment,
};

pub const STORAGE_SCHEMA_VERSION: u32 = 3;

const CF_AGENTS: &str = "agents";
const CF_AGENT_NODES: &str = "agent_nodes";
const CF_CHALLENGES: &str = "challenges";
const CF_EPOCHS: &str = "epochs";
const CF_CONTRIBUTIONS: &str = "contributions";
const CF_NETWORK_STATS: &str = "network_stats";
const CF_INFERENCE_METRICS: &str = "inference_metrics";
const CF_INFERENCE_PROOFS: &str = "inference_proofs";
const CF_PIPELINE_ASSIGNMENTS: &str = "pipeline_assignments";
const CF_METADATA: &str = "metadata";

const ALL_COLUMN_FAMILIES: [&str; 10] = [
    CF_AGENTS,
    CF_AGENT_NODES,
    CF_CHALLENGES,
    CF_EPOCHS,
    CF_CONTRIBUTIONS,
    CF_NETWORK_STATS,
    CF_INFERENCE_METRICS,
    CF_INFERENCE_PROOFS,
    CF_PIPELINE_ASSIGNMENTS,
    CF_METADATA,
];

const SCHEMA_VERSION_KEY: &[u8] = b"schema_version";
const NETWORK_STATS_KEY: &[u8] = b"latest";

/// Single persistent source of truth. Every in-memory map elsewhere in the
/// process is a derived cache rebuilt from these column families at boot.
pub struct Storage {
    db: Arc<DBWithThreadMode<MultiThreaded>>,
}

impl Storage {
    /// Opens the store, creating missing column families in development.
    /// With `strict` set (production), a missing family or an unexpected
    /// schema version aborts instead of being papered over.
    pub fn open(path: &Path, strict: bool) -> OracleResult<Self> {
        if strict {
            let existing = DB::list_cf(&Options::default(), path)
                .map_err(|err| OracleError::Config(format!("cannot enumerate schema: {err}")))?;
            for family in ALL_COLUMN_FAMILIES {
                if !existing.iter().any(|name| name == family) {
                    return Err(OracleError::Config(format!(
                        "schema verification failed: missing column family {family}"
                    )));
                }
            }
        }
        let mut opts = Options::default();
        opts.create_if_missing(!strict);
        opts.create_missing_column_families(!strict);
        let cf_descriptors: Vec<ColumnFamilyDescriptor> = ALL_COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect();
        let db = DBWithThreadMode::open_cf_descriptors(&opts, path, cf_descriptors)?;
        let storage = Self { db: Arc::new(db) };
        storage.ensure_schema_supported()?;
        Ok(storage)
    }

    fn ensure_schema_supported(&self) -> OracleResult<()> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(&cf, SCHEMA_VERSION_KEY)? {
            Some(bytes) => {
                let bytes: [u8; 4] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| OracleError::Config("invalid schema version encoding".into()))?;
                let version = u32::from_be_bytes(bytes);
                if version != STORAGE_SCHEMA_VERSION {
                    return Err(OracleError::Config(format!(
                        "database schema version {version} does not match supported {STORAGE_SCHEMA_VERSION}"
                    )));
                }
                Ok(())
            }
            None => {
                self.db.put_cf(
                    &cf,
                    SCHEMA_VERSION_KEY,
                    STORAGE_SCHEMA_VERSION.to_be_bytes(),
                )?;
                Ok(())
            }
        }
    }

    fn cf(&self, name: &str) -> OracleResult<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| OracleError::Config(format!("missing column family {name}")))
    }

    fn put<T: serde::Serialize>(&self, family: &str, key: &[u8], value: &T) -> OracleResult<()> {
        let cf = self.cf(family)?;
        let data = bincode::serialize(value)?;
        self.db.put_cf(&cf, key, data)?;
        Ok(())
    }

    fn get<T: serde::de::DeserializeOwned>(
        &self,
        family: &str,
        key: &[u8],
    ) -> OracleResult<Option<T>> {
        let cf = self.cf(family)?;
        match self.db.get_cf(&cf, key)? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    fn scan<T: serde::de::DeserializeOwned>(&self, family: &str) -> OracleResult<Vec<T>> {
        let cf = self.cf(family)?;
        let mut rows = Vec::new();
        let mut iterator = self.db.iterator_cf(&cf, IteratorMode::Start);
        while let Some(entry) = iterator.next() {
            let (_key, value) = entry?;
            rows.push(bincode::deserialize(&value)?);
        }
        Ok(rows)
    }

    // --- agents ---

    pub fn put_agent(&self, agent: &Agent) -> OracleResult<()> {
        self.put(CF_AGENTS, agent.address.as_bytes(), agent)
    }

    pub fn get_agent(&self, address: &str) -> OracleResult<Option<Agent>> {
        self.get(CF_AGENTS, address.as_bytes())
    }

    pub fn load_agents(&self) -> OracleResult<Vec<Agent>> {
        let mut agents: Vec<Agent> = self.scan(CF_AGENTS)?;
        agents.sort_by(|a, b| a.address.cmp(&b.address));
        Ok(agents)
    }

    // --- agent nodes ---

    pub fn put_node(&self, node: &AgentNode) -> OracleResult<()> {
        self.put(CF_AGENT_NODES, node.address.as_bytes(), node)
    }

    pub fn get_node(&self, address: &str) -> OracleResult<Option<AgentNode>> {
        self.get(CF_AGENT_NODES, address.as_bytes())
    }

    pub fn load_nodes(&self) -> OracleResult<Vec<AgentNode>> {
        let mut nodes: Vec<AgentNode> = self.scan(CF_AGENT_NODES)?;
        nodes.sort_by(|a, b| a.address.cmp(&b.address));
        Ok(nodes)
    }

    // --- epoch metrics ---

    fn metrics_key(address: &str, epoch: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(address.len() + 8);
        key.extend_from_slice(address.as_bytes());
        key.extend_from_slice(&epoch.to_be_bytes());
        key
    }

    pub fn put_metrics(&self, metrics: &EpochMetrics) -> OracleResult<()> {
        self.put(
            CF_INFERENCE_METRICS,
            &Self::metrics_key(&metrics.address, metrics.epoch),
            metrics,
        )
    }

    pub fn get_metrics(&self, address: &str, epoch: u64) -> OracleResult<Option<EpochMetrics>> {
        self.get(CF_INFERENCE_METRICS, &Self::metrics_key(address, epoch))
    }

    pub fn load_metrics_for_epoch(&self, epoch: u64) -> OracleResult<Vec<EpochMetrics>> {
        let mut rows: Vec<EpochMetrics> = self.scan(CF_INFERENCE_METRICS)?;
        rows.retain(|row| row.epoch == epoch);
        rows.sort_by(|a, b| a.address.cmp(&b.address));
        Ok(rows)
    }

    /// Latest metrics row per address, regardless of epoch. Bootstrap uses
    /// this to rebuild the replay cursors and raw-counter snapshots.
    pub fn load_latest_metrics(&self) -> OracleResult<Vec<EpochMetrics>> {
        let mut latest: std::collections::HashMap<String, EpochMetrics> =
            std::collections::HashMap::new();
        for row in self.scan::<EpochMetrics>(CF_INFERENCE_METRICS)? {
            match latest.get(&row.address) {
                Some(existing) if existing.epoch >= row.epoch => {}
                _ => {
                    latest.insert(row.address.clone(), row);
                }
            }
        }
        Ok(latest.into_values().collect())
    }

    // --- inference proofs ---

    pub fn put_proof(&self, proof: &InferenceProof) -> OracleResult<()> {
        self.put(CF_INFERENCE_PROOFS, proof.id.as_bytes(), proof)
    }

    pub fn get_proof(&self, id: &str) -> OracleResult<Option<InferenceProof>> {
        self.get(CF_INFERENCE_PROOFS, id.as_bytes())
    }

    pub fn load_proofs_for(&self, address: &str) -> OracleResult<Vec<InferenceProof>> {
        let mut proofs: Vec<InferenceProof> = self.scan(CF_INFERENCE_PROOFS)?;
        proofs.retain(|proof| proof.address == address);
        proofs.sort_by_key(|proof| proof.created_at);
        Ok(proofs)
    }

    pub fn load_proofs_for_epoch(
        &self,
        address: &str,
        epoch: u64,
    ) -> OracleResult<Vec<InferenceProof>> {
        let mut proofs = self.load_proofs_for(address)?;
        proofs.retain(|proof| proof.epoch == epoch);
        Ok(proofs)
    }

    // --- contributions ---

    pub fn put_contribution(&self, contribution: &Contribution) -> OracleResult<()> {
        self.put(
            CF_CONTRIBUTIONS,
            &Self::metrics_key(&contribution.address, contribution.epoch),
            contribution,
        )
    }

    pub fn get_contribution(
        &self,
        address: &str,
        epoch: u64,
    ) -> OracleResult<Option<Contribution>> {
        self.get(CF_CONTRIBUTIONS, &Self::metrics_key(address, epoch))
    }

    pub fn load_contributions_for_epoch(&self, epoch: u64) -> OracleResult<Vec<Contribution>> {
        let mut rows: Vec<Contribution> = self.scan(CF_CONTRIBUTIONS)?;
        rows.retain(|row| row.epoch == epoch);
        rows.sort_by(|a, b| a.address.cmp(&b.address));
        Ok(rows)
    }

    // --- epochs ---

    pub fn put_epoch(&self, epoch: &Epoch) -> OracleResult<()> {
        self.put(CF_EPOCHS, &epoch.number.to_be_bytes(), epoch)
    }

    pub fn get_epoch(&self, number: u64) -> OracleResult<Option<Epoch>> {
        self.get(CF_EPOCHS, &number.to_be_bytes())
    }

    pub fn load_epochs(&self) -> OracleResult<Vec<Epoch>> {
        let mut epochs: Vec<Epoch> = self.scan(CF_EPOCHS)?;
        epochs.sort_by_key(|epoch| epoch.number);
        Ok(epochs)
    }

    // --- challenges ---

    pub fn put_challenge(&self, challenge: &Challenge) -> OracleResult<()> {
        self.put(CF_CHALLENGES, &challenge.id.to_be_bytes(), challenge)
    }

    pub fn get_challenge(&self, id: u64) -> OracleResult<Option<Challenge>> {
        self.get(CF_CHALLENGES, &id.to_be_bytes())
    }

    pub fn load_challenges(&self) -> OracleResult<Vec<Challenge>> {
        let mut challenges: Vec<Challenge> = self.scan(CF_CHALLENGES)?;
        challenges.sort_by_key(|challenge| challenge.id);
        Ok(challenges)
    }

    // --- pipeline assignments ---

    fn assignment_key(model: &str, address: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(model.len() + address.len() + 1);
        key.extend_from_slice(model.as_bytes());
        key.push(0);
        key.extend_from_slice(address.as_bytes());
        key
    }

    pub fn put_assignment(&self, assignment: &PipelineAssignment) -> OracleResult<()> {
        self.put(
            CF_PIPELINE_ASSIGNMENTS,
            &Self::assignment_key(&assignment.model_name, &assignment.node_address),
            assignment,
        )
    }

    /// Persists a full per-model assignment batch. Callers compute the whole
    /// split before writing so partial layouts are never observable.
    pub fn put_assignment_batch(&self, assignments: &[PipelineAssignment]) -> OracleResult<()> {
        let cf = self.cf(CF_PIPELINE_ASSIGNMENTS)?;
        let mut batch = rocksdb::WriteBatch::default();
        for assignment in assignments {
            let key = Self::assignment_key(&assignment.model_name, &assignment.node_address);
            batch.put_cf(&cf, key, bincode::serialize(assignment)?);
        }
        self.db.write(batch)?;
        Ok(())
    }

    pub fn get_assignment(
        &self,
        address: &str,
        model: &str,
    ) -> OracleResult<Option<PipelineAssignment>> {
        self.get(
            CF_PIPELINE_ASSIGNMENTS,
            &Self::assignment_key(model, address),
        )
    }

    pub fn delete_assignment(&self, address: &str, model: &str) -> OracleResult<()> {
        let cf = self.cf(CF_PIPELINE_ASSIGNMENTS)?;
        self.db
            .delete_cf(&cf, Self::assignment_key(model, address))?;
        Ok(())
    }

    pub fn assignments_for_model(&self, model: &str) -> OracleResult<Vec<PipelineAssignment>> {
        let cf = self.cf(CF_PIPELINE_ASSIGNMENTS)?;
        let mut prefix = Vec::with_capacity(model.len() + 1);
        prefix.extend_from_slice(model.as_bytes());
        prefix.push(0);
        let mut rows = Vec::new();
        let mut iterator = self.db.iterator_cf(
            &cf,
            IteratorMode::From(&prefix, rocksdb::Direction::Forward),
        );
        while let Some(entry) = iterator.next() {
            let (key, value) = entry?;
            if !key.starts_with(&prefix) {
                break;
            }
            rows.push(bincode::deserialize::<PipelineAssignment>(&value)?);
        }
        rows.sort_by_key(|row| row.pipeline_order);
        Ok(rows)
    }

    pub fn load_assignments(&self) -> OracleResult<Vec<PipelineAssignment>> {
        self.scan(CF_PIPELINE_ASSIGNMENTS)
    }

    // --- network stats ---

    pub fn put_network_stats(&self, stats: &NetworkStats) -> OracleResult<()> {
        self.put(CF_NETWORK_STATS, NETWORK_STATS_KEY, stats)
    }

    pub fn get_network_stats(&self) -> OracleResult<Option<NetworkStats>> {
        self.get(CF_NETWORK_STATS, NETWORK_STATS_KEY)
    }
}

impl Clone for Storage {
    fn clone(&self) -> Self {
        Self {
            db: self.db.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NodeMode;
    use tempfile::tempdir;

    fn assignment(address: &str, model: &str, order: u32) -> PipelineAssignment {
        PipelineAssignment {
            node_address: address.to_string(),
            model_name: model.to_string(),
            layer_start: 0,
            layer_end: 32,
            total_layers: 32,
            grpc_endpoint: format!("{address}:50051"),
            http_endpoint: format!("{address}:8080"),
            ram_mb: 16_384,
            device: "cpu".into(),
            vram_mb: 0,
            benchmark_tok_per_sec: 10.0,
            ready: false,
            pipeline_order: order,
            node_mode: NodeMode::Standalone,
            cluster_id: None,
            rpc_port: 50052,
            lan_ip: None,
            updated_at: 0,
        }
    }

    #[test]
    fn metrics_round_trip_and_epoch_scan() {
        let dir = tempdir().unwrap();
        let storage = Storage::open(dir.path(), false).unwrap();
        let mut metrics = EpochMetrics::new("0xaa".repeat(20).into(), 7);
        metrics.tokens_processed = 550;
        metrics.last_raw_tokens = 250;
        storage.put_metrics(&metrics).unwrap();

        let loaded = storage.get_metrics(&metrics.address, 7).unwrap().unwrap();
        assert_eq!(loaded.tokens_processed, 550);
        assert_eq!(loaded.last_raw_tokens, 250);
        assert!(storage.get_metrics(&metrics.address, 8).unwrap().is_none());
        assert_eq!(storage.load_metrics_for_epoch(7).unwrap().len(), 1);
    }

    #[test]
    fn assignment_prefix_scan_is_model_scoped() {
        let dir = tempdir().unwrap();
        let storage = Storage::open(dir.path(), false).unwrap();
        let a = "0x".to_string() + &"a".repeat(40);
        let b = "0x".to_string() + &"b".repeat(40);
        storage.put_assignment(&assignment(&a, "llama-8b", 0)).unwrap();
        storage.put_assignment(&assignment(&b, "llama-8b", 1)).unwrap();
        storage.put_assignment(&assignment(&a, "qwen-14b", 0)).unwrap();

        let rows = storage.assignments_for_model("llama-8b").unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|row| row.model_name == "llama-8b"));
        assert_eq!(storage.assignments_for_model("qwen-14b").unwrap().len(), 1);
    }

    #[test]
    fn latest_metrics_picks_newest_epoch_per_address() {
        let dir = tempdir().unwrap();
        let storage = Storage::open(dir.path(), false).unwrap();
        let address: String = "0x".to_string() + &"c".repeat(40);
        for epoch in [3u64, 5, 4] {
            let mut metrics = EpochMetrics::new(address.clone(), epoch);
            metrics.last_raw_tokens = epoch * 100;
            storage.put_metrics(&metrics).unwrap();
        }
        let latest = storage.load_latest_metrics().unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].epoch, 5);
        assert_eq!(latest[0].last_raw_tokens, 500);
    }

    #[test]
    fn strict_open_requires_existing_schema() {
        let dir = tempdir().unwrap();
        assert!(Storage::open(dir.path(), true).is_err());
        drop(Storage::open(dir.path(), false).unwrap());
        assert!(Storage::open(dir.path(), true).is_ok());
    }
}
