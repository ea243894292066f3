//! Scenario tests exercising the full ingest -> score -> report path and
//! the pipeline lifecycle through the oracle handle.

use std::sync::Arc;

use inference_oracle::chain::testing::MockChainClient;
use inference_oracle::chain::{ChainClient, EpochCursor};
use inference_oracle::config::OracleConfig;
use inference_oracle::crypto::{
    generate_signing_key, sign_message, signer_address, telemetry_message,
};
use inference_oracle::ingest::{ReplayGuards, TelemetryIngestor, TelemetryReport};
use inference_oracle::node::{Oracle, OracleHandle, ReadyCall};
use inference_oracle::pipeline::PipelineRegistration;
use inference_oracle::proofs::ProofStore;
use inference_oracle::reporter::ReporterCore;
use inference_oracle::scoring::EpochScorer;
use inference_oracle::storage::Storage;
use inference_oracle::types::{current_timestamp, NodeMode};
use k256::ecdsa::SigningKey;

fn telemetry(key: &SigningKey, tokens: u64, requests: u64, timestamp: u64) -> TelemetryReport {
    let address = signer_address(key);
    let message = telemetry_message(&address, tokens, timestamp);
    TelemetryReport {
        address,
        tokens_processed: tokens,
        avg_latency_ms: 120.0,
        request_count: requests,
        uptime_seconds: 2_400,
        timestamp,
        signature: sign_message(key, message.as_bytes()).unwrap(),
        proofs: Vec::new(),
    }
}

#[tokio::test]
async fn telemetry_flows_into_an_onchain_contribution_report() {
    let dir = tempfile::tempdir().unwrap();
    let storage = Storage::open(dir.path(), false).unwrap();
    let chain = MockChainClient::new();
    chain.state.lock().epoch = 41;
    let key = generate_signing_key();
    let address = signer_address(&key);
    chain.register(&address);

    let scorer = Arc::new(EpochScorer::new(storage.clone()));
    let proofs = ProofStore::new(storage.clone());
    let ingestor = TelemetryIngestor::new(
        storage.clone(),
        Arc::new(chain.clone()),
        scorer.clone(),
        proofs.clone(),
        Arc::new(EpochCursor::new(41)),
        Arc::new(ReplayGuards::default()),
    );

    let base = current_timestamp();
    for (tokens, requests, offset) in [(100, 1, 0), (300, 3, 10), (250, 4, 20)] {
        ingestor
            .ingest(&telemetry(&key, tokens, requests, base + offset), false)
            .await
            .unwrap();
    }

    let reporter = ReporterCore::new(
        storage.clone(),
        Arc::new(chain.clone()),
        scorer,
        proofs,
        0,
    );
    chain.state.lock().block = 1;
    reporter.tick().await.unwrap();
    chain.state.lock().block = 2;
    let stats = reporter.tick().await.unwrap().unwrap();
    assert_eq!(stats.reported, 1);
    assert_eq!(stats.failed, 0);

    // The local row and the contract's tally must agree.
    let local = storage.get_contribution(&address, 41).unwrap().unwrap();
    assert_eq!(local.processed_tokens, 550);
    assert_eq!(local.uptime_seconds, 2_400);
    let onchain = chain
        .epoch_contribution(41, &address)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(onchain.processed_tokens, local.processed_tokens);
    assert_eq!(onchain.uptime_seconds, local.uptime_seconds);
    assert_eq!(onchain.response_score, local.response_score);
    assert_eq!(onchain.avg_latency_inv, local.avg_latency_inv);
}

#[tokio::test]
async fn oracle_restart_preserves_counters_and_replay_cursor() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = OracleConfig::default();
    config.data_dir = dir.path().to_path_buf();
    config.key_path = dir.path().join("keys/oracle.toml");

    let chain = MockChainClient::new();
    chain.state.lock().epoch = 41;
    let key = generate_signing_key();
    let address = signer_address(&key);
    chain.register(&address);

    let base = current_timestamp();
    {
        let oracle = Oracle::new(
            config.clone(),
            Arc::new(chain.clone()),
            "0xoracle".into(),
        )
        .unwrap();
        let runtime = oracle.start().await.unwrap();
        let handle = oracle.handle();
        for (tokens, requests, offset) in [(100, 1, 0), (300, 3, 10)] {
            handle
                .submit_metrics(&telemetry(&key, tokens, requests, base + offset), false)
                .await
                .unwrap();
        }
        runtime.shutdown().await;
    }

    // Process restart: same data dir, fresh in-memory state.
    let oracle = Oracle::new(config, Arc::new(chain.clone()), "0xoracle".into()).unwrap();
    let runtime = oracle.start().await.unwrap();
    let handle = oracle.handle();

    // Replaying the already-accepted report is still rejected.
    let replay = telemetry(&key, 300, 3, base + 10);
    assert!(handle.submit_metrics(&replay, false).await.is_err());

    // The post-reset report accumulates against the rehydrated raw values.
    handle
        .submit_metrics(&telemetry(&key, 250, 4, base + 20), false)
        .await
        .unwrap();
    let metrics = handle.metrics(&address).unwrap().unwrap();
    assert_eq!(metrics.tokens_processed, 550);
    assert_eq!(metrics.request_count, 7);
    assert_eq!(metrics.last_raw_tokens, 250);
    runtime.shutdown().await;
}

fn pipeline_registration(
    key: &SigningKey,
    model: &str,
    lan_ip: &str,
    ram_mb: u64,
    tok_per_sec: f64,
    timestamp: u64,
) -> PipelineRegistration {
    let address = signer_address(key);
    let mut registration = PipelineRegistration {
        address: address.clone(),
        model_name: model.to_string(),
        grpc_endpoint: format!("{lan_ip}:50051"),
        http_endpoint: format!("{lan_ip}:8080"),
        ram_mb,
        device: "cpu".into(),
        vram_mb: 0,
        benchmark_tok_per_sec: tok_per_sec,
        rpc_port: 50052,
        lan_ip: Some(lan_ip.to_string()),
        can_distribute: true,
        timestamp,
        signature: String::new(),
    };
    registration.signature =
        sign_message(key, registration.signing_message().as_bytes()).unwrap();
    registration
}

#[tokio::test]
async fn lan_peers_cluster_and_confirm_readiness_through_the_handle() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = OracleConfig::default();
    config.data_dir = dir.path().to_path_buf();
    config.key_path = dir.path().join("keys/oracle.toml");
    config.model_memory_mb.insert("llama-20b".into(), 18_000);

    let chain = MockChainClient::new();
    let oracle = Oracle::new(config, Arc::new(chain), "0xoracle".into()).unwrap();
    let handle: OracleHandle = oracle.handle();

    let now = current_timestamp();
    let fast = generate_signing_key();
    let slow = generate_signing_key();
    let foreign = generate_signing_key();
    handle
        .register_pipeline(&pipeline_registration(
            &fast,
            "llama-20b",
            "192.168.0.10",
            9_216,
            60.0,
            now,
        ))
        .unwrap();
    handle
        .register_pipeline(&pipeline_registration(
            &slow,
            "llama-20b",
            "192.168.0.11",
            9_216,
            40.0,
            now,
        ))
        .unwrap();
    handle
        .register_pipeline(&pipeline_registration(
            &foreign,
            "llama-20b",
            "192.168.1.10",
            9_216,
            80.0,
            now,
        ))
        .unwrap();

    let topology = handle.topology("llama-20b").unwrap();
    assert_eq!(topology.len(), 3);

    let fast_row = topology
        .iter()
        .find(|row| row.node_address == signer_address(&fast))
        .unwrap();
    let slow_row = topology
        .iter()
        .find(|row| row.node_address == signer_address(&slow))
        .unwrap();
    let foreign_row = topology
        .iter()
        .find(|row| row.node_address == signer_address(&foreign))
        .unwrap();

    assert_eq!(fast_row.node_mode, NodeMode::Coordinator);
    assert_eq!(slow_row.node_mode, NodeMode::RpcServer);
    assert_eq!(fast_row.cluster_id, slow_row.cluster_id);
    assert!(fast_row.cluster_id.is_some());
    assert_eq!((fast_row.layer_start, fast_row.layer_end), (0, 16));
    assert_eq!((slow_row.layer_start, slow_row.layer_end), (16, 32));

    // The lone foreign-subnet peer cannot cluster and serves unclustered.
    assert!(foreign_row.cluster_id.is_none());

    let mut ready = ReadyCall {
        address: signer_address(&foreign),
        model_name: "llama-20b".into(),
        timestamp: now + 1,
        signature: String::new(),
    };
    ready.signature = sign_message(&foreign, ready.signing_message().as_bytes()).unwrap();
    handle.pipeline_ready(&ready).unwrap();
    let topology = handle.topology("llama-20b").unwrap();
    let foreign_row = topology
        .iter()
        .find(|row| row.node_address == signer_address(&foreign))
        .unwrap();
    assert!(foreign_row.ready);
}
