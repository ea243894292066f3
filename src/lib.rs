//! Off-chain contribution oracle for a fleet of inference agents.
//!
//! The oracle ingests signed telemetry and inference proofs over HTTP,
//! accumulates them into per-epoch contribution records, reports the records
//! to the reward contract with exactly-once-per-epoch semantics, and triggers
//! reward distribution on epoch rollover. In parallel it partitions model
//! layers across registered pipeline nodes, groups memory-constrained LAN
//! peers into coordinator/worker clusters, and streams the resulting
//! topology to the downstream request router.
//!
//! Applications typically depend on [`config::OracleConfig`] to bootstrap,
//! [`node::Oracle`] and [`node::OracleHandle`] to operate the process, and
//! [`api::serve`] for the HTTP/WebSocket edge. The persistent store
//! ([`storage::Storage`]) is the single source of truth; every in-memory
//! map is a derived cache rebuilt from it at startup.

pub mod api;
pub mod chain;
pub mod challenges;
pub mod cluster;
pub mod config;
pub mod crypto;
pub mod distributor;
pub mod errors;
pub mod ingest;
pub mod monitor;
pub mod node;
pub mod pipeline;
pub mod proofs;
pub mod reporter;
pub mod scoring;
pub mod storage;
pub mod types;
pub mod watcher;
