use std::fmt;
use std::str::FromStr;

use malachite::Natural;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::Address;

/// Registration state mirrored from the agent registry contract.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    #[default]
    Inactive,
    Active,
    Slashed,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Inactive => "inactive",
            AgentStatus::Active => "active",
            AgentStatus::Slashed => "slashed",
        }
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stake amounts come from the chain as decimal strings and are kept
/// arbitrary-precision end to end.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Stake(Natural);

impl Default for Stake {
    fn default() -> Self {
        Self::zero()
    }
}

impl Stake {
    pub fn zero() -> Self {
        Self(Natural::from(0u32))
    }

    pub fn from_natural(inner: Natural) -> Self {
        Self(inner)
    }

    pub fn as_natural(&self) -> &Natural {
        &self.0
    }
}

impl FromStr for Stake {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Natural::from_str(s).map(Stake)
    }
}

impl fmt::Display for Stake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for Stake {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for Stake {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        Natural::from_str(&value)
            .map(Stake)
            .map_err(|_| serde::de::Error::custom("invalid stake value"))
    }
}

/// An off-chain inference worker identified by its chain address.
///
/// Created by the chain watcher or on first verified telemetry; mutated on
/// heartbeat, metric arrival, or on-chain reconciliation; never destroyed.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Agent {
    pub address: Address,
    pub registered_at: u64,
    pub last_heartbeat: u64,
    pub status: AgentStatus,
    pub stake: Stake,
    pub node_id: String,
    pub metadata: String,
}

impl Agent {
    pub fn new(address: Address, registered_at: u64) -> Self {
        Self {
            address,
            registered_at,
            last_heartbeat: registered_at,
            status: AgentStatus::Active,
            stake: Stake::zero(),
            node_id: String::new(),
            metadata: String::new(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    #[default]
    Active,
    Inactive,
}

/// A network-reachable presence of an agent, created on explicit registration
/// or auto-registered from a first verified metrics report.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentNode {
    pub address: Address,
    pub endpoint: String,
    pub capabilities: Vec<String>,
    pub status: NodeStatus,
    pub score: f64,
    pub last_heartbeat: u64,
    pub last_metric_report: u64,
    pub registration_signature: String,
    pub benchmark_tok_per_sec: f64,
    pub lan_ip: Option<String>,
    pub can_distribute: bool,
}

impl AgentNode {
    pub fn new(address: Address, endpoint: String, now: u64) -> Self {
        Self {
            address,
            endpoint,
            capabilities: Vec::new(),
            status: NodeStatus::Active,
            score: 0.0,
            last_heartbeat: now,
            last_metric_report: 0,
            registration_signature: String::new(),
            benchmark_tok_per_sec: 0.0,
            lan_ip: None,
            can_distribute: false,
        }
    }
}

/// A proof-of-work style task published by the challenge manager contract.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Challenge {
    pub id: u64,
    pub difficulty: u32,
    pub seed: String,
    pub created_at: u64,
    pub expires_at: u64,
    pub solved: bool,
    pub solver: Option<Address>,
    pub reward_bonus: Stake,
}

impl Challenge {
    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }
}
