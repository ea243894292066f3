mod agent;
mod metrics;
mod pipeline;

pub use agent::{Agent, AgentNode, AgentStatus, Challenge, NodeStatus, Stake};
pub use metrics::{
    AgentScore, Contribution, Epoch, EpochMetrics, InferenceProof, NetworkStats, TaskRecord,
};
pub use pipeline::{NodeMode, PipelineAssignment};

use crate::errors::{OracleError, OracleResult};

pub type Address = String;

/// Canonical form used for every comparison and storage key: `0x` plus 40
/// lowercase hex characters.
pub fn canonical_address(raw: &str) -> OracleResult<Address> {
    let trimmed = raw.trim();
    let hex_part = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    if hex_part.len() != 40 || !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(OracleError::Config(format!(
            "invalid agent address: {raw}"
        )));
    }
    Ok(format!("0x{}", hex_part.to_ascii_lowercase()))
}

pub fn current_timestamp() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalizes_mixed_case_addresses() {
        let canonical = canonical_address("0xAbCdEf0123456789abcdef0123456789ABCDEF01").unwrap();
        assert_eq!(canonical, "0xabcdef0123456789abcdef0123456789abcdef01");
        let bare = canonical_address("abcdef0123456789abcdef0123456789abcdef01").unwrap();
        assert_eq!(bare, canonical);
    }

    #[test]
    fn rejects_malformed_addresses() {
        assert!(canonical_address("0x1234").is_err());
        assert!(canonical_address("0xzzcdef0123456789abcdef0123456789abcdef01").is_err());
        assert!(canonical_address("").is_err());
    }
}
