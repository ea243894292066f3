use tracing::debug;

use crate::crypto::keccak256;
use crate::errors::{OracleError, OracleResult, RejectReason};
use crate::storage::Storage;
use crate::types::{current_timestamp, Address, InferenceProof};

/// An inference proof as submitted by an agent, before plausibility checks.
#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
pub struct ProofSubmission {
    pub model_hash: String,
    pub input_hash: String,
    pub output_hash: String,
    pub token_count: u64,
}

/// Stores inference proofs and runs the save-time plausibility check.
///
/// Passing proofs are marked `verified` with a local digest recorded as the
/// verification hash; the rest are persisted unverified so a later on-chain
/// verifier can pick them up through [`ProofStore::mark_verified`].
#[derive(Clone)]
pub struct ProofStore {
    storage: Storage,
}

impl ProofStore {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    /// Persists one proof scoped to `(address, epoch)`. Returns the stored
    /// row; a malformed hash rejects the submission outright.
    pub fn save(
        &self,
        address: &Address,
        epoch: u64,
        submission: &ProofSubmission,
    ) -> OracleResult<InferenceProof> {
        for hash in [
            &submission.model_hash,
            &submission.input_hash,
            &submission.output_hash,
        ] {
            if !is_hash32(hash) {
                return Err(OracleError::Rejected(RejectReason::Payload));
            }
        }

        let created_at = current_timestamp();
        let id = proof_id(address, epoch, submission, created_at);
        let plausible = self.is_plausible(address, epoch, submission)?;
        let proof = InferenceProof {
            id: id.clone(),
            address: address.clone(),
            epoch,
            model_hash: submission.model_hash.clone(),
            input_hash: submission.input_hash.clone(),
            output_hash: submission.output_hash.clone(),
            token_count: submission.token_count,
            verified: plausible,
            verification_tx_hash: plausible.then(|| format!("local:{id}")),
            created_at,
            verified_at: plausible.then_some(created_at),
        };
        self.storage.put_proof(&proof)?;
        debug!(
            address = %address,
            epoch,
            verified = plausible,
            token_count = submission.token_count,
            "stored inference proof"
        );
        Ok(proof)
    }

    /// Plausibility only: a cooperating agent fabricating self-consistent
    /// hashes passes. True verification happens off-process and lands via
    /// `mark_verified`.
    fn is_plausible(
        &self,
        address: &str,
        epoch: u64,
        submission: &ProofSubmission,
    ) -> OracleResult<bool> {
        if submission.input_hash == submission.output_hash
            || submission.model_hash == submission.input_hash
        {
            return Ok(false);
        }
        let reported = self
            .storage
            .get_metrics(address, epoch)?
            .map(|metrics| metrics.tokens_processed)
            .unwrap_or(0);
        Ok(submission.token_count <= reported)
    }

    /// Callback surface for the future on-chain verifier.
    pub fn mark_verified(&self, id: &str, tx_hash: &str) -> OracleResult<()> {
        let mut proof = self
            .storage
            .get_proof(id)?
            .ok_or_else(|| OracleError::Config(format!("unknown proof {id}")))?;
        proof.verified = true;
        proof.verification_tx_hash = Some(tx_hash.to_string());
        proof.verified_at = Some(current_timestamp());
        self.storage.put_proof(&proof)
    }

    /// Sum of `token_count` over verified rows, the scorer's stronger signal.
    pub fn verified_token_count(&self, address: &str, epoch: u64) -> OracleResult<u64> {
        let proofs = self.storage.load_proofs_for_epoch(address, epoch)?;
        Ok(proofs
            .iter()
            .filter(|proof| proof.verified)
            .map(|proof| proof.token_count)
            .sum())
    }

    pub fn proofs_for(&self, address: &str) -> OracleResult<Vec<InferenceProof>> {
        self.storage.load_proofs_for(address)
    }
}

fn is_hash32(value: &str) -> bool {
    let hex_part = value.strip_prefix("0x").unwrap_or(value);
    hex_part.len() == 64 && hex_part.chars().all(|c| c.is_ascii_hexdigit())
}

fn proof_id(address: &str, epoch: u64, submission: &ProofSubmission, created_at: u64) -> String {
    let mut data = Vec::new();
    data.extend_from_slice(address.as_bytes());
    data.extend_from_slice(&epoch.to_be_bytes());
    data.extend_from_slice(submission.input_hash.as_bytes());
    data.extend_from_slice(submission.output_hash.as_bytes());
    data.extend_from_slice(&created_at.to_be_bytes());
    hex::encode(&keccak256(&data)[..16])
}
