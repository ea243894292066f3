use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::chain::{
    BlockView, ChainClient, TxView, PRECOMPILE_AGENT_HEARTBEAT, PRECOMPILE_AGENT_REGISTER,
    PRECOMPILE_CLAIM_REWARD, PRECOMPILE_VERIFY_INFERENCE,
};
use crate::crypto::keccak256;
use crate::errors::OracleResult;
use crate::storage::Storage;
use crate::types::{canonical_address, current_timestamp, Agent, Address};

const WORD: usize = 32;

/// Decoded agent-register call data.
#[derive(Debug, PartialEq)]
struct RegisterCall {
    name: String,
    model_hash: String,
    capabilities: Vec<String>,
    beneficiary: Option<Address>,
}

/// Reconciles on-chain precompile traffic into the local agent registry.
/// Decoding is defensive throughout: malformed call data is logged and
/// skipped, never propagated.
pub struct WatcherCore {
    storage: Storage,
}

impl WatcherCore {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    pub fn handle_block(&self, block: &BlockView) {
        for tx in &block.transactions {
            if !tx.status {
                continue;
            }
            let Some(target) = tx.to.as_deref() else {
                continue;
            };
            let result = match target {
                PRECOMPILE_AGENT_REGISTER => self.handle_register(tx),
                PRECOMPILE_AGENT_HEARTBEAT => self.handle_heartbeat(tx),
                PRECOMPILE_VERIFY_INFERENCE => self.handle_verify_inference(tx),
                PRECOMPILE_CLAIM_REWARD => self.handle_claim_reward(tx),
                _ => Ok(()),
            };
            if let Err(err) = result {
                warn!(hash = %tx.hash, block = block.number, %err, "precompile reconciliation failed");
            }
        }
    }

    fn handle_register(&self, tx: &TxView) -> OracleResult<()> {
        let Some(call) = decode_register_input(&tx.input) else {
            debug!(hash = %tx.hash, "malformed register call data, skipping");
            return Ok(());
        };
        let sender = canonical_address(&tx.from)?;
        let target = call.beneficiary.unwrap_or(sender);
        let now = current_timestamp();
        let mut agent = self
            .storage
            .get_agent(&target)?
            .unwrap_or_else(|| Agent::new(target.clone(), now));
        agent.node_id = call.name.clone();
        agent.metadata = serde_json::json!({
            "model_hash": call.model_hash,
            "capabilities": call.capabilities,
        })
        .to_string();
        agent.last_heartbeat = now;
        self.storage.put_agent(&agent)?;
        info!(agent = %target, name = %call.name, "agent registered on-chain");
        Ok(())
    }

    fn handle_heartbeat(&self, tx: &TxView) -> OracleResult<()> {
        let sender = canonical_address(&tx.from)?;
        let now = current_timestamp();
        match self.storage.get_agent(&sender)? {
            Some(mut agent) => {
                agent.last_heartbeat = now;
                self.storage.put_agent(&agent)?;
            }
            None => {
                // Heartbeat from an unknown sender auto-registers it.
                self.storage.put_agent(&Agent::new(sender.clone(), now))?;
                debug!(agent = %sender, "auto-registered agent from heartbeat");
            }
        }
        Ok(())
    }

    fn handle_verify_inference(&self, tx: &TxView) -> OracleResult<()> {
        let Some(agent) = decode_address_word(&tx.input, 0) else {
            debug!(hash = %tx.hash, "malformed verify-inference call data, skipping");
            return Ok(());
        };
        if self.storage.get_agent(&agent)?.is_none() {
            self.storage
                .put_agent(&Agent::new(agent.clone(), current_timestamp()))?;
            debug!(agent = %agent, "registered agent from inference verification");
        }
        Ok(())
    }

    fn handle_claim_reward(&self, tx: &TxView) -> OracleResult<()> {
        let topic = reward_claimed_topic();
        for log in &tx.logs {
            let Some(first) = log.topics.first() else {
                continue;
            };
            if first.trim_start_matches("0x") != topic {
                continue;
            }
            if let Some(claimer) = log
                .topics
                .get(1)
                .and_then(|padded| decode_padded_address(padded))
            {
                info!(agent = %claimer, hash = %tx.hash, "reward claimed");
            }
        }
        Ok(())
    }
}

fn reward_claimed_topic() -> String {
    hex::encode(keccak256(b"RewardClaimed(address)"))
}

fn input_words(input: &str) -> Option<Vec<[u8; WORD]>> {
    let raw = hex::decode(input.trim_start_matches("0x")).ok()?;
    if raw.is_empty() || raw.len() % WORD != 0 {
        return None;
    }
    Some(
        raw.chunks(WORD)
            .map(|chunk| {
                let mut word = [0u8; WORD];
                word.copy_from_slice(chunk);
                word
            })
            .collect(),
    )
}

fn word_to_string(word: &[u8; WORD]) -> String {
    let end = word.iter().position(|byte| *byte == 0).unwrap_or(WORD);
    String::from_utf8_lossy(&word[..end]).into_owned()
}

fn word_to_address(word: &[u8; WORD]) -> Option<Address> {
    if word[..12].iter().any(|byte| *byte != 0) {
        return None;
    }
    if word[12..].iter().all(|byte| *byte == 0) {
        return None;
    }
    Some(format!("0x{}", hex::encode(&word[12..])))
}

fn decode_address_word(input: &str, index: usize) -> Option<Address> {
    let words = input_words(input)?;
    word_to_address(words.get(index)?)
}

fn decode_padded_address(topic: &str) -> Option<Address> {
    let raw = hex::decode(topic.trim_start_matches("0x")).ok()?;
    let word: [u8; WORD] = raw.try_into().ok()?;
    word_to_address(&word)
}

/// `(name[32], model_hash[32], cap_count[32], caps[32]..., beneficiary[32]?)`
fn decode_register_input(input: &str) -> Option<RegisterCall> {
    let words = input_words(input)?;
    if words.len() < 3 {
        return None;
    }
    let name = word_to_string(&words[0]);
    let model_hash = hex::encode(words[1]);
    let cap_count = u64::from_be_bytes(words[2][24..].try_into().ok()?) as usize;
    if cap_count > words.len().saturating_sub(3) {
        return None;
    }
    let capabilities = words[3..3 + cap_count]
        .iter()
        .map(word_to_string)
        .collect();
    let beneficiary = match words.len() - 3 - cap_count {
        0 => None,
        1 => word_to_address(&words[3 + cap_count]),
        _ => return None,
    };
    Some(RegisterCall {
        name,
        model_hash,
        capabilities,
        beneficiary,
    })
}

/// Subscribes to the block stream and feeds the reconciler.
pub struct ChainWatcher {
    shutdown: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ChainWatcher {
    pub async fn start(storage: Storage, chain: Arc<dyn ChainClient>) -> OracleResult<Self> {
        let core = WatcherCore::new(storage);
        let mut blocks = chain.subscribe_blocks().await?;
        let (tx, mut rx) = watch::channel(false);
        let worker = tokio::spawn(async move {
            loop {
                tokio::select! {
                    block = blocks.recv() => {
                        match block {
                            Some(block) => core.handle_block(&block),
                            None => {
                                warn!("block stream closed");
                                break;
                            }
                        }
                    }
                    changed = rx.changed() => {
                        if changed.is_ok() && *rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });
        Ok(Self {
            shutdown: tx,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub async fn shutdown(&self) {
        if self.shutdown.send(true).is_err() {
            return;
        }
        if let Some(handle) = self.worker.lock().await.take() {
            if let Err(err) = handle.await {
                debug!(?err, "watcher worker exited with error");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::LogView;
    use tempfile::tempdir;

    fn word_from_str(value: &str) -> [u8; WORD] {
        let mut word = [0u8; WORD];
        word[..value.len()].copy_from_slice(value.as_bytes());
        word
    }

    fn word_from_address(address: &str) -> [u8; WORD] {
        let raw = hex::decode(address.trim_start_matches("0x")).unwrap();
        let mut word = [0u8; WORD];
        word[12..].copy_from_slice(&raw);
        word
    }

    fn encode(words: &[[u8; WORD]]) -> String {
        let mut data = Vec::new();
        for word in words {
            data.extend_from_slice(word);
        }
        format!("0x{}", hex::encode(data))
    }

    fn count_word(count: u64) -> [u8; WORD] {
        let mut word = [0u8; WORD];
        word[24..].copy_from_slice(&count.to_be_bytes());
        word
    }

    fn tx(to: &str, from: &str, input: String) -> TxView {
        TxView {
            hash: "0xabc".into(),
            from: from.to_string(),
            to: Some(to.to_string()),
            input,
            status: true,
            logs: Vec::new(),
        }
    }

    fn storage() -> (tempfile::TempDir, Storage) {
        let dir = tempdir().unwrap();
        let storage = Storage::open(dir.path(), false).unwrap();
        (dir, storage)
    }

    #[test]
    fn register_decodes_name_caps_and_beneficiary() {
        let beneficiary = format!("0x{:040x}", 0xbeefu64);
        let input = encode(&[
            word_from_str("gpu-worker-7"),
            [0x11; WORD],
            count_word(2),
            word_from_str("inference"),
            word_from_str("embeddings"),
            word_from_address(&beneficiary),
        ]);
        let call = decode_register_input(&input).unwrap();
        assert_eq!(call.name, "gpu-worker-7");
        assert_eq!(call.capabilities, vec!["inference", "embeddings"]);
        assert_eq!(call.beneficiary.as_deref(), Some(beneficiary.as_str()));
    }

    #[test]
    fn register_upserts_the_beneficiary_agent() {
        let (_dir, storage) = storage();
        let core = WatcherCore::new(storage.clone());
        let beneficiary = format!("0x{:040x}", 0xbeefu64);
        let sender = format!("0x{:040x}", 1);
        let input = encode(&[
            word_from_str("gpu-worker-7"),
            [0x11; WORD],
            count_word(0),
            word_from_address(&beneficiary),
        ]);
        core.handle_block(&BlockView {
            number: 10,
            transactions: vec![tx(PRECOMPILE_AGENT_REGISTER, &sender, input)],
        });
        let agent = storage.get_agent(&beneficiary).unwrap().unwrap();
        assert_eq!(agent.node_id, "gpu-worker-7");
        assert!(storage.get_agent(&sender).unwrap().is_none());
    }

    #[test]
    fn failed_transactions_are_ignored() {
        let (_dir, storage) = storage();
        let core = WatcherCore::new(storage.clone());
        let sender = format!("0x{:040x}", 2);
        let mut reverted = tx(PRECOMPILE_AGENT_HEARTBEAT, &sender, "0x".into());
        reverted.status = false;
        core.handle_block(&BlockView {
            number: 11,
            transactions: vec![reverted],
        });
        assert!(storage.get_agent(&sender).unwrap().is_none());
    }

    #[test]
    fn heartbeat_auto_registers_unknown_sender() {
        let (_dir, storage) = storage();
        let core = WatcherCore::new(storage.clone());
        let sender = format!("0x{:040x}", 3);
        core.handle_block(&BlockView {
            number: 12,
            transactions: vec![tx(PRECOMPILE_AGENT_HEARTBEAT, &sender, "0x".into())],
        });
        assert!(storage.get_agent(&sender).unwrap().is_some());
    }

    #[test]
    fn malformed_register_input_is_skipped_without_panic() {
        let (_dir, storage) = storage();
        let core = WatcherCore::new(storage.clone());
        let sender = format!("0x{:040x}", 4);
        for input in ["0xdeadbeef", "0x", &encode(&[count_word(9)])] {
            core.handle_block(&BlockView {
                number: 13,
                transactions: vec![tx(PRECOMPILE_AGENT_REGISTER, &sender, input.to_string())],
            });
        }
        assert!(storage.get_agent(&sender).unwrap().is_none());
    }

    #[test]
    fn reward_claim_log_is_detected_by_topic() {
        let (_dir, storage) = storage();
        let core = WatcherCore::new(storage);
        let claimer = format!("0x{:040x}", 5);
        let mut claim = tx(PRECOMPILE_CLAIM_REWARD, &claimer, "0x".into());
        claim.logs = vec![LogView {
            address: PRECOMPILE_CLAIM_REWARD.into(),
            topics: vec![
                format!("0x{}", reward_claimed_topic()),
                format!("0x{}", hex::encode(word_from_address(&claimer))),
            ],
            data: "0x".into(),
        }];
        // Just must not error or panic.
        core.handle_block(&BlockView {
            number: 14,
            transactions: vec![claim],
        });
    }

    #[test]
    fn verify_inference_registers_the_agent_slot() {
        let (_dir, storage) = storage();
        let core = WatcherCore::new(storage.clone());
        let agent = format!("0x{:040x}", 6);
        let input = encode(&[word_from_address(&agent), [0x22; WORD]]);
        core.handle_block(&BlockView {
            number: 15,
            transactions: vec![tx(PRECOMPILE_VERIFY_INFERENCE, &agent, input)],
        });
        assert!(storage.get_agent(&agent).unwrap().is_some());
    }
}
