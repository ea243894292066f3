use std::fs;
use std::path::Path;

use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};

use crate::errors::{OracleError, OracleResult};
use crate::types::{canonical_address, Address};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredKeypair {
    pub address: String,
    pub secret_key: String,
}

pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Digest agents sign: the message wrapped in the
/// `\x19Ethereum Signed Message:\n<len>` envelope, then keccak-hashed.
pub fn personal_message_hash(message: &[u8]) -> [u8; 32] {
    let mut data = format!("\x19Ethereum Signed Message:\n{}", message.len()).into_bytes();
    data.extend_from_slice(message);
    keccak256(&data)
}

pub fn address_from_verifying_key(key: &VerifyingKey) -> Address {
    let encoded = key.to_encoded_point(false);
    let digest = keccak256(&encoded.as_bytes()[1..]);
    format!("0x{}", hex::encode(&digest[12..]))
}

/// Recovers the signer address of a 65-byte `r || s || v` signature over the
/// personal-message digest of `message`.
pub fn recover_signer(message: &[u8], signature_hex: &str) -> OracleResult<Address> {
    let raw = hex::decode(signature_hex.trim_start_matches("0x"))
        .map_err(|err| OracleError::Crypto(format!("invalid signature encoding: {err}")))?;
    if raw.len() != 65 {
        return Err(OracleError::Crypto(format!(
            "invalid signature length: {}",
            raw.len()
        )));
    }
    let signature = Signature::from_slice(&raw[..64])
        .map_err(|err| OracleError::Crypto(format!("invalid signature bytes: {err}")))?;
    let v = match raw[64] {
        v @ 0..=1 => v,
        v @ 27..=28 => v - 27,
        v => {
            return Err(OracleError::Crypto(format!(
                "invalid recovery id: {v}"
            )));
        }
    };
    let recovery_id = RecoveryId::try_from(v)
        .map_err(|err| OracleError::Crypto(format!("invalid recovery id: {err}")))?;
    let digest = personal_message_hash(message);
    let key = VerifyingKey::recover_from_prehash(&digest, &signature, recovery_id)
        .map_err(|err| OracleError::Crypto(format!("signature recovery failed: {err}")))?;
    canonical_address(&address_from_verifying_key(&key))
}

pub fn sign_message(key: &SigningKey, message: &[u8]) -> OracleResult<String> {
    let digest = personal_message_hash(message);
    let (signature, recovery_id) = key
        .sign_prehash_recoverable(&digest)
        .map_err(|err| OracleError::Crypto(format!("signing failed: {err}")))?;
    let mut raw = signature.to_bytes().to_vec();
    raw.push(recovery_id.to_byte() + 27);
    Ok(format!("0x{}", hex::encode(raw)))
}

/// Canonical telemetry signing payload. Key order is part of the wire
/// contract and must not change.
pub fn telemetry_message(address: &str, processed_tokens: u64, timestamp: u64) -> String {
    format!(
        "{{\"agent\":\"{}\",\"processed_tokens\":{},\"timestamp\":{}}}",
        address.to_ascii_lowercase(),
        processed_tokens,
        timestamp
    )
}

pub fn generate_signing_key() -> SigningKey {
    SigningKey::random(&mut OsRng)
}

pub fn signing_key_from_hex(data: &str) -> OracleResult<SigningKey> {
    let bytes = hex::decode(data.trim().trim_start_matches("0x"))
        .map_err(|err| OracleError::Crypto(format!("invalid private key encoding: {err}")))?;
    SigningKey::from_slice(&bytes)
        .map_err(|err| OracleError::Crypto(format!("invalid private key bytes: {err}")))
}

pub fn signer_address(key: &SigningKey) -> Address {
    address_from_verifying_key(key.verifying_key())
}

pub fn save_keypair(path: &Path, key: &SigningKey) -> OracleResult<()> {
    let stored = StoredKeypair {
        address: signer_address(key),
        secret_key: hex::encode(key.to_bytes()),
    };
    let encoded = toml::to_string_pretty(&stored)
        .map_err(|err| OracleError::Config(format!("failed to encode keypair: {err}")))?;
    fs::create_dir_all(path.parent().unwrap_or_else(|| Path::new(".")))?;
    fs::write(path, encoded)?;
    Ok(())
}

pub fn load_keypair(path: &Path) -> OracleResult<SigningKey> {
    let raw = fs::read_to_string(path)?;
    let stored: StoredKeypair = toml::from_str(&raw)
        .map_err(|err| OracleError::Config(format!("failed to decode keypair: {err}")))?;
    signing_key_from_hex(&stored.secret_key)
}

pub fn load_or_generate_keypair(path: &Path) -> OracleResult<SigningKey> {
    if path.exists() {
        load_keypair(path)
    } else {
        let key = generate_signing_key();
        save_keypair(path, &key)?;
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recovers_signer_from_telemetry_signature() {
        let key = generate_signing_key();
        let address = signer_address(&key);
        let message = telemetry_message(&address, 1500, 1_700_000_000);
        let signature = sign_message(&key, message.as_bytes()).unwrap();
        let recovered = recover_signer(message.as_bytes(), &signature).unwrap();
        assert_eq!(recovered, address);
    }

    #[test]
    fn tampered_message_recovers_different_signer() {
        let key = generate_signing_key();
        let address = signer_address(&key);
        let message = telemetry_message(&address, 1500, 1_700_000_000);
        let signature = sign_message(&key, message.as_bytes()).unwrap();
        let forged = telemetry_message(&address, 9_999_999, 1_700_000_000);
        let recovered = recover_signer(forged.as_bytes(), &signature).unwrap();
        assert_ne!(recovered, address);
    }

    #[test]
    fn rejects_malformed_signatures() {
        assert!(recover_signer(b"msg", "0xdeadbeef").is_err());
        assert!(recover_signer(b"msg", "zz").is_err());
    }

    #[test]
    fn keypair_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("oracle.toml");
        let key = load_or_generate_keypair(&path).unwrap();
        let reloaded = load_or_generate_keypair(&path).unwrap();
        assert_eq!(signer_address(&key), signer_address(&reloaded));
    }
}
