use std::fmt;
use std::io;

use thiserror::Error;

/// Reasons a client submission is refused before any state is touched.
///
/// The first two map to HTTP 401, the rest to 400. Internal failures never use
/// this type; they surface as the other [`OracleError`] variants.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RejectReason {
    Signature,
    StaleOrReplay,
    Bounds,
    Unregistered,
    Payload,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::Signature => "rejected-signature",
            RejectReason::StaleOrReplay => "rejected-stale-or-replay",
            RejectReason::Bounds => "rejected-bounds",
            RejectReason::Unregistered => "rejected-unregistered",
            RejectReason::Payload => "rejected-payload",
        }
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, RejectReason::Signature | RejectReason::StaleOrReplay)
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum OracleError {
    #[error("storage error: {0}")]
    Storage(#[from] rocksdb::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("cryptography error: {0}")]
    Crypto(String),
    #[error("submission rejected: {0}")]
    Rejected(RejectReason),
    #[error("chain error: {0}")]
    Chain(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl OracleError {
    pub fn reject_reason(&self) -> Option<RejectReason> {
        match self {
            OracleError::Rejected(reason) => Some(*reason),
            _ => None,
        }
    }
}

pub type OracleResult<T> = Result<T, OracleError>;
