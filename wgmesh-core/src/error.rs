//! Crate-wide error aggregation, mirroring `server/src/error.rs`'s
//! `thiserror` enum with `#[from]` conversions from each module's own error
//! type. Orchestrator and CLI code sees this; individual modules keep their
//! own typed errors (`KeyDerivationError`, `EnvelopeError`, `StunError`) for
//! callers that want to match on specifics.

use thiserror::Error;

use crate::{envelope::EnvelopeError, keys::KeyDerivationError, stun::StunError};

#[derive(Debug, Error)]
pub enum MeshError {
    #[error("key derivation failed: {0}")]
    KeyDerivation(#[from] KeyDerivationError),

    #[error("envelope error: {0}")]
    Envelope(#[from] EnvelopeError),

    #[error("STUN error: {0}")]
    Stun(#[from] StunError),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("wireguard control error: {0}")]
    WireGuard(String),

    #[error("dht error: {0}")]
    Dht(String),
}
