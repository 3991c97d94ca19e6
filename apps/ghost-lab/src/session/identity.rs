use crate::transport::{PeerId, TransportError, TransportProvider};
use rand::Rng;
use rand::seq::SliceRandom;
use serde::Serialize;
use thiserror::Error;

const CODENAME_PREFIXES: [&str; 10] = [
    "NEON", "SILVER", "GHOST", "SHADOW", "CYBER", "VOID", "ALPHA", "PHANTOM", "ZERO", "CRYPTO",
];
const CODENAME_SUFFIXES: [&str; 10] = [
    "STRIKE", "OPERATIVE", "STALKER", "WRAITH", "BLADE", "PULSE", "VEIL", "SHARD", "AGENT", "HUNTER",
];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("identity allocation failed: {0}")]
pub struct AllocationError(#[from] pub TransportError);

/// Rendezvous identifier plus the operator codename shown beside it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SessionIdentity {
    pub peer_id: PeerId,
    pub codename: String,
}

impl SessionIdentity {
    pub async fn allocate(provider: &dyn TransportProvider) -> Result<Self, AllocationError> {
        let peer_id = provider.allocate_identity().await?;
        Ok(Self::assign(peer_id, &mut rand::thread_rng()))
    }

    pub fn assign<R: Rng + ?Sized>(peer_id: PeerId, rng: &mut R) -> Self {
        Self {
            peer_id,
            codename: codename(rng),
        }
    }
}

/// `PREFIX_SUFFIX`, e.g. `NEON_STRIKE`.
pub fn codename<R: Rng + ?Sized>(rng: &mut R) -> String {
    let prefix = CODENAME_PREFIXES.choose(rng).copied().unwrap_or("GHOST");
    let suffix = CODENAME_SUFFIXES.choose(rng).copied().unwrap_or("AGENT");
    format!("{prefix}_{suffix}")
}
