// Circuit selection — drawing a relay path from the known peer set
//
// Hop count is uniform in [min_hops, max_hops]; hops are sampled uniformly
// without replacement from relay-enabled peers, never including the
// originator itself.

use crate::directory::RelayPeer;
use crate::identity::PeerId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CircuitError {
    #[error("Not enough relay peers available for a circuit")]
    InsufficientPeers,
    #[error("Invalid circuit configuration")]
    InvalidConfig,
}

/// Configuration for circuit selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitConfig {
    /// Minimum number of hops.
    pub min_hops: usize,
    /// Maximum number of hops.
    pub max_hops: usize,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            min_hops: 3,
            max_hops: 5,
        }
    }
}

impl CircuitConfig {
    pub fn validate(&self) -> Result<(), CircuitError> {
        if self.min_hops == 0 || self.max_hops == 0 {
            return Err(CircuitError::InvalidConfig);
        }
        if self.min_hops > self.max_hops {
            return Err(CircuitError::InvalidConfig);
        }
        if self.max_hops > crate::onion::MAX_ONION_HOPS {
            return Err(CircuitError::InvalidConfig);
        }
        Ok(())
    }
}

/// Select an ordered hop chain for one circuit.
///
/// `exclude` removes candidates beyond the originator itself, e.g. entry
/// hops that already failed channel establishment for this request.
pub fn select_hops(
    peers: &[RelayPeer],
    local_peer: &PeerId,
    exclude: &[PeerId],
    config: &CircuitConfig,
) -> Result<Vec<PeerId>, CircuitError> {
    use rand::seq::SliceRandom;
    use rand::Rng;

    config.validate()?;

    let eligible: Vec<&RelayPeer> = peers
        .iter()
        .filter(|p| p.capabilities.relay_enabled)
        .filter(|p| &p.id != local_peer)
        .filter(|p| !exclude.contains(&p.id))
        .collect();

    if eligible.len() < config.min_hops {
        return Err(CircuitError::InsufficientPeers);
    }

    let mut rng = rand::thread_rng();
    let upper = config.max_hops.min(eligible.len());
    let hop_count = rng.gen_range(config.min_hops..=upper);

    let selected = eligible
        .choose_multiple(&mut rng, hop_count)
        .map(|p| p.id.clone())
        .collect();

    Ok(selected)
}

// ============================================================================
// TESTS
// ============================================================================
