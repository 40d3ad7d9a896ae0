//! Registration verifier.
//!
//! A candidate registration is accepted only when the signature over the
//! address bytes recovers an identity known to the channel graph, the
//! address is still free, and the neighbor-suggestion rule holds: if the
//! registrant already has registered channel neighbors, the address must
//! equal the suggestion seeded from at least one of them. Nodes without
//! registered neighbors may claim any free address, which is how the
//! overlay bootstraps.

use thiserror::Error;
use tracing::debug;

use crate::addr::OverlayAddr;
use crate::chain::Registration;
use crate::identity::{IdentityError, IdentityService, NodeId};

use super::{Db, RegistrationRecord};

/// Reasons a candidate registration is rejected.
#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("invalid signature on registration for {0}")]
    InvalidSignature(OverlayAddr),

    #[error("address {0} is already registered")]
    AlreadyRegistered(OverlayAddr),

    #[error("address {candidate} does not match any neighbor suggestion for {node}")]
    NotSuggested { candidate: OverlayAddr, node: NodeId },

    #[error(transparent)]
    Identity(#[from] IdentityError),
}

impl Db {
    /// Validate a candidate registration against the current overlay
    /// state, returning the record to install on success.
    pub fn verify_registration(
        &self,
        registration: &Registration,
        identity: &dyn IdentityService,
    ) -> Result<RegistrationRecord, RegistrationError> {
        let candidate = registration.address;

        let node_id = identity
            .verify(candidate.as_bytes(), &registration.signature)?
            .ok_or(RegistrationError::InvalidSignature(candidate))?;

        if self.is_address_registered(candidate) {
            return Err(RegistrationError::AlreadyRegistered(candidate));
        }

        let neighbors = identity.node_neighbors(&node_id)?;
        let mut registered_neighbors = 0usize;
        let mut suggested = false;
        for neighbor in &neighbors {
            let Some(neighbor_address) = self.node_address(neighbor) else {
                continue;
            };
            registered_neighbors += 1;
            if self.suggest(neighbor_address).ok() == Some(candidate) {
                suggested = true;
            }
        }
        if registered_neighbors > 0 && !suggested {
            return Err(RegistrationError::NotSuggested {
                candidate,
                node: node_id,
            });
        }

        debug!(address = %candidate, node = %node_id.short(), "registration verified");
        Ok(RegistrationRecord {
            address: candidate,
            node_id,
            height: registration.height,
            txid: registration.txid,
            version: registration.version,
        })
    }
}
