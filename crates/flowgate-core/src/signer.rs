//! Keyed BLAKE2s signatures for events.
//!
//! Agents install a key with `SetCryptoKey`; attach and data events for
//! that filter then carry a MAC the agent can check.

use blake2::digest::Mac;
use blake2::{Blake2s256, Blake2sMac256, Digest};
use flowgate_proto::{DataEvent, FlowId, Signature, SocketInfo};
use std::net::SocketAddr;
use thiserror::Error;

/// Key installation errors
#[derive(Debug, Error)]
pub enum SignerError {
    #[error("Crypto key is empty")]
    EmptyKey,
    #[error("Crypto key rejected")]
    InvalidKey,
}

/// Per-filter event signer.
pub struct Signer {
    key: [u8; 32],
}

impl Signer {
    /// Derive a signer from arbitrary key material.
    pub fn new(material: &[u8]) -> Result<Self, SignerError> {
        if material.is_empty() {
            return Err(SignerError::EmptyKey);
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&<Blake2s256 as Digest>::digest(material));
        // Fail early if the MAC refuses the derived key.
        Blake2sMac256::new_from_slice(&key).map_err(|_| SignerError::InvalidKey)?;
        Ok(Self { key })
    }

    /// MAC over the concatenation of `parts`.
    pub fn sign(&self, parts: &[&[u8]]) -> Signature {
        let mut out = [0u8; 32];
        if let Ok(mut mac) = Blake2sMac256::new_from_slice(&self.key) {
            for part in parts {
                Mac::update(&mut mac, part);
            }
            out.copy_from_slice(&mac.finalize().into_bytes());
        }
        out
    }

    pub fn verify(&self, parts: &[&[u8]], signature: &Signature) -> bool {
        let Ok(mut mac) = Blake2sMac256::new_from_slice(&self.key) else {
            return false;
        };
        for part in parts {
            Mac::update(&mut mac, part);
        }
        mac.verify_slice(signature).is_ok()
    }

    /// Signature carried by an `Attached` event.
    pub fn sign_attached(&self, flow_id: FlowId, info: &SocketInfo) -> Signature {
        let local = addr_bytes(info.local);
        let remote = addr_bytes(info.remote);
        self.sign(&[
            &flow_id.0.to_be_bytes(),
            &[info.protocol],
            &info.pid.to_be_bytes(),
            info.uuid.as_bytes(),
            &local,
            &remote,
        ])
    }

    /// Signature carried by a data event.
    pub fn sign_data(&self, flow_id: FlowId, event: &DataEvent) -> Signature {
        self.sign(&[
            &flow_id.0.to_be_bytes(),
            &[event.direction.is_outbound() as u8],
            &event.start.to_be_bytes(),
            &event.end.to_be_bytes(),
            &event.payload,
        ])
    }
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signer").finish_non_exhaustive()
    }
}

fn addr_bytes(addr: Option<SocketAddr>) -> Vec<u8> {
    match addr {
        Some(SocketAddr::V4(a)) => {
            let mut out = a.ip().octets().to_vec();
            out.extend_from_slice(&a.port().to_be_bytes());
            out
        }
        Some(SocketAddr::V6(a)) => {
            let mut out = a.ip().octets().to_vec();
            out.extend_from_slice(&a.port().to_be_bytes());
            out
        }
        None => Vec::new(),
    }
}
