//! # Certificate Challenge Protocol
//!
//! Marketplace entities carry a certificate id. The authoritative tree keeps
//! at most one live entity per certificate; when a second copy is rezzed the
//! older holder is force-deleted, and the newcomer must survive two gates:
//!
//! 1. **Proof of provenance** — a [`PurchaseValidator`] (the marketplace
//!    endpoint behind a trait) vouches for the certificate and names the
//!    current owner's public key.
//! 2. **Nonce challenge** — the tree sends the rezzing node a random nonce;
//!    the node must sign the SHA-256 of the nonce with the owner's private
//!    key before the deadline, or the entity is force-deleted.
//!
//! Peer nodes can also challenge each other; the tree just relays those
//! request/reply payloads through a [`ChallengeTransport`].
//!
//! [`ChallengeTracker`] holds the certificate→holder map and the pending
//! nonce table. It is plain data behind the tree's own lock; deadlines are
//! polled from the tree's `update()` rather than per-challenge timers.

use crate::error::{EntityError, EntityResult};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tracing::{debug, warn};
use uuid::Uuid;
use weald_common::{EntityId, SessionId};

// ============================================================================
// Collaborator traits
// ============================================================================

/// Verdict from the proof-of-provenance endpoint for one certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PopVerdict {
    /// Certificate checks out; the nonce challenge may proceed against this
    /// owner public key.
    Valid { transfer_recipient_key: String },
    /// The endpoint rejected the certificate outright.
    Invalid { reason: String },
    /// The marketplace transfer for this certificate failed.
    TransferFailed,
    /// The endpoint could not be reached.
    Unreachable { error: String },
}

/// Marketplace proof-of-provenance lookup. Implementations typically wrap an
/// HTTP client; tests use canned verdicts.
pub trait PurchaseValidator: Send + Sync {
    fn validate(&self, certificate_id: &str) -> PopVerdict;
}

/// Signature check for challenge responses. `public_key` is the key text the
/// validator handed back, `digest` is the SHA-256 of the nonce, `signature`
/// is the raw response payload.
pub trait SignatureVerifier: Send + Sync {
    fn verify(&self, public_key: &str, digest: &[u8], signature: &[u8]) -> bool;
}

/// Outbound delivery of challenge payloads. The tree never talks to sockets
/// itself.
pub trait ChallengeTransport: Send + Sync {
    /// Deliver a nonce challenge to the node that rezzed the entity.
    fn send_challenge(&self, recipient: SessionId, payload: Bytes);

    /// Relay a peer challenge request to the node being challenged.
    fn relay_challenge_request(&self, recipient: SessionId, payload: Bytes);

    /// Relay a challenge reply back to the original challenger.
    fn relay_challenge_reply(&self, recipient: SessionId, payload: Bytes);
}

// ============================================================================
// Payload framing
// ============================================================================

// Challenge payloads are length-prefixed byte arrays: two i32 lengths, then
// the certificate id and the text. Outbound the text is the nonce; inbound
// it is the signature over the hashed nonce. Relayed peer challenges append
// a third array holding the 16-byte node id.

fn read_array(buf: &mut &[u8], len: usize) -> EntityResult<Vec<u8>> {
    if buf.remaining() < len {
        return Err(EntityError::TruncatedPacket {
            needed: len,
            remaining: buf.remaining(),
        });
    }
    let mut out = vec![0u8; len];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

fn read_len(buf: &mut &[u8]) -> EntityResult<usize> {
    if buf.remaining() < 4 {
        return Err(EntityError::TruncatedPacket {
            needed: 4,
            remaining: buf.remaining(),
        });
    }
    let len = buf.get_i32_le();
    if len < 0 {
        return Err(EntityError::decode("negative array length"));
    }
    Ok(len as usize)
}

/// `[i32 cert_len][i32 text_len][cert][text]`
pub fn encode_challenge_payload(certificate_id: &str, text: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(8 + certificate_id.len() + text.len());
    buf.put_i32_le(certificate_id.len() as i32);
    buf.put_i32_le(text.len() as i32);
    buf.put_slice(certificate_id.as_bytes());
    buf.put_slice(text);
    buf.freeze()
}

pub fn decode_challenge_payload(mut buf: &[u8]) -> EntityResult<(String, Vec<u8>)> {
    let cert_len = read_len(&mut buf)?;
    let text_len = read_len(&mut buf)?;
    let cert = read_array(&mut buf, cert_len)?;
    let text = read_array(&mut buf, text_len)?;
    let cert = String::from_utf8(cert)
        .map_err(|_| EntityError::decode("certificate id is not utf-8"))?;
    Ok((cert, text))
}

/// `[i32 cert_len][i32 text_len][i32 node_len][cert][text][node]`
pub fn encode_challenge_relay(certificate_id: &str, text: &[u8], node: SessionId) -> Bytes {
    let node_bytes = node.to_rfc4122();
    let mut buf =
        BytesMut::with_capacity(12 + certificate_id.len() + text.len() + node_bytes.len());
    buf.put_i32_le(certificate_id.len() as i32);
    buf.put_i32_le(text.len() as i32);
    buf.put_i32_le(node_bytes.len() as i32);
    buf.put_slice(certificate_id.as_bytes());
    buf.put_slice(text);
    buf.put_slice(&node_bytes);
    buf.freeze()
}

pub fn decode_challenge_relay(mut buf: &[u8]) -> EntityResult<(String, Vec<u8>, SessionId)> {
    let cert_len = read_len(&mut buf)?;
    let text_len = read_len(&mut buf)?;
    let node_len = read_len(&mut buf)?;
    let cert = read_array(&mut buf, cert_len)?;
    let text = read_array(&mut buf, text_len)?;
    let node = read_array(&mut buf, node_len)?;
    let cert = String::from_utf8(cert)
        .map_err(|_| EntityError::decode("certificate id is not utf-8"))?;
    let node: [u8; 16] = node
        .try_into()
        .map_err(|_| EntityError::decode("node id must be 16 bytes"))?;
    Ok((cert, text, SessionId::from_rfc4122(node)))
}

// ============================================================================
// ChallengeTracker
// ============================================================================

/// A challenge in flight: the nonce we sent, the key that must sign it, the
/// entity on the line, and when we give up.
#[derive(Debug, Clone)]
struct PendingChallenge {
    nonce: String,
    owner_key: String,
    entity: EntityId,
    deadline_usec: u64,
}

/// Outcome of a challenge response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeOutcome {
    /// Signature matched; the entity stays.
    Verified,
    /// Signature failed; the named entity must be force-deleted.
    Failed(EntityId),
    /// No challenge outstanding for that certificate; response is ignored.
    Unknown,
}

/// Certificate bookkeeping for an authoritative tree: which entity holds
/// each certificate, and which challenges are awaiting a signature.
#[derive(Debug, Default)]
pub struct ChallengeTracker {
    holders: HashMap<String, EntityId>,
    pending: HashMap<String, PendingChallenge>,
}

impl ChallengeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `id` as the holder of `certificate_id`. Returns the displaced
    /// prior holder, which the caller must force-delete.
    pub fn register_holder(&mut self, certificate_id: &str, id: EntityId) -> Option<EntityId> {
        let prior = self.holders.insert(certificate_id.to_string(), id);
        match prior {
            Some(old) if old != id => {
                warn!(
                    "Certificate \"{}\" already held by {}; displaced by {}",
                    certificate_id, old, id
                );
                Some(old)
            }
            _ => None,
        }
    }

    pub fn holder(&self, certificate_id: &str) -> Option<EntityId> {
        self.holders.get(certificate_id).copied()
    }

    /// Drop bookkeeping for a deleted entity. Only removes mappings that
    /// still point at `id`, so a displaced holder's delete cannot clobber
    /// its replacement.
    pub fn release(&mut self, certificate_id: &str, id: EntityId) {
        if self.holders.get(certificate_id) == Some(&id) {
            self.holders.remove(certificate_id);
        }
        if self
            .pending
            .get(certificate_id)
            .map(|p| p.entity == id)
            .unwrap_or(false)
        {
            self.pending.remove(certificate_id);
        }
    }

    /// Open a nonce challenge against `entity` and return the payload to
    /// send to the rezzing node.
    pub fn begin_challenge(
        &mut self,
        certificate_id: &str,
        owner_key: &str,
        entity: EntityId,
        now: u64,
        timeout_usec: u64,
    ) -> Bytes {
        let nonce = Uuid::new_v4().to_string();
        let payload = encode_challenge_payload(certificate_id, nonce.as_bytes());
        debug!(
            "Challenging certificate \"{}\" held by {}; deadline in {}us",
            certificate_id, entity, timeout_usec
        );
        self.pending.insert(
            certificate_id.to_string(),
            PendingChallenge {
                nonce,
                owner_key: owner_key.to_string(),
                entity,
                deadline_usec: now + timeout_usec,
            },
        );
        payload
    }

    /// Settle a challenge response. Consumes the pending record either way;
    /// a repeat response for the same certificate comes back [`Unknown`].
    ///
    /// [`Unknown`]: ChallengeOutcome::Unknown
    pub fn verify_response(
        &mut self,
        certificate_id: &str,
        signature: &[u8],
        verifier: &dyn SignatureVerifier,
    ) -> ChallengeOutcome {
        let Some(pending) = self.pending.remove(certificate_id) else {
            debug!(
                "Challenge response for unknown certificate \"{}\"; ignoring",
                certificate_id
            );
            return ChallengeOutcome::Unknown;
        };
        let digest = Sha256::digest(pending.nonce.as_bytes());
        if verifier.verify(&pending.owner_key, &digest, signature) {
            debug!("Challenge for \"{}\" verified", certificate_id);
            ChallengeOutcome::Verified
        } else {
            warn!(
                "Challenge signature for \"{}\" failed verification",
                certificate_id
            );
            ChallengeOutcome::Failed(pending.entity)
        }
    }

    /// Drain challenges whose deadline passed: `(certificate, entity)` pairs
    /// the tree must force-delete.
    pub fn take_expired(&mut self, now: u64) -> Vec<(String, EntityId)> {
        let overdue: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, p)| now >= p.deadline_usec)
            .map(|(cert, _)| cert.clone())
            .collect();
        overdue
            .into_iter()
            .filter_map(|cert| {
                self.pending
                    .remove(&cert)
                    .map(|p| (cert, p.entity))
            })
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn clear(&mut self) {
        self.holders.clear();
        self.pending.clear();
    }
}
