//! Peer session handshake.
//!
//! Two-phase exchange binding a fresh transport key pair to a
//! channel-graph identity:
//!
//! 1. Both sides send `pubkey ‖ signature`: a PEM-encoded RSA-2048 public
//!    key (459 bytes) freshly generated for this session, signed by the
//!    identity service (65-byte recoverable signature). Each side
//!    recovers the signer from the signature and requires it to be a
//!    direct channel counterparty that is registered in the overlay.
//! 2. The initiator generates `key ‖ base_iv ‖ start_seq` (40 bytes),
//!    encrypts it to the responder's key with RSA-OAEP (SHA-256) and
//!    sends the 256-byte ciphertext. The responder replies with the
//!    16-byte key alone, encrypted to the initiator's key, as the
//!    key-confirmation ACK.
//!
//! Any verification failure closes the transport. A key-confirmation
//! mismatch is not a peer failure but local cryptographic
//! self-inconsistency, and is flagged fatal.

use std::io::{Read, Write};

use parking_lot::RwLock;
use rsa::pkcs8::{DecodePublicKey, Document, EncodePublicKey, LineEnding};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use thiserror::Error;
use tracing::debug;

use crate::db::Db;
use crate::identity::{IdentityError, IdentityService, NodeId, SIGNATURE_SIZE};
use crate::record::SessionSecret;

/// RSA modulus size for session key transport.
pub const RSA_KEY_BITS: usize = 2048;

/// Exact length of the PEM-encoded public key sent on the wire.
pub const PUBKEY_PEM_SIZE: usize = 459;

/// Length of an RSA-OAEP ciphertext under a 2048-bit key.
pub const RSA_CIPHERTEXT_SIZE: usize = 256;

const PUBKEY_PEM_LABEL: &str = "RSA PUBLIC KEY";

/// Errors from the handshake.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("peer credential signature did not verify")]
    InvalidSignature,

    #[error("peer {0} does not share a channel with this node")]
    NotChannelPeer(NodeId),

    #[error("peer {0} is not registered in the overlay")]
    NotRegistered(NodeId),

    #[error("key confirmation mismatch")]
    KeyConfirmMismatch,

    #[error("malformed session secret from peer")]
    BadSecret,

    #[error("public key encoding: {0}")]
    Pem(String),

    #[error("rsa failure: {0}")]
    Rsa(#[from] rsa::Error),

    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl HandshakeError {
    /// Whether this failure indicates local cryptographic
    /// self-inconsistency rather than a misbehaving peer.
    pub fn is_fatal(&self) -> bool {
        matches!(self, HandshakeError::KeyConfirmMismatch)
    }
}

struct LocalCredentials {
    private_key: RsaPrivateKey,
    /// `pubkey_pem ‖ signature`, ready for the wire.
    wire: Vec<u8>,
}

fn oaep() -> Oaep {
    Oaep::new::<Sha256>()
}

fn local_credentials(identity: &dyn IdentityService) -> Result<LocalCredentials, HandshakeError> {
    let mut rng = rand::thread_rng();
    let private_key = RsaPrivateKey::new(&mut rng, RSA_KEY_BITS)?;
    let public_key = RsaPublicKey::from(&private_key);

    let der = public_key
        .to_public_key_der()
        .map_err(|e| HandshakeError::Pem(e.to_string()))?;
    let pem = der
        .to_pem(PUBKEY_PEM_LABEL, LineEnding::LF)
        .map_err(|e| HandshakeError::Pem(e.to_string()))?;
    if pem.len() != PUBKEY_PEM_SIZE {
        return Err(HandshakeError::Pem(format!(
            "encoded public key is {} bytes, expected {PUBKEY_PEM_SIZE}",
            pem.len()
        )));
    }

    let signature = identity.sign(pem.as_bytes())?;
    let mut wire = Vec::with_capacity(PUBKEY_PEM_SIZE + SIGNATURE_SIZE);
    wire.extend_from_slice(pem.as_bytes());
    wire.extend_from_slice(&signature);
    Ok(LocalCredentials { private_key, wire })
}

fn receive_peer_credentials<S: Read>(
    stream: &mut S,
) -> Result<(Vec<u8>, [u8; SIGNATURE_SIZE]), HandshakeError> {
    let mut buf = [0u8; PUBKEY_PEM_SIZE + SIGNATURE_SIZE];
    stream.read_exact(&mut buf)?;
    let mut signature = [0u8; SIGNATURE_SIZE];
    signature.copy_from_slice(&buf[PUBKEY_PEM_SIZE..]);
    Ok((buf[..PUBKEY_PEM_SIZE].to_vec(), signature))
}

/// Recover and vet the peer behind a credential blob: valid signature,
/// direct channel counterparty, registered in the overlay.
fn verify_peer(
    pem: &[u8],
    signature: &[u8; SIGNATURE_SIZE],
    identity: &dyn IdentityService,
    db: &RwLock<Db>,
) -> Result<(NodeId, RsaPublicKey), HandshakeError> {
    let peer = identity
        .verify(pem, signature)?
        .ok_or(HandshakeError::InvalidSignature)?;

    let channels = identity.channels()?;
    if !channels.iter().any(|channel| channel.remote == peer) {
        return Err(HandshakeError::NotChannelPeer(peer));
    }
    if !db.read().is_node_registered(&peer) {
        return Err(HandshakeError::NotRegistered(peer));
    }

    let pem_str =
        std::str::from_utf8(pem).map_err(|e| HandshakeError::Pem(e.to_string()))?;
    let (_, der) = Document::from_pem(pem_str).map_err(|e| HandshakeError::Pem(e.to_string()))?;
    let public_key = RsaPublicKey::from_public_key_der(der.as_bytes())
        .map_err(|e| HandshakeError::Pem(e.to_string()))?;

    debug!(peer = %peer.short(), "peer credentials verified");
    Ok((peer, public_key))
}

/// Run the handshake as the connecting side.
pub fn initiate<S: Read + Write>(
    stream: &mut S,
    identity: &dyn IdentityService,
    db: &RwLock<Db>,
) -> Result<(SessionSecret, NodeId), HandshakeError> {
    let local = local_credentials(identity)?;
    stream.write_all(&local.wire)?;

    let (peer_pem, peer_signature) = receive_peer_credentials(stream)?;
    let (peer, peer_key) = verify_peer(&peer_pem, &peer_signature, identity, db)?;

    let secret = SessionSecret::generate();
    let mut rng = rand::thread_rng();
    let sealed = peer_key.encrypt(&mut rng, oaep(), &secret.to_bytes())?;
    stream.write_all(&sealed)?;

    let mut ack = [0u8; RSA_CIPHERTEXT_SIZE];
    stream.read_exact(&mut ack)?;
    let confirmed = local.private_key.decrypt(oaep(), &ack)?;
    if confirmed[..] != secret.key[..] {
        return Err(HandshakeError::KeyConfirmMismatch);
    }

    Ok((secret, peer))
}

/// Run the handshake as the accepting side.
pub fn accept<S: Read + Write>(
    stream: &mut S,
    identity: &dyn IdentityService,
    db: &RwLock<Db>,
) -> Result<(SessionSecret, NodeId), HandshakeError> {
    let (peer_pem, peer_signature) = receive_peer_credentials(stream)?;
    let (peer, peer_key) = verify_peer(&peer_pem, &peer_signature, identity, db)?;

    let local = local_credentials(identity)?;
    stream.write_all(&local.wire)?;

    let mut sealed = [0u8; RSA_CIPHERTEXT_SIZE];
    stream.read_exact(&mut sealed)?;
    let secret_bytes = local.private_key.decrypt(oaep(), &sealed)?;
    let secret =
        SessionSecret::from_bytes(&secret_bytes).map_err(|_| HandshakeError::BadSecret)?;

    let mut rng = rand::thread_rng();
    let ack = peer_key.encrypt(&mut rng, oaep(), &secret.key)?;
    stream.write_all(&ack)?;

    Ok((secret, peer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::RegistrationRecord;
    use crate::identity::Channel;
    use crate::addr::OverlayAddr;
    use std::net::{TcpListener, TcpStream};
    use std::path::PathBuf;
    use std::thread;

    fn node(last: u8) -> NodeId {
        let mut bytes = [0u8; 33];
        bytes[0] = 2;
        bytes[32] = last;
        NodeId::from_bytes(bytes)
    }

    /// Identity fixture for a two-node graph: signing always yields our
    /// marker signature, verification trusts the marker byte.
    struct PairIdentity {
        local: u8,
        remote: u8,
    }

    impl IdentityService for PairIdentity {
        fn local_node(&self) -> Result<NodeId, IdentityError> {
            Ok(node(self.local))
        }

        fn channels(&self) -> Result<Vec<Channel>, IdentityError> {
            Ok(vec![Channel {
                remote: node(self.remote),
                local_balance: 1_000,
            }])
        }

        fn node_neighbors(&self, _node: &NodeId) -> Result<Vec<NodeId>, IdentityError> {
            Ok(Vec::new())
        }

        fn sign(&self, _message: &[u8]) -> Result<[u8; SIGNATURE_SIZE], IdentityError> {
            let mut signature = [0u8; SIGNATURE_SIZE];
            signature[0] = self.local;
            Ok(signature)
        }

        fn verify(
            &self,
            _message: &[u8],
            signature: &[u8; SIGNATURE_SIZE],
        ) -> Result<Option<NodeId>, IdentityError> {
            match signature[0] {
                0 => Ok(None),
                last => Ok(Some(node(last))),
            }
        }

        fn network_addresses(&self, _node: &NodeId) -> Result<Vec<String>, IdentityError> {
            Ok(Vec::new())
        }
    }

    fn db_with(registered: &[u8]) -> RwLock<Db> {
        let mut db = Db::new(PathBuf::new());
        for &last in registered {
            db.insert_record(RegistrationRecord {
                address: OverlayAddr::from_bytes([10, 0, 0, last]),
                node_id: node(last),
                height: 0,
                txid: [0; 32],
                version: 0,
            })
            .unwrap();
        }
        RwLock::new(db)
    }

    fn stream_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn test_credential_blob_has_fixed_size() {
        let identity = PairIdentity { local: 1, remote: 2 };
        let credentials = local_credentials(&identity).unwrap();
        assert_eq!(credentials.wire.len(), PUBKEY_PEM_SIZE + SIGNATURE_SIZE);
        assert!(credentials.wire.starts_with(b"-----BEGIN RSA PUBLIC KEY-----\n"));
    }

    #[test]
    fn test_handshake_agrees_on_keys() {
        let (mut initiator_stream, mut responder_stream) = stream_pair();

        let responder = thread::spawn(move || {
            let identity = PairIdentity { local: 2, remote: 1 };
            let db = db_with(&[1, 2]);
            accept(&mut responder_stream, &identity, &db).unwrap()
        });

        let identity = PairIdentity { local: 1, remote: 2 };
        let db = db_with(&[1, 2]);
        let (initiator_secret, initiator_peer) =
            initiate(&mut initiator_stream, &identity, &db).unwrap();
        let (responder_secret, responder_peer) = responder.join().unwrap();

        assert_eq!(initiator_peer, node(2));
        assert_eq!(responder_peer, node(1));
        assert_eq!(initiator_secret.key, responder_secret.key);
        assert_eq!(initiator_secret.base_iv, responder_secret.base_iv);
        assert_eq!(initiator_secret.start_seq, responder_secret.start_seq);
    }

    #[test]
    fn test_responder_rejects_unregistered_peer() {
        let (mut initiator_stream, mut responder_stream) = stream_pair();

        let initiator = thread::spawn(move || {
            let identity = PairIdentity { local: 1, remote: 2 };
            let db = db_with(&[1, 2]);
            // The responder hangs up mid-handshake; any error is fine.
            let _ = initiate(&mut initiator_stream, &identity, &db);
        });

        let identity = PairIdentity { local: 2, remote: 1 };
        let db = db_with(&[2]); // peer 1 not registered
        let err = accept(&mut responder_stream, &identity, &db).unwrap_err();
        assert!(matches!(err, HandshakeError::NotRegistered(n) if n == node(1)));
        drop(responder_stream);
        initiator.join().unwrap();
    }

    #[test]
    fn test_responder_rejects_non_counterparty() {
        let (mut initiator_stream, mut responder_stream) = stream_pair();

        let initiator = thread::spawn(move || {
            let identity = PairIdentity { local: 1, remote: 2 };
            let db = db_with(&[1, 2]);
            let _ = initiate(&mut initiator_stream, &identity, &db);
        });

        // Responder only has a channel with node 9.
        let identity = PairIdentity { local: 2, remote: 9 };
        let db = db_with(&[1, 2]);
        let err = accept(&mut responder_stream, &identity, &db).unwrap_err();
        assert!(matches!(err, HandshakeError::NotChannelPeer(n) if n == node(1)));
        drop(responder_stream);
        initiator.join().unwrap();
    }

    #[test]
    fn test_key_confirm_mismatch_is_fatal() {
        assert!(HandshakeError::KeyConfirmMismatch.is_fatal());
        assert!(!HandshakeError::InvalidSignature.is_fatal());
    }
}
