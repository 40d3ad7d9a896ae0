//! Encrypted record layer for peer sessions.
//!
//! Frames on the wire are `u16 big-endian length ‖ ciphertext`, where the
//! ciphertext is AES-128-GCM over the message plaintext with no
//! additional data. The nonce for a frame is `base_iv XOR sequence`; the
//! 96-bit big-endian sequence counter starts at the negotiated value and
//! advances once per frame produced *or* consumed, so both directions of
//! a session share a single ordered stream. The counter must never wrap:
//! exhaustion is a session-fatal error.

use std::fmt;
use std::io::{Read, Write};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes128Gcm, Key, Nonce};
use rand::Rng;
use thiserror::Error;

/// AES key size in bytes.
pub const KEY_SIZE: usize = 16;

/// Base IV size in bytes.
pub const BASE_IV_SIZE: usize = 12;

/// Sequence counter size in bytes.
pub const SEQUENCE_SIZE: usize = 12;

/// Size of the full keying triple exchanged during the handshake.
pub const SECRET_SIZE: usize = KEY_SIZE + BASE_IV_SIZE + SEQUENCE_SIZE;

/// Size of the frame length prefix.
pub const FRAME_LEN_SIZE: usize = 2;

/// Hard upper bound on a frame (the length prefix is a u16).
pub const MAX_FRAME_LEN: usize = u16::MAX as usize;

/// Errors from the record layer.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("frame of {got} bytes exceeds limit of {max}")]
    FrameTooLarge { got: usize, max: usize },

    #[error("sequence counter exhausted")]
    SequenceExhausted,

    #[error("authenticated decryption failed")]
    Decrypt,

    #[error("encryption failed")]
    Encrypt,

    #[error("bad session secret length: expected {SECRET_SIZE}, got {0}")]
    BadSecretLength(usize),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Keying material negotiated during the handshake.
#[derive(Clone)]
pub struct SessionSecret {
    /// 128-bit AES key.
    pub key: [u8; KEY_SIZE],
    /// Base IV the sequence counter is XORed with.
    pub base_iv: [u8; BASE_IV_SIZE],
    /// Starting sequence counter value.
    pub start_seq: [u8; SEQUENCE_SIZE],
}

impl SessionSecret {
    /// Generate fresh random keying material.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let mut secret = Self {
            key: [0u8; KEY_SIZE],
            base_iv: [0u8; BASE_IV_SIZE],
            start_seq: [0u8; SEQUENCE_SIZE],
        };
        rng.fill(&mut secret.key[..]);
        rng.fill(&mut secret.base_iv[..]);
        rng.fill(&mut secret.start_seq[..]);
        secret
    }

    /// Serialize as `key ‖ base_iv ‖ start_seq`.
    pub fn to_bytes(&self) -> [u8; SECRET_SIZE] {
        let mut buf = [0u8; SECRET_SIZE];
        buf[..KEY_SIZE].copy_from_slice(&self.key);
        buf[KEY_SIZE..KEY_SIZE + BASE_IV_SIZE].copy_from_slice(&self.base_iv);
        buf[KEY_SIZE + BASE_IV_SIZE..].copy_from_slice(&self.start_seq);
        buf
    }

    /// Parse from `key ‖ base_iv ‖ start_seq`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, RecordError> {
        if bytes.len() != SECRET_SIZE {
            return Err(RecordError::BadSecretLength(bytes.len()));
        }
        let mut secret = Self {
            key: [0u8; KEY_SIZE],
            base_iv: [0u8; BASE_IV_SIZE],
            start_seq: [0u8; SEQUENCE_SIZE],
        };
        secret.key.copy_from_slice(&bytes[..KEY_SIZE]);
        secret
            .base_iv
            .copy_from_slice(&bytes[KEY_SIZE..KEY_SIZE + BASE_IV_SIZE]);
        secret
            .start_seq
            .copy_from_slice(&bytes[KEY_SIZE + BASE_IV_SIZE..]);
        Ok(secret)
    }
}

impl fmt::Debug for SessionSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionSecret")
            .field("key", &"[redacted]")
            .field("base_iv", &"[redacted]")
            .field("start_seq", &"[redacted]")
            .finish()
    }
}

/// 96-bit big-endian frame counter.
#[derive(Clone, PartialEq, Eq)]
pub struct Sequence([u8; SEQUENCE_SIZE]);

impl Sequence {
    /// Start a counter at the given value.
    pub fn new(start: [u8; SEQUENCE_SIZE]) -> Self {
        Self(start)
    }

    /// The current counter value.
    pub fn as_bytes(&self) -> &[u8; SEQUENCE_SIZE] {
        &self.0
    }

    /// Advance by one. Wrapping the 96-bit space is a fatal error.
    pub fn advance(&mut self) -> Result<(), RecordError> {
        for byte in self.0.iter_mut().rev() {
            if *byte < u8::MAX {
                *byte += 1;
                return Ok(());
            }
            *byte = 0;
        }
        Err(RecordError::SequenceExhausted)
    }
}

impl fmt::Debug for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sequence({})", hex::encode(self.0))
    }
}

/// Symmetric cipher state for one session.
///
/// Both directions share the one counter, so every `seal` and `open`
/// must happen under the owning session's mutex.
pub struct RecordCipher {
    cipher: Aes128Gcm,
    base_iv: [u8; BASE_IV_SIZE],
    sequence: Sequence,
}

impl RecordCipher {
    /// Build cipher state from negotiated keying material.
    pub fn new(secret: &SessionSecret) -> Self {
        Self {
            cipher: Aes128Gcm::new(Key::<Aes128Gcm>::from_slice(&secret.key)),
            base_iv: secret.base_iv,
            sequence: Sequence::new(secret.start_seq),
        }
    }

    /// The current sequence counter.
    pub fn sequence(&self) -> &Sequence {
        &self.sequence
    }

    fn nonce(&self) -> [u8; BASE_IV_SIZE] {
        let mut nonce = self.base_iv;
        for (byte, seq) in nonce.iter_mut().zip(self.sequence.as_bytes()) {
            *byte ^= seq;
        }
        nonce
    }

    /// Encrypt one frame payload and advance the counter.
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, RecordError> {
        let nonce = self.nonce();
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| RecordError::Encrypt)?;
        self.sequence.advance()?;
        Ok(ciphertext)
    }

    /// Decrypt one frame payload and advance the counter.
    pub fn open(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, RecordError> {
        let nonce = self.nonce();
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext)
            .map_err(|_| RecordError::Decrypt)?;
        self.sequence.advance()?;
        Ok(plaintext)
    }
}

/// Write one length-prefixed ciphertext frame.
pub fn write_frame<W: Write>(writer: &mut W, ciphertext: &[u8]) -> Result<(), RecordError> {
    if ciphertext.len() > MAX_FRAME_LEN {
        return Err(RecordError::FrameTooLarge {
            got: ciphertext.len(),
            max: MAX_FRAME_LEN,
        });
    }
    writer.write_all(&(ciphertext.len() as u16).to_be_bytes())?;
    writer.write_all(ciphertext)?;
    Ok(())
}

/// Read one length-prefixed ciphertext frame, enforcing `max_len`.
pub fn read_frame<R: Read>(reader: &mut R, max_len: usize) -> Result<Vec<u8>, RecordError> {
    let mut len_bytes = [0u8; FRAME_LEN_SIZE];
    reader.read_exact(&mut len_bytes)?;
    let len = u16::from_be_bytes(len_bytes) as usize;
    if len > max_len {
        return Err(RecordError::FrameTooLarge {
            got: len,
            max: max_len,
        });
    }
    let mut frame = vec![0u8; len];
    reader.read_exact(&mut frame)?;
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn secret() -> SessionSecret {
        SessionSecret {
            key: [7u8; KEY_SIZE],
            base_iv: [3u8; BASE_IV_SIZE],
            start_seq: [0u8; SEQUENCE_SIZE],
        }
    }

    #[test]
    fn test_secret_roundtrip() {
        let secret = SessionSecret::generate();
        let restored = SessionSecret::from_bytes(&secret.to_bytes()).unwrap();
        assert_eq!(restored.key, secret.key);
        assert_eq!(restored.base_iv, secret.base_iv);
        assert_eq!(restored.start_seq, secret.start_seq);

        assert!(SessionSecret::from_bytes(&[0u8; SECRET_SIZE - 1]).is_err());
    }

    #[test]
    fn test_seal_open_in_lockstep() {
        let mut sender = RecordCipher::new(&secret());
        let mut receiver = RecordCipher::new(&secret());

        for i in 0..5u8 {
            let plaintext = vec![i; 20];
            let ciphertext = sender.seal(&plaintext).unwrap();
            assert_ne!(ciphertext, plaintext);
            assert_eq!(receiver.open(&ciphertext).unwrap(), plaintext);
        }
        assert_eq!(sender.sequence(), receiver.sequence());
    }

    #[test]
    fn test_nonce_advances_per_frame() {
        let mut cipher = RecordCipher::new(&secret());
        let first = cipher.seal(b"same").unwrap();
        let second = cipher.seal(b"same").unwrap();
        // Same plaintext, fresh nonce, different ciphertext.
        assert_ne!(first, second);
    }

    #[test]
    fn test_out_of_sequence_frame_rejected() {
        let mut sender = RecordCipher::new(&secret());
        let mut receiver = RecordCipher::new(&secret());

        let skipped = sender.seal(b"one").unwrap();
        let delivered = sender.seal(b"two").unwrap();
        // Receiver expects the first frame; the second must not decrypt.
        assert!(matches!(receiver.open(&delivered), Err(RecordError::Decrypt)));
        // The failed attempt does not advance the counter.
        assert_eq!(receiver.open(&skipped).unwrap(), b"one".to_vec());
    }

    #[test]
    fn test_tampered_frame_rejected() {
        let mut sender = RecordCipher::new(&secret());
        let mut receiver = RecordCipher::new(&secret());

        let mut ciphertext = sender.seal(b"payload").unwrap();
        ciphertext[0] ^= 0x01;
        assert!(matches!(receiver.open(&ciphertext), Err(RecordError::Decrypt)));
    }

    #[test]
    fn test_sequence_carry_and_exhaustion() {
        let mut sequence = Sequence::new([0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xff]);
        sequence.advance().unwrap();
        assert_eq!(
            sequence.as_bytes(),
            &[0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1, 0]
        );

        let mut sequence = Sequence::new([0xff; SEQUENCE_SIZE]);
        assert!(matches!(
            sequence.advance(),
            Err(RecordError::SequenceExhausted)
        ));
    }

    #[test]
    fn test_frame_roundtrip() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &[0xaa; 48]).unwrap();
        assert_eq!(&buf[..2], &[0, 48]);

        let mut reader = Cursor::new(buf);
        assert_eq!(read_frame(&mut reader, MAX_FRAME_LEN).unwrap(), vec![0xaa; 48]);
    }

    #[test]
    fn test_frame_over_limit_rejected() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &[0u8; 100]).unwrap();
        let mut reader = Cursor::new(buf);
        assert!(matches!(
            read_frame(&mut reader, 64),
            Err(RecordError::FrameTooLarge { got: 100, max: 64 })
        ));
    }

    #[test]
    fn test_message_frame_roundtrip() {
        use crate::protocol::Message;

        let secret = SessionSecret::generate();
        let mut sender = RecordCipher::new(&secret);
        let mut receiver = RecordCipher::new(&secret);

        let message = Message::TableRequest { starting_block: 42 };
        let mut wire = Vec::new();
        write_frame(&mut wire, &sender.seal(&message.encode().unwrap()).unwrap()).unwrap();

        let mut reader = Cursor::new(wire);
        let ciphertext = read_frame(&mut reader, MAX_FRAME_LEN).unwrap();
        let plaintext = receiver.open(&ciphertext).unwrap();
        assert_eq!(Message::decode(&plaintext).unwrap(), message);
    }

    #[test]
    fn test_short_read_is_an_error() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &[0u8; 30]).unwrap();
        buf.truncate(10);
        let mut reader = Cursor::new(buf);
        assert!(read_frame(&mut reader, MAX_FRAME_LEN).is_err());
    }
}
