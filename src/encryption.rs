use aead::{Aead, Nonce};
use aes_gcm::Aes256Gcm;
use bytes::{BufMut, Bytes, BytesMut};
use std::sync::atomic::{AtomicU64, Ordering};

/// Whether and how chunk payloads are encrypted before being wrapped into the envelope.
///  Decided once when the stream is constructed - the send path never checks for a
///  'maybe present' cipher.
pub enum SendEncryption {
    Plain,
    Encrypted(EncryptedSend),
}

impl SendEncryption {
    pub(crate) fn apply(&self, plain: Bytes) -> anyhow::Result<Bytes> {
        match self {
            SendEncryption::Plain => Ok(plain),
            SendEncryption::Encrypted(encrypted) => encrypted.encrypt_chunk(&plain),
        }
    }
}

/// Per-chunk AES-256-GCM encryption. The cipher is provided by the caller and treated
///  as an opaque capability.
pub struct EncryptedSend {
    cipher: Aes256Gcm,
    nonce_fixed: u32,
    nonce_counter: AtomicU64,
}

impl EncryptedSend {
    pub fn new(cipher: Aes256Gcm, nonce_fixed: u32) -> EncryptedSend {
        EncryptedSend {
            cipher,
            nonce_fixed,
            nonce_counter: AtomicU64::new(0),
        }
    }

    /// Encrypts one chunk, prefixing the unique nonce so the peer can decrypt. The
    ///  nonce is a fixed part plus a counter, which guarantees uniqueness per cipher
    ///  instance without coordination.
    fn encrypt_chunk(&self, plain: &[u8]) -> anyhow::Result<Bytes> {
        let mut nonce_buf = BytesMut::with_capacity(12);
        nonce_buf.put_u32(self.nonce_fixed);
        nonce_buf.put_u64(self.nonce_counter.fetch_add(1, Ordering::AcqRel));
        let nonce = Nonce::<Aes256Gcm>::from_slice(nonce_buf.as_ref());

        let ciphertext = self.cipher.encrypt(nonce, plain)
            .map_err(|e| anyhow::anyhow!("chunk encryption failed: {}", e))?;

        let mut out = BytesMut::with_capacity(nonce_buf.len() + ciphertext.len());
        out.put_slice(nonce_buf.as_ref());
        out.put_slice(&ciphertext);
        Ok(out.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aes_gcm::{Key, KeyInit};
    use rstest::*;

    #[rstest]
    fn test_encrypt_chunk() {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&[7u8; 32]));
        let encryption = SendEncryption::Encrypted(EncryptedSend::new(cipher, 0x1234));

        let plain = Bytes::from_static(b"some chunk payload");
        let first = encryption.apply(plain.clone()).unwrap();
        let second = encryption.apply(plain.clone()).unwrap();

        // nonce prefix (12 bytes) + ciphertext + tag (16 bytes)
        assert_eq!(first.len(), 12 + plain.len() + 16);
        assert_eq!(&first[..4], &[0, 0, 0x12, 0x34]);

        // the counter part of the nonce makes every chunk unique
        assert_ne!(first, second);
        assert_ne!(&first[12..], plain.as_ref());
    }

    #[rstest]
    fn test_plain_passthrough() {
        let plain = Bytes::from_static(b"payload");
        assert_eq!(SendEncryption::Plain.apply(plain.clone()).unwrap(), plain);
    }
}
