//! Authenticated thread tokens.
//!
//! A provider message id is hidden inside `<e.<payload>@mailer.tld>` where
//! `payload = base64url(tag ‖ nonce ‖ ciphertext)` and the plaintext is
//! `message_id:fingerprint(sender)`.
//!
//! Each token draws a random 24-byte nonce. HKDF-SHA256 over the master secret,
//! salted with that nonce, yields a fresh XChaCha20-Poly1305 key and cipher
//! nonce, so no two tokens share key material. The random nonce is also fed
//! in as associated data.
//!
//! Decryption fails closed on any malformed wrapper, authentication failure or
//! sender mismatch.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chacha20poly1305::aead::{AeadInPlace, KeyInit};
use chacha20poly1305::{Key, Tag, XChaCha20Poly1305, XNonce};
use hkdf::Hkdf;
use rand::RngCore;
use rand::rngs::OsRng;
use secrecy::{ExposeSecret, SecretSlice};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CipherError;

/// Size of the Poly1305 tag.
pub const TAG_SIZE: usize = 16;

/// Size of the random per-token nonce.
pub const NONCE_SIZE: usize = 24;

/// Size of the derived AEAD key.
const KEY_SIZE: usize = 32;

/// Minimum master secret length.
pub const MIN_SECRET_SIZE: usize = 32;

/// Bytes of BLAKE3 output kept as the sender fingerprint.
const FINGERPRINT_SIZE: usize = 8;

/// HKDF info label for token keys.
const KDF_INFO: &[u8] = b"alias-relay/message-id/v1";

const TOKEN_PREFIX: &str = "<e.";
const TOKEN_SUFFIX: &str = ">";

/// Key and nonce derived for a single token.
#[derive(Zeroize, ZeroizeOnDrop)]
struct TokenKeys {
    key: [u8; KEY_SIZE],
    nonce: [u8; NONCE_SIZE],
}

/// Encrypts and decrypts thread tokens for one mailer domain.
pub struct MessageIdCipher {
    master: SecretSlice<u8>,
    mailer_domain: String,
}

impl MessageIdCipher {
    /// Create a cipher. The master secret must be at least [`MIN_SECRET_SIZE`] bytes.
    pub fn new(master: SecretSlice<u8>, mailer_domain: impl Into<String>) -> Option<Self> {
        if master.expose_secret().len() < MIN_SECRET_SIZE {
            return None;
        }
        Some(Self {
            master,
            mailer_domain: mailer_domain.into(),
        })
    }

    /// Wrap `message_id` into a token bound to `sender`.
    pub fn encrypt(&self, message_id: &str, sender: &str) -> Result<String, CipherError> {
        let mut random_nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut random_nonce);

        let keys = self.derive(&random_nonce)?;
        let cipher = XChaCha20Poly1305::new(Key::from_slice(&keys.key));

        let mut buffer = format!("{message_id}:{}", fingerprint(sender)).into_bytes();
        let tag = cipher
            .encrypt_in_place_detached(XNonce::from_slice(&keys.nonce), &random_nonce, &mut buffer)
            .map_err(|_| CipherError::Encryption)?;

        let mut packed = Vec::with_capacity(TAG_SIZE + NONCE_SIZE + buffer.len());
        packed.extend_from_slice(&tag);
        packed.extend_from_slice(&random_nonce);
        packed.extend_from_slice(&buffer);

        Ok(format!(
            "{TOKEN_PREFIX}{}@{}{TOKEN_SUFFIX}",
            URL_SAFE_NO_PAD.encode(packed),
            self.mailer_domain
        ))
    }

    /// Recover the message id from `token`, which must be bound to `claimed_sender`.
    pub fn decrypt(&self, token: &str, claimed_sender: &str) -> Result<String, CipherError> {
        let payload = self.token_payload(token.trim())?;
        let packed = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| CipherError::Malformed)?;

        if packed.len() <= TAG_SIZE + NONCE_SIZE {
            return Err(CipherError::Truncated);
        }

        let (tag, rest) = packed.split_at(TAG_SIZE);
        let (random_nonce, ciphertext) = rest.split_at(NONCE_SIZE);

        let keys = self.derive(random_nonce)?;
        let cipher = XChaCha20Poly1305::new(Key::from_slice(&keys.key));

        let mut buffer = ciphertext.to_vec();
        cipher
            .decrypt_in_place_detached(
                XNonce::from_slice(&keys.nonce),
                random_nonce,
                &mut buffer,
                Tag::from_slice(tag),
            )
            .map_err(|_| CipherError::Integrity)?;

        let plaintext = String::from_utf8(buffer).map_err(|_| CipherError::Malformed)?;
        let (message_id, embedded) = plaintext.rsplit_once(':').ok_or(CipherError::Malformed)?;

        let expected = fingerprint(claimed_sender);
        if !bool::from(embedded.as_bytes().ct_eq(expected.as_bytes())) {
            return Err(CipherError::SenderMismatch);
        }

        Ok(message_id.to_string())
    }

    /// Extract the base64 payload from `<e.payload@domain>`.
    fn token_payload<'a>(&self, token: &'a str) -> Result<&'a str, CipherError> {
        let inner = token
            .strip_prefix(TOKEN_PREFIX)
            .and_then(|t| t.strip_suffix(TOKEN_SUFFIX))
            .ok_or(CipherError::Malformed)?;
        let (payload, domain) = inner.rsplit_once('@').ok_or(CipherError::Malformed)?;
        if !domain.eq_ignore_ascii_case(&self.mailer_domain) {
            return Err(CipherError::ForeignDomain);
        }
        if payload.is_empty() {
            return Err(CipherError::Truncated);
        }
        Ok(payload)
    }

    fn derive(&self, random_nonce: &[u8]) -> Result<TokenKeys, CipherError> {
        let hk = Hkdf::<Sha256>::new(Some(random_nonce), self.master.expose_secret());
        let mut okm = [0u8; KEY_SIZE + NONCE_SIZE];
        hk.expand(KDF_INFO, &mut okm)
            .map_err(|_| CipherError::KeyDerivation)?;

        let mut keys = TokenKeys {
            key: [0u8; KEY_SIZE],
            nonce: [0u8; NONCE_SIZE],
        };
        keys.key.copy_from_slice(&okm[..KEY_SIZE]);
        keys.nonce.copy_from_slice(&okm[KEY_SIZE..]);
        okm.zeroize();
        Ok(keys)
    }
}

impl std::fmt::Debug for MessageIdCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageIdCipher")
            .field("master", &"[REDACTED]")
            .field("mailer_domain", &self.mailer_domain)
            .finish()
    }
}

/// Short binding fingerprint of a sender address.
///
/// Truncated to 64 bits: it binds a token to a sender inside the AEAD and is
/// not a uniqueness guarantee.
pub fn fingerprint(sender: &str) -> String {
    let normalized = sender.trim().to_ascii_lowercase();
    let digest = blake3::hash(normalized.as_bytes());
    hex::encode(&digest.as_bytes()[..FINGERPRINT_SIZE])
}
