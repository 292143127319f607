use std::num::NonZeroU32;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, CHACHA20_POLY1305, NONCE_LEN};
use ring::pbkdf2;
use ring::rand::{SecureRandom, SystemRandom};
use thiserror::Error;

const PBKDF2_ITERATIONS: u32 = 100_000;
const KEY_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum CipherError {
    #[error("invalid key material")]
    InvalidKey,
    #[error("encryption failed")]
    SealFailed,
    #[error("decryption failed")]
    OpenFailed,
    #[error("sealed payload is not valid base64: {0}")]
    Encoding(#[from] base64::DecodeError),
    #[error("sealed payload is truncated")]
    Truncated,
    #[error("decrypted payload is not utf-8")]
    NotUtf8,
}

/// Seals session descriptions with a key derived from the room password.
///
/// Every peer in a password-protected room derives the same key (the room
/// topic is the salt), so only peers that know the password can read or forge
/// an offer. Nonces are random per message since many peers seal under the
/// same key.
pub struct SignalCipher {
    key: LessSafeKey,
    rng: SystemRandom,
}

impl SignalCipher {
    pub fn from_password(password: &str, salt: &str) -> Result<Self, CipherError> {
        let iterations = NonZeroU32::new(PBKDF2_ITERATIONS).ok_or(CipherError::InvalidKey)?;
        let mut key_bytes = [0u8; KEY_LEN];
        pbkdf2::derive(
            pbkdf2::PBKDF2_HMAC_SHA256,
            iterations,
            salt.as_bytes(),
            password.as_bytes(),
            &mut key_bytes,
        );
        let unbound =
            UnboundKey::new(&CHACHA20_POLY1305, &key_bytes).map_err(|_| CipherError::InvalidKey)?;
        Ok(Self {
            key: LessSafeKey::new(unbound),
            rng: SystemRandom::new(),
        })
    }

    /// Encrypt `plaintext`; output is base64 of `nonce || ciphertext || tag`.
    pub fn seal(&self, plaintext: &str) -> Result<String, CipherError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| CipherError::SealFailed)?;

        let mut in_out = plaintext.as_bytes().to_vec();
        self.key
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::empty(),
                &mut in_out,
            )
            .map_err(|_| CipherError::SealFailed)?;

        let mut out = Vec::with_capacity(NONCE_LEN + in_out.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&in_out);
        Ok(BASE64.encode(out))
    }

    /// Decrypt a payload produced by [`SignalCipher::seal`].
    pub fn open(&self, sealed: &str) -> Result<String, CipherError> {
        let raw = BASE64.decode(sealed)?;
        if raw.len() < NONCE_LEN {
            return Err(CipherError::Truncated);
        }
        let (nonce_bytes, ciphertext) = raw.split_at(NONCE_LEN);
        let nonce =
            Nonce::try_assume_unique_for_key(nonce_bytes).map_err(|_| CipherError::Truncated)?;

        let mut in_out = ciphertext.to_vec();
        let plaintext = self
            .key
            .open_in_place(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| CipherError::OpenFailed)?;
        String::from_utf8(plaintext.to_vec()).map_err(|_| CipherError::NotUtf8)
    }
}
