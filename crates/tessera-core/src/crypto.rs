//! Symmetric primitives: SHA-512 digests, HKDF-SHA-512 derivation and
//! AES-256-GCM envelope encryption with the content-set identifier bound as
//! AAD.

use aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha512};
use subtle::ConstantTimeEq;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::envelope::{EncryptedEnvelope, AES_256_GCM, IV_LEN, TAG_LEN};
use crate::error::{Result, TesseraError};

pub const KEY_LEN: usize = 32;

pub fn sha512(data: &[u8]) -> [u8; 64] {
    let mut hasher = Sha512::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// 128-hex-character digest, the integrity format used everywhere in the
/// persisted model.
pub fn sha512_hex(data: &[u8]) -> String {
    hex::encode(sha512(data))
}

/// Constant-time comparison of two hex digests.
pub fn digest_eq(a: &str, b: &str) -> bool {
    a.len() == b.len() && a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// HKDF-SHA-512 extract-then-expand.
pub fn hkdf_sha512(ikm: &[u8], salt: &[u8], info: &[u8], out_len: usize) -> Result<Vec<u8>> {
    let hk = Hkdf::<Sha512>::new(Some(salt), ikm);
    let mut okm = vec![0u8; out_len];
    hk.expand(info, &mut okm)
        .map_err(|_| TesseraError::Precondition(format!("hkdf output length {out_len} too large")))?;
    Ok(okm)
}

/// 32-byte HKDF-SHA-512 derivation. The output length is a compile-time
/// constant well under the RFC 5869 bound, so expand cannot fail.
pub fn derive_key_32(ikm: &[u8], salt: &[u8], info: &[u8]) -> Zeroizing<[u8; 32]> {
    let hk = Hkdf::<Sha512>::new(Some(salt), ikm);
    let mut okm = Zeroizing::new([0u8; 32]);
    hk.expand(info, okm.as_mut()).expect("32-byte HKDF expand");
    okm
}

fn check_key(key: &[u8]) -> Result<()> {
    if key.len() != KEY_LEN {
        return Err(TesseraError::InvalidKeyLength(key.len()));
    }
    Ok(())
}

/// Encrypt one content-set payload. Every call draws a fresh random 12-byte
/// IV; the AAD is the UTF-8 identifier of the content set, so an envelope
/// cannot be replayed under another set.
pub fn encrypt(
    plaintext: &[u8],
    key: &[u8],
    key_id: Uuid,
    content_set_identifier: &str,
) -> Result<EncryptedEnvelope> {
    check_key(key)?;

    let mut iv = [0u8; IV_LEN];
    OsRng
        .try_fill_bytes(&mut iv)
        .map_err(|e| TesseraError::RngFailure(e.to_string()))?;

    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| TesseraError::InvalidKeyLength(key.len()))?;
    let mut sealed = cipher
        .encrypt(
            Nonce::from_slice(&iv),
            Payload {
                msg: plaintext,
                aad: content_set_identifier.as_bytes(),
            },
        )
        .map_err(|_| TesseraError::AeadAuthentication {
            content_set: content_set_identifier.to_string(),
        })?;

    // aes-gcm appends the 16-byte tag; the envelope stores it separately
    let tag_offset = sealed.len() - TAG_LEN;
    let mut auth_tag = [0u8; TAG_LEN];
    auth_tag.copy_from_slice(&sealed[tag_offset..]);
    sealed.truncate(tag_offset);

    Ok(EncryptedEnvelope {
        content_set_identifier: content_set_identifier.to_string(),
        iv,
        auth_tag,
        plaintext_hash: sha512_hex(plaintext),
        ciphertext_hash: sha512_hex(&sealed),
        ciphertext: sealed,
        key_id,
        algorithm: AES_256_GCM.to_string(),
        encrypted_at: chrono::Utc::now(),
    })
}

/// Decrypt an envelope, verifying in order: stored ciphertext hash, GCM tag
/// under the envelope's own content-set AAD, stored plaintext hash.
pub fn decrypt(envelope: &EncryptedEnvelope, key: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    check_key(key)?;

    if !digest_eq(&sha512_hex(&envelope.ciphertext), &envelope.ciphertext_hash) {
        return Err(TesseraError::CiphertextIntegrity {
            content_set: envelope.content_set_identifier.clone(),
        });
    }

    let mut sealed = Vec::with_capacity(envelope.ciphertext.len() + TAG_LEN);
    sealed.extend_from_slice(&envelope.ciphertext);
    sealed.extend_from_slice(&envelope.auth_tag);

    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| TesseraError::InvalidKeyLength(key.len()))?;
    let plaintext = cipher
        .decrypt(
            Nonce::from_slice(&envelope.iv),
            Payload {
                msg: &sealed,
                aad: envelope.content_set_identifier.as_bytes(),
            },
        )
        .map(Zeroizing::new)
        .map_err(|_| TesseraError::AeadAuthentication {
            content_set: envelope.content_set_identifier.clone(),
        })?;

    if !digest_eq(&sha512_hex(&plaintext), &envelope.plaintext_hash) {
        return Err(TesseraError::PlaintextIntegrity {
            content_set: envelope.content_set_identifier.clone(),
        });
    }

    Ok(plaintext)
}

/// Decrypt under `old_key` (all three integrity checks) and seal again under
/// `new_key` for the same content set. The plaintext hash carries over
/// unchanged; IV and ciphertext are new.
pub fn re_encrypt(
    envelope: &EncryptedEnvelope,
    old_key: &[u8],
    new_key: &[u8],
    new_key_id: Uuid,
) -> Result<EncryptedEnvelope> {
    let plaintext = decrypt(envelope, old_key)?;
    encrypt(&plaintext, new_key, new_key_id, &envelope.content_set_identifier)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    fn key_a() -> [u8; 32] {
        [7u8; 32]
    }

    fn key_b() -> [u8; 32] {
        [9u8; 32]
    }

    #[test]
    fn sha512_known_answer() {
        // NIST vector for "abc"
        let expected = hex!(
            "ddaf35a193617abacc417349ae20413112e6fa4e89a97ea20a9eeee64b55d39a"
            "2192992a274fc1a836ba3c23a3feebbd454d4423643ce80e2a9ac94fa54ca49f"
        );
        assert_eq!(sha512(b"abc"), expected);
        assert_eq!(sha512_hex(b"abc").len(), 128);
    }

    #[test]
    fn round_trip() {
        let env = encrypt(b"Budget $4.2M.", &key_a(), Uuid::new_v4(), "CS-CONFIDENTIAL").unwrap();
        let pt = decrypt(&env, &key_a()).unwrap();
        assert_eq!(&*pt, b"Budget $4.2M.");
    }

    #[test]
    fn fresh_iv_every_call() {
        let key = key_a();
        let id = Uuid::new_v4();
        let a = encrypt(b"same plaintext", &key, id, "CS-PUBLIC").unwrap();
        let b = encrypt(b"same plaintext", &key, id, "CS-PUBLIC").unwrap();
        assert_ne!(a.iv, b.iv);
        assert_ne!(a.ciphertext, b.ciphertext);
        assert_eq!(a.plaintext_hash, b.plaintext_hash);
    }

    #[test]
    fn aad_binds_content_set() {
        let env = encrypt(b"payload", &key_a(), Uuid::new_v4(), "CS-SECRET").unwrap();
        let mut swapped = env.clone();
        swapped.content_set_identifier = "CS-PUBLIC".to_string();
        let err = decrypt(&swapped, &key_a()).unwrap_err();
        assert!(matches!(err, TesseraError::AeadAuthentication { .. }));
    }

    #[test]
    fn ciphertext_tamper_detected_before_aead() {
        let env = encrypt(b"payload", &key_a(), Uuid::new_v4(), "CS-SECRET").unwrap();
        let mut tampered = env.clone();
        tampered.ciphertext[0] ^= 0x80;
        let err = decrypt(&tampered, &key_a()).unwrap_err();
        assert!(matches!(err, TesseraError::CiphertextIntegrity { .. }));
    }

    #[test]
    fn tag_tamper_fails_aead() {
        let env = encrypt(b"payload", &key_a(), Uuid::new_v4(), "CS-SECRET").unwrap();
        let mut tampered = env.clone();
        tampered.auth_tag[0] ^= 1;
        let err = decrypt(&tampered, &key_a()).unwrap_err();
        assert!(matches!(err, TesseraError::AeadAuthentication { .. }));
    }

    #[test]
    fn stale_plaintext_hash_detected() {
        let mut env = encrypt(b"payload", &key_a(), Uuid::new_v4(), "CS-SECRET").unwrap();
        env.plaintext_hash = sha512_hex(b"something else");
        let err = decrypt(&env, &key_a()).unwrap_err();
        assert!(matches!(err, TesseraError::PlaintextIntegrity { .. }));
    }

    #[test]
    fn wrong_key_length_rejected() {
        let err = encrypt(b"p", &[0u8; 16], Uuid::new_v4(), "CS-PUBLIC").unwrap_err();
        assert!(matches!(err, TesseraError::InvalidKeyLength(16)));
    }

    #[test]
    fn re_encrypt_preserves_plaintext_hash() {
        let new_id = Uuid::new_v4();
        let env = encrypt(b"rotate me", &key_a(), Uuid::new_v4(), "CS-PUBLIC").unwrap();
        let rotated = re_encrypt(&env, &key_a(), &key_b(), new_id).unwrap();
        assert_eq!(rotated.plaintext_hash, env.plaintext_hash);
        assert_ne!(rotated.iv, env.iv);
        assert_ne!(rotated.ciphertext, env.ciphertext);
        assert_eq!(rotated.key_id, new_id);
        assert_eq!(&*decrypt(&rotated, &key_b()).unwrap(), b"rotate me");
    }

    #[test]
    fn hkdf_sha512_expand_lengths() {
        let okm = hkdf_sha512(b"ikm", b"salt", b"info", 80).unwrap();
        assert_eq!(okm.len(), 80);
        // first 64 bytes are T(1); asking for 64 must be a prefix of asking for 80
        let prefix = hkdf_sha512(b"ikm", b"salt", b"info", 64).unwrap();
        assert_eq!(&okm[..64], &prefix[..]);
    }
}
