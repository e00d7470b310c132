//! L1 — cryptographic primitives.
//!
//! Thin, direct wrappers over `x25519-dalek`, `ed25519-dalek`, `hkdf`,
//! `hmac`/`sha2` and `chacha20poly1305`. No primitive here logs its inputs;
//! every secret-bearing return type is wiped on drop by its own crate
//! (`x25519-dalek`/`ed25519-dalek` are built with the `zeroize` feature) or,
//! where we hold raw `[u8; 32]` buffers ourselves, by an explicit
//! `Zeroize`/`Drop` at the call site.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key as AeadKey, Nonce as AeadNonce,
};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::{rngs::OsRng, RngCore};
use sha2::Sha256;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret as X25519Secret};

use crate::error::{CoreError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Generate a fresh X25519 keypair.
pub fn generate_dh_keypair() -> (X25519Public, X25519Secret) {
    let secret = X25519Secret::random_from_rng(OsRng);
    let public = X25519Public::from(&secret);
    (public, secret)
}

/// Diffie-Hellman; fails `InvalidKey` if the result is a low-order /
/// all-zero shared secret (small-subgroup / degenerate-point attack).
pub fn dh(secret: &X25519Secret, peer_public: &X25519Public) -> Result<[u8; 32]> {
    let shared = secret.diffie_hellman(peer_public);
    if shared.as_bytes().iter().all(|b| *b == 0) {
        return Err(CoreError::InvalidKey(
            "diffie-hellman produced a degenerate (all-zero) shared secret".into(),
        ));
    }
    Ok(*shared.as_bytes())
}

/// Generate a fresh Ed25519 signing keypair.
pub fn generate_sign_keypair() -> SigningKey {
    SigningKey::generate(&mut OsRng)
}

/// Sign `msg` with an Ed25519 private key.
pub fn sign(msg: &[u8], signing_key: &SigningKey) -> Signature {
    signing_key.sign(msg)
}

/// Verify an Ed25519 signature over `msg`.
pub fn verify(msg: &[u8], sig: &Signature, verifying_key: &VerifyingKey) -> Result<()> {
    verifying_key
        .verify(msg, sig)
        .map_err(|_| CoreError::InvalidBundle("signature verification failed".into()))
}

/// HMAC-SHA-256.
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// RFC 5869 HKDF-SHA-256. `salt` defaults to 32 zero bytes when empty.
/// Fails when `out_len > 255*32` (the RFC's expand limit).
pub fn hkdf(ikm: &[u8], salt: &[u8], info: &[u8], out_len: usize) -> Result<Vec<u8>> {
    if out_len > 255 * 32 {
        return Err(CoreError::InvalidKey(format!(
            "hkdf output length {out_len} exceeds 255*HashLen"
        )));
    }
    let zero_salt = [0u8; 32];
    let salt = if salt.is_empty() { &zero_salt[..] } else { salt };
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut okm = vec![0u8; out_len];
    hk.expand(info, &mut okm)
        .map_err(|e| CoreError::InvalidKey(format!("hkdf expand failed: {e}")))?;
    Ok(okm)
}

/// AEAD seal: ChaCha20-Poly1305, 12-byte nonce, 16-byte tag appended.
pub fn aead_seal(key32: &[u8; 32], nonce12: &[u8; 12], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(AeadKey::from_slice(key32));
    let nonce = AeadNonce::from_slice(nonce12);
    cipher
        .encrypt(nonce, Payload { msg: plaintext, aad })
        .map_err(|_| CoreError::InvalidKey("aead seal failed".into()))
}

/// AEAD open; fails `AuthFailed` on tag mismatch.
pub fn aead_open(key32: &[u8; 32], nonce12: &[u8; 12], ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(AeadKey::from_slice(key32));
    let nonce = AeadNonce::from_slice(nonce12);
    cipher
        .decrypt(nonce, Payload { msg: ciphertext, aad })
        .map_err(|_| CoreError::AuthFailed)
}

/// `n` bytes from the OS CSPRNG.
pub fn random_bytes(n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    OsRng.fill_bytes(&mut buf);
    buf
}

/// Constant-time byte comparison.
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
