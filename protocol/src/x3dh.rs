//! L3 — X3DH initial key agreement (spec §4.3).
//!
//! Grounded on the DH-chaining shape of `dl_crypto::x3dh` (DH1..DH4, a
//! constant `0xFF` prefix that domain-separates the IKM from a
//! degenerate all-zero DH4 when no OPK is available, single HKDF-SHA-256
//! expand to the session key) but reworked around this crate's
//! two-independent-keypair `IdentityKey` (spec §3) rather than a
//! birational Edwards/Montgomery conversion.

use x25519_dalek::{PublicKey as X25519Public, StaticSecret as X25519Secret};

use crate::error::{CoreError, Result};
use crate::keys::{IdentityKey, OneTimePreKey, PreKeyBundle, SignedPreKey};
use crate::primitives;

const X3DH_INFO: &[u8] = b"WhisperText";

/// Output of the sender (Alice) side of X3DH.
pub struct X3dhSendResult {
    pub shared_key: [u8; 32],
    pub ephemeral_public: X25519Public,
    pub used_opk_id: Option<u32>,
}

/// Verify `bundle`'s SPK signature under its advertised identity signing key.
pub fn verify_bundle(bundle: &PreKeyBundle) -> Result<()> {
    primitives::verify(
        bundle.spk_public.as_bytes(),
        &bundle.spk_signature,
        &bundle.identity_sign_public,
    )
}

/// Session-level associated data (spec §4.3 step 6): `IK_pub_sender ||
/// IK_pub_recipient`, fixed for the lifetime of the session and folded
/// into every Double Ratchet AEAD call alongside the per-message header.
pub fn associated_data(sender_identity_public: &X25519Public, recipient_identity_public: &X25519Public) -> [u8; 64] {
    let mut out = [0u8; 64];
    out[0..32].copy_from_slice(sender_identity_public.as_bytes());
    out[32..64].copy_from_slice(recipient_identity_public.as_bytes());
    out
}

/// Sender side (spec §4.3, Alice). `ephemeral_private` is freshly
/// generated per session by the caller so tests can supply a fixed one.
pub fn x3dh_sender(
    identity: &IdentityKey,
    ephemeral_private: &X25519Secret,
    bundle: &PreKeyBundle,
) -> Result<X3dhSendResult> {
    verify_bundle(bundle)?;

    let ephemeral_public = X25519Public::from(ephemeral_private);

    let dh1 = primitives::dh(&identity.dh_private, &bundle.spk_public)?;
    let dh2 = primitives::dh(ephemeral_private, &bundle.identity_public)?;
    let dh3 = primitives::dh(ephemeral_private, &bundle.spk_public)?;
    let dh4 = match bundle.opk_public {
        Some(opk_public) => Some(primitives::dh(ephemeral_private, &opk_public)?),
        None => None,
    };

    let ikm = build_ikm(&dh1, &dh2, &dh3, dh4.as_ref());
    let okm = primitives::hkdf(&ikm, &[], X3DH_INFO, 32)?;
    let mut shared_key = [0u8; 32];
    shared_key.copy_from_slice(&okm);

    Ok(X3dhSendResult {
        shared_key,
        ephemeral_public,
        used_opk_id: bundle.opk_id,
    })
}

/// Receiver side (spec §4.3, Bob). `opk` is `None` when the PreKey
/// message referenced no one-time key or it was already consumed
/// elsewhere; callers decide whether that is `DuplicateMessage`.
pub fn x3dh_receiver(
    identity: &IdentityKey,
    spk: &SignedPreKey,
    opk: Option<&OneTimePreKey>,
    sender_identity_public: &X25519Public,
    sender_ephemeral_public: &X25519Public,
) -> Result<[u8; 32]> {
    let dh1 = primitives::dh(&spk.private, sender_identity_public)?;
    let dh2 = primitives::dh(&identity.dh_private, sender_ephemeral_public)?;
    let dh3 = primitives::dh(&spk.private, sender_ephemeral_public)?;
    let dh4 = match opk {
        Some(opk) => Some(primitives::dh(&opk.private, sender_ephemeral_public)?),
        None => None,
    };

    let ikm = build_ikm(&dh1, &dh2, &dh3, dh4.as_ref());
    let okm = primitives::hkdf(&ikm, &[], X3DH_INFO, 32)
        .map_err(|_| CoreError::InvalidKey("x3dh hkdf expand failed".into()))?;
    let mut shared_key = [0u8; 32];
    shared_key.copy_from_slice(&okm);
    Ok(shared_key)
}

fn build_ikm(dh1: &[u8; 32], dh2: &[u8; 32], dh3: &[u8; 32], dh4: Option<&[u8; 32]>) -> Vec<u8> {
    let mut ikm = Vec::with_capacity(32 + 32 * 4);
    ikm.extend_from_slice(&[0xFFu8; 32]);
    ikm.extend_from_slice(dh1);
    ikm.extend_from_slice(dh2);
    ikm.extend_from_slice(dh3);
    if let Some(dh4) = dh4 {
        ikm.extend_from_slice(dh4);
    }
    ikm
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::keys::KeyManager;
    use crate::store::MemoryStore;

    fn new_manager() -> KeyManager<MemoryStore> {
        KeyManager::new(MemoryStore::new(), Config::default())
    }

    #[test]
    fn sender_and_receiver_agree_with_opk() {
        let bob_km = new_manager();
        let bob_init = bob_km.initialize(0).unwrap();
        let bundle = bob_init.bundle.unwrap();
        let bob_identity = bob_km.identity().unwrap();
        let bob_spk = bob_km.current_signed_pre_key().unwrap();
        let opk_id = bundle.opk_id.unwrap();
        let bob_opk = bob_km.consume_one_time_pre_key(opk_id).unwrap();

        let alice_km = new_manager();
        alice_km.initialize(0).unwrap();
        let alice_identity = alice_km.identity().unwrap();

        let (_, ephemeral_private) = primitives::generate_dh_keypair();
        let send = x3dh_sender(&alice_identity, &ephemeral_private, &bundle).unwrap();

        let recv = x3dh_receiver(
            &bob_identity,
            &bob_spk,
            Some(&bob_opk),
            &alice_identity.dh_public,
            &send.ephemeral_public,
        )
        .unwrap();

        assert_eq!(send.shared_key, recv);
    }

    #[test]
    fn sender_and_receiver_agree_without_opk() {
        let bob_km = new_manager();
        let bob_init = bob_km.initialize(0).unwrap();
        let mut bundle = bob_init.bundle.unwrap();
        bundle.opk_id = None;
        bundle.opk_public = None;
        let bob_identity = bob_km.identity().unwrap();
        let bob_spk = bob_km.current_signed_pre_key().unwrap();

        let alice_km = new_manager();
        alice_km.initialize(0).unwrap();
        let alice_identity = alice_km.identity().unwrap();

        let (_, ephemeral_private) = primitives::generate_dh_keypair();
        let send = x3dh_sender(&alice_identity, &ephemeral_private, &bundle).unwrap();

        let recv = x3dh_receiver(
            &bob_identity,
            &bob_spk,
            None,
            &alice_identity.dh_public,
            &send.ephemeral_public,
        )
        .unwrap();

        assert_eq!(send.shared_key, recv);
    }

    #[test]
    fn tampered_spk_signature_rejected() {
        let bob_km = new_manager();
        let bob_init = bob_km.initialize(0).unwrap();
        let mut bundle = bob_init.bundle.unwrap();
        // Swap in an unrelated identity's signature.
        let other_km = new_manager();
        let other_bundle = other_km.initialize(0).unwrap().bundle.unwrap();
        bundle.spk_signature = other_bundle.spk_signature;

        let alice_km = new_manager();
        alice_km.initialize(0).unwrap();
        let alice_identity = alice_km.identity().unwrap();
        let (_, ephemeral_private) = primitives::generate_dh_keypair();

        assert!(x3dh_sender(&alice_identity, &ephemeral_private, &bundle).is_err());
    }
}
