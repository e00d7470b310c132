//! L2 — `KeyManager`: long-lived identity, signed-prekey rotation, the
//! one-time-prekey pool.
//!
//! Persistence uses the flat namespacing convention of §6 via a
//! `SecureStore`. SPK/OPK ids are 32-bit unsigned integers, monotonically
//! increasing for the lifetime of the device (§4.2 "Algorithmic rules") —
//! see DESIGN.md for why a monotonic counter was chosen over a
//! timestamp-based id assignment.

use ed25519_dalek::{Signature, SigningKey, VerifyingKey};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret as X25519Secret};

use crate::config::Config;
use crate::error::{CoreError, Result};
use crate::primitives;
use crate::store::SecureStore;

/// Long-lived per-account identity: one X25519 DH keypair, one Ed25519
/// signing keypair (spec §3 "IdentityKey").
pub struct IdentityKey {
    pub dh_public: X25519Public,
    pub dh_private: X25519Secret,
    pub sign_public: VerifyingKey,
    pub sign_private: SigningKey,
}

/// A rotatable signed prekey, identified by a dense 32-bit id.
pub struct SignedPreKey {
    pub id: u32,
    pub public: X25519Public,
    pub private: X25519Secret,
    pub signature: Signature,
    pub created_at: u64,
}

/// A single-use prekey.
pub struct OneTimePreKey {
    pub id: u32,
    pub public: X25519Public,
    pub private: X25519Secret,
}

/// Public-only tuple published to the directory (spec §3 "PreKeyBundle").
#[derive(Debug, Clone)]
pub struct PreKeyBundle {
    pub identity_public: X25519Public,
    pub identity_sign_public: VerifyingKey,
    pub spk_id: u32,
    pub spk_public: X25519Public,
    pub spk_signature: Signature,
    pub opk_id: Option<u32>,
    pub opk_public: Option<X25519Public>,
}

pub struct InitResult {
    pub new_device: bool,
    pub bundle: Option<PreKeyBundle>,
}

pub struct RotateResult {
    pub rotated: bool,
    pub new_public_bundle: Option<PreKeyBundle>,
}

// ── Wire encodings for SecureStore byte blobs ────────────────────────────────

fn encode_spk(spk: &SignedPreKey) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + 32 + 32 + 64 + 8);
    out.extend_from_slice(&spk.id.to_be_bytes());
    out.extend_from_slice(spk.public.as_bytes());
    out.extend_from_slice(&spk.private.to_bytes());
    out.extend_from_slice(&spk.signature.to_bytes());
    out.extend_from_slice(&spk.created_at.to_be_bytes());
    out
}

fn decode_spk(bytes: &[u8]) -> Result<SignedPreKey> {
    if bytes.len() != 4 + 32 + 32 + 64 + 8 {
        return Err(CoreError::Malformed("corrupt signed prekey record".into()));
    }
    let id = u32::from_be_bytes(bytes[0..4].try_into().unwrap());
    let public = X25519Public::from(<[u8; 32]>::try_from(&bytes[4..36]).unwrap());
    let private = X25519Secret::from(<[u8; 32]>::try_from(&bytes[36..68]).unwrap());
    let signature = Signature::from_bytes(&<[u8; 64]>::try_from(&bytes[68..132]).unwrap());
    let created_at = u64::from_be_bytes(bytes[132..140].try_into().unwrap());
    Ok(SignedPreKey {
        id,
        public,
        private,
        signature,
        created_at,
    })
}

fn encode_opk(opk: &OneTimePreKey) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + 32 + 32);
    out.extend_from_slice(&opk.id.to_be_bytes());
    out.extend_from_slice(opk.public.as_bytes());
    out.extend_from_slice(&opk.private.to_bytes());
    out
}

fn decode_opk(bytes: &[u8]) -> Result<OneTimePreKey> {
    if bytes.len() != 4 + 32 + 32 {
        return Err(CoreError::Malformed("corrupt one-time prekey record".into()));
    }
    let id = u32::from_be_bytes(bytes[0..4].try_into().unwrap());
    let public = X25519Public::from(<[u8; 32]>::try_from(&bytes[4..36]).unwrap());
    let private = X25519Secret::from(<[u8; 32]>::try_from(&bytes[36..68]).unwrap());
    Ok(OneTimePreKey { id, public, private })
}

fn sign_spk_public(identity: &IdentityKey, spk_public: &X25519Public) -> Signature {
    primitives::sign(spk_public.as_bytes(), &identity.sign_private)
}

/// Manages one device's identity key, SPK rotation, and OPK pool atop a
/// `SecureStore`.
pub struct KeyManager<S: SecureStore> {
    store: S,
    config: Config,
}

impl<S: SecureStore> KeyManager<S> {
    pub fn new(store: S, config: Config) -> Self {
        Self { store, config }
    }

    /// Idempotent. Creates identity/SPK/first OPK batch on first call.
    pub fn initialize(&self, now: u64) -> Result<InitResult> {
        if self.store.get("ik/private")?.is_some() {
            return Ok(InitResult {
                new_device: false,
                bundle: None,
            });
        }

        let (dh_public, dh_private) = primitives::generate_dh_keypair();
        let sign_private = primitives::generate_sign_keypair();
        let sign_public = sign_private.verifying_key();

        self.store.set("ik/private", &dh_private.to_bytes())?;
        self.store.set("ik/public", dh_public.as_bytes())?;
        self.store
            .set("ik/sign_private", &sign_private.to_bytes())?;
        self.store
            .set("ik/sign_public", &sign_public.to_bytes())?;

        let identity = self.load_identity()?;

        let (spk_public, spk_private) = primitives::generate_dh_keypair();
        let signature = sign_spk_public(&identity, &spk_public);
        let spk = SignedPreKey {
            id: 0,
            public: spk_public,
            private: spk_private,
            signature,
            created_at: now,
        };
        self.store.set("spk/current_id", &0u32.to_be_bytes())?;
        self.store.set("spk/0", &encode_spk(&spk))?;
        self.store.set("spk/rotation_ts", &now.to_be_bytes())?;

        let opk_publics = self.generate_one_time_pre_keys(self.config.opk_batch_size)?;
        let (opk_id, opk_public) = opk_publics.first().copied().unzip();

        let bundle = PreKeyBundle {
            identity_public: dh_public,
            identity_sign_public: sign_public,
            spk_id: spk.id,
            spk_public: spk.public,
            spk_signature: spk.signature,
            opk_id,
            opk_public,
        };

        Ok(InitResult {
            new_device: true,
            bundle: Some(bundle),
        })
    }

    fn load_identity(&self) -> Result<IdentityKey> {
        let dh_private = self
            .store
            .get("ik/private")?
            .ok_or_else(|| CoreError::NotFound("ik/private".into()))?;
        let dh_public = self
            .store
            .get("ik/public")?
            .ok_or_else(|| CoreError::NotFound("ik/public".into()))?;
        let sign_private = self
            .store
            .get("ik/sign_private")?
            .ok_or_else(|| CoreError::NotFound("ik/sign_private".into()))?;
        let sign_public = self
            .store
            .get("ik/sign_public")?
            .ok_or_else(|| CoreError::NotFound("ik/sign_public".into()))?;

        let dh_private = X25519Secret::from(<[u8; 32]>::try_from(dh_private.as_slice()).map_err(|_| {
            CoreError::Malformed("ik/private wrong length".into())
        })?);
        let dh_public = X25519Public::from(<[u8; 32]>::try_from(dh_public.as_slice()).map_err(|_| {
            CoreError::Malformed("ik/public wrong length".into())
        })?);
        let sign_private = SigningKey::from_bytes(&<[u8; 32]>::try_from(sign_private.as_slice()).map_err(
            |_| CoreError::Malformed("ik/sign_private wrong length".into()),
        )?);
        let sign_public = VerifyingKey::from_bytes(&<[u8; 32]>::try_from(sign_public.as_slice()).map_err(
            |_| CoreError::Malformed("ik/sign_public wrong length".into()),
        )?)
        .map_err(|e| CoreError::Malformed(e.to_string()))?;

        Ok(IdentityKey {
            dh_public,
            dh_private,
            sign_public,
            sign_private,
        })
    }

    pub fn identity(&self) -> Result<IdentityKey> {
        self.load_identity()
    }

    fn current_spk_id(&self) -> Result<u32> {
        let bytes = self
            .store
            .get("spk/current_id")?
            .ok_or_else(|| CoreError::NotFound("spk/current_id".into()))?;
        Ok(u32::from_be_bytes(
            bytes
                .as_slice()
                .try_into()
                .map_err(|_| CoreError::Malformed("spk/current_id wrong length".into()))?,
        ))
    }

    pub fn current_signed_pre_key(&self) -> Result<SignedPreKey> {
        let id = self.current_spk_id()?;
        self.signed_pre_key(id)
    }

    pub fn signed_pre_key(&self, id: u32) -> Result<SignedPreKey> {
        let bytes = self
            .store
            .get(&format!("spk/{id}"))?
            .ok_or_else(|| CoreError::NotFound(format!("spk/{id}")))?;
        decode_spk(&bytes)
    }

    /// Rotate the SPK if `now - last_rotation >= spk_rotation_days`. The
    /// previous SPK is retained under its id for the in-flight-message
    /// grace period (spec §3 "SignedPreKey").
    pub fn rotate_signed_pre_key_if_needed(&self, now: u64) -> Result<RotateResult> {
        let rotation_ts_bytes = self
            .store
            .get("spk/rotation_ts")?
            .ok_or_else(|| CoreError::NotFound("spk/rotation_ts".into()))?;
        let last_rotation = u64::from_be_bytes(
            rotation_ts_bytes
                .as_slice()
                .try_into()
                .map_err(|_| CoreError::Malformed("spk/rotation_ts wrong length".into()))?,
        );

        let rotation_interval_secs = self.config.spk_rotation_days * 24 * 60 * 60;
        if now.saturating_sub(last_rotation) < rotation_interval_secs {
            return Ok(RotateResult {
                rotated: false,
                new_public_bundle: None,
            });
        }

        let identity = self.load_identity()?;
        let new_id = self.current_spk_id()? + 1;
        let (public, private) = primitives::generate_dh_keypair();
        let signature = sign_spk_public(&identity, &public);
        let spk = SignedPreKey {
            id: new_id,
            public,
            private,
            signature,
            created_at: now,
        };
        self.store.set(&format!("spk/{new_id}"), &encode_spk(&spk))?;
        self.store
            .set("spk/current_id", &new_id.to_be_bytes())?;
        self.store.set("spk/rotation_ts", &now.to_be_bytes())?;
        tracing::info!(new_id, "rotated signed prekey");

        let bundle = PreKeyBundle {
            identity_public: identity.dh_public,
            identity_sign_public: identity.sign_public,
            spk_id: spk.id,
            spk_public: spk.public,
            spk_signature: spk.signature,
            opk_id: None,
            opk_public: None,
        };

        Ok(RotateResult {
            rotated: true,
            new_public_bundle: Some(bundle),
        })
    }

    /// Atomically remove and return an OPK. Fails `NotFound` if absent or
    /// already consumed (spec §3 invariant 4).
    pub fn consume_one_time_pre_key(&self, id: u32) -> Result<OneTimePreKey> {
        let key = format!("opk/{id}");
        let bytes = self
            .store
            .get(&key)?
            .ok_or_else(|| CoreError::NotFound(key.clone()))?;
        let opk = decode_opk(&bytes)?;
        self.store.remove(&key)?;
        Ok(opk)
    }

    /// Append `count` new OPKs with dense ascending ids; return publics only.
    pub fn generate_one_time_pre_keys(&self, count: u32) -> Result<Vec<(u32, X25519Public)>> {
        let mut next_id = match self.store.get("opk/index")? {
            Some(bytes) => u32::from_be_bytes(
                bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| CoreError::Malformed("opk/index wrong length".into()))?,
            ),
            None => 0,
        };

        let mut out = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let (public, private) = primitives::generate_dh_keypair();
            let opk = OneTimePreKey {
                id: next_id,
                public,
                private,
            };
            self.store
                .set(&format!("opk/{next_id}"), &encode_opk(&opk))?;
            out.push((next_id, public));
            next_id += 1;
        }
        self.store.set("opk/index", &next_id.to_be_bytes())?;
        Ok(out)
    }

    /// True iff the server-visible OTK count is below the refill threshold.
    pub fn needs_opk_refill(&self, server_count: u32) -> bool {
        server_count < self.config.opk_refill_threshold
    }

    /// Erase every persisted key.
    pub fn wipe_all(&self) -> Result<()> {
        self.store.clear()
    }
}
