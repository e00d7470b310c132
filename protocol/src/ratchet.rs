//! L4 — the Double Ratchet (spec §4.4).
//!
//! Grounded on `dl_crypto::ratchet::RatchetSession` for the overall shape
//! (symmetric-key ratchet per direction, a DH ratchet triggered on the
//! first message of a new sending chain, a bounded skipped-message-key
//! cache) but reparameterized to this crate's exact invariants: 32-bit
//! `n`/`pn` counters (spec §3 "RatchetState"), `Config::max_skip` /
//! `Config::max_cached_keys` instead of a fixed `MAX_SKIP`, and
//! big-endian header encoding folded into the AEAD associated data
//! rather than a separate MAC.

use std::collections::{HashMap, VecDeque};

use x25519_dalek::{PublicKey as X25519Public, StaticSecret as X25519Secret};

use crate::config::Config;
use crate::error::{CoreError, Result};
use crate::primitives;

const KDF_RK_INFO: &[u8] = b"WhisperRatchet";
const KDF_MK_INFO: &[u8] = b"WhisperMessageKeys";
const MK_CONSTANT: u8 = 0x01;
const CK_CONSTANT: u8 = 0x02;

/// Ratchet message header (spec §3 "RatchetHeader"). Carried alongside
/// the ciphertext on the wire and folded into the AEAD AAD so tampering
/// with `n`/`pn`/`dh_public` is detected at decrypt time.
#[derive(Debug, Clone)]
pub struct RatchetHeader {
    pub dh_public: X25519Public,
    pub n: u32,
    pub pn: u32,
}

impl RatchetHeader {
    /// Fixed 40-byte big-endian encoding: `dh_public(32) || pn(4) || n(4)`.
    pub fn encode(&self) -> [u8; 40] {
        let mut out = [0u8; 40];
        out[0..32].copy_from_slice(self.dh_public.as_bytes());
        out[32..36].copy_from_slice(&self.pn.to_be_bytes());
        out[36..40].copy_from_slice(&self.n.to_be_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 40 {
            return Err(CoreError::Malformed("ratchet header must be 40 bytes".into()));
        }
        let dh_public = X25519Public::from(<[u8; 32]>::try_from(&bytes[0..32]).unwrap());
        let pn = u32::from_be_bytes(bytes[32..36].try_into().unwrap());
        let n = u32::from_be_bytes(bytes[36..40].try_into().unwrap());
        Ok(Self { dh_public, n, pn })
    }
}

/// The full per-peer ratchet state (spec §3 "RatchetState").
#[derive(Clone)]
pub struct RatchetState {
    root_key: [u8; 32],
    dh_send_private: X25519Secret,
    dh_send_public: X25519Public,
    dh_recv_public: Option<X25519Public>,
    send_chain_key: Option<[u8; 32]>,
    recv_chain_key: Option<[u8; 32]>,
    send_n: u32,
    recv_n: u32,
    prev_send_n: u32,
    /// Bounded FIFO cache: `(peer_dh_public bytes, n) -> message_key`.
    skipped: HashMap<([u8; 32], u32), [u8; 32]>,
    skipped_order: VecDeque<([u8; 32], u32)>,
    max_skip: u32,
    max_cached_keys: usize,
}

impl RatchetState {
    /// Sender (Alice) side: she already knows Bob's current ratchet
    /// public key (the SPK/one-time key negotiated via X3DH) and sends
    /// first, so her sending chain is ready immediately.
    pub fn init_sender(
        shared_key: [u8; 32],
        bob_dh_public: X25519Public,
        config: &Config,
    ) -> Result<Self> {
        let (dh_send_public, dh_send_private) = primitives::generate_dh_keypair();
        let dh_out = primitives::dh(&dh_send_private, &bob_dh_public)?;
        let (root_key, send_chain_key) = kdf_rk(&shared_key, &dh_out);

        Ok(Self {
            root_key,
            dh_send_private,
            dh_send_public,
            dh_recv_public: Some(bob_dh_public),
            send_chain_key: Some(send_chain_key),
            recv_chain_key: None,
            send_n: 0,
            recv_n: 0,
            prev_send_n: 0,
            skipped: HashMap::new(),
            skipped_order: VecDeque::new(),
            max_skip: config.max_skip,
            max_cached_keys: config.max_cached_keys,
        })
    }

    /// Receiver (Bob) side: he has no peer ratchet key yet and cannot
    /// send until the first inbound message triggers a DH ratchet step.
    pub fn init_receiver(
        shared_key: [u8; 32],
        dh_self_public: X25519Public,
        dh_self_private: X25519Secret,
        config: &Config,
    ) -> Self {
        Self {
            root_key: shared_key,
            dh_send_private: dh_self_private,
            dh_send_public: dh_self_public,
            dh_recv_public: None,
            send_chain_key: None,
            recv_chain_key: None,
            send_n: 0,
            recv_n: 0,
            prev_send_n: 0,
            skipped: HashMap::new(),
            skipped_order: VecDeque::new(),
            max_skip: config.max_skip,
            max_cached_keys: config.max_cached_keys,
        }
    }

    /// Encrypt the next message in the sending chain. `aad` is
    /// additional session-level associated data (e.g. a frame type tag)
    /// prepended to the encoded header before sealing.
    pub fn encrypt(&mut self, plaintext: &[u8], aad: &[u8]) -> Result<(RatchetHeader, Vec<u8>)> {
        let chain_key = self.send_chain_key.ok_or(CoreError::NoSession)?;
        let (next_chain_key, message_key) = kdf_ck(&chain_key);
        self.send_chain_key = Some(next_chain_key);

        let header = RatchetHeader {
            dh_public: self.dh_send_public,
            n: self.send_n,
            pn: self.prev_send_n,
        };
        self.send_n += 1;

        let full_aad = combine_aad(aad, &header);
        let (enc_key, _auth_key, iv) = derive_message_keys(&message_key);
        let ciphertext = primitives::aead_seal(&enc_key, &iv, plaintext, &full_aad)?;
        Ok((header, ciphertext))
    }

    /// Decrypt an inbound message, performing a DH ratchet step if the
    /// header carries a new peer public key, and replaying from the
    /// skipped-key cache if this message was received out of order.
    ///
    /// The whole operation is staged on a clone of `self` and only
    /// committed once AEAD authentication actually succeeds: a tampered
    /// ciphertext must leave every field — `recv_n`, the skipped cache,
    /// a would-be DH ratchet step — exactly as it was before the attempt
    /// (spec §8 testable property).
    pub fn decrypt(&mut self, header: &RatchetHeader, ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        let full_aad = combine_aad(aad, header);
        let skipped_key = (*header.dh_public.as_bytes(), header.n);

        if let Some(message_key) = self.skipped.get(&skipped_key).copied() {
            let (enc_key, _auth_key, iv) = derive_message_keys(&message_key);
            let plaintext = primitives::aead_open(&enc_key, &iv, ciphertext, &full_aad)?;
            self.skipped.remove(&skipped_key);
            self.skipped_order.retain(|k| k != &skipped_key);
            return Ok(plaintext);
        }

        let mut staged = self.clone();

        let is_new_chain = match &staged.dh_recv_public {
            Some(current) => current.as_bytes() != header.dh_public.as_bytes(),
            None => true,
        };
        if is_new_chain {
            staged.skip_message_keys_for_current_chain(header.pn)?;
            staged.dh_ratchet_step(header.dh_public)?;
        }
        staged.skip_message_keys_for_current_chain(header.n)?;

        let chain_key = staged.recv_chain_key.ok_or(CoreError::NoSession)?;
        let (next_chain_key, message_key) = kdf_ck(&chain_key);
        let (enc_key, _auth_key, iv) = derive_message_keys(&message_key);
        let plaintext = primitives::aead_open(&enc_key, &iv, ciphertext, &full_aad)?;

        staged.recv_chain_key = Some(next_chain_key);
        staged.recv_n += 1;
        *self = staged;
        Ok(plaintext)
    }

    fn skip_message_keys_for_current_chain(&mut self, until: u32) -> Result<()> {
        let Some(mut chain_key) = self.recv_chain_key else {
            return Ok(());
        };
        let Some(dh_recv_public) = self.dh_recv_public else {
            return Ok(());
        };

        if until.saturating_sub(self.recv_n) > self.max_skip {
            let gap = until - self.recv_n;
            tracing::warn!(gap, max_skip = self.max_skip, "refusing to skip past max_skip");
            return Err(CoreError::TooManySkipped(gap));
        }

        while self.recv_n < until {
            let (next_chain_key, message_key) = kdf_ck(&chain_key);
            self.insert_skipped(dh_recv_public, self.recv_n, message_key);
            chain_key = next_chain_key;
            self.recv_n += 1;
        }
        self.recv_chain_key = Some(chain_key);
        Ok(())
    }

    fn insert_skipped(&mut self, dh_public: X25519Public, n: u32, message_key: [u8; 32]) {
        let key = (*dh_public.as_bytes(), n);
        self.skipped.insert(key, message_key);
        self.skipped_order.push_back(key);
        while self.skipped_order.len() > self.max_cached_keys {
            if let Some(oldest) = self.skipped_order.pop_front() {
                self.skipped.remove(&oldest);
            }
        }
    }

    fn dh_ratchet_step(&mut self, new_recv_public: X25519Public) -> Result<()> {
        self.prev_send_n = self.send_n;
        self.send_n = 0;
        self.recv_n = 0;
        self.dh_recv_public = Some(new_recv_public);

        let recv_dh_out = primitives::dh(&self.dh_send_private, &new_recv_public)?;
        let (root_key, recv_chain_key) = kdf_rk(&self.root_key, &recv_dh_out);
        self.root_key = root_key;
        self.recv_chain_key = Some(recv_chain_key);

        let (new_dh_public, new_dh_private) = primitives::generate_dh_keypair();
        self.dh_send_public = new_dh_public;
        self.dh_send_private = new_dh_private;

        let send_dh_out = primitives::dh(&self.dh_send_private, &new_recv_public)?;
        let (root_key, send_chain_key) = kdf_rk(&self.root_key, &send_dh_out);
        self.root_key = root_key;
        self.send_chain_key = Some(send_chain_key);

        Ok(())
    }

    pub fn current_dh_public(&self) -> X25519Public {
        self.dh_send_public
    }

    /// Size of the skipped-message-key cache (spec §3 invariant 3), for
    /// host-level telemetry and tests.
    pub fn skipped_len(&self) -> usize {
        self.skipped_order.len()
    }

    /// Serialize full ratchet state for persistence (spec §6 "Secure
    /// store"). Layout is a flat sequence of fixed-width fields followed
    /// by the skipped-key cache in FIFO order, so `import_state` can
    /// rebuild `skipped_order` exactly.
    pub fn export_state(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.root_key);
        out.extend_from_slice(&self.dh_send_private.to_bytes());
        out.extend_from_slice(self.dh_send_public.as_bytes());
        write_optional_public(&mut out, &self.dh_recv_public);
        write_optional_chain(&mut out, &self.send_chain_key);
        write_optional_chain(&mut out, &self.recv_chain_key);
        out.extend_from_slice(&self.send_n.to_be_bytes());
        out.extend_from_slice(&self.recv_n.to_be_bytes());
        out.extend_from_slice(&self.prev_send_n.to_be_bytes());
        out.extend_from_slice(&(self.skipped_order.len() as u32).to_be_bytes());
        for (dh_bytes, n) in &self.skipped_order {
            out.extend_from_slice(dh_bytes);
            out.extend_from_slice(&n.to_be_bytes());
            out.extend_from_slice(&self.skipped[&(*dh_bytes, *n)]);
        }
        out
    }

    pub fn import_state(bytes: &[u8], config: &Config) -> Result<Self> {
        let mut cur = bytes;
        let root_key = take_32(&mut cur)?;
        let dh_send_private = X25519Secret::from(take_32(&mut cur)?);
        let dh_send_public = X25519Public::from(take_32(&mut cur)?);
        let dh_recv_public = read_optional_public(&mut cur)?;
        let send_chain_key = read_optional_chain(&mut cur)?;
        let recv_chain_key = read_optional_chain(&mut cur)?;
        let send_n = take_u32(&mut cur)?;
        let recv_n = take_u32(&mut cur)?;
        let prev_send_n = take_u32(&mut cur)?;
        let skipped_count = take_u32(&mut cur)?;

        let mut skipped = HashMap::new();
        let mut skipped_order = VecDeque::new();
        for _ in 0..skipped_count {
            let dh_bytes = take_32(&mut cur)?;
            let n = take_u32(&mut cur)?;
            let key = take_32(&mut cur)?;
            skipped.insert((dh_bytes, n), key);
            skipped_order.push_back((dh_bytes, n));
        }

        Ok(Self {
            root_key,
            dh_send_private,
            dh_send_public,
            dh_recv_public,
            send_chain_key,
            recv_chain_key,
            send_n,
            recv_n,
            prev_send_n,
            skipped,
            skipped_order,
            max_skip: config.max_skip,
            max_cached_keys: config.max_cached_keys,
        })
    }
}

fn write_optional_public(out: &mut Vec<u8>, value: &Option<X25519Public>) {
    match value {
        Some(public) => {
            out.push(1);
            out.extend_from_slice(public.as_bytes());
        }
        None => out.push(0),
    }
}

fn write_optional_chain(out: &mut Vec<u8>, value: &Option<[u8; 32]>) {
    match value {
        Some(chain) => {
            out.push(1);
            out.extend_from_slice(chain);
        }
        None => out.push(0),
    }
}

fn read_optional_public(cur: &mut &[u8]) -> Result<Option<X25519Public>> {
    let flag = take_u8(cur)?;
    match flag {
        0 => Ok(None),
        1 => Ok(Some(X25519Public::from(take_32(cur)?))),
        _ => Err(CoreError::Malformed("bad optional-public flag".into())),
    }
}

fn read_optional_chain(cur: &mut &[u8]) -> Result<Option<[u8; 32]>> {
    let flag = take_u8(cur)?;
    match flag {
        0 => Ok(None),
        1 => Ok(Some(take_32(cur)?)),
        _ => Err(CoreError::Malformed("bad optional-chain flag".into())),
    }
}

fn take_u8(cur: &mut &[u8]) -> Result<u8> {
    if cur.is_empty() {
        return Err(CoreError::Malformed("truncated ratchet state".into()));
    }
    let value = cur[0];
    *cur = &cur[1..];
    Ok(value)
}

fn take_u32(cur: &mut &[u8]) -> Result<u32> {
    if cur.len() < 4 {
        return Err(CoreError::Malformed("truncated ratchet state".into()));
    }
    let value = u32::from_be_bytes(cur[0..4].try_into().unwrap());
    *cur = &cur[4..];
    Ok(value)
}

fn take_32(cur: &mut &[u8]) -> Result<[u8; 32]> {
    if cur.len() < 32 {
        return Err(CoreError::Malformed("truncated ratchet state".into()));
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&cur[0..32]);
    *cur = &cur[32..];
    Ok(out)
}

fn combine_aad(external_aad: &[u8], header: &RatchetHeader) -> Vec<u8> {
    let mut out = Vec::with_capacity(external_aad.len() + 40);
    out.extend_from_slice(external_aad);
    out.extend_from_slice(&header.encode());
    out
}

/// `derive_message_keys(mk) = HKDF(ikm=mk, salt=zero32, info="WhisperMessageKeys", len=80)`
/// (spec §4.4) — splits a chain's message key into an AEAD encryption
/// key, an auth key, and a nonce. `auth_key` is part of this derivation's
/// named output but unused by this crate's AEAD choice (ChaCha20-Poly1305
/// already authenticates; a detached HMAC only matters for a
/// non-AEAD cipher construction) — it is zeroized immediately rather
/// than threaded further.
fn derive_message_keys(message_key: &[u8; 32]) -> ([u8; 32], [u8; 32], [u8; 12]) {
    let okm = primitives::hkdf(message_key, &[], KDF_MK_INFO, 80)
        .expect("hkdf with fixed 80-byte output never exceeds the RFC 5869 bound");
    let mut enc_key = [0u8; 32];
    let mut auth_key = [0u8; 32];
    let mut iv = [0u8; 12];
    enc_key.copy_from_slice(&okm[0..32]);
    auth_key.copy_from_slice(&okm[32..64]);
    iv.copy_from_slice(&okm[64..80]);
    use zeroize::Zeroize;
    auth_key.zeroize();
    (enc_key, auth_key, iv)
}

fn kdf_rk(root_key: &[u8; 32], dh_out: &[u8; 32]) -> ([u8; 32], [u8; 32]) {
    let okm = primitives::hkdf(dh_out, root_key, KDF_RK_INFO, 64)
        .expect("hkdf with fixed 64-byte output never exceeds the RFC 5869 bound");
    let mut new_root = [0u8; 32];
    let mut chain_key = [0u8; 32];
    new_root.copy_from_slice(&okm[0..32]);
    chain_key.copy_from_slice(&okm[32..64]);
    (new_root, chain_key)
}

fn kdf_ck(chain_key: &[u8; 32]) -> ([u8; 32], [u8; 32]) {
    let next_chain_key = primitives::hmac_sha256(chain_key, &[CK_CONSTANT]);
    let message_key = primitives::hmac_sha256(chain_key, &[MK_CONSTANT]);
    (next_chain_key, message_key)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paired_states() -> (RatchetState, RatchetState) {
        let config = Config::default();
        let shared_key = [9u8; 32];
        let (bob_public, bob_private) = primitives::generate_dh_keypair();

        let alice = RatchetState::init_sender(shared_key, bob_public, &config).unwrap();
        let bob = RatchetState::init_receiver(shared_key, bob_public, bob_private, &config);
        (alice, bob)
    }

    #[test]
    fn in_order_roundtrip() {
        let (mut alice, mut bob) = paired_states();
        let (header, ct) = alice.encrypt(b"hello bob", b"aad").unwrap();
        let pt = bob.decrypt(&header, &ct, b"aad").unwrap();
        assert_eq!(pt, b"hello bob");
    }

    #[test]
    fn full_bidirectional_ratchet() {
        let (mut alice, mut bob) = paired_states();
        let (h1, c1) = alice.encrypt(b"a->b 1", b"").unwrap();
        assert_eq!(bob.decrypt(&h1, &c1, b"").unwrap(), b"a->b 1");

        let (h2, c2) = bob.encrypt(b"b->a 1", b"").unwrap();
        assert_eq!(alice.decrypt(&h2, &c2, b"").unwrap(), b"b->a 1");

        let (h3, c3) = alice.encrypt(b"a->b 2", b"").unwrap();
        assert_eq!(bob.decrypt(&h3, &c3, b"").unwrap(), b"a->b 2");
    }

    #[test]
    fn out_of_order_messages_are_cached_and_replayed() {
        let (mut alice, mut bob) = paired_states();
        let (h1, c1) = alice.encrypt(b"msg1", b"").unwrap();
        let (h2, c2) = alice.encrypt(b"msg2", b"").unwrap();
        let (h3, c3) = alice.encrypt(b"msg3", b"").unwrap();

        assert_eq!(bob.decrypt(&h3, &c3, b"").unwrap(), b"msg3");
        assert_eq!(bob.decrypt(&h1, &c1, b"").unwrap(), b"msg1");
        assert_eq!(bob.decrypt(&h2, &c2, b"").unwrap(), b"msg2");
    }

    #[test]
    fn exceeding_max_skip_is_rejected() {
        let config = Config {
            max_skip: 3,
            ..Config::default()
        };
        let shared_key = [3u8; 32];
        let (bob_public, bob_private) = primitives::generate_dh_keypair();
        let mut alice = RatchetState::init_sender(shared_key, bob_public, &config).unwrap();
        let mut bob = RatchetState::init_receiver(shared_key, bob_public, bob_private, &config);

        for _ in 0..5 {
            alice.encrypt(b"filler", b"").unwrap();
        }
        let (header, ct) = alice.encrypt(b"too far ahead", b"").unwrap();
        assert_eq!(
            bob.decrypt(&header, &ct, b""),
            Err(CoreError::TooManySkipped(header.n))
        );
    }

    #[test]
    fn tampered_header_fails_authentication() {
        let (mut alice, mut bob) = paired_states();
        let (mut header, ct) = alice.encrypt(b"hello", b"").unwrap();
        header.pn += 1;
        assert!(bob.decrypt(&header, &ct, b"").is_err());
    }

    #[test]
    fn skipped_cache_is_bounded_fifo() {
        let config = Config {
            max_skip: 10_000,
            max_cached_keys: 2,
            ..Config::default()
        };
        let shared_key = [5u8; 32];
        let (bob_public, bob_private) = primitives::generate_dh_keypair();
        let mut alice = RatchetState::init_sender(shared_key, bob_public, &config).unwrap();
        let mut bob = RatchetState::init_receiver(shared_key, bob_public, bob_private, &config);

        let mut messages = Vec::new();
        for i in 0..4 {
            messages.push(alice.encrypt(format!("m{i}").as_bytes(), b"").unwrap());
        }
        // Decrypt only the last one; this skips 0..=2, evicting the oldest
        // skipped entries once the cache exceeds max_cached_keys.
        let (header, ct) = messages.last().unwrap().clone();
        bob.decrypt(&header, &ct, b"").unwrap();
        assert!(bob.skipped.len() <= 2);

        // The oldest skipped key (message 0) should have been evicted and is
        // no longer decryptable.
        let (h0, c0) = messages[0].clone();
        assert!(bob.decrypt(&h0, &c0, b"").is_err());
    }

    #[test]
    fn export_import_round_trip_preserves_chain_position() {
        let config = Config::default();
        let (mut alice, mut bob) = paired_states();
        let (h1, c1) = alice.encrypt(b"before export", b"").unwrap();
        bob.decrypt(&h1, &c1, b"").unwrap();

        let exported = alice.export_state();
        let mut restored = RatchetState::import_state(&exported, &config).unwrap();

        let (h2, c2) = restored.encrypt(b"after import", b"").unwrap();
        assert_eq!(bob.decrypt(&h2, &c2, b"").unwrap(), b"after import");
    }
}
