//! Tunables enumerated in spec §6 ("Configuration (enumerated)").

/// Runtime configuration for a `KeyManager` / `SessionManager` pair.
///
/// Cloned cheaply and passed down to every layer that needs a bound; there
/// is deliberately no global/ambient config singleton (see DESIGN.md
/// "Global state").
#[derive(Debug, Clone)]
pub struct Config {
    /// In-chain skip ceiling for a single `decrypt` call (spec §4.4).
    pub max_skip: u32,
    /// `|SKIPPED|` ceiling across the lifetime of a session (spec §3 invariant 3).
    pub max_cached_keys: usize,
    /// How many one-time prekeys `generate_one_time_pre_keys` appends by default.
    pub opk_batch_size: u32,
    /// Below this server-visible OTK count, `needs_opk_refill` returns true.
    pub opk_refill_threshold: u32,
    /// SPK rotation interval.
    pub spk_rotation_days: u64,
    /// Domain-separation bytes mixed into the safety-number derivation.
    pub app_id_bytes: Vec<u8>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_skip: 1000,
            max_cached_keys: 2000,
            opk_batch_size: 100,
            opk_refill_threshold: 20,
            spk_rotation_days: 30,
            app_id_bytes: b"secure-messaging-core".to_vec(),
        }
    }
}
