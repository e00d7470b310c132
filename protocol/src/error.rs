//! Error taxonomy for the secure messaging core.
//!
//! Variant names double as the exit codes surfaced to the host (see
//! spec §6 "Exit/error codes exposed to host"). No variant may carry key
//! material in its message — only identifiers (session/peer ids, counters).

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum CoreError {
    /// Encrypt was called for a peer with no session and no bundle supplied.
    #[error("no session exists for this peer")]
    NoSession,

    /// A fetched prekey bundle failed signature verification.
    #[error("prekey bundle failed verification: {0}")]
    InvalidBundle(String),

    /// A DH computation produced a low-order / all-zero output, or a key
    /// was malformed.
    #[error("invalid key material: {0}")]
    InvalidKey(String),

    /// AEAD authentication failed on decrypt.
    #[error("authentication failed")]
    AuthFailed,

    /// A single decrypt call would need to advance the receiving chain by
    /// more than `max_skip` steps.
    #[error("too many skipped messages ({0} > max_skip)")]
    TooManySkipped(u32),

    /// A referenced key (OPK, SPK, session) does not exist or was already
    /// consumed.
    #[error("not found: {0}")]
    NotFound(String),

    /// An inbound PreKey message referenced an already-consumed OPK and no
    /// existing session could decrypt it either.
    #[error("duplicate message")]
    DuplicateMessage,

    /// The secure store / directory backend failed; the in-flight operation
    /// is untouched and may be retried.
    #[error("storage failure: {0}")]
    StorageFailure(String),

    /// Wire decoding failure (malformed frame, bad header).
    #[error("malformed wire message: {0}")]
    Malformed(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;
