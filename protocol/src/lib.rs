//! A self-contained secure messaging cryptographic core: X3DH initial
//! key agreement plus a Double Ratchet session layer, independent of
//! transport and storage backend.
//!
//! Layers, bottom to top:
//! - [`primitives`] — X25519, Ed25519, HKDF, HMAC-SHA-256, ChaCha20-Poly1305.
//! - [`store`] — the `SecureStore` capability trait callers implement.
//! - [`keys`] — identity key, signed prekey rotation, one-time prekey pool.
//! - [`x3dh`] — initial asynchronous key agreement.
//! - [`ratchet`] — the per-direction symmetric-key ratchet and DH ratchet.
//! - [`wire`] — the binary frame format exchanged between peers.
//! - [`session`] — ties the above into a per-peer `SessionManager`.

pub mod config;
pub mod error;
pub mod keys;
pub mod primitives;
pub mod ratchet;
pub mod session;
pub mod store;
pub mod wire;
pub mod x3dh;

pub use config::Config;
pub use error::{CoreError, Result};
pub use keys::{IdentityKey, KeyManager, OneTimePreKey, PreKeyBundle, SignedPreKey};
pub use session::{IdentityStatus, SessionManager};
pub use store::{MemoryStore, SecureStore};
