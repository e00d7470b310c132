//! Capability-set storage traits (spec §9 "Polymorphism").
//!
//! The core depends only on these traits, never on a concrete backend. A
//! single `SecureStore` covers identity/prekey/session persistence via the
//! flat namespacing convention of spec §6; callers that want separate
//! backends per concern can implement the trait over a router.

use std::sync::{Arc, Mutex};

use crate::error::Result;

/// A flat, confidentiality-at-rest key/value sink (spec §6 "Secure store").
pub trait SecureStore: Send + Sync {
    fn get(&self, name: &str) -> Result<Option<Vec<u8>>>;
    fn set(&self, name: &str, bytes: &[u8]) -> Result<()>;
    fn remove(&self, name: &str) -> Result<()>;
    fn clear(&self) -> Result<()>;
}

/// An in-memory `SecureStore`, used by tests and as a reference
/// implementation. Cheap to clone: clones share the same backing map.
#[derive(Default, Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<std::collections::HashMap<String, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SecureStore for MemoryStore {
    fn get(&self, name: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.inner.lock().unwrap().get(name).cloned())
    }

    fn set(&self, name: &str, bytes: &[u8]) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .insert(name.to_string(), bytes.to_vec());
        Ok(())
    }

    fn remove(&self, name: &str) -> Result<()> {
        self.inner.lock().unwrap().remove(name);
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.inner.lock().unwrap().clear();
        Ok(())
    }
}
