//! Keys for sealed (authenticated) archives.
//!
//! No singletons here: a [`KeyRing`] lives inside the process context and is
//! handed to whatever needs it. Prompting is behind the [`KeyProvider`]
//! trait; this crate never talks to a UI or keychain itself.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::KeyError;

/// A 256-bit archive key.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretKey([u8; 32]);

impl SecretKey {
    pub fn new(bytes: [u8; 32]) -> SecretKey {
        SecretKey(bytes)
    }

    /// Derive a key from a passphrase.
    #[cfg(feature = "seal")]
    pub fn from_passphrase(passphrase: &str) -> SecretKey {
        SecretKey(blake3::derive_key(
            "arcfs 2026-06 sealed archive key",
            passphrase.as_bytes(),
        ))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never log key material.
        f.write_str("SecretKey(..)")
    }
}

/// Supplies the key for a mount point, typically by prompting the user.
pub trait KeyProvider: Send + Sync {
    fn request_key(&self, mount: &Path) -> Result<SecretKey, KeyError>;
}

/// A provider that always answers with the same key. Intended for tests and
/// non-interactive embedders.
pub struct FixedKeyProvider(pub SecretKey);

impl KeyProvider for FixedKeyProvider {
    fn request_key(&self, _mount: &Path) -> Result<SecretKey, KeyError> {
        Ok(self.0.clone())
    }
}

/// Per-mount key cache in front of an optional provider.
pub struct KeyRing {
    provider: Option<Arc<dyn KeyProvider>>,
    cache: Mutex<HashMap<PathBuf, SecretKey>>,
}

impl KeyRing {
    pub fn new(provider: Option<Arc<dyn KeyProvider>>) -> KeyRing {
        KeyRing {
            provider,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// The key for `mount`, prompting the provider on the first request and
    /// caching the answer for the mount's lifetime.
    pub fn key_for(&self, mount: &Path) -> Result<SecretKey, KeyError> {
        if let Some(key) = self.cache.lock().get(mount) {
            return Ok(key.clone());
        }
        let provider = self.provider.as_ref().ok_or_else(|| KeyError::Unavailable {
            mount: mount.to_path_buf(),
        })?;
        let key = provider.request_key(mount)?;
        self.cache.lock().insert(mount.to_path_buf(), key.clone());
        Ok(key)
    }

    /// Forget the cached key for `mount`. Called when the mount point's own
    /// file is unlinked; the next mount prompts afresh.
    pub fn invalidate(&self, mount: &Path) {
        self.cache.lock().remove(mount);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting(AtomicUsize);

    impl KeyProvider for Counting {
        fn request_key(&self, _mount: &Path) -> Result<SecretKey, KeyError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(SecretKey::new([7u8; 32]))
        }
    }

    #[test]
    fn key_is_cached_until_invalidated() {
        let provider = Arc::new(Counting(AtomicUsize::new(0)));
        let ring = KeyRing::new(Some(provider.clone()));
        let mount = Path::new("/data/a.mem");

        ring.key_for(mount).unwrap();
        ring.key_for(mount).unwrap();
        assert_eq!(provider.0.load(Ordering::SeqCst), 1);

        ring.invalidate(mount);
        ring.key_for(mount).unwrap();
        assert_eq!(provider.0.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn no_provider_means_unavailable() {
        let ring = KeyRing::new(None);
        let err = ring.key_for(Path::new("/data/a.mem")).unwrap_err();
        assert!(matches!(err, KeyError::Unavailable { .. }));
    }

    #[test]
    fn debug_redacts_key_material() {
        let key = SecretKey::new([42u8; 32]);
        assert_eq!(format!("{key:?}"), "SecretKey(..)");
    }
}
