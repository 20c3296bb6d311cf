//! Storage backend adapters
//!
//! Concrete [`StorageBackend`] implementations plus the registry the engine
//! resolves them from. Backends are registered once at startup under their
//! provider name; entity parameters name the provider that must serve them.

pub mod loopdev;
pub mod tmpfs;

pub use loopdev::LoopBackend;
pub use tmpfs::TmpfsBackend;

use crate::domain::ports::BackendRef;
use crate::domain::tags::StorageKind;
use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

// =============================================================================
// Backend Registry
// =============================================================================

/// Immutable-after-startup lookup table from provider name to backend.
#[derive(Default)]
pub struct BackendRegistry {
    backends: BTreeMap<String, BackendRef>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry preloaded with the machine-local providers.
    pub fn with_common_providers() -> Result<Self> {
        let mut registry = Self::new();
        registry.register(Arc::new(LoopBackend::new(loopdev::DEFAULT_MAX_DEVICES)))?;
        registry.register(Arc::new(TmpfsBackend::new()))?;
        Ok(registry)
    }

    /// Register a backend under its provider name. A duplicate name is a
    /// startup misconfiguration, never a shadowing.
    pub fn register(&mut self, backend: BackendRef) -> Result<()> {
        let provider = backend.provider().to_string();
        if self.backends.contains_key(&provider) {
            return Err(Error::DuplicateProvider { provider });
        }
        info!(provider = %provider, "registering storage backend");
        self.backends.insert(provider, backend);
        Ok(())
    }

    /// Resolve the backend serving `provider`, checking it supports `kind`.
    pub fn lookup(&self, provider: &str, kind: StorageKind) -> Result<BackendRef> {
        let backend = self
            .backends
            .get(provider)
            .ok_or_else(|| Error::UnknownProvider {
                provider: provider.to_string(),
            })?;
        if !backend.supported_kinds().contains(&kind) {
            return Err(Error::UnknownProvider {
                provider: format!("{provider} ({kind})"),
            });
        }
        Ok(Arc::clone(backend))
    }

    pub fn providers(&self) -> impl Iterator<Item = &str> {
        self.backends.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_common_providers_registered() {
        let registry = BackendRegistry::with_common_providers().unwrap();
        let providers: Vec<&str> = registry.providers().collect();
        assert_eq!(providers, vec!["loop", "tmpfs"]);

        registry.lookup("loop", StorageKind::Volume).unwrap();
        registry.lookup("tmpfs", StorageKind::Filesystem).unwrap();
    }

    #[test]
    fn test_unknown_provider() {
        let registry = BackendRegistry::with_common_providers().unwrap();
        assert_matches!(
            registry.lookup("ebs", StorageKind::Volume).err(),
            Some(Error::UnknownProvider { .. })
        );
    }

    #[test]
    fn test_kind_mismatch_rejected() {
        let registry = BackendRegistry::with_common_providers().unwrap();
        // loop devices are volumes, never filesystems
        assert_matches!(
            registry.lookup("loop", StorageKind::Filesystem).err(),
            Some(Error::UnknownProvider { .. })
        );
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = BackendRegistry::new();
        registry.register(Arc::new(TmpfsBackend::new())).unwrap();
        assert_matches!(
            registry.register(Arc::new(TmpfsBackend::new())),
            Err(Error::DuplicateProvider { .. })
        );
    }
}
