//! Device secret resolution.
//!
//! Resolution order: in-memory cache, then the secret file provisioned by
//! the device enrollment flow, then the configured fallback. A missing
//! secret disables uploads; it is not fatal and is retried lazily on the
//! next enqueue.

use std::path::PathBuf;

use zeroize::{Zeroize, ZeroizeOnDrop};

/// Cached secret material, zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
struct CachedSecret(String);

pub struct CredentialStore {
    secret_path: Option<PathBuf>,
    fallback: Option<CachedSecret>,
    cached: Option<CachedSecret>,
}

impl CredentialStore {
    pub fn new(secret_path: Option<PathBuf>, fallback: Option<String>) -> Self {
        Self {
            secret_path,
            fallback: fallback.filter(|s| !s.is_empty()).map(CachedSecret),
            cached: None,
        }
    }

    /// Resolve the device secret, caching the first hit.
    pub fn resolve(&mut self) -> Option<&str> {
        if self.cached.is_none() {
            if let Some(from_file) = self.read_secret_file() {
                self.cached = Some(CachedSecret(from_file));
            } else if let Some(fallback) = self.fallback.as_ref() {
                self.cached = Some(CachedSecret(fallback.0.clone()));
            }
        }
        self.cached.as_ref().map(|secret| secret.0.as_str())
    }

    fn read_secret_file(&self) -> Option<String> {
        let path = self.secret_path.as_ref()?;
        match std::fs::read_to_string(path) {
            Ok(raw) => {
                let trimmed = raw.trim();
                if trimmed.is_empty() {
                    log::warn!("device secret file {} is empty", path.display());
                    None
                } else {
                    Some(trimmed.to_string())
                }
            }
            Err(e) => {
                log::debug!("device secret file {} unreadable: {}", path.display(), e);
                None
            }
        }
    }
}
