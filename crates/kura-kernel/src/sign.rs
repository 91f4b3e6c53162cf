//! Shareable link signing.
//!
//! A signed token is `base64url(mac):expire`, where `expire` is a unix
//! timestamp in seconds and `0` means the token never expires. The MAC is a
//! BLAKE3 keyed hash over `data:expire`.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Signature verification failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignError {
    #[error("malformed signature")]
    Malformed,
    #[error("signature expired")]
    Expired,
    #[error("signature mismatch")]
    Invalid,
    #[error("signer not initialized")]
    NotInitialized,
}

/// Produces and checks signed tokens for a piece of data.
pub trait Signer: Send + Sync {
    /// Sign `data`, valid until `expire` (unix seconds, `0` for never).
    fn sign(&self, data: &str, expire: u64) -> String;

    /// Check a token produced by [`sign`](Self::sign).
    fn verify(&self, data: &str, token: &str) -> Result<(), SignError>;
}

/// BLAKE3 keyed-hash signer.
pub struct KeyedSigner {
    key: [u8; 32],
}

impl KeyedSigner {
    /// Derive a signing key from a configured secret.
    pub fn new(secret: &str) -> Self {
        Self {
            key: blake3::derive_key("kura 2024 link signing", secret.as_bytes()),
        }
    }

    fn mac(&self, data: &str, expire: u64) -> blake3::Hash {
        blake3::keyed_hash(&self.key, format!("{data}:{expire}").as_bytes())
    }
}

impl std::fmt::Debug for KeyedSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyedSigner").finish_non_exhaustive()
    }
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl Signer for KeyedSigner {
    fn sign(&self, data: &str, expire: u64) -> String {
        let mac = self.mac(data, expire);
        format!("{}:{}", URL_SAFE_NO_PAD.encode(mac.as_bytes()), expire)
    }

    fn verify(&self, data: &str, token: &str) -> Result<(), SignError> {
        let (mac, expire) = token.rsplit_once(':').ok_or(SignError::Malformed)?;
        let expire: u64 = expire.parse().map_err(|_| SignError::Malformed)?;
        if expire != 0 && now_unix() > expire {
            return Err(SignError::Expired);
        }
        let bytes: [u8; 32] = URL_SAFE_NO_PAD
            .decode(mac)
            .map_err(|_| SignError::Malformed)?
            .try_into()
            .map_err(|_| SignError::Malformed)?;
        // blake3::Hash equality is constant-time.
        if self.mac(data, expire) == blake3::Hash::from(bytes) {
            Ok(())
        } else {
            Err(SignError::Invalid)
        }
    }
}

/// The process-wide signer.
///
/// `init` installs a signer only into an empty slot. Re-keying goes through
/// [`replace`](SignerSlot::replace), or [`reset`](SignerSlot::reset) followed
/// by `init`; tokens signed by the previous signer stop verifying.
pub struct SignerSlot {
    signer: RwLock<Option<Arc<dyn Signer>>>,
    expiration: Option<Duration>,
}

impl SignerSlot {
    /// An empty slot. `expiration` of `None` signs non-expiring tokens.
    pub fn new(expiration: Option<Duration>) -> Self {
        Self {
            signer: RwLock::new(None),
            expiration,
        }
    }

    /// Install the signer. Returns false if one was already installed.
    pub fn init(&self, signer: Arc<dyn Signer>) -> bool {
        let mut slot = self.signer.write();
        if slot.is_some() {
            return false;
        }
        *slot = Some(signer);
        true
    }

    /// Install `signer` unconditionally, returning the previous one.
    pub fn replace(&self, signer: Arc<dyn Signer>) -> Option<Arc<dyn Signer>> {
        self.signer.write().replace(signer)
    }

    /// Empty the slot, returning the signer that was installed.
    pub fn reset(&self) -> Option<Arc<dyn Signer>> {
        self.signer.write().take()
    }

    pub fn is_initialized(&self) -> bool {
        self.signer.read().is_some()
    }

    fn current(&self) -> Result<Arc<dyn Signer>, SignError> {
        self.signer.read().clone().ok_or(SignError::NotInitialized)
    }

    /// Sign with the configured expiration.
    pub fn sign(&self, data: &str) -> Result<String, SignError> {
        let expire = match self.expiration {
            Some(d) => now_unix() + d.as_secs(),
            None => 0,
        };
        self.sign_until(data, expire)
    }

    /// Sign a non-expiring token.
    pub fn sign_forever(&self, data: &str) -> Result<String, SignError> {
        self.sign_until(data, 0)
    }

    fn sign_until(&self, data: &str, expire: u64) -> Result<String, SignError> {
        Ok(self.current()?.sign(data, expire))
    }

    pub fn verify(&self, data: &str, token: &str) -> Result<(), SignError> {
        self.current()?.verify(data, token)
    }
}

impl std::fmt::Debug for SignerSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignerSlot")
            .field("initialized", &self.is_initialized())
            .field("expiration", &self.expiration)
            .finish()
    }
}
