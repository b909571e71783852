//! The TLS library underneath a context.
//!
//! Behavior that differs between library generations is only reachable
//! through [`Capabilities`], so the rest of the crate does not care which
//! library it is talking to.

use crate::init::{InitError, LockingCallbacks};
use rustls::crypto::{ring, CryptoProvider};
use tracing::debug;

/// Library-generation dependent behavior.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Capabilities {
    /// Library needs locking and thread-id callbacks to be thread-safe.
    pub external_locking: bool,
    /// A version-negotiating method is available.
    pub version_negotiation: bool,
    /// Elliptic-curve key exchange is enabled without being asked for.
    pub automatic_ecdh: bool,
    /// Library is recent enough for the AEAD-only default cipher list.
    pub aead_cipher_defaults: bool,
}

impl Capabilities {
    /// Capabilities of a current, internally synchronized library.
    pub const MODERN: Self = Self {
        external_locking: false,
        version_negotiation: true,
        automatic_ecdh: true,
        aead_cipher_defaults: true,
    };
}

/// A TLS library implementation.
pub trait Backend: Send + Sync {
    /// Reports what this library needs and offers.
    fn capabilities(&self) -> Capabilities;

    /// Whether the library was built with thread support.
    fn thread_support(&self) -> bool {
        true
    }

    /// One-time library setup.
    fn initialize(&self) -> Result<(), InitError>;

    /// Number of locks the library wants callbacks for.
    fn num_locks(&self) -> usize {
        0
    }

    /// Hands the locking and thread-id callbacks to the library.
    fn install_locking(&self, _callbacks: LockingCallbacks) {}

    /// Provider of every negotiable algorithm, `None` if there is no
    /// version-negotiating method.
    fn crypto_provider(&self) -> Option<CryptoProvider>;
}

/// [`rustls`] with the `ring` provider.
#[derive(Debug, Default, Clone, Copy)]
pub struct RustlsBackend;

impl Backend for RustlsBackend {
    fn capabilities(&self) -> Capabilities {
        Capabilities::MODERN
    }

    fn initialize(&self) -> Result<(), InitError> {
        if ring::default_provider().install_default().is_err() {
            debug!("Process default crypto provider already installed");
        }
        Ok(())
    }

    fn crypto_provider(&self) -> Option<CryptoProvider> {
        Some(
            CryptoProvider::get_default()
                .map(|provider| (**provider).clone())
                .unwrap_or_else(ring::default_provider),
        )
    }
}
