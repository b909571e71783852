//! Environment lookups used for client-side defaulting.

use std::collections::HashMap;
use std::ffi::{OsStr, OsString};

/// Directory of trusted CA certificates.
pub const X509_CERT_DIR: &str = "X509_CERT_DIR";
/// File of trusted CA certificates.
pub const X509_CERT_FILE: &str = "X509_CERT_FILE";
/// Client certificate, possibly with the key inlined.
pub const X509_USER_PROXY: &str = "X509_USER_PROXY";
/// Client private key.
pub const X509_USER_KEY: &str = "X509_USER_KEY";

/// Source of environment values. Empty values count as unset.
pub trait Environment: Send + Sync {
    /// Looks up a variable. Values are passed through untouched, so paths
    /// that are not valid UTF-8 survive.
    fn var(&self, name: &str) -> Option<OsString>;
}

/// The real process environment.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessEnvironment;

impl Environment for ProcessEnvironment {
    fn var(&self, name: &str) -> Option<OsString> {
        std::env::var_os(name).filter(|value| !value.is_empty())
    }
}

/// A fixed set of variables, for callers that must not depend on the
/// process environment.
#[derive(Debug, Default, Clone)]
pub struct StaticEnvironment(HashMap<String, OsString>);

impl StaticEnvironment {
    /// Creates an empty environment.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a variable.
    #[must_use]
    pub fn with(mut self, name: &str, value: impl AsRef<OsStr>) -> Self {
        self.0.insert(name.to_owned(), value.as_ref().to_owned());
        self
    }
}

impl Environment for StaticEnvironment {
    fn var(&self, name: &str) -> Option<OsString> {
        self.0.get(name).filter(|value| !value.is_empty()).cloned()
    }
}
