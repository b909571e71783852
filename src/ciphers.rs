//! Cipher list policy.
//!
//! Cipher lists use the familiar colon-separated OpenSSL notation and are
//! resolved against the suites the crypto provider implements. The list
//! only governs TLS 1.2; every TLS 1.3 suite of the provider stays enabled.

use crate::backend::Capabilities;
use rustls::{CipherSuite, SupportedCipherSuite};
use std::collections::HashSet;
use std::sync::{PoisonError, RwLock};
use thiserror::Error;

/// Default list for libraries offering AEAD suites.
pub const DEFAULT_CIPHERS: &str = "ECDHE-ECDSA-AES128-GCM-SHA256:\
                                   ECDHE-RSA-AES128-GCM-SHA256:\
                                   ECDHE-ECDSA-AES256-GCM-SHA384:\
                                   ECDHE-RSA-AES256-GCM-SHA384:\
                                   ECDHE-ECDSA-CHACHA20-POLY1305:\
                                   ECDHE-RSA-CHACHA20-POLY1305:\
                                   DHE-RSA-AES128-GCM-SHA256:\
                                   DHE-RSA-AES256-GCM-SHA384";

/// Default list for older libraries.
pub const LEGACY_CIPHERS: &str = "ALL:!LOW:!EXP:!MD5:!MD2";

const NAMES: &[(&str, CipherSuite)] = &[
    (
        "ECDHE-ECDSA-AES128-GCM-SHA256",
        CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
    ),
    (
        "ECDHE-RSA-AES128-GCM-SHA256",
        CipherSuite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
    ),
    (
        "ECDHE-ECDSA-AES256-GCM-SHA384",
        CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
    ),
    (
        "ECDHE-RSA-AES256-GCM-SHA384",
        CipherSuite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
    ),
    (
        "ECDHE-ECDSA-CHACHA20-POLY1305",
        CipherSuite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
    ),
    (
        "ECDHE-RSA-CHACHA20-POLY1305",
        CipherSuite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
    ),
    (
        "DHE-RSA-AES128-GCM-SHA256",
        CipherSuite::TLS_DHE_RSA_WITH_AES_128_GCM_SHA256,
    ),
    (
        "DHE-RSA-AES256-GCM-SHA384",
        CipherSuite::TLS_DHE_RSA_WITH_AES_256_GCM_SHA384,
    ),
];

static CIPHERS: RwLock<Option<String>> = RwLock::new(None);

/// Error returned by [`select`].
#[allow(missing_docs)]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CipherError {
    #[error("no supported cipher matches \"{0}\"")]
    NoMatch(String),
}

/// Replaces the process-wide cipher list used by later builds. Contexts
/// already built keep the list they were built with.
pub fn set_ciphers(list: &str) {
    *CIPHERS.write().unwrap_or_else(PoisonError::into_inner) = Some(list.to_owned());
}

/// Restores the default cipher list.
pub fn reset_ciphers() {
    *CIPHERS.write().unwrap_or_else(PoisonError::into_inner) = None;
}

/// The default list for a library with `caps`.
#[must_use]
pub fn default_ciphers(caps: Capabilities) -> &'static str {
    if caps.aead_cipher_defaults {
        DEFAULT_CIPHERS
    } else {
        LEGACY_CIPHERS
    }
}

/// The list the next build will use.
#[must_use]
pub fn current_ciphers(caps: Capabilities) -> String {
    CIPHERS
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
        .unwrap_or_else(|| default_ciphers(caps).to_owned())
}

/// OpenSSL-style name of a TLS 1.2 suite.
#[must_use]
pub fn openssl_name(suite: CipherSuite) -> Option<&'static str> {
    NAMES
        .iter()
        .find(|(_, known)| *known == suite)
        .map(|(name, _)| *name)
}

fn matches(name: &str, keyword: &str) -> bool {
    match keyword {
        "ALL" | "DEFAULT" | "HIGH" | "TLSv1.2" => true,
        "ECDHE" | "EECDH" | "kECDHE" | "kEECDH" => name.starts_with("ECDHE-"),
        "DHE" | "EDH" | "kDHE" | "kEDH" => name.starts_with("DHE-"),
        "ECDSA" | "aECDSA" => name.contains("-ECDSA-"),
        "RSA" | "aRSA" => name.contains("-RSA-"),
        "AES" => name.contains("-AES"),
        "AES128" => name.contains("-AES128-"),
        "AES256" => name.contains("-AES256-"),
        "AESGCM" => name.contains("-AES") && name.contains("-GCM-"),
        "CHACHA20" => name.contains("-CHACHA20-"),
        "AEAD" => name.contains("-GCM-") || name.contains("-CHACHA20-"),
        "SHA256" => name.ends_with("-SHA256"),
        "SHA384" => name.ends_with("-SHA384"),
        exact => name == exact,
    }
}

enum Op {
    Add,
    Remove,
    Kill,
    MoveToEnd,
}

/// Resolves `list` against `available`.
///
/// Returns the selected TLS 1.2 suites in list order followed by every
/// TLS 1.3 suite in `available`. Fails if no TLS 1.2 suite is selected.
pub fn select(
    list: &str,
    available: &[SupportedCipherSuite],
) -> Result<Vec<SupportedCipherSuite>, CipherError> {
    let candidates = available
        .iter()
        .filter(|suite| suite.tls13().is_none())
        .filter_map(|suite| openssl_name(suite.suite()).map(|name| (name, *suite)))
        .collect::<Vec<_>>();

    let mut selected: Vec<usize> = Vec::new();
    let mut killed = HashSet::new();
    for token in list.split([':', ',', ' ']).filter(|t| !t.is_empty()) {
        let (op, body) = if let Some(rest) = token.strip_prefix('!') {
            (Op::Kill, rest)
        } else if let Some(rest) = token.strip_prefix('-') {
            (Op::Remove, rest)
        } else if let Some(rest) = token.strip_prefix('+') {
            (Op::MoveToEnd, rest)
        } else {
            (Op::Add, token)
        };
        if body.starts_with('@') {
            continue;
        }
        let hits = candidates
            .iter()
            .enumerate()
            .filter(|(_, (name, _))| body.split('+').all(|keyword| matches(name, keyword)))
            .map(|(index, _)| index)
            .collect::<Vec<_>>();
        match op {
            Op::Add => {
                for index in hits {
                    if !killed.contains(&index) && !selected.contains(&index) {
                        selected.push(index);
                    }
                }
            }
            Op::Remove => selected.retain(|index| !hits.contains(index)),
            Op::Kill => {
                selected.retain(|index| !hits.contains(index));
                killed.extend(hits);
            }
            Op::MoveToEnd => {
                let (moved, kept): (Vec<_>, Vec<_>) =
                    selected.into_iter().partition(|index| hits.contains(index));
                selected = kept;
                selected.extend(moved);
            }
        }
    }

    if selected.is_empty() {
        return Err(CipherError::NoMatch(list.to_owned()));
    }
    Ok(available
        .iter()
        .filter(|suite| suite.tls13().is_some())
        .copied()
        .chain(selected.into_iter().map(|index| candidates[index].1))
        .collect())
}
