//! Validated, reusable TLS contexts.
//!
//! A [`Context`] is built from an optional certificate, private key, CA
//! directory and CA file plus an [`Options`] word. Before anything is
//! loaded the paths are checked for existence, kind, and permissions;
//! clients fall back to the `X509_*` environment variables for anything
//! not supplied. Failures are reported through a [`MessageSink`] and leave
//! the context without native configuration.

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc)]

pub mod backend;
pub mod ciphers;
pub mod context;
pub mod env;
pub mod init;
pub mod options;
pub mod paths;
pub mod sink;
pub mod verify;

#[cfg(test)]
mod testdata;

pub use backend::{Backend, Capabilities, RustlsBackend};
pub use ciphers::{reset_ciphers, set_ciphers};
pub use context::{
    Context, ContextBuilder, Error, NativeContext, Parameters, TlsConfig, VerifyMode,
};
pub use env::{Environment, ProcessEnvironment, StaticEnvironment};
pub use init::{ensure_initialized, init, InitError, Initializer};
pub use options::Options;
pub use sink::{set_message_sink, MessageSink, TracingSink};
