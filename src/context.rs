//! TLS context construction.
//!
//! A [`Context`] is built once from credential paths and an [`Options`]
//! word and is immutable afterwards. Construction either passes every
//! check, including the certificate/key cross-check, or yields a context
//! without native configuration after reporting why to the builder's
//! [`MessageSink`].

use crate::backend::Capabilities;
use crate::ciphers::{self, CipherError};
use crate::env::{
    Environment, ProcessEnvironment, X509_CERT_DIR, X509_CERT_FILE, X509_USER_KEY,
    X509_USER_PROXY,
};
use crate::init::{InitError, Initializer};
use crate::options::Options;
use crate::paths::{self, PathError};
use crate::sink::{message_sink, MessageSink, CONTEXT_COMPONENT};
use crate::verify::{PeerClientVerifier, PeerServerVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::ResolvesServerCertUsingSni;
use rustls::sign::CertifiedKey;
use rustls::{
    ClientConfig, InconsistentKeys, NamedGroup, RootCertStore, ServerConfig,
    SupportedCipherSuite, SupportedProtocolVersion,
};
use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, instrument, trace, warn};

/// Protocol versions every context negotiates between.
pub const PROTOCOL_VERSIONS: &[&SupportedProtocolVersion] =
    &[&rustls::version::TLS13, &rustls::version::TLS12];

/// Error reported when a context cannot be built.
#[allow(missing_docs)]
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Init(#[from] InitError),
    #[error(
        "Unable to determine the location of trusted CA certificates to verify peer identity; \
         this is required!"
    )]
    ConfigMissing,
    #[error(transparent)]
    PathInvalid(#[from] PathError),
    #[error("No negotiable TLS method available.")]
    MethodUnavailable,
    #[error("Unable to allocate TLS context! {0}")]
    Allocation(rustls::Error),
    #[error("Unable to set the CA cert file or directory; {0}")]
    TrustLoad(String),
    #[error("Unable to set SSL cipher list; {0}")]
    CipherLoad(#[from] CipherError),
    #[error("Unable to create TLS context; certificate error: {0}")]
    CertLoad(String),
    #[error("Unable to create TLS context; private key error: {0}")]
    KeyLoad(String),
    #[error("Unable to create TLS context; cert-key mismatch.")]
    KeyMismatch,
}

/// Effective inputs of a context, after environment defaulting.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Parameters {
    /// Certificate file.
    pub cert: Option<PathBuf>,
    /// Private key file. When absent the key is read from `cert`.
    pub pkey: Option<PathBuf>,
    /// Directory of trust anchors.
    pub cadir: Option<PathBuf>,
    /// File of trust anchors.
    pub cafile: Option<PathBuf>,
    /// Options word.
    pub opts: Options,
}

/// Peer certificate verification mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VerifyMode {
    /// Peers are not asked for or checked against trust anchors.
    None,
    /// Peers must present a certificate chaining to a trust anchor.
    Peer,
}

/// The role-specific configuration inside a [`NativeContext`].
#[derive(Clone, Debug)]
pub enum TlsConfig {
    /// Client role.
    Client(Arc<ClientConfig>),
    /// Server role.
    Server(Arc<ServerConfig>),
}

/// Fully configured TLS library state, ready for sessions to derive from.
#[derive(Clone, Debug)]
pub struct NativeContext {
    config: TlsConfig,
    verify_mode: VerifyMode,
    verify_depth: u32,
    logs_verify_failures: bool,
    cipher_suites: Vec<SupportedCipherSuite>,
}

impl NativeContext {
    /// Role-specific configuration.
    #[must_use]
    pub fn config(&self) -> &TlsConfig {
        &self.config
    }

    /// Client configuration, for client contexts.
    #[must_use]
    pub fn client_config(&self) -> Option<Arc<ClientConfig>> {
        match &self.config {
            TlsConfig::Client(config) => Some(Arc::clone(config)),
            TlsConfig::Server(_) => None,
        }
    }

    /// Server configuration, for server contexts.
    #[must_use]
    pub fn server_config(&self) -> Option<Arc<ServerConfig>> {
        match &self.config {
            TlsConfig::Server(config) => Some(Arc::clone(config)),
            TlsConfig::Client(_) => None,
        }
    }

    /// Peer verification mode.
    #[must_use]
    pub fn verify_mode(&self) -> VerifyMode {
        self.verify_mode
    }

    /// Maximum verified chain depth.
    #[must_use]
    pub fn verify_depth(&self) -> u32 {
        self.verify_depth
    }

    /// Whether verification failures are reported.
    #[must_use]
    pub fn logs_verify_failures(&self) -> bool {
        self.logs_verify_failures
    }

    /// Negotiable cipher suites, TLS 1.3 first.
    #[must_use]
    pub fn cipher_suites(&self) -> &[SupportedCipherSuite] {
        &self.cipher_suites
    }
}

/// A reusable TLS configuration.
///
/// Built by [`ContextBuilder::build`]. When construction failed,
/// [`Context::native`] is `None` and nothing else is held.
pub struct Context {
    native: Option<NativeContext>,
    params: Parameters,
    builder: ContextBuilder,
}

impl Context {
    /// Builds a context with the process-wide collaborators.
    #[must_use]
    pub fn new(
        cert: Option<&Path>,
        pkey: Option<&Path>,
        cadir: Option<&Path>,
        cafile: Option<&Path>,
        opts: Options,
    ) -> Self {
        ContextBuilder::new().build(cert, pkey, cadir, cafile, opts)
    }

    /// The native configuration, `None` if construction failed.
    #[must_use]
    pub fn native(&self) -> Option<&NativeContext> {
        self.native.as_ref()
    }

    /// Whether construction succeeded.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.native.is_some()
    }

    /// Inputs the context was built from.
    #[must_use]
    pub fn params(&self) -> &Parameters {
        &self.params
    }

    /// Builds a new context from the same parameters. Returns `None` if that
    /// build fails.
    #[must_use]
    pub fn try_clone(&self) -> Option<Self> {
        let params = &self.params;
        let context = self.builder.build(
            params.cert.as_deref(),
            params.pkey.as_deref(),
            params.cadir.as_deref(),
            params.cafile.as_deref(),
            params.opts,
        );
        context.is_valid().then_some(context)
    }

    /// Whether peer certificates are verified against trust anchors.
    #[must_use]
    pub fn x509_verify(&self) -> bool {
        self.native.is_some() && (self.params.cadir.is_some() || self.params.cafile.is_some())
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("native", &self.native)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

/// Builds [`Context`]s.
///
/// Carries the collaborators a build depends on: the library initializer,
/// the diagnostic sink, and the environment used for client defaults.
#[derive(Clone)]
pub struct ContextBuilder {
    initializer: Arc<Initializer>,
    sink: Arc<dyn MessageSink>,
    env: Arc<dyn Environment>,
}

impl Default for ContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ContextBuilder {
    /// Uses the process-wide initializer and sink, and the process
    /// environment.
    #[must_use]
    pub fn new() -> Self {
        Self {
            initializer: Arc::clone(Initializer::global()),
            sink: message_sink(),
            env: Arc::new(ProcessEnvironment),
        }
    }

    /// Reports diagnostics to `sink`.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn MessageSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Takes client defaults from `env`.
    #[must_use]
    pub fn with_environment(mut self, env: Arc<dyn Environment>) -> Self {
        self.env = env;
        self
    }

    /// Uses `initializer` and its backend instead of the process-wide one.
    #[must_use]
    pub fn with_initializer(mut self, initializer: Arc<Initializer>) -> Self {
        self.initializer = initializer;
        self
    }

    /// Builds a context. Failures are reported to the sink and yield a
    /// context without native configuration.
    #[instrument(level = "debug", skip_all, fields(opts = ?opts))]
    pub fn build(
        &self,
        cert: Option<&Path>,
        pkey: Option<&Path>,
        cadir: Option<&Path>,
        cafile: Option<&Path>,
        opts: Options,
    ) -> Context {
        let failed = |err: &Error, params| {
            debug!("TLS context construction failed: {err}");
            self.sink.message(CONTEXT_COMPONENT, &err.to_string(), true);
            Context {
                native: None,
                params,
                builder: self.clone(),
            }
        };
        let params = match self.resolve(cert, pkey, cadir, cafile, opts) {
            Ok(params) => params,
            Err(err) => return failed(&err, Parameters::default()),
        };
        match self.configure(&params) {
            Ok(native) => {
                debug!("TLS context ready");
                Context {
                    native: Some(native),
                    params,
                    builder: self.clone(),
                }
            }
            Err(err) => failed(&err, params),
        }
    }

    fn env_path(&self, name: &str) -> Option<PathBuf> {
        self.env.var(name).map(PathBuf::from)
    }

    fn resolve(
        &self,
        cert: Option<&Path>,
        pkey: Option<&Path>,
        cadir: Option<&Path>,
        cafile: Option<&Path>,
        opts: Options,
    ) -> Result<Parameters, Error> {
        if !self.initializer.is_initialized() {
            self.initializer.ensure_initialized()?;
        }

        let given = |path: Option<&Path>| {
            path.filter(|path| !path.as_os_str().is_empty())
                .map(Path::to_path_buf)
        };
        let (mut cert, mut pkey, mut cadir, mut cafile) =
            (given(cert), given(pkey), given(cadir), given(cafile));

        // Clients must verify servers, so trust anchors are mandatory.
        if !opts.is_server() {
            if cadir.is_none() && cafile.is_none() {
                cadir = self.env_path(X509_CERT_DIR);
                cafile = self.env_path(X509_CERT_FILE);
                if cadir.is_none() && cafile.is_none() {
                    return Err(Error::ConfigMissing);
                }
            }
            cert = cert.or_else(|| self.env_path(X509_USER_PROXY));
            pkey = pkey.or_else(|| self.env_path(X509_USER_KEY));
        }

        paths::validate(
            cert.as_deref(),
            pkey.as_deref(),
            cadir.as_deref(),
            cafile.as_deref(),
        )?;
        trace!(?cert, ?pkey, ?cadir, ?cafile, "Credential paths accepted");

        Ok(Parameters {
            cert,
            pkey,
            cadir,
            cafile,
            opts,
        })
    }

    fn configure(&self, params: &Parameters) -> Result<NativeContext, Error> {
        let backend = self.initializer.backend();
        let caps = backend.capabilities();
        if !caps.version_negotiation {
            return Err(Error::MethodUnavailable);
        }
        let mut provider = backend
            .crypto_provider()
            .ok_or(Error::MethodUnavailable)?;

        let roots = if params.cadir.is_some() || params.cafile.is_some() {
            Some(Arc::new(load_roots(
                params.cadir.as_deref(),
                params.cafile.as_deref(),
            )?))
        } else {
            None
        };
        let verify_mode = if roots.is_some() {
            VerifyMode::Peer
        } else {
            VerifyMode::None
        };
        let verify_depth = params.opts.effective_verify_depth();
        let logs_verify_failures = roots.is_some() && params.opts.log_verify_failures();
        let log = logs_verify_failures.then(|| Arc::clone(&self.sink));

        let list = ciphers::current_ciphers(caps);
        provider.cipher_suites = ciphers::select(&list, &provider.cipher_suites)?;
        prefer_ecdh(&mut provider, caps);
        let cipher_suites = provider.cipher_suites.clone();
        let provider = Arc::new(provider);

        let credentials = params
            .cert
            .as_deref()
            .map(|cert| load_credentials(cert, params.pkey.as_deref().unwrap_or(cert), &provider))
            .transpose()?;

        let config = if params.opts.is_server() {
            let builder = ServerConfig::builder_with_provider(Arc::clone(&provider))
                .with_protocol_versions(PROTOCOL_VERSIONS)
                .map_err(Error::Allocation)?;
            let builder = match roots {
                Some(roots) => {
                    let verifier =
                        PeerClientVerifier::new(roots, Arc::clone(&provider), verify_depth, log)
                            .map_err(|err| Error::TrustLoad(err.to_string()))?;
                    builder.with_client_cert_verifier(Arc::new(verifier))
                }
                None => builder.with_no_client_auth(),
            };
            let config = match credentials {
                Some((chain, key)) => builder
                    .with_single_cert(chain, key)
                    .map_err(credential_error)?,
                None => builder.with_cert_resolver(Arc::new(ResolvesServerCertUsingSni::new())),
            };
            TlsConfig::Server(Arc::new(config))
        } else {
            let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
                .with_protocol_versions(PROTOCOL_VERSIONS)
                .map_err(Error::Allocation)?;
            let roots = roots.ok_or(Error::ConfigMissing)?;
            let verifier = PeerServerVerifier::new(roots, Arc::clone(&provider), verify_depth, log)
                .map_err(|err| Error::TrustLoad(err.to_string()))?;
            let builder = builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(verifier));
            let config = match credentials {
                Some((chain, key)) => builder
                    .with_client_auth_cert(chain, key)
                    .map_err(credential_error)?,
                None => builder.with_no_client_auth(),
            };
            TlsConfig::Client(Arc::new(config))
        };

        Ok(NativeContext {
            config,
            verify_mode,
            verify_depth,
            logs_verify_failures,
            cipher_suites,
        })
    }
}

fn read_certs(path: &Path) -> io::Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)?;
    rustls_pemfile::certs(&mut BufReader::new(file)).collect()
}

fn trust_error(path: &Path, err: &dyn fmt::Display) -> Error {
    Error::TrustLoad(format!("{}: {err}", path.display()))
}

fn load_roots(cadir: Option<&Path>, cafile: Option<&Path>) -> Result<RootCertStore, Error> {
    let mut roots = RootCertStore::empty();

    if let Some(cafile) = cafile {
        let certs = read_certs(cafile).map_err(|err| trust_error(cafile, &err))?;
        if add_roots(&mut roots, cafile, certs) == 0 {
            return Err(trust_error(cafile, &"no usable CA certificates"));
        }
    }
    if let Some(cadir) = cadir {
        for entry in fs::read_dir(cadir).map_err(|err| trust_error(cadir, &err))? {
            let path = entry.map_err(|err| trust_error(cadir, &err))?.path();
            if !path.is_file() {
                continue;
            }
            match read_certs(&path) {
                Ok(certs) => {
                    add_roots(&mut roots, &path, certs);
                }
                Err(err) => trace!("Skipping {}: {err}", path.display()),
            }
        }
    }
    if roots.is_empty() {
        let path = cadir.or(cafile).unwrap_or(Path::new(""));
        return Err(trust_error(path, &"no CA certificates found"));
    }
    Ok(roots)
}

fn add_roots(roots: &mut RootCertStore, path: &Path, certs: Vec<CertificateDer<'static>>) -> usize {
    let (added, ignored) = roots.add_parsable_certificates(certs);
    if ignored > 0 {
        warn!("Ignored {ignored} unusable CA certificates in {}", path.display());
    }
    trace!("Loaded {added} CA certificates from {}", path.display());
    added
}

fn load_credentials(
    cert: &Path,
    key: &Path,
    provider: &CryptoProvider,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), Error> {
    let chain = read_certs(cert)
        .map_err(|err| Error::CertLoad(format!("{}: {err}", cert.display())))?;
    if chain.is_empty() {
        return Err(Error::CertLoad(format!(
            "{}: no certificate found",
            cert.display()
        )));
    }

    let key_der = File::open(key)
        .and_then(|file| rustls_pemfile::private_key(&mut BufReader::new(file)))
        .map_err(|err| Error::KeyLoad(format!("{}: {err}", key.display())))?
        .ok_or_else(|| Error::KeyLoad(format!("{}: no private key found", key.display())))?;
    let signing_key = provider
        .key_provider
        .load_private_key(key_der.clone_key())
        .map_err(|err| Error::KeyLoad(format!("{}: {err}", key.display())))?;

    match CertifiedKey::new(chain.clone(), signing_key).keys_match() {
        Ok(()) | Err(rustls::Error::InconsistentKeys(InconsistentKeys::Unknown)) => {}
        Err(_) => return Err(Error::KeyMismatch),
    }
    Ok((chain, key_der))
}

fn credential_error(err: rustls::Error) -> Error {
    match err {
        rustls::Error::InconsistentKeys(_) => Error::KeyMismatch,
        err => Error::KeyLoad(err.to_string()),
    }
}

fn prefer_ecdh(provider: &mut CryptoProvider, caps: Capabilities) {
    if caps.automatic_ecdh {
        return;
    }
    provider.kx_groups.sort_by_key(|group| {
        matches!(
            group.name(),
            NamedGroup::FFDHE2048
                | NamedGroup::FFDHE3072
                | NamedGroup::FFDHE4096
                | NamedGroup::FFDHE6144
                | NamedGroup::FFDHE8192
        )
    });
}
