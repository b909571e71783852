//! Peer certificate verification policy.
//!
//! The webpki verifiers decide whether a chain is acceptable. The wrappers
//! here add the chain depth limit and, when asked to, report every
//! rejection to a [`MessageSink`] without ever changing the verdict.

use crate::sink::{MessageSink, CERT_COMPONENT};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::{VerifierBuilderError, WebPkiClientVerifier};
use rustls::{
    CertificateError, DigitallySignedStruct, DistinguishedName, Error, OtherError,
    RootCertStore, SignatureScheme,
};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use x509_parser::objects::{oid2abbrev, oid_registry};
use x509_parser::prelude::{FromDer, X509Certificate, X509Name};

/// Numeric certificate verification error, using the X.509 verify codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VerifyErrorCode(pub i32);

impl VerifyErrorCode {
    /// Anything without a more specific code.
    pub const UNSPECIFIED: Self = Self(1);
    /// Signature check failed.
    pub const CERT_SIGNATURE_FAILURE: Self = Self(7);
    /// Validity period has not started.
    pub const CERT_NOT_YET_VALID: Self = Self(9);
    /// Validity period has ended.
    pub const CERT_HAS_EXPIRED: Self = Self(10);
    /// No trust anchor issued the chain.
    pub const UNABLE_TO_GET_ISSUER_CERT_LOCALLY: Self = Self(20);
    /// Chain is longer than the verification depth.
    pub const CERT_CHAIN_TOO_LONG: Self = Self(22);
    /// Certificate was revoked.
    pub const CERT_REVOKED: Self = Self(23);
    /// Certificate not usable for this purpose.
    pub const INVALID_PURPOSE: Self = Self(26);
    /// Certificate does not name the peer.
    pub const HOSTNAME_MISMATCH: Self = Self(62);

    /// Classifies a verifier error.
    #[must_use]
    pub fn from_error(err: &Error) -> Self {
        let Error::InvalidCertificate(err) = err else {
            return Self::UNSPECIFIED;
        };
        match err {
            CertificateError::BadSignature => Self::CERT_SIGNATURE_FAILURE,
            CertificateError::NotValidYet | CertificateError::NotValidYetContext { .. } => {
                Self::CERT_NOT_YET_VALID
            }
            CertificateError::Expired | CertificateError::ExpiredContext { .. } => {
                Self::CERT_HAS_EXPIRED
            }
            CertificateError::UnknownIssuer => Self::UNABLE_TO_GET_ISSUER_CERT_LOCALLY,
            CertificateError::Revoked => Self::CERT_REVOKED,
            CertificateError::InvalidPurpose | CertificateError::InvalidPurposeContext { .. } => {
                Self::INVALID_PURPOSE
            }
            CertificateError::NotValidForName
            | CertificateError::NotValidForNameContext { .. } => Self::HOSTNAME_MISMATCH,
            CertificateError::Other(other) if other.0.downcast_ref::<ChainTooLong>().is_some() => {
                Self::CERT_CHAIN_TOO_LONG
            }
            _ => Self::UNSPECIFIED,
        }
    }

    /// Human-readable text for the code.
    #[must_use]
    pub fn description(self) -> &'static str {
        match self.0 {
            7 => "certificate signature failure",
            9 => "certificate is not yet valid",
            10 => "certificate has expired",
            20 => "unable to get local issuer certificate",
            22 => "certificate chain too long",
            23 => "certificate revoked",
            26 => "unsupported certificate purpose",
            62 => "hostname mismatch",
            _ => "unspecified certificate verification error",
        }
    }
}

/// Rejection raised when a chain exceeds the verification depth.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("certificate chain too long for verification depth {depth}")]
pub struct ChainTooLong {
    /// Configured depth.
    pub depth: u32,
}

/// What the verification callback gets to see about a rejection.
#[derive(Debug, Clone, Copy)]
pub struct StoreContext<'a> {
    cert: &'a CertificateDer<'a>,
    depth: usize,
    error: VerifyErrorCode,
}

impl<'a> StoreContext<'a> {
    /// Describes a rejection of `cert` at chain position `depth`.
    #[must_use]
    pub fn new(cert: &'a CertificateDer<'a>, depth: usize, error: VerifyErrorCode) -> Self {
        Self { cert, depth, error }
    }

    /// Locates the certificate responsible for `err` in a presented chain.
    #[must_use]
    pub fn for_error(
        err: &Error,
        end_entity: &'a CertificateDer<'a>,
        intermediates: &'a [CertificateDer<'a>],
    ) -> Self {
        let error = VerifyErrorCode::from_error(err);
        let top_of_chain = error == VerifyErrorCode::UNABLE_TO_GET_ISSUER_CERT_LOCALLY
            || error == VerifyErrorCode::CERT_CHAIN_TOO_LONG;
        match intermediates.last() {
            Some(cert) if top_of_chain => Self::new(cert, intermediates.len(), error),
            _ => Self::new(end_entity, 0, error),
        }
    }

    /// The failing certificate.
    #[must_use]
    pub fn current_cert(&self) -> &CertificateDer<'a> {
        self.cert
    }

    /// Chain position of the failing certificate, the peer being 0.
    #[must_use]
    pub fn error_depth(&self) -> usize {
        self.depth
    }

    /// Why verification failed.
    #[must_use]
    pub fn error(&self) -> VerifyErrorCode {
        self.error
    }
}

/// Verification callback. Reports a rejection to `sink` and returns
/// `accepted` unchanged.
pub fn log_verify_failure(accepted: bool, store: &StoreContext<'_>, sink: &dyn MessageSink) -> bool {
    if accepted {
        return accepted;
    }
    let (subject, issuer) = match X509Certificate::from_der(store.current_cert().as_ref()) {
        Ok((_, cert)) => (oneline(cert.subject()), oneline(cert.issuer())),
        Err(_) => ("<unparsable>".to_owned(), "<unparsable>".to_owned()),
    };
    sink.message(
        CERT_COMPONENT,
        &format!("Cert verification failed for DN={subject}"),
        true,
    );
    sink.message(CERT_COMPONENT, &format!("Failing cert issuer={issuer}"), true);
    sink.message(
        CERT_COMPONENT,
        &format!(
            "Error {} at depth {} [{}]",
            store.error().0,
            store.error_depth(),
            store.error().description()
        ),
        true,
    );
    accepted
}

/// Formats a name as `/C=../O=../CN=..`.
#[must_use]
pub fn oneline(name: &X509Name<'_>) -> String {
    let registry = oid_registry();
    name.iter_attributes()
        .map(|attr| {
            let key = oid2abbrev(attr.attr_type(), registry)
                .map_or_else(|_| attr.attr_type().to_id_string(), str::to_owned);
            let value = attr.as_str().unwrap_or("<binary>");
            format!("/{key}={value}")
        })
        .collect()
}

struct ChainPolicy {
    depth: u32,
    log: Option<Arc<dyn MessageSink>>,
}

impl fmt::Debug for ChainPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainPolicy")
            .field("depth", &self.depth)
            .field("log", &self.log.is_some())
            .finish()
    }
}

impl ChainPolicy {
    fn check<T>(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        verify: impl FnOnce() -> Result<T, Error>,
    ) -> Result<T, Error> {
        // Depth bounds the intermediates. The trust anchor sits one above them.
        let result = if intermediates.len() > self.depth as usize {
            Err(Error::InvalidCertificate(CertificateError::Other(
                OtherError(Arc::new(ChainTooLong { depth: self.depth })),
            )))
        } else {
            verify()
        };
        if let (Err(err), Some(sink)) = (&result, &self.log) {
            let store = StoreContext::for_error(err, end_entity, intermediates);
            log_verify_failure(false, &store, sink.as_ref());
        }
        result
    }
}

/// Client-side verifier of server certificates.
#[derive(Debug)]
pub struct PeerServerVerifier {
    inner: Arc<WebPkiServerVerifier>,
    policy: ChainPolicy,
}

impl PeerServerVerifier {
    /// Verifies against `roots`, allowing chains up to `depth`, reporting
    /// rejections to `log` if given.
    pub fn new(
        roots: Arc<RootCertStore>,
        provider: Arc<CryptoProvider>,
        depth: u32,
        log: Option<Arc<dyn MessageSink>>,
    ) -> Result<Self, VerifierBuilderError> {
        let inner = WebPkiServerVerifier::builder_with_provider(roots, provider).build()?;
        Ok(Self {
            inner,
            policy: ChainPolicy { depth, log },
        })
    }
}

impl ServerCertVerifier for PeerServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, Error> {
        self.policy.check(end_entity, intermediates, || {
            self.inner
                .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
        })
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// Server-side verifier of client certificates. A client certificate is
/// required.
#[derive(Debug)]
pub struct PeerClientVerifier {
    inner: Arc<dyn ClientCertVerifier>,
    policy: ChainPolicy,
}

impl PeerClientVerifier {
    /// Verifies against `roots`, allowing chains up to `depth`, reporting
    /// rejections to `log` if given.
    pub fn new(
        roots: Arc<RootCertStore>,
        provider: Arc<CryptoProvider>,
        depth: u32,
        log: Option<Arc<dyn MessageSink>>,
    ) -> Result<Self, VerifierBuilderError> {
        let inner = WebPkiClientVerifier::builder_with_provider(roots, provider).build()?;
        Ok(Self {
            inner,
            policy: ChainPolicy { depth, log },
        })
    }
}

impl ClientCertVerifier for PeerClientVerifier {
    fn client_auth_mandatory(&self) -> bool {
        self.inner.client_auth_mandatory()
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        self.inner.root_hint_subjects()
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> Result<ClientCertVerified, Error> {
        self.policy.check(end_entity, intermediates, || {
            self.inner.verify_client_cert(end_entity, intermediates, now)
        })
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::testing::Recorder;
    use crate::testdata;
    use rustls::crypto::ring;
    use std::time::Duration;

    fn roots() -> Arc<RootCertStore> {
        let mut roots = RootCertStore::empty();
        roots.add_parsable_certificates(testdata::certs(testdata::CA_CERT));
        Arc::new(roots)
    }

    fn server_verifier(depth: u32, log: Option<Arc<Recorder>>) -> PeerServerVerifier {
        PeerServerVerifier::new(
            roots(),
            Arc::new(ring::default_provider()),
            depth,
            log.map(|log| log as Arc<dyn MessageSink>),
        )
        .expect("verifier")
    }

    fn verify_server(
        verifier: &PeerServerVerifier,
        chain: &[CertificateDer<'static>],
    ) -> Result<ServerCertVerified, Error> {
        verify_server_as(verifier, chain, "localhost", UnixTime::now())
    }

    fn verify_server_as(
        verifier: &PeerServerVerifier,
        chain: &[CertificateDer<'static>],
        name: &'static str,
        now: UnixTime,
    ) -> Result<ServerCertVerified, Error> {
        verifier.verify_server_cert(
            &chain[0],
            &chain[1..],
            &ServerName::try_from(name).expect("name"),
            &[],
            now,
        )
    }

    fn at(secs: u64) -> UnixTime {
        UnixTime::since_unix_epoch(Duration::from_secs(secs))
    }

    #[test]
    fn callback_preserves_verdict() {
        let cert = testdata::certs(testdata::ROGUE_CERT).remove(0);
        for error in [VerifyErrorCode::UNSPECIFIED, VerifyErrorCode::CERT_HAS_EXPIRED] {
            for depth in [0, 3] {
                let store = StoreContext::new(&cert, depth, error);
                let sink = Recorder::default();
                assert!(log_verify_failure(true, &store, &sink));
                assert!(sink.records().is_empty());
                assert!(!log_verify_failure(false, &store, &sink));
                assert_eq!(sink.records().len(), 3);
            }
        }
    }

    #[test]
    fn callback_reports_subject_issuer_and_error() {
        let cert = testdata::certs(testdata::ROGUE_CERT).remove(0);
        let store = StoreContext::new(&cert, 0, VerifyErrorCode::UNABLE_TO_GET_ISSUER_CERT_LOCALLY);
        let sink = Recorder::default();
        log_verify_failure(false, &store, &sink);
        assert_eq!(
            sink.records(),
            vec![
                (
                    "Cert".to_owned(),
                    "Cert verification failed for DN=/C=XX/O=Rogue/CN=localhost".to_owned(),
                    true
                ),
                (
                    "Cert".to_owned(),
                    "Failing cert issuer=/C=XX/O=Rogue/CN=Rogue CA".to_owned(),
                    true
                ),
                (
                    "Cert".to_owned(),
                    "Error 20 at depth 0 [unable to get local issuer certificate]".to_owned(),
                    true
                ),
            ]
        );
    }

    #[test]
    fn callback_survives_garbage() {
        let cert = CertificateDer::from(vec![0x30, 0x00]);
        let store = StoreContext::new(&cert, 2, VerifyErrorCode::UNSPECIFIED);
        let sink = Recorder::default();
        assert!(!log_verify_failure(false, &store, &sink));
        assert_eq!(
            sink.texts()[0],
            "Cert verification failed for DN=<unparsable>"
        );
    }

    #[test]
    fn accepts_chain_to_trusted_root() {
        let log = Arc::new(Recorder::default());
        let verifier = server_verifier(9, Some(log.clone()));
        verify_server(&verifier, &testdata::certs(testdata::HOST_CERT)).expect("direct");
        let mut chain = testdata::certs(testdata::DEEP_CERT);
        chain.extend(testdata::certs(testdata::INTERMEDIATE_CERT));
        verify_server(&verifier, &chain).expect("via intermediate");
        assert!(log.records().is_empty());
    }

    #[test]
    fn rejects_unknown_issuer_and_logs() {
        let log = Arc::new(Recorder::default());
        let verifier = server_verifier(9, Some(log.clone()));
        let err = verify_server(&verifier, &testdata::certs(testdata::ROGUE_CERT)).unwrap_err();
        assert_eq!(
            err,
            Error::InvalidCertificate(CertificateError::UnknownIssuer)
        );
        assert_eq!(log.texts().len(), 3);
        assert_eq!(
            log.texts()[2],
            "Error 20 at depth 0 [unable to get local issuer certificate]"
        );
    }

    #[test]
    fn rejects_without_logging_when_not_asked() {
        let verifier = server_verifier(9, None);
        assert!(verify_server(&verifier, &testdata::certs(testdata::ROGUE_CERT)).is_err());
    }

    #[test]
    fn reports_time_and_name_failures() {
        let host = testdata::certs(testdata::HOST_CERT);
        let cases = [
            // 2200-01-01, long after the fixtures expire.
            ("localhost", at(7_258_118_400), VerifyErrorCode::CERT_HAS_EXPIRED),
            // 2001-09-09, before they were issued.
            ("localhost", at(1_000_000_000), VerifyErrorCode::CERT_NOT_YET_VALID),
            ("example.org", UnixTime::now(), VerifyErrorCode::HOSTNAME_MISMATCH),
        ];
        for (name, now, code) in cases {
            let log = Arc::new(Recorder::default());
            let verifier = server_verifier(9, Some(log.clone()));
            let err = verify_server_as(&verifier, &host, name, now).unwrap_err();
            assert_eq!(VerifyErrorCode::from_error(&err), code, "{err:?}");
            assert_eq!(
                log.texts(),
                vec![
                    "Cert verification failed for DN=/C=CH/O=Test Grid/CN=localhost".to_owned(),
                    "Failing cert issuer=/C=CH/O=Test Grid/CN=Test Root CA".to_owned(),
                    format!("Error {} at depth 0 [{}]", code.0, code.description()),
                ]
            );
        }
        assert_eq!(
            VerifyErrorCode::CERT_HAS_EXPIRED.description(),
            "certificate has expired"
        );
        assert_eq!(VerifyErrorCode::HOSTNAME_MISMATCH.description(), "hostname mismatch");
    }

    #[test]
    fn enforces_depth() {
        let mut chain = testdata::certs(testdata::DEEP_CERT);
        chain.extend(testdata::certs(testdata::INTERMEDIATE_CERT));

        let log = Arc::new(Recorder::default());
        let err = verify_server(&server_verifier(0, Some(log.clone())), &chain).unwrap_err();
        assert_eq!(VerifyErrorCode::from_error(&err), VerifyErrorCode::CERT_CHAIN_TOO_LONG);
        assert_eq!(
            log.texts(),
            vec![
                "Cert verification failed for DN=/C=CH/O=Test Grid/CN=Test Intermediate CA",
                "Failing cert issuer=/C=CH/O=Test Grid/CN=Test Root CA",
                "Error 22 at depth 1 [certificate chain too long]",
            ]
        );

        verify_server(&server_verifier(1, None), &chain).expect("one intermediate fits depth 1");
        verify_server(&server_verifier(0, None), &testdata::certs(testdata::HOST_CERT))
            .expect("leaf under root fits depth 0");
    }

    #[test]
    fn client_verifier_requires_and_checks_certs() {
        let log = Arc::new(Recorder::default());
        let verifier = PeerClientVerifier::new(
            roots(),
            Arc::new(ring::default_provider()),
            9,
            Some(log.clone() as Arc<dyn MessageSink>),
        )
        .expect("verifier");
        assert!(verifier.client_auth_mandatory());
        assert_eq!(verifier.root_hint_subjects().len(), 1);

        let host = testdata::certs(testdata::HOST_CERT);
        verifier
            .verify_client_cert(&host[0], &[], UnixTime::now())
            .expect("trusted client");
        let rogue = testdata::certs(testdata::ROGUE_CERT);
        assert!(verifier
            .verify_client_cert(&rogue[0], &[], UnixTime::now())
            .is_err());
        assert_eq!(log.texts().len(), 3);
    }

    #[test]
    fn oneline_names() {
        let der = testdata::certs(testdata::HOST_CERT).remove(0);
        let (_, cert) = X509Certificate::from_der(der.as_ref()).expect("parse");
        assert_eq!(oneline(cert.subject()), "/C=CH/O=Test Grid/CN=localhost");
        assert_eq!(oneline(cert.issuer()), "/C=CH/O=Test Grid/CN=Test Root CA");
    }
}
