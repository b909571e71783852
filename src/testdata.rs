//! PEM fixtures shared by the unit tests.

use rustls::pki_types::CertificateDer;
use std::io::Cursor;

pub const CA_CERT: &str = include_str!("../tests/data/ca.pem");
pub const INTERMEDIATE_CERT: &str = include_str!("../tests/data/int.pem");
pub const HOST_CERT: &str = include_str!("../tests/data/host.pem");
pub const HOST_KEY: &str = include_str!("../tests/data/host.key");
pub const DEEP_CERT: &str = include_str!("../tests/data/deep.pem");
pub const ROGUE_CERT: &str = include_str!("../tests/data/rogue.pem");
pub const ROGUE_CA_CERT: &str = include_str!("../tests/data/rogueca.pem");
pub const OTHER_KEY: &str = include_str!("../tests/data/other.key");

pub fn certs(pem: &str) -> Vec<CertificateDer<'static>> {
    rustls_pemfile::certs(&mut Cursor::new(pem))
        .collect::<Result<Vec<_>, _>>()
        .expect("test certificates")
}
