//! Credential path validation.
//!
//! Before anything reads credential material, every supplied path must
//! exist, be of the expected kind, and grant nobody more access than its
//! role allows. Only metadata is inspected; files are never opened here.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// What a credential path is used for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// Directory of trust anchors.
    CaDir,
    /// File of trust anchors.
    CaFile,
    /// Private key.
    Key,
    /// Certificate, with its key in a separate file.
    Cert,
    /// Certificate with the private key in the same file.
    CertWithKey,
}

impl Role {
    /// Highest permission bits a path in this role may carry.
    #[must_use]
    pub const fn mask(self) -> u32 {
        match self {
            Self::CaDir => 0o755,
            Self::CaFile | Self::Cert => 0o674,
            Self::Key | Self::CertWithKey => 0o600,
        }
    }

    /// Whether the path must be a directory rather than a regular file.
    #[must_use]
    pub const fn is_directory(self) -> bool {
        matches!(self, Self::CaDir)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::CaDir => "CA cert directory",
            Self::CaFile => "CA cert file",
            Self::Key => "key file",
            Self::Cert => "cert file",
            Self::CertWithKey => "cert+key file",
        })
    }
}

/// Why a path was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Problem {
    /// Metadata could not be obtained.
    Inaccessible(String),
    /// A directory was expected.
    NotDirectory,
    /// A regular file was expected.
    NotFile,
    /// Permission bits beyond the role's mask.
    ExcessiveAccess(u32),
}

impl fmt::Display for Problem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inaccessible(reason) => f.write_str(reason),
            Self::NotDirectory => f.write_str("is not a directory"),
            Self::NotFile => f.write_str("is not a file"),
            Self::ExcessiveAccess(mode) => {
                write!(f, "has excessive access rights (mode {mode:o})")
            }
        }
    }
}

/// A refused credential path.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unable to use {role} {}; {problem}", .path.display())]
pub struct PathError {
    /// Role the path was supplied for.
    pub role: Role,
    /// The path.
    pub path: PathBuf,
    /// What is wrong with it.
    pub problem: Problem,
}

/// Checks every supplied credential path, stopping at the first refusal.
///
/// The certificate is held to the key's mask when no separate key is
/// given, since it then carries the key itself.
pub fn validate(
    cert: Option<&Path>,
    pkey: Option<&Path>,
    cadir: Option<&Path>,
    cafile: Option<&Path>,
) -> Result<(), PathError> {
    let cert_role = if pkey.is_some() {
        Role::Cert
    } else {
        Role::CertWithKey
    };
    [
        (cadir, Role::CaDir),
        (cafile, Role::CaFile),
        (pkey, Role::Key),
        (cert, cert_role),
    ]
    .into_iter()
    .filter_map(|(path, role)| path.map(|path| (path, role)))
    .try_for_each(|(path, role)| check(path, role))
}

/// Checks a single path against `role`.
pub fn check(path: &Path, role: Role) -> Result<(), PathError> {
    let refuse = |problem| PathError {
        role,
        path: path.to_owned(),
        problem,
    };
    let metadata = std::fs::metadata(path).map_err(|err| refuse(inaccessible(&err)))?;
    if role.is_directory() {
        if !metadata.is_dir() {
            return Err(refuse(Problem::NotDirectory));
        }
    } else if !metadata.is_file() {
        return Err(refuse(Problem::NotFile));
    }
    check_mode(&metadata, role).map_err(refuse)
}

fn inaccessible(err: &io::Error) -> Problem {
    Problem::Inaccessible(match err.kind() {
        io::ErrorKind::NotFound => "does not exist".to_owned(),
        _ => err.to_string(),
    })
}

#[cfg(unix)]
fn check_mode(metadata: &std::fs::Metadata, role: Role) -> Result<(), Problem> {
    use std::os::unix::fs::PermissionsExt;

    let mode = metadata.permissions().mode() & 0o777;
    if mode & !role.mask() != 0 {
        return Err(Problem::ExcessiveAccess(mode));
    }
    Ok(())
}

#[cfg(not(unix))]
fn check_mode(_metadata: &std::fs::Metadata, role: Role) -> Result<(), Problem> {
    tracing::warn!("Permission check for {role} not available on this platform");
    Ok(())
}
