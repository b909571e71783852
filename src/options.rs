//! Context construction options.

use std::fmt;

/// Verification depth used when the options word does not carry one.
pub const DEFAULT_VERIFY_DEPTH: u32 = 9;

const VERIFY_DEPTH_MASK: u32 = 0x0000_ff00;
const VERIFY_DEPTH_SHIFT: u32 = 8;

/// Options word passed to [`ContextBuilder::build`](crate::ContextBuilder::build).
///
/// Two flag bits and an 8-bit verification depth subfield. Bits that are
/// not recognized are kept as-is so that [`Parameters`](crate::Parameters)
/// replays exactly what the caller gave.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Options(u32);

impl Options {
    /// Context is for the server role.
    pub const SERVER: Self = Self(0x0000_0001);
    /// Log peer certificate verification failures.
    pub const LOG_VERIFY_FAILURES: Self = Self(0x0000_0002);

    /// Creates options from a raw word.
    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Returns the raw word.
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Returns `true` if every bit of `other` is set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns `true` for server contexts.
    #[must_use]
    pub const fn is_server(self) -> bool {
        self.contains(Self::SERVER)
    }

    /// Returns `true` if verification failures should be logged.
    #[must_use]
    pub const fn log_verify_failures(self) -> bool {
        self.contains(Self::LOG_VERIFY_FAILURES)
    }

    /// Sets the verification depth subfield. Values above 255 saturate.
    #[must_use]
    pub const fn with_verify_depth(self, depth: u32) -> Self {
        let depth = if depth > 0xff { 0xff } else { depth };
        Self((self.0 & !VERIFY_DEPTH_MASK) | (depth << VERIFY_DEPTH_SHIFT))
    }

    /// Raw verification depth subfield, zero when unset.
    #[must_use]
    pub const fn verify_depth(self) -> u32 {
        (self.0 & VERIFY_DEPTH_MASK) >> VERIFY_DEPTH_SHIFT
    }

    /// Verification depth to apply, substituting [`DEFAULT_VERIFY_DEPTH`]
    /// for zero.
    #[must_use]
    pub const fn effective_verify_depth(self) -> u32 {
        match self.verify_depth() {
            0 => DEFAULT_VERIFY_DEPTH,
            depth => depth,
        }
    }
}

impl std::ops::BitOr for Options {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for Options {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("server", &self.is_server())
            .field("log_verify_failures", &self.log_verify_failures())
            .field("verify_depth", &self.verify_depth())
            .field("bits", &format_args!("{:#010x}", self.0))
            .finish()
    }
}
