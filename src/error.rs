//! Error kinds surfaced by the linker.
//!
//! The variants are coarse enough for a crash reporter to classify a failed
//! launch and carry the paths and symbol names needed to compose the
//! human-readable halt message.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Bad header, overlong load command, overlapping segments, or a
    /// truncated slice.
    #[error("malformed mach-o image {path:?}: {reason}")]
    MalformedImage { path: PathBuf, reason: String },

    /// A rebase site fell outside its segment, or the rebase stream itself
    /// is corrupt.
    #[error("malformed rebase information in {path:?}: {reason}")]
    MalformedRebase { path: PathBuf, reason: String },

    /// The file's cpu type/subtype is not runnable on this host.
    #[error("{path:?} is not compatible with this architecture (cputype {cputype:#x})")]
    UnsupportedArch { path: PathBuf, cputype: u32 },

    /// A non-slideable segment could not be placed at its preferred
    /// address.
    #[error("cannot map segment {segment} of {path:?} at required address {vmaddr:#x}")]
    AddressSpaceBusy {
        path: PathBuf,
        segment: String,
        vmaddr: u64,
    },

    /// Code signature rejected during registration.
    #[error("code signature registration failed for {path:?}")]
    SignatureInvalid { path: PathBuf },

    /// A required dependency could not be located on disk or in the shared
    /// cache.
    #[error("library not loaded: {name}\n  referenced from: {referenced_from:?}\n  reason: {reason}")]
    MissingLibrary {
        name: String,
        referenced_from: PathBuf,
        reason: String,
    },

    /// A non-weak undefined symbol could not be resolved.
    #[error("symbol not found: {symbol}\n  referenced from: {referenced_from:?}\n  expected in: {expected_in}")]
    SymbolNotFound {
        symbol: String,
        referenced_from: PathBuf,
        expected_in: String,
    },

    /// Dependency's compatibility version is lower than the client
    /// requires.
    #[error(
        "incompatible library version: {referenced_from:?} requires version {required} or later, \
         but {name} provides version {found}"
    )]
    VersionMismatch {
        name: String,
        referenced_from: PathBuf,
        required: PackedVersion,
        found: PackedVersion,
    },

    /// A state-change handler returned a rejection string for a load
    /// batch.
    #[error("image load rejected by handler: {reason}")]
    HandlerRejected { reason: String },

    /// The shared cache on disk does not match the running libsystem.
    #[error("shared cache mismatch: {reason}")]
    CacheMismatch { reason: String },

    /// Dependency or segment counts overflow their per-image storage.
    #[error("{path:?} has too many {what} ({count})")]
    TooManyDependencies {
        path: PathBuf,
        what: &'static str,
        count: usize,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Scroll(#[from] scroll::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// A `X.Y.Z` version packed into 32 bits as `xxxx.yy.zz`, the encoding used
/// by `LC_LOAD_DYLIB` compatibility and current versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct PackedVersion(pub u32);

impl std::fmt::Display for PackedVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}.{}.{}",
            self.0 >> 16,
            (self.0 >> 8) & 0xff,
            self.0 & 0xff
        )
    }
}

impl Error {
    /// The short classification tag published in the debugger-visible
    /// process info when a launch halts.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::MalformedImage { .. } | Error::MalformedRebase { .. } => {
                ErrorKind::MalformedImage
            }
            Error::UnsupportedArch { .. } => ErrorKind::UnsupportedArch,
            Error::AddressSpaceBusy { .. } => ErrorKind::AddressSpaceBusy,
            Error::SignatureInvalid { .. } => ErrorKind::SignatureInvalid,
            Error::MissingLibrary { .. } => ErrorKind::MissingLibrary,
            Error::SymbolNotFound { .. } => ErrorKind::SymbolNotFound,
            Error::VersionMismatch { .. } => ErrorKind::VersionMismatch,
            Error::HandlerRejected { .. } => ErrorKind::HandlerRejected,
            Error::CacheMismatch { .. } => ErrorKind::CacheMismatch,
            Error::TooManyDependencies { .. } => ErrorKind::MalformedImage,
            Error::Io(_) | Error::Scroll(_) => ErrorKind::Other,
        }
    }
}

/// Coarse error classification for crash reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorKind {
    None = 0,
    MalformedImage,
    UnsupportedArch,
    AddressSpaceBusy,
    SignatureInvalid,
    MissingLibrary,
    SymbolNotFound,
    VersionMismatch,
    HandlerRejected,
    CacheMismatch,
    Other,
}
