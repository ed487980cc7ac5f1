//! Error types returned from BBP operations.

use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BbpError {
    /// Returned when an I/O operation against a farm directory or a catalog
    /// file fails.
    #[error("io error: {0}")]
    Io(String),

    /// Returned when `BBP.dir` cannot be parsed: truncated header, a field
    /// that doesn't parse as the expected integer, or a malformed entry line.
    #[error("malformed catalog: {0}")]
    CatalogMalformed(String),

    /// Returned when the catalog's recorded pointer size, OID size, or
    /// format version is incompatible with this build.
    #[error("incompatible database: {0}")]
    IncompatibleDatabase(String),

    /// Returned when `BBP.dir` declares a format version older than this
    /// build knows how to read.
    #[error("catalog version too old: {0}")]
    VersionTooOld(String),

    /// Returned when a farm configuration is missing a root for a role that
    /// is required, or a role mask collides with an existing farm.
    #[error("invalid farm configuration: {0}")]
    InvalidFarm(String),

    /// Returned by `rename` when the requested name is already bound to a
    /// different BAT.
    #[error("name already in use: {0}")]
    NameInUse(String),

    /// Returned by `rename` when the requested name has the reserved
    /// `tmp_<octal>` shape.
    #[error("illegal temporary name: {0}")]
    IllegalTemporaryName(String),

    /// Returned when an id does not name a live slot.
    #[error("not a valid bat id: {0}")]
    InvalidId(u64),

    /// Returned when the slot table has reached its hard capacity `H*L`.
    #[error("bbp exhausted: cannot allocate beyond {0} slots")]
    Exhausted(usize),

    /// Returned when a physical pin is released more times than it was
    /// taken, or a logical release happens on a BAT without logical
    /// references. Debug builds additionally assert on this condition.
    #[error("precondition violated: {0}")]
    Precondition(String),

    /// Returned when a commit must abort because staging a heap into the
    /// backup tree failed; the database remains in its pre-commit state and
    /// the caller may retry.
    #[error("commit aborted: {0}")]
    CommitAborted(String),

    /// Returned when recovery cannot make progress, e.g. a file in the
    /// backup tree cannot be moved back to its live location.
    #[error("recovery failed: {0}")]
    RecoveryFailed(String),
}

impl From<io::Error> for BbpError {
    #[inline]
    fn from(e: io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BbpError>;
