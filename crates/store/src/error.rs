//! Error types for the nd-store engine.

use std::io;

use snafu::Snafu;

use crate::types::Address;

/// Result type alias for nd-store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during nd-store operations.
///
/// Any of these leaves the index unusable from the consumer's point of view; the
/// engine performs no automatic repair.
#[derive(Debug, Snafu)]
pub enum Error {
    /// I/O error from the underlying storage backend.
    #[snafu(display("I/O error: {source}"))]
    Io {
        /// The underlying I/O error.
        source: io::Error,
    },

    /// Database file is corrupted or has invalid format.
    #[snafu(display("Corrupted database: {reason}"))]
    Corrupted {
        /// Description of what was corrupted.
        reason: String,
    },

    /// Database header checksum verification failed.
    #[snafu(display("Header checksum mismatch"))]
    HeaderChecksumMismatch,

    /// Invalid magic number in database header.
    #[snafu(display("Invalid database magic number"))]
    InvalidMagic,

    /// Database format version outside the range the caller accepts.
    #[snafu(display("Unsupported format version: {version} (supported {min}..={max})"))]
    UnsupportedVersion {
        /// The version found in the file.
        version: u32,
        /// Oldest version the caller accepts.
        min: u32,
        /// Newest version the caller accepts.
        max: u32,
    },

    /// Database is read-only.
    #[snafu(display("Database is read-only"))]
    ReadOnly,

    /// An address outside the allocated address space, or a null address where a
    /// record was required.
    #[snafu(display("Invalid address {address}"))]
    InvalidAddress {
        /// The offending address.
        address: Address,
    },

    /// Requested allocation cannot be represented by the allocator.
    #[snafu(display("Allocation too large: {size} bytes"))]
    AllocationTooLarge {
        /// Requested payload size in bytes.
        size: usize,
    },

    /// A record carries a node type tag that the schema does not know.
    #[snafu(display("Record {address} has unknown node type {node_type}"))]
    InvalidNodeType {
        /// The record address.
        address: Address,
        /// The tag read from the record.
        node_type: u16,
    },

    /// The record cannot be deleted on its own: it is the root record or is
    /// embedded in a list.
    #[snafu(display("Record {address} cannot be deleted: {reason}"))]
    NotDeletable {
        /// The record address.
        address: Address,
        /// Why the record is pinned.
        reason: String,
    },

    /// The declared schema is inconsistent.
    #[snafu(display("Invalid schema: {reason}"))]
    InvalidSchema {
        /// Description of the inconsistency.
        reason: String,
    },
}

// Provide automatic conversion from io::Error to Error::Io for ergonomic ? usage
impl From<io::Error> for Error {
    fn from(source: io::Error) -> Self {
        Error::Io { source }
    }
}

impl Error {
    /// Builds a [`Error::Corrupted`] from anything displayable.
    pub(crate) fn corrupted(reason: impl Into<String>) -> Self {
        Error::Corrupted { reason: reason.into() }
    }

    /// Returns `true` for any backend I/O failure.
    pub fn is_io(&self) -> bool {
        matches!(self, Error::Io { .. })
    }

    /// Returns `true` if this is an I/O error reporting an interrupted operation.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Error::Io { source } if source.kind() == io::ErrorKind::Interrupted)
    }
}
