//! Error types shared by the header codec, the byte queue, pack and extract

use thiserror::Error;

/// Tar codec error type
#[derive(Debug, Error)]
pub enum TarError {
    /// Name is longer than 100 bytes and cannot be split into prefix/name
    #[error("invalid name: '{0}' cannot be split into a 155 byte prefix and a 100 byte name")]
    InvalidName(String),

    /// Encoded name and prefix together exceed 255 bytes
    #[error("invalid name length: {0} bytes (name and prefix must be at most 255 bytes)")]
    InvalidNameLength(usize),

    /// Link target does not fit the 100 byte linkname field
    #[error("invalid linkname length: {0} bytes (must be at most 100 bytes)")]
    InvalidLinkname(usize),

    /// Stored checksum does not match the block contents
    #[error("invalid checksum: header says {expected:o}, block sums to {actual:o}")]
    InvalidChecksum {
        /// Checksum read from the header field
        expected: u32,
        /// Checksum computed over the block
        actual: u32,
    },

    /// Base-256 numeric field is negative, has an unknown marker or overflows
    #[error("invalid base-256 numeric field: {0:02X?}")]
    InvalidBase256(Vec<u8>),

    /// Octal numeric field contains a non-octal digit
    #[error("invalid octal numeric field: {0:?}")]
    InvalidOctalFormat(String),

    /// Block is all zeros (terminator or padding), not a header
    #[error("block is not a header (all zero)")]
    NotAHeader,

    /// Malformed PAX extended header payload
    #[error("invalid PAX record: {0}")]
    InvalidPaxRecord(String),

    /// More bytes were requested from the byte queue than it holds
    #[error("insufficient bytes: requested {requested}, buffered {available}")]
    InsufficientBytes {
        /// Number of bytes requested
        requested: usize,
        /// Number of bytes buffered
        available: usize,
    },

    /// Input ended in the middle of an entry
    #[error("truncated archive: input ended at offset {offset} with {missing} bytes missing")]
    Truncated {
        /// Total bytes consumed when the input ended
        offset: u64,
        /// Bytes still expected by the decoder
        missing: u64,
    },

    /// `add` was called after `done`
    #[error("can't add new entry after calling done()")]
    HasFinished,

    /// Extract was used after it errored
    #[error("extract stream is closed")]
    Closed,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for tar operations
pub type TarResult<T> = Result<T, TarError>;
