//! NDR error types

use std::char::DecodeUtf16Error;
use std::string::FromUtf8Error;
use thiserror::Error;

/// Result type for NDR operations
pub type Result<T> = std::result::Result<T, NdrError>;

/// NDR encoding/decoding errors
///
/// Every decode failure is reported through this type; a malformed or
/// truncated buffer never panics and never reads past the end of the input.
#[derive(Debug, Error)]
pub enum NdrError {
    #[error("truncated input: needed {needed} bytes, have {have}")]
    TruncatedInput { needed: usize, have: usize },

    #[error("size overflow: declared {declared}, limit {limit}")]
    SizeOverflow { declared: u64, limit: u64 },

    #[error("missing referent for pointer 0x{0:08x}")]
    MissingReferent(u32),

    #[error("referent for pointer 0x{0:08x} was decoded but never claimed")]
    UnresolvedReferent(u32),

    #[error("referent for pointer 0x{0:08x} has an unexpected type")]
    ReferentTypeMismatch(u32),

    #[error("unknown union variant: discriminant {0}")]
    UnknownUnionVariant(u32),

    #[error("conformance mismatch: max_count={max_count}, actual_count={actual_count}")]
    ConformanceMismatch { max_count: u64, actual_count: u64 },

    #[error("invalid alignment: {0}")]
    InvalidAlignment(usize),

    #[error("non-zero array offset: {0}")]
    NonZeroOffset(u32),

    #[error("invalid enum value: {0}")]
    InvalidEnumValue(u32),

    #[error("invalid string: {0}")]
    InvalidString(String),

    #[error("UTF-8 error: {0}")]
    Utf8Error(#[from] FromUtf8Error),

    #[error("UTF-16 error: {0}")]
    Utf16Error(#[from] DecodeUtf16Error),
}

impl NdrError {
    pub(crate) fn truncated(needed: usize, have: usize) -> Self {
        NdrError::TruncatedInput { needed, have }
    }
}
