//! Core Error Types
//!
//! Errors raised while decoding log messages and datapoint blocks, building row
//! keys, or loading key material.
//!
//! ## Error Categories
//!
//! ### Wire Format Errors
//! - `MalformedMessage`: A log message could not be decoded (bad kind, truncation, trailing bytes)
//! - `MalformedBlock`: A datapoint block could not be decoded
//! - `UnsupportedVersion`: Message was produced by a newer encoder
//!
//! ### Configuration Errors
//! - `InvalidKey`: Key material has the wrong length or encoding
//! - `InvalidModulus`: Row key modulus below 1
//!
//! Crypto failures on the message path have their own type
//! ([`crate::crypto::EnvelopeError`]) because they are never fatal.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Malformed log message: {0}")]
    MalformedMessage(String),

    #[error("Malformed datapoint block: {0}")]
    MalformedBlock(String),

    #[error("Unsupported message version: {0}")]
    UnsupportedVersion(u8),

    #[error("Invalid key '{name}': {reason}")]
    InvalidKey { name: String, reason: String },

    #[error("Invalid row key modulus: {0} (must be >= 1)")]
    InvalidModulus(i64),

    #[error("Storage seal error: {0}")]
    Seal(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;
