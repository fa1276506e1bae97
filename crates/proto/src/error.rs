//! Wire-level error types.

use thiserror::Error;

/// Errors raised while encoding or decoding protocol frames.
///
/// Every variant is fatal to the link it occurred on: the stream position
/// can no longer be trusted once a field fails to decode.
#[derive(Debug, Error)]
pub enum ProtoError {
	/// The header carried a function type this peer does not know.
	#[error("unknown call kind on wire: {0}")]
	UnknownCallKind(u32),

	/// An argument envelope carried an unknown reference tag.
	#[error("unknown reference tag on wire: {0}")]
	UnknownRefTag(u8),

	/// A length prefix was negative, odd (for UTF-16 data) or implausibly large.
	#[error("length prefix out of range: {0}")]
	BadLength(i64),

	/// A string field did not decode as UTF-16LE.
	#[error("malformed string field: {0}")]
	BadString(String),

	/// The peer closed the stream between frames.
	#[error("link closed by peer")]
	Eof,

	/// The underlying stream raised an error (including mid-frame EOF).
	#[error(transparent)]
	Io(#[from] std::io::Error),
}

/// Result type for protocol operations.
pub type Result<T> = std::result::Result<T, ProtoError>;
