//! Error taxonomy for the remoting runtime.

use thiserror::Error;

use crate::ident::ObjectId;

/// Errors surfaced by the remoting runtime.
///
/// Link-fatal conditions ([`RemotingError::Protocol`], wire and I/O
/// failures) tear the whole link down; per-call conditions
/// ([`RemotingError::Remote`], [`RemotingError::InstanceNotFound`]) travel
/// in `ExceptionReturn` frames and leave the link healthy.
#[derive(Debug, Error)]
pub enum RemotingError {
	/// The peer violated the protocol; fatal to the link.
	#[error("protocol violation: {0}")]
	Protocol(String),

	/// A frame failed to encode or decode; fatal to the link.
	#[error(transparent)]
	Wire(#[from] tether_proto::ProtoError),

	/// The requested operation cannot be remoted.
	#[error("unsupported operation: {0}")]
	Unsupported(String),

	/// No instance is registered under the target identifier.
	#[error("no instance registered under {0}")]
	InstanceNotFound(ObjectId),

	/// The invoked method failed on the remote side.
	#[error("remote call failed: {kind}: {message}")]
	Remote {
		/// Stable name of the remote error kind.
		kind: String,
		/// Human-readable message from the remote side.
		message: String,
		/// Remote diagnostic detail, when the peer supplied one.
		detail: Option<String>,
	},

	/// The link terminator fired while a call was outstanding.
	#[error("link is down")]
	LinkDown,

	/// A different object was registered under an existing identifier in
	/// strict mode.
	#[error("duplicate registration under {0}")]
	DuplicateRegistration(ObjectId),

	/// The peer index is exhausted; a process tracks at most 64 peers.
	#[error("peer table is full: at most 64 distinct peers per process")]
	TooManyPeers,

	/// An inline value failed to encode or decode in the payload codec.
	#[error("payload codec error: {0}")]
	Codec(#[from] postcard::Error),

	/// The underlying transport raised an error.
	#[error(transparent)]
	Io(#[from] std::io::Error),
}

impl RemotingError {
	/// Builds a remote-side fault from an error kind and message.
	///
	/// Dispatch implementations use this to raise application exceptions
	/// that propagate to the calling peer with kind and message preserved.
	pub fn remote(kind: impl Into<String>, message: impl Into<String>) -> Self {
		Self::Remote {
			kind: kind.into(),
			message: message.into(),
			detail: None,
		}
	}

	/// The stable kind string encoded into an `ExceptionReturn` frame.
	pub(crate) fn wire_kind(&self) -> &str {
		match self {
			Self::Remote { kind, .. } => kind,
			Self::InstanceNotFound(_) => "InstanceNotFound",
			Self::Unsupported(_) => "UnsupportedOperation",
			Self::DuplicateRegistration(_) => "DuplicateRegistration",
			Self::Protocol(_) | Self::Wire(_) => "ProtocolError",
			Self::LinkDown => "LinkDown",
			Self::TooManyPeers => "TooManyPeers",
			Self::Codec(_) => "SerializationError",
			Self::Io(_) => "IoError",
		}
	}
}

/// Result type for remoting operations.
pub type Result<T> = std::result::Result<T, RemotingError>;
