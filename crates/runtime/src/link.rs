//! One direction-pair of a remoting link.
//!
//! A [`Link`] owns the write half of one stream plus the terminator token
//! shared by everything running on that stream. All senders assemble their
//! frame body in a local buffer first and copy it onto the stream under
//! the link's writer mutex, so concurrent senders can never interleave
//! bodies.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use tether_proto::{CallHeader, CallKind, write_frame};

use crate::error::Result;
use crate::ident::PeerId;

/// Boxed read half of a link stream.
pub type BoxRead = Box<dyn AsyncRead + Send + Unpin>;
/// Boxed write half of a link stream.
pub type BoxWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// Splits a TCP stream into the boxed halves a link runs on.
///
/// This is the transport wrap point: a TLS (or other) stream adapter goes
/// around the stream here, identically on both sides, before the halves
/// are split.
#[must_use]
pub fn wrap_stream(stream: TcpStream) -> (BoxRead, BoxWrite) {
	let (read, write) = stream.into_split();
	(Box::new(read), Box::new(write))
}

/// The write side and terminator of one stream.
pub struct Link {
	peer: PeerId,
	writer: tokio::sync::Mutex<BoxWrite>,
	terminator: CancellationToken,
}

impl Link {
	/// Wraps a write half.
	#[must_use]
	pub fn new(peer: PeerId, writer: BoxWrite, terminator: CancellationToken) -> Arc<Self> {
		Arc::new(Self {
			peer,
			writer: tokio::sync::Mutex::new(writer),
			terminator,
		})
	}

	/// The peer on the other end of this link.
	#[must_use]
	pub fn peer(&self) -> &PeerId {
		&self.peer
	}

	/// The terminator cancelling everything that runs on this link.
	#[must_use]
	pub fn terminator(&self) -> &CancellationToken {
		&self.terminator
	}

	/// Writes one frame atomically with respect to other senders.
	pub async fn send(&self, kind: CallKind, sequence: i32, body: &[u8]) -> Result<()> {
		let mut writer = self.writer.lock().await;
		write_frame(&mut *writer, CallHeader::new(kind, sequence), body).await?;
		Ok(())
	}
}
