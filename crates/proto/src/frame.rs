//! Call headers and primitive wire encodings.
//!
//! Integers travel little-endian. Strings travel as an `i32` byte-length
//! prefix followed by UTF-16LE code units. Byte blobs travel as an `i32`
//! length prefix followed by raw bytes.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ProtoError, Result};

/// Upper bound for any length prefix read off the wire.
///
/// Anything larger is treated as stream desynchronisation rather than a
/// legitimate payload.
const MAX_FIELD_LEN: usize = 64 * 1024 * 1024;

/// The logical kind of a protocol frame.
///
/// Wire values are fixed; both peers must agree on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum CallKind {
	/// Construct a server-side instance with its default constructor.
	CreateInstanceWithDefaultCtor = 1,
	/// Construct a server-side instance with explicit arguments.
	CreateInstance = 2,
	/// Invoke a method on a registered instance.
	MethodCall = 3,
	/// Successful reply carrying the return value and out-parameters.
	MethodReply = 4,
	/// The invoked method failed; carries the decoded exception.
	ExceptionReturn = 5,
	/// First client frame announcing the endpoint for the reverse channel.
	OpenReverseChannel = 6,
	/// Batch of object identifiers released by the sending peer.
	GcCleanup = 7,
	/// Ask the server process to shut down.
	ShutdownServer = 8,
	/// Broadcast by a shutting-down server; fails all pending calls.
	ServerShuttingDown = 9,
}

impl CallKind {
	/// Decodes a wire value into a call kind.
	pub fn from_wire(v: u32) -> Result<Self> {
		Ok(match v {
			1 => Self::CreateInstanceWithDefaultCtor,
			2 => Self::CreateInstance,
			3 => Self::MethodCall,
			4 => Self::MethodReply,
			5 => Self::ExceptionReturn,
			6 => Self::OpenReverseChannel,
			7 => Self::GcCleanup,
			8 => Self::ShutdownServer,
			9 => Self::ServerShuttingDown,
			other => return Err(ProtoError::UnknownCallKind(other)),
		})
	}
}

/// The `(kind, sequence)` prefix of every frame.
///
/// Replies echo the sequence of the request they answer. Client-originated
/// sequences start at 1; server-originated (callback) sequences start at
/// 10 000 so the two ranges cannot collide on a shared stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallHeader {
	/// The frame kind.
	pub kind: CallKind,
	/// Sender-chosen sequence number.
	pub sequence: i32,
}

impl CallHeader {
	/// Encoded size of a header in bytes.
	pub const SIZE: usize = 8;

	/// Creates a header.
	#[must_use]
	pub fn new(kind: CallKind, sequence: i32) -> Self {
		Self { kind, sequence }
	}

	/// Appends the header to a body buffer.
	pub fn put(&self, buf: &mut Vec<u8>) {
		put_u32(buf, self.kind as u32);
		put_i32(buf, self.sequence);
	}

	/// Reads a header from the stream.
	///
	/// A clean EOF before the first header byte is reported as
	/// [`ProtoError::Eof`]; EOF inside the header is an I/O error, the
	/// stream died mid-frame.
	pub async fn read(reader: &mut (impl AsyncRead + Unpin)) -> Result<Self> {
		let mut raw = [0u8; Self::SIZE];
		let mut filled = 0;
		while filled < raw.len() {
			let n = reader.read(&mut raw[filled..]).await?;
			if n == 0 {
				if filled == 0 {
					return Err(ProtoError::Eof);
				}
				return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
			}
			filled += n;
		}
		let kind = CallKind::from_wire(u32::from_le_bytes(raw[0..4].try_into().unwrap()))?;
		let sequence = i32::from_le_bytes(raw[4..8].try_into().unwrap());
		Ok(Self { kind, sequence })
	}
}

/// Appends a little-endian `u32`.
pub fn put_u32(buf: &mut Vec<u8>, v: u32) {
	buf.extend_from_slice(&v.to_le_bytes());
}

/// Appends a little-endian `i32`.
pub fn put_i32(buf: &mut Vec<u8>, v: i32) {
	buf.extend_from_slice(&v.to_le_bytes());
}

/// Appends a single byte.
pub fn put_u8(buf: &mut Vec<u8>, v: u8) {
	buf.push(v);
}

/// Appends a length-prefixed UTF-16LE string.
pub fn put_str(buf: &mut Vec<u8>, s: &str) {
	let start = buf.len();
	put_i32(buf, 0);
	for unit in s.encode_utf16() {
		buf.extend_from_slice(&unit.to_le_bytes());
	}
	let byte_len = (buf.len() - start - 4) as i32;
	buf[start..start + 4].copy_from_slice(&byte_len.to_le_bytes());
}

/// Appends a length-prefixed byte blob.
pub fn put_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
	put_i32(buf, bytes.len() as i32);
	buf.extend_from_slice(bytes);
}

/// Reads a little-endian `u32`.
pub async fn read_u32(reader: &mut (impl AsyncRead + Unpin)) -> Result<u32> {
	let mut raw = [0u8; 4];
	reader.read_exact(&mut raw).await?;
	Ok(u32::from_le_bytes(raw))
}

/// Reads a little-endian `i32`.
pub async fn read_i32(reader: &mut (impl AsyncRead + Unpin)) -> Result<i32> {
	let mut raw = [0u8; 4];
	reader.read_exact(&mut raw).await?;
	Ok(i32::from_le_bytes(raw))
}

/// Reads a single byte.
pub async fn read_u8(reader: &mut (impl AsyncRead + Unpin)) -> Result<u8> {
	let mut raw = [0u8; 1];
	reader.read_exact(&mut raw).await?;
	Ok(raw[0])
}

/// Validates a length prefix against [`MAX_FIELD_LEN`].
fn checked_len(len: i32) -> Result<usize> {
	if len < 0 || len as usize > MAX_FIELD_LEN {
		return Err(ProtoError::BadLength(i64::from(len)));
	}
	Ok(len as usize)
}

/// Reads a length-prefixed UTF-16LE string.
pub async fn read_str(reader: &mut (impl AsyncRead + Unpin)) -> Result<String> {
	let byte_len = checked_len(read_i32(reader).await?)?;
	if byte_len % 2 != 0 {
		return Err(ProtoError::BadLength(byte_len as i64));
	}
	let mut raw = vec![0u8; byte_len];
	reader.read_exact(&mut raw).await?;
	let units: Vec<u16> = raw
		.chunks_exact(2)
		.map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
		.collect();
	String::from_utf16(&units).map_err(|_| ProtoError::BadString(format!("{byte_len} bytes")))
}

/// Reads a length-prefixed byte blob.
pub async fn read_bytes(reader: &mut (impl AsyncRead + Unpin)) -> Result<Vec<u8>> {
	let len = checked_len(read_i32(reader).await?)?;
	let mut raw = vec![0u8; len];
	reader.read_exact(&mut raw).await?;
	Ok(raw)
}

/// Writes a complete frame (header plus pre-assembled body) and flushes.
///
/// The caller is responsible for holding its per-link writer lock across
/// this call so concurrent senders cannot interleave bodies.
pub async fn write_frame(
	writer: &mut (impl AsyncWrite + Unpin),
	header: CallHeader,
	body: &[u8],
) -> Result<()> {
	tracing::trace!(kind = ?header.kind, sequence = header.sequence, len = body.len(), "frame out");
	let mut prefix = Vec::with_capacity(CallHeader::SIZE);
	header.put(&mut prefix);
	writer.write_all(&prefix).await?;
	writer.write_all(body).await?;
	writer.flush().await?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use rstest::rstest;

	use super::*;

	#[tokio::test]
	async fn header_roundtrip() {
		let mut buf = Vec::new();
		CallHeader::new(CallKind::MethodCall, 42).put(&mut buf);
		assert_eq!(buf.len(), CallHeader::SIZE);
		let decoded = CallHeader::read(&mut buf.as_slice()).await.unwrap();
		assert_eq!(decoded.kind, CallKind::MethodCall);
		assert_eq!(decoded.sequence, 42);
	}

	#[tokio::test]
	async fn header_rejects_unknown_kind() {
		let mut buf = Vec::new();
		put_u32(&mut buf, 999);
		put_i32(&mut buf, 1);
		let err = CallHeader::read(&mut buf.as_slice()).await.unwrap_err();
		assert!(matches!(err, ProtoError::UnknownCallKind(999)));
	}

	#[tokio::test]
	async fn header_eof_between_frames() {
		let err = CallHeader::read(&mut [0u8; 0].as_slice()).await.unwrap_err();
		assert!(matches!(err, ProtoError::Eof));
	}

	#[tokio::test]
	async fn header_eof_mid_frame_is_io() {
		let err = CallHeader::read(&mut [1u8, 0, 0].as_slice()).await.unwrap_err();
		assert!(matches!(err, ProtoError::Io(_)));
	}

	#[rstest]
	#[case("")]
	#[case("MarshallableClass")]
	#[case("srv:1A.1/0")]
	#[case("ünïcode 試験 𝄞")]
	#[tokio::test]
	async fn string_roundtrip(#[case] s: &str) {
		let mut buf = Vec::new();
		put_str(&mut buf, s);
		let decoded = read_str(&mut buf.as_slice()).await.unwrap();
		assert_eq!(decoded, s);
	}

	#[tokio::test]
	async fn string_rejects_negative_length() {
		let mut buf = Vec::new();
		put_i32(&mut buf, -8);
		let err = read_str(&mut buf.as_slice()).await.unwrap_err();
		assert!(matches!(err, ProtoError::BadLength(-8)));
	}

	#[tokio::test]
	async fn string_rejects_odd_length() {
		let mut buf = Vec::new();
		put_i32(&mut buf, 3);
		buf.extend_from_slice(&[0, 0, 0]);
		let err = read_str(&mut buf.as_slice()).await.unwrap_err();
		assert!(matches!(err, ProtoError::BadLength(3)));
	}

	#[tokio::test]
	async fn bytes_roundtrip() {
		let mut buf = Vec::new();
		put_bytes(&mut buf, &[1, 2, 3]);
		put_bytes(&mut buf, &[]);
		let mut reader = buf.as_slice();
		assert_eq!(read_bytes(&mut reader).await.unwrap(), vec![1, 2, 3]);
		assert_eq!(read_bytes(&mut reader).await.unwrap(), Vec::<u8>::new());
	}

	#[tokio::test]
	async fn frame_write_then_read() {
		let (client, mut server) = tokio::io::duplex(1024);
		let mut body = Vec::new();
		put_str(&mut body, "target");
		let mut client = client;
		write_frame(&mut client, CallHeader::new(CallKind::GcCleanup, 7), &body)
			.await
			.unwrap();
		drop(client);
		let header = CallHeader::read(&mut server).await.unwrap();
		assert_eq!(header.kind, CallKind::GcCleanup);
		assert_eq!(header.sequence, 7);
		assert_eq!(read_str(&mut server).await.unwrap(), "target");
	}
}
