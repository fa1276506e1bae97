//! Per-argument reference envelopes.
//!
//! Every argument, return value and out-parameter on the wire starts with
//! a [`RefTag`] byte describing how the value travels: inline payload,
//! fresh remote reference, already-known reference, type literal or
//! delegate pointer.

use tokio::io::AsyncRead;

use crate::error::{ProtoError, Result};
use crate::frame::{put_bytes, put_i32, put_str, put_u8, read_bytes, read_i32, read_str, read_u8};

/// Tag byte prepended to every encoded value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RefTag {
	/// The value is absent.
	NullPointer = 0,
	/// Inline value; an opaque codec payload follows.
	SerializedItem = 1,
	/// A reference this peer has not seen yet; type name, object id and
	/// interface list follow.
	NewProxy = 2,
	/// A reference the peer already knows; only the object id follows.
	RemoteReference = 3,
	/// A type literal; the type name follows.
	InstanceOfSystemType = 4,
	/// An array of type literals; a counted name list follows.
	ArrayOfSystemType = 5,
	/// A delegate; target object id and method descriptor follow.
	MethodPointer = 6,
}

impl RefTag {
	/// Decodes a wire byte into a tag.
	pub fn from_wire(v: u8) -> Result<Self> {
		Ok(match v {
			0 => Self::NullPointer,
			1 => Self::SerializedItem,
			2 => Self::NewProxy,
			3 => Self::RemoteReference,
			4 => Self::InstanceOfSystemType,
			5 => Self::ArrayOfSystemType,
			6 => Self::MethodPointer,
			other => return Err(ProtoError::UnknownRefTag(other)),
		})
	}
}

/// A decoded argument envelope.
///
/// This is the wire-side shape only; turning it into a live object or
/// proxy is the runtime's job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireValue {
	/// Absent value.
	Null,
	/// Inline value bytes in the opaque payload codec.
	Payload(Vec<u8>),
	/// A marshal-by-reference object the receiving peer has not seen yet.
	NewProxy {
		/// Fully-qualified type name for proxy synthesis.
		type_name: String,
		/// Identifier of the referenced object.
		object_id: String,
		/// Interface names the type implements, for interface-proxy fallback.
		interfaces: Vec<String>,
	},
	/// A marshal-by-reference object already known to the receiving peer.
	RemoteRef {
		/// Identifier of the referenced object.
		object_id: String,
	},
	/// A type literal.
	TypeName(String),
	/// An array of type literals.
	TypeNames(Vec<String>),
	/// A delegate: a method pointer bound to a remotable target.
	Delegate {
		/// Identifier of the delegate target object.
		target_id: String,
		/// Stable descriptor string of the pointed-to method.
		method_id: String,
	},
}

impl WireValue {
	/// Appends the envelope to a body buffer.
	pub fn put(&self, buf: &mut Vec<u8>) {
		match self {
			Self::Null => put_u8(buf, RefTag::NullPointer as u8),
			Self::Payload(bytes) => {
				put_u8(buf, RefTag::SerializedItem as u8);
				put_bytes(buf, bytes);
			}
			Self::NewProxy {
				type_name,
				object_id,
				interfaces,
			} => {
				put_u8(buf, RefTag::NewProxy as u8);
				put_str(buf, type_name);
				put_str(buf, object_id);
				put_i32(buf, interfaces.len() as i32);
				for name in interfaces {
					put_str(buf, name);
				}
			}
			Self::RemoteRef { object_id } => {
				put_u8(buf, RefTag::RemoteReference as u8);
				put_str(buf, object_id);
			}
			Self::TypeName(name) => {
				put_u8(buf, RefTag::InstanceOfSystemType as u8);
				put_str(buf, name);
			}
			Self::TypeNames(names) => {
				put_u8(buf, RefTag::ArrayOfSystemType as u8);
				put_i32(buf, names.len() as i32);
				for name in names {
					put_str(buf, name);
				}
			}
			Self::Delegate {
				target_id,
				method_id,
			} => {
				put_u8(buf, RefTag::MethodPointer as u8);
				put_str(buf, target_id);
				put_str(buf, method_id);
			}
		}
	}

	/// Reads one envelope from the stream.
	pub async fn read(reader: &mut (impl AsyncRead + Unpin)) -> Result<Self> {
		let tag = RefTag::from_wire(read_u8(reader).await?)?;
		Ok(match tag {
			RefTag::NullPointer => Self::Null,
			RefTag::SerializedItem => Self::Payload(read_bytes(reader).await?),
			RefTag::NewProxy => {
				let type_name = read_str(reader).await?;
				let object_id = read_str(reader).await?;
				let count = read_count(reader).await?;
				let mut interfaces = Vec::with_capacity(count);
				for _ in 0..count {
					interfaces.push(read_str(reader).await?);
				}
				Self::NewProxy {
					type_name,
					object_id,
					interfaces,
				}
			}
			RefTag::RemoteReference => Self::RemoteRef {
				object_id: read_str(reader).await?,
			},
			RefTag::InstanceOfSystemType => Self::TypeName(read_str(reader).await?),
			RefTag::ArrayOfSystemType => {
				let count = read_count(reader).await?;
				let mut names = Vec::with_capacity(count);
				for _ in 0..count {
					names.push(read_str(reader).await?);
				}
				Self::TypeNames(names)
			}
			RefTag::MethodPointer => {
				let target_id = read_str(reader).await?;
				let method_id = read_str(reader).await?;
				Self::Delegate {
					target_id,
					method_id,
				}
			}
		})
	}
}

/// Reads an `i32` element count and validates it.
async fn read_count(reader: &mut (impl AsyncRead + Unpin)) -> Result<usize> {
	let count = read_i32(reader).await?;
	if !(0..=u16::MAX as i32).contains(&count) {
		return Err(ProtoError::BadLength(i64::from(count)));
	}
	Ok(count as usize)
}

#[cfg(test)]
mod tests {
	use rstest::rstest;

	use super::*;

	#[rstest]
	#[case(WireValue::Null)]
	#[case(WireValue::Payload(vec![9, 8, 7]))]
	#[case(WireValue::Payload(Vec::new()))]
	#[case(WireValue::NewProxy {
		type_name: "demo.Component".into(),
		object_id: "host:2B.1/4".into(),
		interfaces: vec!["demo.IComponent".into(), "demo.IDisposable".into()],
	})]
	#[case(WireValue::RemoteRef { object_id: "host:2B.1/4".into() })]
	#[case(WireValue::TypeName("System.Int32".into()))]
	#[case(WireValue::TypeNames(vec!["A".into(), "B".into()]))]
	#[case(WireValue::Delegate {
		target_id: "cli:FF.2/D1a2".into(),
		method_id: "Handler.on_change(i32)".into(),
	})]
	#[tokio::test]
	async fn envelope_roundtrip(#[case] value: WireValue) {
		let mut buf = Vec::new();
		value.put(&mut buf);
		let decoded = WireValue::read(&mut buf.as_slice()).await.unwrap();
		assert_eq!(decoded, value);
	}

	#[tokio::test]
	async fn rejects_unknown_tag() {
		let err = WireValue::read(&mut [250u8].as_slice()).await.unwrap_err();
		assert!(matches!(err, ProtoError::UnknownRefTag(250)));
	}

	#[tokio::test]
	async fn rejects_absurd_interface_count() {
		let mut buf = Vec::new();
		put_u8(&mut buf, RefTag::ArrayOfSystemType as u8);
		put_i32(&mut buf, i32::MAX);
		let err = WireValue::read(&mut buf.as_slice()).await.unwrap_err();
		assert!(matches!(err, ProtoError::BadLength(_)));
	}

	#[tokio::test]
	async fn envelopes_are_self_delimiting() {
		let mut buf = Vec::new();
		WireValue::Payload(vec![1]).put(&mut buf);
		WireValue::Null.put(&mut buf);
		WireValue::RemoteRef {
			object_id: "a/1".into(),
		}
		.put(&mut buf);
		let mut reader = buf.as_slice();
		assert_eq!(WireValue::read(&mut reader).await.unwrap(), WireValue::Payload(vec![1]));
		assert_eq!(WireValue::read(&mut reader).await.unwrap(), WireValue::Null);
		assert!(matches!(
			WireValue::read(&mut reader).await.unwrap(),
			WireValue::RemoteRef { .. }
		));
		assert!(reader.is_empty());
	}
}
