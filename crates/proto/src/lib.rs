//! Wire protocol for the tether remoting runtime.
//!
//! This crate fixes the byte-level protocol both peers speak:
//! * [`CallHeader`]: the `(kind, sequence)` prefix of every frame
//! * [`CallKind`]: the nine logical frame kinds
//! * [`RefTag`] / [`WireValue`]: the per-argument reference envelope
//! * primitive encodings: little-endian integers and length-prefixed
//!   UTF-16LE strings
//!
//! Frame bodies are self-describing; there is no outer length prefix.
//! Senders assemble a body into a buffer with the `put_*` writers and copy
//! it onto the stream atomically, readers consume fields with the `read_*`
//! functions. The inline payload of a [`WireValue::Payload`] is opaque to
//! this crate; the runtime feeds it to its value codec.

#![warn(missing_docs)]

pub mod error;
pub mod frame;
pub mod value;

pub use error::{ProtoError, Result};
pub use frame::{
	CallHeader, CallKind, put_bytes, put_i32, put_str, put_u8, put_u32, read_bytes, read_i32,
	read_str, read_u8, read_u32, write_frame,
};
pub use value::{RefTag, WireValue};
