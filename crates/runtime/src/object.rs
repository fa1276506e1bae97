//! The remotable object model.
//!
//! A marshal-by-reference object is anything implementing
//! [`RemoteObject`]: it names its type, lists the interfaces it satisfies
//! and dispatches method calls by stable method identifier. Server-side
//! implementations execute real code; client-side proxies forward the call
//! through an [`Invoker`].
//!
//! Rust has no runtime proxy generation, so dispatch tables and typed
//! stubs are written (or generated at compile time) per remotable surface;
//! this module is the contract they implement.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{RemotingError, Result};
use crate::ident::{MethodDescriptor, ObjectId, PeerId};

/// A marshal-by-reference object: identity-preserving across processes.
#[async_trait]
pub trait RemoteObject: Send + Sync + 'static {
	/// Fully-qualified type name, used for proxy synthesis on the peer.
	fn type_name(&self) -> &str;

	/// Interface names this type satisfies, for interface-proxy fallback.
	fn interfaces(&self) -> Vec<String> {
		Vec::new()
	}

	/// Downcast support for typed access on the receiving side.
	fn as_any(&self) -> &dyn Any;

	/// Executes the method named by `method_id` with the given arguments.
	///
	/// Returns the reply values: the return value first, then each
	/// out-parameter in declaration order. Application failures are
	/// reported as [`RemotingError::Remote`] and travel back to the caller
	/// with kind and message preserved.
	async fn dispatch(
		&self,
		method_id: &str,
		generic_args: &[String],
		args: Vec<Value>,
	) -> Result<Reply>;
}

/// Address identity of a remotable object, used as the reverse-table key.
pub(crate) fn object_addr(obj: &Arc<dyn RemoteObject>) -> usize {
	Arc::as_ptr(obj) as *const () as usize
}

impl fmt::Debug for dyn RemoteObject {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("RemoteObject")
			.field("type_name", &self.type_name())
			.finish()
	}
}

/// A runtime argument or result value.
#[derive(Clone)]
pub enum Value {
	/// Absent value.
	Null,
	/// An inline serialisable value in the opaque payload codec.
	Data(Vec<u8>),
	/// A marshal-by-reference object (or a proxy for one).
	Object(Arc<dyn RemoteObject>),
	/// A delegate bound to a remotable target.
	Delegate(RemoteDelegate),
	/// A type literal.
	TypeName(String),
	/// An array of type literals.
	TypeNames(Vec<String>),
}

impl Value {
	/// Encodes a serialisable value into its inline payload form.
	pub fn serialize<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
		Ok(Self::Data(postcard::to_allocvec(value)?))
	}

	/// Decodes an inline payload back into a concrete type.
	pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T> {
		match self {
			Self::Data(bytes) => Ok(postcard::from_bytes(bytes)?),
			other => Err(RemotingError::Unsupported(format!(
				"expected an inline payload, got {other:?}"
			))),
		}
	}

	/// Wraps a remotable object.
	#[must_use]
	pub fn object(obj: Arc<dyn RemoteObject>) -> Self {
		Self::Object(obj)
	}

	/// The wrapped object, if this value carries one.
	#[must_use]
	pub fn as_object(&self) -> Option<&Arc<dyn RemoteObject>> {
		match self {
			Self::Object(obj) => Some(obj),
			_ => None,
		}
	}

	/// The wrapped delegate, if this value carries one.
	#[must_use]
	pub fn as_delegate(&self) -> Option<&RemoteDelegate> {
		match self {
			Self::Delegate(delegate) => Some(delegate),
			_ => None,
		}
	}
}

impl fmt::Debug for Value {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Null => f.write_str("Null"),
			Self::Data(bytes) => write!(f, "Data({} bytes)", bytes.len()),
			Self::Object(obj) => write!(f, "Object({})", obj.type_name()),
			Self::Delegate(delegate) => write!(f, "Delegate({})", delegate.method_id()),
			Self::TypeName(name) => write!(f, "TypeName({name})"),
			Self::TypeNames(names) => write!(f, "TypeNames({names:?})"),
		}
	}
}

/// Reply values of one call: return value first, then out-parameters.
///
/// An empty reply stands for "default return value, no out-values"; the
/// dispatcher sends it when a delegate target vanished between an event
/// being raised and the handler being removed.
#[derive(Debug, Clone, Default)]
pub struct Reply {
	/// The reply values.
	pub values: Vec<Value>,
}

impl Reply {
	/// A reply with no values.
	#[must_use]
	pub fn empty() -> Self {
		Self::default()
	}

	/// A reply carrying a single value.
	#[must_use]
	pub fn of(value: Value) -> Self {
		Self {
			values: vec![value],
		}
	}

	/// A reply carrying one serialised return value.
	pub fn serialize<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
		Ok(Self::of(Value::serialize(value)?))
	}

	/// The return value, when present.
	#[must_use]
	pub fn returned(&self) -> Option<&Value> {
		self.values.first()
	}

	/// The `i`-th out-parameter value, when present.
	#[must_use]
	pub fn out(&self, i: usize) -> Option<&Value> {
		self.values.get(i + 1)
	}

	/// Decodes the return value, substituting the default for an empty reply.
	pub fn returned_or_default<T: DeserializeOwned + Default>(&self) -> Result<T> {
		match self.returned() {
			None | Some(Value::Null) => Ok(T::default()),
			Some(value) => value.deserialize(),
		}
	}
}

/// A delegate: a method pointer bound to a remotable target.
///
/// On the producing side the target is a local handler object; after a
/// round trip it is a proxy whose invocation re-enters the producer over
/// its reverse channel. Equality is by target identifier and method, which
/// is what makes remote unsubscription match a prior subscription.
#[derive(Clone)]
pub struct RemoteDelegate {
	target: Arc<dyn RemoteObject>,
	target_id: ObjectId,
	method_id: String,
}

impl RemoteDelegate {
	/// Binds a method on a registered target.
	#[must_use]
	pub fn new(target: Arc<dyn RemoteObject>, target_id: ObjectId, method_id: String) -> Self {
		Self {
			target,
			target_id,
			method_id,
		}
	}

	/// Identifier of the delegate target.
	#[must_use]
	pub fn target_id(&self) -> &ObjectId {
		&self.target_id
	}

	/// Stable identifier of the pointed-to method.
	#[must_use]
	pub fn method_id(&self) -> &str {
		&self.method_id
	}

	/// The target object (a local handler or a proxy).
	#[must_use]
	pub fn target(&self) -> &Arc<dyn RemoteObject> {
		&self.target
	}

	/// Invokes the delegate.
	pub async fn invoke(&self, args: Vec<Value>) -> Result<Reply> {
		self.target.dispatch(&self.method_id, &[], args).await
	}
}

impl PartialEq for RemoteDelegate {
	fn eq(&self, other: &Self) -> bool {
		self.target_id == other.target_id && self.method_id == other.method_id
	}
}

impl Eq for RemoteDelegate {}

impl fmt::Debug for RemoteDelegate {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("RemoteDelegate")
			.field("target", &self.target_id)
			.field("method", &self.method_id)
			.finish()
	}
}

/// A callback handler wrapping a plain function.
///
/// The usual delegate target on the subscribing side: wraps a closure so
/// it can be registered, marshalled as a method pointer and invoked from
/// the peer over the reverse channel.
pub struct CallbackFn {
	type_name: String,
	handler: Box<dyn Fn(Vec<Value>) -> Result<Reply> + Send + Sync>,
}

impl CallbackFn {
	/// Wraps a handler function under the given type name.
	pub fn new(
		type_name: impl Into<String>,
		handler: impl Fn(Vec<Value>) -> Result<Reply> + Send + Sync + 'static,
	) -> Arc<Self> {
		Arc::new(Self {
			type_name: type_name.into(),
			handler: Box::new(handler),
		})
	}
}

#[async_trait]
impl RemoteObject for CallbackFn {
	fn type_name(&self) -> &str {
		&self.type_name
	}

	fn as_any(&self) -> &dyn Any {
		self
	}

	async fn dispatch(
		&self,
		_method_id: &str,
		_generic_args: &[String],
		args: Vec<Value>,
	) -> Result<Reply> {
		(self.handler)(args)
	}
}

/// One remote method invocation, as handed to an [`Invoker`].
#[derive(Debug)]
pub struct RemoteCall {
	/// Identifier of the target object on the owning peer.
	pub target: ObjectId,
	/// Fully-qualified name of the declaring type.
	pub declaring_type: String,
	/// Stable identifier of the invoked method.
	pub method_id: String,
	/// Generic argument type names, resolved by the peer before invoke.
	pub generic_args: Vec<String>,
	/// Argument values.
	pub args: Vec<Value>,
}

impl RemoteCall {
	/// Builds a call from a method descriptor.
	#[must_use]
	pub fn new(target: ObjectId, method: &MethodDescriptor, args: Vec<Value>) -> Self {
		Self {
			target,
			declaring_type: method.declaring_type.clone(),
			method_id: method.id(),
			generic_args: method.generic_args.clone(),
			args,
		}
	}
}

/// The interception seam: turns an in-process invocation into a remote
/// request/reply exchange.
///
/// One invoker exists per outgoing link; proxies hold the invoker of the
/// peer that owns their target object.
#[async_trait]
pub trait Invoker: Send + Sync + 'static {
	/// Identity of the peer this invoker reaches.
	fn peer(&self) -> &PeerId;

	/// Whether display formatting of proxies should be remoted.
	///
	/// Off by default: proxies render a local placeholder.
	fn remote_display(&self) -> bool {
		false
	}

	/// Performs one remote call and awaits its reply.
	async fn invoke(&self, call: RemoteCall) -> Result<Reply>;
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn inline_payload_roundtrip() {
		let value = Value::serialize(&(3i32, "x".to_owned())).unwrap();
		let decoded: (i32, String) = value.deserialize().unwrap();
		assert_eq!(decoded, (3, "x".to_owned()));
	}

	#[test]
	fn empty_reply_decodes_to_default() {
		let reply = Reply::empty();
		assert_eq!(reply.returned_or_default::<i32>().unwrap(), 0);
		assert_eq!(reply.returned_or_default::<String>().unwrap(), String::new());
	}

	#[tokio::test]
	async fn callback_fn_dispatches() {
		let cb = CallbackFn::new("demo.Handler", |args| {
			let n: i32 = args[0].deserialize()?;
			Reply::serialize(&(n * 2))
		});
		let reply = cb
			.dispatch("demo.Handler.call(i32)", &[], vec![Value::serialize(&21i32).unwrap()])
			.await
			.unwrap();
		assert_eq!(reply.returned_or_default::<i32>().unwrap(), 42);
	}
}
