//! Proxy synthesis.
//!
//! A proxy is a locally materialised stand-in for an object owned by a
//! peer. The [`ProxyFactory`] selects how to build one from the type and
//! interface names that travelled with the reference:
//!
//! 1. a binder registered for the declared type (class proxy),
//! 2. else a binder registered for one of the advertised interfaces, in
//!    advertised order (interface proxy),
//! 3. else an untyped [`GenericProxy`] around the bare handle.
//!
//! Selection is deterministic for identical inputs, preserving
//! assignability at the call site. Binders are the compile-time stand-in
//! for runtime proxy generation: one hand-written (or macro-generated)
//! typed stub per remotable surface.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::Notify;

use crate::error::Result;
use crate::ident::{MethodDescriptor, ObjectId};
use crate::object::{Invoker, RemoteCall, RemoteObject, Reply, Value};

/// A live reference to an object owned by a peer.
///
/// Typed stubs wrap a handle and forward their methods through
/// [`RemoteHandle::invoke`]. Dropping the last handle for an object does
/// not release anything remotely by itself; it nudges the distributed GC,
/// which owns the release protocol.
pub struct RemoteHandle {
	id: ObjectId,
	type_name: String,
	invoker: Arc<dyn Invoker>,
	release_kick: Option<Arc<Notify>>,
}

impl RemoteHandle {
	/// Creates a handle routed through the given invoker.
	#[must_use]
	pub fn new(id: ObjectId, type_name: impl Into<String>, invoker: Arc<dyn Invoker>) -> Self {
		Self {
			id,
			type_name: type_name.into(),
			invoker,
			release_kick: None,
		}
	}

	/// Attaches the GC kick fired when this handle is dropped.
	pub(crate) fn with_release_kick(mut self, kick: Arc<Notify>) -> Self {
		self.release_kick = Some(kick);
		self
	}

	/// Identifier of the remote object.
	#[must_use]
	pub fn id(&self) -> &ObjectId {
		&self.id
	}

	/// Declared type name of the remote object.
	#[must_use]
	pub fn type_name(&self) -> &str {
		&self.type_name
	}

	/// The invoker this handle routes through.
	#[must_use]
	pub fn invoker(&self) -> &Arc<dyn Invoker> {
		&self.invoker
	}

	/// Invokes a method on the remote object.
	pub async fn invoke(&self, method: &MethodDescriptor, args: Vec<Value>) -> Result<Reply> {
		self.invoker
			.invoke(RemoteCall::new(self.id.clone(), method, args))
			.await
	}

	/// Invokes by raw method identifier, as forwarded from a dispatch.
	pub async fn invoke_raw(
		&self,
		method_id: &str,
		generic_args: &[String],
		args: Vec<Value>,
	) -> Result<Reply> {
		self.invoker
			.invoke(RemoteCall {
				target: self.id.clone(),
				declaring_type: self.type_name.clone(),
				method_id: method_id.to_owned(),
				generic_args: generic_args.to_vec(),
				args,
			})
			.await
	}

	/// The local placeholder rendered instead of remoting display calls.
	///
	/// Display formatting short-circuits locally unless the owning channel
	/// was configured to remote it; see
	/// [`RemoteHandle::display_string`].
	#[must_use]
	pub fn placeholder(&self) -> String {
		format!("remote:{}/{}", self.type_name, self.id)
	}

	/// Renders the remote object as a string.
	///
	/// Returns the local placeholder unless the channel opted in to
	/// remoting display calls, in which case the peer's own formatting is
	/// fetched.
	pub async fn display_string(&self) -> Result<String> {
		if !self.invoker.remote_display() {
			return Ok(self.placeholder());
		}
		let method = MethodDescriptor::new(self.type_name.clone(), "to_display_string", []);
		let reply = self.invoke(&method, Vec::new()).await?;
		reply.returned_or_default()
	}
}

impl fmt::Debug for RemoteHandle {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("RemoteHandle")
			.field("id", &self.id)
			.field("type_name", &self.type_name)
			.field("peer", self.invoker.peer())
			.finish()
	}
}

impl Drop for RemoteHandle {
	fn drop(&mut self) {
		if let Some(kick) = &self.release_kick {
			kick.notify_one();
		}
	}
}

/// Builds typed proxies for one declared type or interface family.
pub trait ProxyBinder: Send + Sync + 'static {
	/// The declared type this binder stands in for.
	fn type_name(&self) -> &str;

	/// Interface names this binder can also stand in for.
	fn interfaces(&self) -> Vec<String> {
		Vec::new()
	}

	/// Wraps a handle in the typed proxy.
	fn bind(&self, handle: RemoteHandle) -> Arc<dyn RemoteObject>;
}

/// A binder assembled from a closure.
struct FnBinder<F> {
	type_name: String,
	interfaces: Vec<String>,
	bind: F,
}

impl<F> ProxyBinder for FnBinder<F>
where
	F: Fn(RemoteHandle) -> Arc<dyn RemoteObject> + Send + Sync + 'static,
{
	fn type_name(&self) -> &str {
		&self.type_name
	}

	fn interfaces(&self) -> Vec<String> {
		self.interfaces.clone()
	}

	fn bind(&self, handle: RemoteHandle) -> Arc<dyn RemoteObject> {
		(self.bind)(handle)
	}
}

/// Builds a [`ProxyBinder`] from a closure.
pub fn binder_fn(
	type_name: impl Into<String>,
	interfaces: impl IntoIterator<Item = String>,
	bind: impl Fn(RemoteHandle) -> Arc<dyn RemoteObject> + Send + Sync + 'static,
) -> Arc<dyn ProxyBinder> {
	Arc::new(FnBinder {
		type_name: type_name.into(),
		interfaces: interfaces.into_iter().collect(),
		bind,
	})
}

/// Registry of proxy binders and the selection rules over them.
#[derive(Default)]
pub struct ProxyFactory {
	by_type: RwLock<HashMap<String, Arc<dyn ProxyBinder>>>,
	by_interface: RwLock<HashMap<String, Arc<dyn ProxyBinder>>>,
}

impl ProxyFactory {
	/// Creates an empty factory.
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// Registers a binder under its declared type and interfaces.
	pub fn register(&self, binder: Arc<dyn ProxyBinder>) {
		for iface in binder.interfaces() {
			self.by_interface.write().insert(iface, binder.clone());
		}
		self.by_type
			.write()
			.insert(binder.type_name().to_owned(), binder);
	}

	/// Materialises a proxy for the given declared type.
	///
	/// Falls through the selection rules in order; the untyped generic
	/// proxy is always available as the last resort.
	pub fn materialize(
		&self,
		type_name: &str,
		interfaces: &[String],
		handle: RemoteHandle,
	) -> Arc<dyn RemoteObject> {
		if let Some(binder) = self.by_type.read().get(type_name) {
			return binder.bind(handle);
		}
		{
			let by_interface = self.by_interface.read();
			for iface in interfaces {
				if let Some(binder) = by_interface.get(iface) {
					tracing::debug!(type_name, interface = %iface, "interface proxy fallback");
					return binder.bind(handle);
				}
			}
		}
		tracing::debug!(type_name, "untyped proxy fallback");
		Arc::new(GenericProxy {
			interfaces: interfaces.to_vec(),
			handle,
		})
	}
}

/// The untyped fallback proxy: forwards every dispatched call verbatim.
pub struct GenericProxy {
	interfaces: Vec<String>,
	handle: RemoteHandle,
}

impl GenericProxy {
	/// The underlying handle.
	#[must_use]
	pub fn handle(&self) -> &RemoteHandle {
		&self.handle
	}
}

#[async_trait]
impl RemoteObject for GenericProxy {
	fn type_name(&self) -> &str {
		self.handle.type_name()
	}

	fn interfaces(&self) -> Vec<String> {
		self.interfaces.clone()
	}

	fn as_any(&self) -> &dyn Any {
		self
	}

	async fn dispatch(
		&self,
		method_id: &str,
		generic_args: &[String],
		args: Vec<Value>,
	) -> Result<Reply> {
		self.handle.invoke_raw(method_id, generic_args, args).await
	}
}

impl fmt::Display for GenericProxy {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.handle.placeholder())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::ident::PeerId;

	struct NullInvoker(PeerId);

	#[async_trait]
	impl Invoker for NullInvoker {
		fn peer(&self) -> &PeerId {
			&self.0
		}

		async fn invoke(&self, call: RemoteCall) -> Result<Reply> {
			Reply::serialize(&call.method_id)
		}
	}

	fn handle(id: &str, type_name: &str) -> RemoteHandle {
		RemoteHandle::new(
			ObjectId::from_wire(id),
			type_name,
			Arc::new(NullInvoker(PeerId::new("test:0"))),
		)
	}

	#[test]
	fn selection_prefers_declared_type() {
		let factory = ProxyFactory::new();
		factory.register(binder_fn("demo.Widget", ["demo.IWidget".to_owned()], |h| {
			Arc::new(GenericProxy {
				interfaces: vec!["declared".into()],
				handle: h,
			})
		}));
		factory.register(binder_fn("demo.Other", ["demo.IWidget".to_owned()], |h| {
			Arc::new(GenericProxy {
				interfaces: vec!["interface".into()],
				handle: h,
			})
		}));

		let proxy = factory.materialize(
			"demo.Widget",
			&["demo.IWidget".to_owned()],
			handle("p:1.1/0", "demo.Widget"),
		);
		assert_eq!(proxy.interfaces(), vec!["declared".to_owned()]);
	}

	#[test]
	fn selection_falls_back_to_interface_then_generic() {
		let factory = ProxyFactory::new();
		factory.register(binder_fn("demo.Widget", ["demo.IWidget".to_owned()], |h| {
			Arc::new(GenericProxy {
				interfaces: vec!["interface".into()],
				handle: h,
			})
		}));

		let via_interface = factory.materialize(
			"demo.Unknown",
			&["demo.IWidget".to_owned()],
			handle("p:1.1/1", "demo.Unknown"),
		);
		assert_eq!(via_interface.interfaces(), vec!["interface".to_owned()]);

		let untyped = factory.materialize("demo.Unknown", &[], handle("p:1.1/2", "demo.Unknown"));
		assert_eq!(untyped.type_name(), "demo.Unknown");
	}

	#[tokio::test]
	async fn generic_proxy_forwards_method_id() {
		let proxy = GenericProxy {
			interfaces: Vec::new(),
			handle: handle("p:1.1/3", "demo.Widget"),
		};
		let reply = proxy
			.dispatch("demo.Widget.poke()", &[], Vec::new())
			.await
			.unwrap();
		assert_eq!(
			reply.returned_or_default::<String>().unwrap(),
			"demo.Widget.poke()"
		);
	}

	#[tokio::test]
	async fn display_short_circuits_by_default() {
		let h = handle("p:1.1/4", "demo.Widget");
		assert_eq!(h.display_string().await.unwrap(), "remote:demo.Widget/p:1.1/4");
	}
}
