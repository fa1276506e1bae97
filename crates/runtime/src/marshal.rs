//! Argument marshalling.
//!
//! Translates between runtime [`Value`]s and wire [`WireValue`] envelopes
//! through the registry: marshal-by-reference objects become `NewProxy`
//! (first time the peer sees them) or `RemoteReference` envelopes,
//! delegates become `MethodPointer`s with a deterministic target id, and
//! everything else rides the opaque payload codec.

use std::sync::Arc;

use tether_proto::WireValue;

use crate::error::{RemotingError, Result};
use crate::ident::{MethodDescriptor, ObjectId, PeerId};
use crate::object::{Invoker, RemoteDelegate, RemoteObject, Value};
use crate::registry::InstanceRegistry;

/// Encodes one value for transmission to `peer`.
pub fn encode_value(
	registry: &InstanceRegistry,
	peer: &PeerId,
	value: &Value,
) -> Result<WireValue> {
	Ok(match value {
		Value::Null => WireValue::Null,
		Value::Data(bytes) => WireValue::Payload(bytes.clone()),
		Value::TypeName(name) => WireValue::TypeName(name.clone()),
		Value::TypeNames(names) => WireValue::TypeNames(names.clone()),
		Value::Object(obj) => encode_object(registry, peer, obj)?,
		Value::Delegate(delegate) => {
			if registry.is_local(delegate.target_id()) {
				registry.note_sent(delegate.target_id(), delegate.target(), peer)?;
			}
			WireValue::Delegate {
				target_id: delegate.target_id().to_string(),
				method_id: delegate.method_id().to_owned(),
			}
		}
	})
}

fn encode_object(
	registry: &InstanceRegistry,
	peer: &PeerId,
	obj: &Arc<dyn RemoteObject>,
) -> Result<WireValue> {
	let id = match registry.try_get_id(obj) {
		Some((id, _)) => id,
		None => registry.register(obj),
	};
	if !registry.is_local(&id) {
		// A proxy travelling on: the owner resolves it back to the
		// original, a third party routes through us.
		return Ok(WireValue::RemoteRef {
			object_id: id.to_string(),
		});
	}
	let newly = registry.note_sent(&id, obj, peer)?;
	Ok(if newly {
		WireValue::NewProxy {
			type_name: obj.type_name().to_owned(),
			object_id: id.to_string(),
			interfaces: obj.interfaces(),
		}
	} else {
		WireValue::RemoteRef {
			object_id: id.to_string(),
		}
	})
}

/// Decodes one envelope received from `peer`.
///
/// `arrival` is the invoker of the link the envelope arrived on; it is the
/// best-effort route for references whose owning process this registry has
/// no direct link to.
pub fn decode_value(
	registry: &InstanceRegistry,
	peer: &PeerId,
	arrival: &Arc<dyn Invoker>,
	wire: WireValue,
) -> Result<Value> {
	Ok(match wire {
		WireValue::Null => Value::Null,
		WireValue::Payload(bytes) => Value::Data(bytes),
		WireValue::TypeName(name) => Value::TypeName(name),
		WireValue::TypeNames(names) => Value::TypeNames(names),
		WireValue::NewProxy {
			type_name,
			object_id,
			interfaces,
		} => {
			let id = ObjectId::from_wire(object_id);
			registry.bind_prefix(id.prefix(), peer);
			Value::Object(resolve_reference(
				registry,
				arrival,
				&type_name,
				id,
				&interfaces,
			)?)
		}
		WireValue::RemoteRef { object_id } => {
			let id = ObjectId::from_wire(object_id);
			Value::Object(resolve_reference(registry, arrival, "", id, &[])?)
		}
		WireValue::Delegate {
			target_id,
			method_id,
		} => {
			let id = ObjectId::from_wire(target_id);
			let target = resolve_reference(registry, arrival, "", id.clone(), &[])?;
			Value::Delegate(RemoteDelegate::new(target, id, method_id))
		}
	})
}

/// Resolves a reference to the original instance (local ids) or to a
/// materialised proxy (foreign ids).
fn resolve_reference(
	registry: &InstanceRegistry,
	arrival: &Arc<dyn Invoker>,
	type_name: &str,
	id: ObjectId,
	interfaces: &[String],
) -> Result<Arc<dyn RemoteObject>> {
	if registry.is_local(&id) {
		return registry
			.try_get(&id)
			.ok_or_else(|| RemotingError::InstanceNotFound(id));
	}
	registry.create_or_get_proxy(type_name, id, interfaces, Some(arrival))
}

/// Binds a method on a local handler as a remotable delegate.
///
/// Registers the target under its deterministic delegate identifier, so a
/// later unsubscription with the same handler and method marshals the same
/// id as the subscription did.
pub fn bind_delegate(
	registry: &InstanceRegistry,
	target: Arc<dyn RemoteObject>,
	method: &MethodDescriptor,
) -> Result<Value> {
	let method_id = method.id();
	let id = registry.register_delegate(&target, &method_id)?;
	Ok(Value::Delegate(RemoteDelegate::new(target, id, method_id)))
}

#[cfg(test)]
mod tests {
	use std::any::Any;

	use async_trait::async_trait;

	use super::*;
	use crate::object::{CallbackFn, RemoteCall, Reply};

	struct Widget;

	#[async_trait]
	impl RemoteObject for Widget {
		fn type_name(&self) -> &str {
			"demo.Widget"
		}

		fn interfaces(&self) -> Vec<String> {
			vec!["demo.IWidget".to_owned()]
		}

		fn as_any(&self) -> &dyn Any {
			self
		}

		async fn dispatch(
			&self,
			_method_id: &str,
			_generic_args: &[String],
			_args: Vec<Value>,
		) -> Result<Reply> {
			Ok(Reply::empty())
		}
	}

	struct StubInvoker(PeerId);

	#[async_trait]
	impl Invoker for StubInvoker {
		fn peer(&self) -> &PeerId {
			&self.0
		}

		async fn invoke(&self, _call: RemoteCall) -> Result<Reply> {
			Ok(Reply::empty())
		}
	}

	fn arrival(name: &str) -> Arc<dyn Invoker> {
		Arc::new(StubInvoker(PeerId::new(name)))
	}

	#[test]
	fn first_send_is_new_proxy_then_remote_ref() {
		let registry = InstanceRegistry::new();
		let peer = PeerId::new("peer-1");
		let obj: Arc<dyn RemoteObject> = Arc::new(Widget);

		let first = encode_value(&registry, &peer, &Value::object(obj.clone())).unwrap();
		let WireValue::NewProxy {
			type_name,
			interfaces,
			..
		} = &first
		else {
			panic!("expected NewProxy, got {first:?}");
		};
		assert_eq!(type_name, "demo.Widget");
		assert_eq!(interfaces, &["demo.IWidget".to_owned()]);

		let second = encode_value(&registry, &peer, &Value::object(obj)).unwrap();
		assert!(matches!(second, WireValue::RemoteRef { .. }));
	}

	#[test]
	fn same_object_is_new_per_peer() {
		let registry = InstanceRegistry::new();
		let obj: Arc<dyn RemoteObject> = Arc::new(Widget);
		let first = encode_value(&registry, &PeerId::new("p1"), &Value::object(obj.clone())).unwrap();
		let again = encode_value(&registry, &PeerId::new("p2"), &Value::object(obj)).unwrap();
		assert!(matches!(first, WireValue::NewProxy { .. }));
		assert!(matches!(again, WireValue::NewProxy { .. }));
	}

	#[test]
	fn decode_materialises_then_reuses_proxy() {
		let registry = InstanceRegistry::new();
		let peer = PeerId::new("owner");
		let arrival = arrival("owner");
		let wire = WireValue::NewProxy {
			type_name: "demo.Widget".into(),
			object_id: "owner-proc:1.1/0".into(),
			interfaces: vec![],
		};
		let a = decode_value(&registry, &peer, &arrival, wire).unwrap();
		let b = decode_value(
			&registry,
			&peer,
			&arrival,
			WireValue::RemoteRef {
				object_id: "owner-proc:1.1/0".into(),
			},
		)
		.unwrap();
		assert!(Arc::ptr_eq(a.as_object().unwrap(), b.as_object().unwrap()));
	}

	#[test]
	fn local_reference_resolves_to_original_instance() {
		let registry = InstanceRegistry::new();
		let peer = PeerId::new("peer-1");
		let obj: Arc<dyn RemoteObject> = Arc::new(Widget);
		let wire = encode_value(&registry, &peer, &Value::object(obj.clone())).unwrap();
		let WireValue::NewProxy { object_id, .. } = wire else {
			panic!("expected NewProxy");
		};

		// The peer hands the reference straight back.
		let decoded = decode_value(
			&registry,
			&peer,
			&arrival("peer-1"),
			WireValue::RemoteRef {
				object_id,
			},
		)
		.unwrap();
		assert!(Arc::ptr_eq(decoded.as_object().unwrap(), &obj));
	}

	#[test]
	fn delegate_binding_is_deterministic() {
		let registry = InstanceRegistry::new();
		let peer = PeerId::new("peer-1");
		let handler: Arc<dyn RemoteObject> =
			CallbackFn::new("demo.Handler", |_| Ok(Reply::empty()));
		let method = MethodDescriptor::new("demo.Events", "on_tick", ["i32"]);

		let a = bind_delegate(&registry, handler.clone(), &method).unwrap();
		let b = bind_delegate(&registry, handler, &method).unwrap();
		let (wa, wb) = (
			encode_value(&registry, &peer, &a).unwrap(),
			encode_value(&registry, &peer, &b).unwrap(),
		);
		assert_eq!(wa, wb);
		assert!(matches!(wa, WireValue::Delegate { .. }));
	}

	#[test]
	fn decoded_delegate_targets_local_handler() {
		let registry = InstanceRegistry::new();
		let peer = PeerId::new("peer-1");
		let handler: Arc<dyn RemoteObject> =
			CallbackFn::new("demo.Handler", |_| Ok(Reply::empty()));
		let method = MethodDescriptor::new("demo.Events", "on_tick", ["i32"]);
		let bound = bind_delegate(&registry, handler.clone(), &method).unwrap();
		let wire = encode_value(&registry, &peer, &bound).unwrap();

		// Round trip within the same process: the decoded delegate must
		// point at the original handler, not a proxy.
		let decoded = decode_value(&registry, &peer, &arrival("peer-1"), wire).unwrap();
		let delegate = decoded.as_delegate().unwrap();
		assert!(Arc::ptr_eq(delegate.target(), &handler));
		assert_eq!(delegate.method_id(), method.id());
	}
}
