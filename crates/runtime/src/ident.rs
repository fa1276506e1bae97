//! Stable identifiers: processes, objects, peers and methods.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

/// Registry instances created so far in this process.
///
/// Each [`ProcessId`] carries the sequence of the registry that minted it,
/// so identifiers from earlier registry generations (tests recreating the
/// registry, mostly) never collide with current ones.
static REGISTRY_SEQ: AtomicU32 = AtomicU32::new(1);

/// Identity of one registry instance in one OS process.
///
/// Formatted as `<machine>:<pid-hex>.<seq>`. The identifier prefix of every
/// object minted by a registry; peers treat it as opaque.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProcessId(String);

impl ProcessId {
	/// Allocates the identity for a fresh registry instance.
	pub(crate) fn allocate() -> Self {
		let machine = std::env::var("HOSTNAME").unwrap_or_else(|_| "local".into());
		let seq = REGISTRY_SEQ.fetch_add(1, Ordering::Relaxed);
		Self(format!("{machine}:{:X}.{seq}", std::process::id()))
	}

	/// The registry-instance sequence embedded in this identity.
	pub(crate) fn sequence(&self) -> u32 {
		self.0
			.rsplit_once('.')
			.and_then(|(_, seq)| seq.parse().ok())
			.unwrap_or(0)
	}

	/// The identity as its wire string.
	#[must_use]
	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for ProcessId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

/// Stable identifier of a marshal-by-reference object.
///
/// Formatted as `<process-id>/<counter-hex>`; the prefix before `/` names
/// the owning registry. Delegate targets use a `D`-prefixed counter derived
/// from the method and receiver so that repeated registrations of the same
/// handler map to the same identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(String);

impl ObjectId {
	/// Builds an identifier from an owner process and counter value.
	pub(crate) fn mint(owner: &ProcessId, counter: u64) -> Self {
		Self(format!("{owner}/{counter:X}"))
	}

	/// Builds a deterministic delegate-target identifier.
	///
	/// The `G` marker cannot appear in a hex counter, so delegate targets
	/// are recognisable without a registry lookup.
	pub(crate) fn delegate(owner: &ProcessId, digest: u64) -> Self {
		Self(format!("{owner}/G{digest:X}"))
	}

	/// Parses an identifier received from the wire.
	#[must_use]
	pub fn from_wire(raw: impl Into<String>) -> Self {
		Self(raw.into())
	}

	/// The process prefix, or the whole string if malformed.
	#[must_use]
	pub fn prefix(&self) -> &str {
		self.0.split_once('/').map_or(self.0.as_str(), |(p, _)| p)
	}

	/// Whether this identifier was minted by the given process.
	#[must_use]
	pub fn is_local_to(&self, process: &ProcessId) -> bool {
		self.prefix() == process.as_str()
	}

	/// Whether this identifier names a delegate target.
	#[must_use]
	pub fn is_delegate_target(&self) -> bool {
		self.0
			.split_once('/')
			.is_some_and(|(_, counter)| counter.starts_with('G'))
	}

	/// The identifier as its wire string.
	#[must_use]
	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for ObjectId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

/// Identity of a link peer.
///
/// The reverse-channel announcement carries only an endpoint, so the
/// canonical `ip:port` of the peer's inbound endpoint serves as its stable
/// identity for the peer index and reference bit vector.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerId(String);

impl PeerId {
	/// Builds a peer identity from its canonical endpoint string.
	#[must_use]
	pub fn new(endpoint: impl Into<String>) -> Self {
		Self(endpoint.into())
	}

	/// The identity as a string.
	#[must_use]
	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for PeerId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

/// Declared shape of a remotable method.
///
/// The derived [`MethodDescriptor::id`] string is what travels on the wire:
/// it is stable under renames that do not change the declared signature and
/// distinguishes overloads by their parameter types.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodDescriptor {
	/// Fully-qualified name of the declaring type.
	pub declaring_type: String,
	/// Method name.
	pub name: String,
	/// Generic argument type names, in declaration order.
	pub generic_args: Vec<String>,
	/// Parameter type names, in declaration order.
	pub params: Vec<String>,
}

impl MethodDescriptor {
	/// Builds a descriptor for a non-generic method.
	#[must_use]
	pub fn new(
		declaring_type: impl Into<String>,
		name: impl Into<String>,
		params: impl IntoIterator<Item = &'static str>,
	) -> Self {
		Self {
			declaring_type: declaring_type.into(),
			name: name.into(),
			generic_args: Vec::new(),
			params: params.into_iter().map(str::to_owned).collect(),
		}
	}

	/// Adds generic argument names to the descriptor.
	#[must_use]
	pub fn with_generics(mut self, generics: impl IntoIterator<Item = String>) -> Self {
		self.generic_args = generics.into_iter().collect();
		self
	}

	/// The stable wire identifier for this method.
	#[must_use]
	pub fn id(&self) -> String {
		let mut id = format!("{}.{}", self.declaring_type, self.name);
		if !self.generic_args.is_empty() {
			id.push('[');
			id.push_str(&self.generic_args.join(","));
			id.push(']');
		}
		id.push('(');
		id.push_str(&self.params.join(","));
		id.push(')');
		id
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn process_id_shape() {
		let p = ProcessId::allocate();
		let q = ProcessId::allocate();
		assert_ne!(p, q);
		assert!(p.as_str().contains(':'));
		assert!(p.sequence() > 0);
		// Other tests allocate concurrently, so only monotonicity holds.
		assert!(q.sequence() > p.sequence());
	}

	#[test]
	fn object_id_locality() {
		let p = ProcessId::allocate();
		let local = ObjectId::mint(&p, 0x1A);
		assert!(local.is_local_to(&p));
		assert_eq!(local.prefix(), p.as_str());
		assert!(local.as_str().ends_with("/1A"));

		let foreign = ObjectId::from_wire("elsewhere:9.1/0");
		assert!(!foreign.is_local_to(&p));
		assert_eq!(foreign.prefix(), "elsewhere:9.1");
	}

	#[test]
	fn delegate_ids_are_recognisable() {
		let p = ProcessId::allocate();
		let plain = ObjectId::mint(&p, 7);
		let delegate = ObjectId::delegate(&p, 0xBEEF);
		assert!(!plain.is_delegate_target());
		assert!(delegate.is_delegate_target());
		assert_eq!(delegate, ObjectId::delegate(&p, 0xBEEF));
	}

	#[test]
	fn method_id_distinguishes_overloads() {
		let a = MethodDescriptor::new("demo.Calc", "add", ["i32", "i32"]);
		let b = MethodDescriptor::new("demo.Calc", "add", ["f64", "f64"]);
		assert_ne!(a.id(), b.id());
		assert_eq!(a.id(), "demo.Calc.add(i32,i32)");
	}

	#[test]
	fn method_id_carries_generics() {
		let m = MethodDescriptor::new("demo.Store", "get", ["String"])
			.with_generics(["demo.Record".to_owned()]);
		assert_eq!(m.id(), "demo.Store.get[demo.Record](String)");
	}
}
