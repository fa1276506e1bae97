//! The service container backing remote instance creation.
//!
//! Maps fully-qualified type names to constructors and singletons.
//! Process-wide and append-only during normal operation: registrations are
//! made at startup and never removed while links are live.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{RemotingError, Result};
use crate::object::{RemoteObject, Value};

/// A registered constructor: turns decoded arguments into an instance.
pub type Constructor = Arc<dyn Fn(Vec<Value>) -> Result<Arc<dyn RemoteObject>> + Send + Sync>;

/// Type-name keyed constructor and singleton registry.
#[derive(Default)]
pub struct ServiceContainer {
	constructors: RwLock<HashMap<String, Constructor>>,
	singletons: RwLock<HashMap<String, Arc<dyn RemoteObject>>>,
}

impl ServiceContainer {
	/// Creates an empty container.
	#[must_use]
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	/// Registers a constructor for a type name.
	pub fn register_constructor(
		&self,
		type_name: impl Into<String>,
		ctor: impl Fn(Vec<Value>) -> Result<Arc<dyn RemoteObject>> + Send + Sync + 'static,
	) {
		self.constructors
			.write()
			.insert(type_name.into(), Arc::new(ctor));
	}

	/// Registers a singleton served for every creation request of its type.
	pub fn register_singleton(&self, type_name: impl Into<String>, instance: Arc<dyn RemoteObject>) {
		self.singletons.write().insert(type_name.into(), instance);
	}

	/// Constructs (or fetches) an instance of the named type.
	pub fn construct(&self, type_name: &str, args: Vec<Value>) -> Result<Arc<dyn RemoteObject>> {
		if let Some(instance) = self.singletons.read().get(type_name) {
			return Ok(instance.clone());
		}
		let ctor = self
			.constructors
			.read()
			.get(type_name)
			.cloned()
			.ok_or_else(|| {
				RemotingError::Unsupported(format!("type {type_name} is not constructible here"))
			})?;
		ctor(args)
	}

	/// Whether the container can produce the named type.
	#[must_use]
	pub fn knows(&self, type_name: &str) -> bool {
		self.singletons.read().contains_key(type_name)
			|| self.constructors.read().contains_key(type_name)
	}
}
