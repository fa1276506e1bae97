//! The process-wide instance registry.
//!
//! One registry per process maps every marshal-by-reference object to a
//! stable [`ObjectId`] and back, tracks which peers currently hold a
//! reference to each local object, and materialises proxies for objects
//! owned elsewhere. All connections of the process share it; that is what
//! lets an object round-trip from peer Q through this process to peer P
//! without being proxied twice.
//!
//! Local entries hold their object strongly while any peer references it
//! and demote to a weak slot once the last peer lets go. Remote entries
//! always hold their proxy weakly; proxy lifetime is driven by local
//! callers, and the distributed GC reports collected proxies back to the
//! owner.


use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;

use crate::error::{RemotingError, Result};
use crate::ident::{ObjectId, PeerId, ProcessId};
use crate::object::{Invoker, RemoteObject, object_addr};
use crate::proxy::{ProxyFactory, RemoteHandle};

/// Hard cap on distinct peers per process; bit *i* of an entry's reference
/// vector records whether peer *i* holds a reference.
const MAX_PEERS: usize = 64;

/// The storage slot of a registry entry.
pub(crate) enum Slot {
	/// Held alive on behalf of at least one peer (local objects only).
	Strong(Arc<dyn RemoteObject>),
	/// Lifetime driven elsewhere: an unused local object or a proxy.
	Weak(Weak<dyn RemoteObject>),
}

/// Mutable state of one entry, serialised by the entry's own mutex.
struct SlotState {
	slot: Slot,
	/// Bit *i* set iff peer *i* has been told about this object.
	referenced_by: u64,
}

/// One registered object: identity, ownership and liveness bookkeeping.
pub(crate) struct InstanceInfo {
	id: ObjectId,
	type_name: String,
	is_local: bool,
	/// Sequence of the registry instance that created the entry.
	owner: u32,
	state: Mutex<SlotState>,
}

impl InstanceInfo {
	/// Resolves the stored object, resurrecting an unused local entry to
	/// its strong state when it is needed again.
	fn get(&self) -> Option<Arc<dyn RemoteObject>> {
		let mut state = self.state.lock();
		match &state.slot {
			Slot::Strong(obj) => Some(obj.clone()),
			Slot::Weak(weak) => {
				let obj = weak.upgrade()?;
				if self.is_local && state.referenced_by != 0 {
					state.slot = Slot::Strong(obj.clone());
				}
				Some(obj)
			}
		}
	}

	/// Address identity of the stored object, if it is still alive.
	fn live_addr(&self) -> Option<usize> {
		let state = self.state.lock();
		let obj = match &state.slot {
			Slot::Strong(obj) => obj.clone(),
			Slot::Weak(weak) => weak.upgrade()?,
		};
		Some(object_addr(&obj))
	}

	/// Whether both the strong and weak half of the slot are gone.
	fn is_released(&self) -> bool {
		let state = self.state.lock();
		match &state.slot {
			Slot::Strong(_) => false,
			Slot::Weak(weak) => weak.strong_count() == 0,
		}
	}
}

/// Peer bookkeeping: small indices, outbound invokers and the process
/// prefixes observed to belong to each peer.
#[derive(Default)]
struct PeerTable {
	indices: HashMap<PeerId, u8>,
	invokers: HashMap<PeerId, Arc<dyn Invoker>>,
	prefixes: HashMap<String, PeerId>,
}

impl PeerTable {
	fn index_of(&mut self, peer: &PeerId) -> Result<u8> {
		if let Some(&idx) = self.indices.get(peer) {
			return Ok(idx);
		}
		let idx = self.indices.len();
		if idx >= MAX_PEERS {
			tracing::error!(%peer, "peer index exhausted, refusing additional peer");
			return Err(RemotingError::TooManyPeers);
		}
		self.indices.insert(peer.clone(), idx as u8);
		Ok(idx as u8)
	}
}

/// The process-wide identifier/object table.
pub struct InstanceRegistry {
	process: ProcessId,
	counter: AtomicU64,
	entries: RwLock<HashMap<ObjectId, Arc<InstanceInfo>>>,
	/// Reverse table keyed by object address; repaired lazily when an
	/// address has been collected and reused.
	reverse: Mutex<HashMap<usize, ObjectId>>,
	peers: Mutex<PeerTable>,
	factory: ProxyFactory,
	/// Fired when a proxy handle is dropped; nudges the GC collector.
	gc_kick: Arc<Notify>,
}

impl InstanceRegistry {
	/// Creates the registry for this process.
	#[must_use]
	pub fn new() -> Arc<Self> {
		let process = ProcessId::allocate();
		tracing::debug!(%process, "instance registry created");
		Arc::new(Self {
			process,
			counter: AtomicU64::new(0),
			entries: RwLock::new(HashMap::new()),
			reverse: Mutex::new(HashMap::new()),
			peers: Mutex::new(PeerTable::default()),
			factory: ProxyFactory::new(),
			gc_kick: Arc::new(Notify::new()),
		})
	}

	/// This registry's process identity.
	#[must_use]
	pub fn process(&self) -> &ProcessId {
		&self.process
	}

	/// The binder registry used to materialise typed proxies.
	#[must_use]
	pub fn proxy_factory(&self) -> &ProxyFactory {
		&self.factory
	}

	/// The notification fired when a proxy is dropped locally.
	#[must_use]
	pub fn gc_kick(&self) -> Arc<Notify> {
		self.gc_kick.clone()
	}

	/// Registers a peer's outbound invoker under its identity.
	///
	/// Allocating the peer's index here keeps [`RemotingError::TooManyPeers`]
	/// at connection setup instead of first marshal.
	pub fn add_peer(&self, peer: PeerId, invoker: Arc<dyn Invoker>) -> Result<()> {
		let mut peers = self.peers.lock();
		peers.index_of(&peer)?;
		peers.invokers.insert(peer, invoker);
		Ok(())
	}

	/// Records that identifier prefixes of `prefix` belong to `peer`.
	///
	/// Learned while decoding references; routes later proxy creation for
	/// that process through the right invoker.
	pub fn bind_prefix(&self, prefix: &str, peer: &PeerId) {
		self.peers
			.lock()
			.prefixes
			.entry(prefix.to_owned())
			.or_insert_with(|| peer.clone());
	}

	/// The invoker responsible for the process that owns `id`, if known.
	#[must_use]
	pub fn invoker_for(&self, id: &ObjectId) -> Option<Arc<dyn Invoker>> {
		let peers = self.peers.lock();
		let peer = peers.prefixes.get(id.prefix())?;
		peers.invokers.get(peer).cloned()
	}

	/// Registers a local object, returning its existing identifier when it
	/// is already known.
	pub fn register(&self, obj: &Arc<dyn RemoteObject>) -> ObjectId {
		if let Some((id, _)) = self.try_get_id(obj) {
			return id;
		}
		let addr = object_addr(obj);
		let mut entries = self.entries.write();
		// Re-check under the write lock: a racing registration of the same
		// object must yield one canonical identifier.
		{
			let reverse = self.reverse.lock();
			if let Some(id) = reverse.get(&addr)
				&& entries.contains_key(id)
			{
				return id.clone();
			}
		}
		let id = ObjectId::mint(&self.process, self.counter.fetch_add(1, Ordering::Relaxed));
		entries.insert(id.clone(), self.new_local_info(id.clone(), obj));
		drop(entries);
		self.reverse.lock().insert(addr, id.clone());
		tracing::debug!(%id, type_name = obj.type_name(), "registered local object");
		id
	}

	/// Registers an object under a caller-chosen identifier.
	///
	/// Races and re-registrations resolve to one canonical entry: the
	/// first live object wins and later objects are discarded, unless
	/// `strict` is set, in which case a conflicting live object is a
	/// [`RemotingError::DuplicateRegistration`]. A released slot is
	/// revived by installing the incoming object as the new strong
	/// reference.
	pub fn register_with_id(
		&self,
		id: ObjectId,
		obj: &Arc<dyn RemoteObject>,
		strict: bool,
	) -> Result<ObjectId> {
		let existing = {
			let mut entries = self.entries.write();
			match entries.get(&id) {
				Some(info) => info.clone(),
				None => {
					let info = self.new_local_info(id.clone(), obj);
					entries.insert(id.clone(), info);
					drop(entries);
					self.reverse.lock().insert(object_addr(obj), id.clone());
					return Ok(id);
				}
			}
		};
		if let Some(current) = existing.get() {
			if !Arc::ptr_eq(&current, obj) && strict {
				return Err(RemotingError::DuplicateRegistration(id));
			}
			// The first live object is canonical; later ones are discarded.
			return Ok(id);
		}
		// Released slot: revive with the incoming instance.
		existing.state.lock().slot = Slot::Strong(obj.clone());
		self.reverse.lock().insert(object_addr(obj), id.clone());
		tracing::debug!(%id, "revived released entry");
		Ok(id)
	}

	/// Registers a delegate target under its deterministic identifier.
	///
	/// The identifier is derived from the method and the receiver's
	/// identity so that a later unsubscription marshals the same id as the
	/// original subscription.
	pub fn register_delegate(&self, target: &Arc<dyn RemoteObject>, method_id: &str) -> Result<ObjectId> {
		let mut hasher = DefaultHasher::new();
		method_id.hash(&mut hasher);
		object_addr(target).hash(&mut hasher);
		let id = ObjectId::delegate(&self.process, hasher.finish());
		self.register_with_id(id, target, false)
	}

	fn new_local_info(&self, id: ObjectId, obj: &Arc<dyn RemoteObject>) -> Arc<InstanceInfo> {
		Arc::new(InstanceInfo {
			is_local: id.is_local_to(&self.process),
			id,
			type_name: obj.type_name().to_owned(),
			owner: self.process.sequence(),
			state: Mutex::new(SlotState {
				slot: Slot::Strong(obj.clone()),
				referenced_by: 0,
			}),
		})
	}

	/// Resolves an identifier to its registered object or live proxy.
	#[must_use]
	pub fn try_get(&self, id: &ObjectId) -> Option<Arc<dyn RemoteObject>> {
		let info = self.entries.read().get(id).cloned()?;
		info.get()
	}

	/// Reverse lookup: the identifier and type name of a known object.
	///
	/// Falls back to a linear scan when the reverse table entry for the
	/// object's address has been collected or reused, repairing the table
	/// on a hit.
	#[must_use]
	pub fn try_get_id(&self, obj: &Arc<dyn RemoteObject>) -> Option<(ObjectId, String)> {
		let addr = object_addr(obj);
		let candidate = self.reverse.lock().get(&addr).cloned();
		if let Some(id) = candidate {
			let info = self.entries.read().get(&id).cloned();
			if let Some(info) = info
				&& info.live_addr() == Some(addr)
			{
				return Some((id, info.type_name.clone()));
			}
		}
		// The reverse entry is stale; scan for the address.
		let hit = self
			.entries
			.read()
			.values()
			.find(|info| info.live_addr() == Some(addr))
			.cloned()?;
		self.reverse.lock().insert(addr, hit.id.clone());
		Some((hit.id.clone(), hit.type_name.clone()))
	}

	/// Whether `id` was minted by this process.
	#[must_use]
	pub fn is_local(&self, id: &ObjectId) -> bool {
		id.is_local_to(&self.process)
	}

	/// Marks that `obj` (registered as `id`) has been sent to `peer`.
	///
	/// Returns `true` the first time this peer is told about the object,
	/// which is what decides between a `NewProxy` and a `RemoteReference`
	/// envelope. Re-pins an unused local entry while the reference is
	/// outstanding.
	pub fn note_sent(
		&self,
		id: &ObjectId,
		obj: &Arc<dyn RemoteObject>,
		peer: &PeerId,
	) -> Result<bool> {
		let info = self
			.entries
			.read()
			.get(id)
			.cloned()
			.ok_or_else(|| RemotingError::InstanceNotFound(id.clone()))?;
		let idx = self.peers.lock().index_of(peer)?;
		let mut state = info.state.lock();
		let bit = 1u64 << idx;
		let newly = state.referenced_by & bit == 0;
		state.referenced_by |= bit;
		if info.is_local && !matches!(state.slot, Slot::Strong(_)) {
			state.slot = Slot::Strong(obj.clone());
		}
		Ok(newly)
	}

	/// Whether `peer` currently holds a reference to `id`.
	#[must_use]
	pub fn is_referenced_by(&self, id: &ObjectId, peer: &PeerId) -> bool {
		let Some(info) = self.entries.read().get(id).cloned() else {
			return false;
		};
		let Some(&idx) = self.peers.lock().indices.get(peer) else {
			return false;
		};
		info.state.lock().referenced_by & (1u64 << idx) != 0
	}

	/// Materialises or resolves the object behind a reference received
	/// from the wire.
	///
	/// Identifiers owned by this process resolve to the original instance;
	/// synthesising a proxy for them is refused. For foreign identifiers
	/// an existing live proxy is returned, a released one is replaced, and
	/// an unknown one is bound through the invoker responsible for the
	/// owning process, falling back to `hint` (the link the reference
	/// arrived on) for transitively introduced third parties.
	pub fn create_or_get_proxy(
		&self,
		type_name: &str,
		id: ObjectId,
		interfaces: &[String],
		hint: Option<&Arc<dyn Invoker>>,
	) -> Result<Arc<dyn RemoteObject>> {
		if self.is_local(&id) {
			return self.try_get(&id).ok_or_else(|| {
				RemotingError::Unsupported(format!(
					"refusing to create a proxy for locally-owned id {id}"
				))
			});
		}

		let existing = self.entries.read().get(&id).cloned();
		if let Some(info) = &existing
			&& let Some(obj) = info.get()
		{
			return Ok(obj);
		}

		let invoker = self
			.invoker_for(&id)
			.or_else(|| hint.cloned())
			.ok_or_else(|| RemotingError::Protocol(format!("no route to the owner of {id}")))?;

		let type_name = if type_name.is_empty() {
			existing
				.as_ref()
				.map_or_else(String::new, |info| info.type_name.clone())
		} else {
			type_name.to_owned()
		};

		let handle = RemoteHandle::new(id.clone(), type_name.clone(), invoker)
			.with_release_kick(self.gc_kick.clone());
		let proxy = self.factory.materialize(&type_name, interfaces, handle);

		let info = Arc::new(InstanceInfo {
			id: id.clone(),
			type_name,
			is_local: false,
			owner: self.process.sequence(),
			state: Mutex::new(SlotState {
				slot: Slot::Weak(Arc::downgrade(&proxy)),
				referenced_by: 0,
			}),
		});
		self.entries.write().insert(id.clone(), info);
		self.reverse.lock().insert(object_addr(&proxy), id.clone());
		tracing::debug!(%id, "materialised proxy");
		Ok(proxy)
	}

	/// Clears `peer`'s reference to `id`.
	///
	/// When the last peer bit clears, a local entry is demoted to its weak
	/// slot, making the object collectable once local callers let go. With
	/// `really_remove` the entry is also deleted, but a local entry only
	/// once its slot is actually released: while the object is still
	/// reachable here, the entry must survive so that re-marshalling it
	/// reuses the identifier and inbound references keep resolving.
	/// Calling this again after the first removal is a no-op.
	pub fn remove(&self, id: &ObjectId, peer: &PeerId, really_remove: bool) -> bool {
		let Some(info) = self.entries.read().get(id).cloned() else {
			return false;
		};
		let Some(&idx) = self.peers.lock().indices.get(peer) else {
			return false;
		};
		let drop_entry = {
			let mut state = info.state.lock();
			state.referenced_by &= !(1u64 << idx);
			if state.referenced_by == 0 {
				if info.is_local
					&& let Slot::Strong(obj) = &state.slot
				{
					state.slot = Slot::Weak(Arc::downgrade(obj));
				}
				let released = match &state.slot {
					Slot::Strong(_) => false,
					Slot::Weak(weak) => weak.strong_count() == 0,
				};
				really_remove && (!info.is_local || released)
			} else {
				false
			}
		};
		if drop_entry {
			self.entries.write().remove(id);
			tracing::debug!(%id, %peer, "entry removed");
		}
		true
	}

	/// Sweeps proxies owned by `peer` that this process has released.
	///
	/// Returns the identifiers to report in a `GcCleanup` frame and erases
	/// them locally. With `drop_all` (shutdown) every entry routed to the
	/// peer is reported regardless of liveness, and the peer's reference
	/// bits on local entries are forgotten as well.
	pub fn sweep_released(&self, peer: &PeerId, drop_all: bool) -> Vec<ObjectId> {
		let prefixes: Vec<String> = {
			let peers = self.peers.lock();
			peers
				.prefixes
				.iter()
				.filter(|(_, p)| *p == peer)
				.map(|(prefix, _)| prefix.clone())
				.collect()
		};
		let owned_by_peer = |id: &ObjectId| prefixes.iter().any(|p| id.prefix() == p);

		let mut swept = Vec::new();
		{
			let mut entries = self.entries.write();
			entries.retain(|id, info| {
				if info.is_local || !owned_by_peer(id) {
					return true;
				}
				if drop_all || info.is_released() {
					swept.push(id.clone());
					return false;
				}
				true
			});
		}
		if drop_all {
			let idx = self.peers.lock().indices.get(peer).copied();
			if let Some(idx) = idx {
				for info in self.entries.read().values() {
					if info.is_local {
						let mut state = info.state.lock();
						state.referenced_by &= !(1u64 << idx);
						if state.referenced_by == 0
							&& let Slot::Strong(obj) = &state.slot
						{
							state.slot = Slot::Weak(Arc::downgrade(obj));
						}
					}
				}
			}
		}
		// Drop reverse entries whose forward entry went away.
		if !swept.is_empty() {
			let entries = self.entries.read();
			self.reverse.lock().retain(|_, id| entries.contains_key(id));
			tracing::debug!(%peer, count = swept.len(), drop_all, "gc sweep");
		}
		swept
	}

	/// Number of live entries, for diagnostics and tests.
	#[must_use]
	pub fn entry_count(&self) -> usize {
		self.entries.read().len()
	}

	/// Empties the registry.
	///
	/// With `fully` set every entry and all peer bookkeeping goes; the
	/// escape hatch for tests sharing a process. Otherwise only entries
	/// created by this registry instance are dropped, leaving entries
	/// inherited from other instances (cross-process-shared statics)
	/// alone.
	pub fn clear(&self, fully: bool) {
		if fully {
			self.entries.write().clear();
			self.reverse.lock().clear();
			let mut peers = self.peers.lock();
			peers.indices.clear();
			peers.invokers.clear();
			peers.prefixes.clear();
			return;
		}
		let own = self.process.sequence();
		self.entries.write().retain(|_, info| info.owner != own);
		let entries = self.entries.read();
		self.reverse.lock().retain(|_, id| entries.contains_key(id));
	}
}
