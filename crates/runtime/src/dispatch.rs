//! Server-side dispatch.
//!
//! A [`RemotingServer`] owns the listening socket and starts one worker
//! per inbound connection. The worker reads frames in a loop: instance
//! creation goes through the service container, method calls resolve their
//! target in the registry and run concurrently so a handler calling back
//! into the peer cannot wedge the stream, GC cleanups clear reference
//! bits, and a shutdown request broadcasts `ServerShuttingDown` to every
//! connected peer before the accept loop stops.
//!
//! The same worker loop drives the client side of a reverse channel,
//! which is what makes the two directions of a peering symmetric.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use tether_proto::{
	CallHeader, CallKind, ProtoError, WireValue, put_bytes, put_i32, put_str, read_i32, read_str,
};

use crate::channel::{CallChannel, ChannelConfig, run_receiver};
use crate::container::ServiceContainer;
use crate::error::{RemotingError, Result};
use crate::ident::{ObjectId, PeerId};
use crate::link::{BoxRead, Link, wrap_stream};
use crate::marshal::{decode_value, encode_value};
use crate::object::{Invoker, RemoteCall, Reply, Value};
use crate::registry::InstanceRegistry;

/// Server tuning knobs.
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	/// Shut the server down when the last client connection closes.
	pub kill_on_disconnect: bool,
}

/// State shared by the accept loop and every connection worker.
struct ServerShared {
	registry: Arc<InstanceRegistry>,
	container: Arc<ServiceContainer>,
	shutdown: CancellationToken,
	/// Inbound links, for the shutting-down broadcast.
	links: Mutex<Vec<Arc<Link>>>,
	active: AtomicUsize,
	kill_on_disconnect: bool,
}

impl ServerShared {
	/// Broadcasts `ServerShuttingDown` to every peer and stops the server.
	async fn shutdown_all(&self) {
		let links: Vec<_> = self.links.lock().clone();
		for link in links {
			let _ = link.send(CallKind::ServerShuttingDown, 0, &[]).await;
		}
		self.shutdown.cancel();
	}
}

/// A remoting server bound to its listening socket.
pub struct RemotingServer {
	listener: TcpListener,
	shared: Arc<ServerShared>,
}

impl RemotingServer {
	/// Binds the listening socket.
	pub async fn bind(
		addr: SocketAddr,
		registry: Arc<InstanceRegistry>,
		container: Arc<ServiceContainer>,
		config: ServerConfig,
	) -> std::io::Result<Self> {
		let listener = TcpListener::bind(addr).await?;
		tracing::info!(addr = %listener.local_addr()?, "remoting server listening");
		Ok(Self {
			listener,
			shared: Arc::new(ServerShared {
				registry,
				container,
				shutdown: CancellationToken::new(),
				links: Mutex::new(Vec::new()),
				active: AtomicUsize::new(0),
				kill_on_disconnect: config.kill_on_disconnect,
			}),
		})
	}

	/// The bound address (useful when binding port 0).
	pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
		self.listener.local_addr()
	}

	/// A token observers can use to stop the server or watch it stop.
	#[must_use]
	pub fn shutdown_token(&self) -> CancellationToken {
		self.shared.shutdown.clone()
	}

	/// Accepts connections until shut down.
	pub async fn serve(self) -> Result<()> {
		let shutdown = self.shared.shutdown.clone();
		loop {
			tokio::select! {
				() = shutdown.cancelled() => break,
				accepted = self.listener.accept() => match accepted {
					Ok((stream, addr)) => {
						tokio::spawn(run_connection(self.shared.clone(), stream, addr));
					}
					Err(err) => {
						tracing::error!(error = %err, "accept failed");
					}
				}
			}
		}
		tracing::info!("remoting server stopped");
		Ok(())
	}
}

/// Lifecycle of one inbound connection.
async fn run_connection(shared: Arc<ServerShared>, stream: TcpStream, addr: SocketAddr) {
	shared.active.fetch_add(1, Ordering::SeqCst);
	tracing::info!(%addr, "connection accepted");

	let (reader, writer) = wrap_stream(stream);
	let peer = PeerId::new(addr.to_string());
	let link = Link::new(peer.clone(), writer, shared.shutdown.child_token());
	shared.links.lock().push(link.clone());

	let dispatcher = Dispatcher {
		registry: shared.registry.clone(),
		container: shared.container.clone(),
		link: link.clone(),
		peer: peer.clone(),
		hint: None,
		server: Some(shared.clone()),
	};
	let final_peer = match dispatcher.run(reader).await {
		Ok(peer) => peer,
		Err((peer, err)) => {
			tracing::warn!(%addr, error = %err, "connection worker failed");
			peer
		}
	};

	// The departed peer can no longer hold anything here.
	shared.registry.sweep_released(&final_peer, true);
	link.terminator().cancel();
	shared.links.lock().retain(|l| !Arc::ptr_eq(l, &link));

	let remaining = shared.active.fetch_sub(1, Ordering::SeqCst) - 1;
	tracing::info!(%addr, "connection closed");
	if shared.kill_on_disconnect && remaining == 0 && !shared.shutdown.is_cancelled() {
		tracing::info!("last client disconnected, shutting down");
		shared.shutdown_all().await;
	}
}

/// An invoker for peers no reverse channel has been opened to yet.
struct NoRoute(PeerId);

#[async_trait]
impl Invoker for NoRoute {
	fn peer(&self) -> &PeerId {
		&self.0
	}

	async fn invoke(&self, call: RemoteCall) -> Result<Reply> {
		Err(RemotingError::Unsupported(format!(
			"no reverse channel to {} for a call on {}",
			self.0, call.target
		)))
	}
}

/// Whether the frame loop keeps going after a frame.
enum Flow {
	Continue,
	Stop,
}

/// The per-connection frame loop.
///
/// Runs on the server for inbound connections and on the client for the
/// reverse channel; only the server role handles `ShutdownServer`.
pub(crate) struct Dispatcher {
	registry: Arc<InstanceRegistry>,
	container: Arc<ServiceContainer>,
	link: Arc<Link>,
	/// Current peer identity; refined once the reverse endpoint is known.
	peer: PeerId,
	/// Invoker of the link references from this peer can be routed through.
	hint: Option<Arc<dyn Invoker>>,
	server: Option<Arc<ServerShared>>,
}

impl Dispatcher {
	/// Builds the worker for the client side of a reverse channel.
	pub(crate) fn for_reverse(
		registry: Arc<InstanceRegistry>,
		container: Arc<ServiceContainer>,
		link: Arc<Link>,
		peer: PeerId,
		hint: Arc<dyn Invoker>,
	) -> Self {
		Self {
			registry,
			container,
			link,
			peer,
			hint: Some(hint),
			server: None,
		}
	}

	fn arrival(&self) -> Arc<dyn Invoker> {
		self.hint
			.clone()
			.unwrap_or_else(|| Arc::new(NoRoute(self.peer.clone())))
	}

	/// Reads frames until the link closes; returns the final peer identity.
	pub(crate) async fn run(mut self, mut reader: BoxRead) -> std::result::Result<PeerId, (PeerId, RemotingError)> {
		let terminator = self.link.terminator().clone();
		loop {
			let header = tokio::select! {
				() = terminator.cancelled() => break,
				header = CallHeader::read(&mut reader) => header,
			};
			let header = match header {
				Ok(header) => header,
				Err(ProtoError::Eof) => break,
				Err(err) => return Err((self.peer.clone(), err.into())),
			};
			match self.handle(header, &mut reader).await {
				Ok(Flow::Continue) => {}
				Ok(Flow::Stop) => break,
				Err(err) => return Err((self.peer.clone(), err)),
			}
		}
		Ok(self.peer)
	}

	async fn handle(&mut self, header: CallHeader, reader: &mut BoxRead) -> Result<Flow> {
		tracing::trace!(kind = ?header.kind, sequence = header.sequence, peer = %self.peer, "frame in");
		match header.kind {
			CallKind::OpenReverseChannel => {
				let ip = read_str(reader).await?;
				let port = read_i32(reader).await?;
				self.open_reverse(&ip, port).await?;
				Ok(Flow::Continue)
			}
			CallKind::CreateInstanceWithDefaultCtor => {
				self.handle_create(header, reader, false).await?;
				Ok(Flow::Continue)
			}
			CallKind::CreateInstance => {
				self.handle_create(header, reader, true).await?;
				Ok(Flow::Continue)
			}
			CallKind::MethodCall => {
				self.handle_method_call(header, reader).await?;
				Ok(Flow::Continue)
			}
			CallKind::GcCleanup => {
				let count = read_checked_count(reader, 1 << 20).await?;
				for _ in 0..count {
					let id = ObjectId::from_wire(read_str(reader).await?);
					self.registry.remove(&id, &self.peer, true);
				}
				tracing::debug!(peer = %self.peer, count, "gc cleanup applied");
				Ok(Flow::Continue)
			}
			CallKind::ShutdownServer => {
				let Some(server) = &self.server else {
					return Err(RemotingError::Protocol(
						"shutdown request on a reverse channel".into(),
					));
				};
				tracing::info!(peer = %self.peer, "shutdown requested");
				server.shutdown_all().await;
				Ok(Flow::Stop)
			}
			CallKind::ServerShuttingDown => {
				self.link.terminator().cancel();
				Ok(Flow::Stop)
			}
			CallKind::MethodReply | CallKind::ExceptionReturn => Err(RemotingError::Protocol(
				format!("{:?} on a request stream", header.kind),
			)),
		}
	}

	/// Dials the peer's announced endpoint and installs the callback channel.
	async fn open_reverse(&mut self, ip: &str, port: i32) -> Result<()> {
		let endpoint = format!("{ip}:{port}");
		let stream = TcpStream::connect(&endpoint).await.map_err(|err| {
			tracing::error!(%endpoint, error = %err, "reverse channel dial failed");
			RemotingError::Io(err)
		})?;
		let (reader, writer) = wrap_stream(stream);
		let peer = PeerId::new(endpoint);
		let link = Link::new(peer.clone(), writer, self.link.terminator().child_token());
		let channel = CallChannel::new(self.registry.clone(), link, ChannelConfig::callback());
		self.registry
			.add_peer(peer.clone(), Arc::new(channel.clone()))?;
		tokio::spawn(run_receiver(channel.clone(), reader));
		tracing::info!(peer = %peer, "reverse channel established");
		self.peer = peer;
		self.hint = Some(Arc::new(channel));
		Ok(())
	}

	async fn handle_create(
		&mut self,
		header: CallHeader,
		reader: &mut BoxRead,
		with_args: bool,
	) -> Result<()> {
		let type_name = read_str(reader).await?;
		let _reserved = read_str(reader).await?;
		let _ctor_id = read_i32(reader).await?;
		let _generic_count = read_i32(reader).await?;
		let mut args = Vec::new();
		if with_args {
			let count = read_checked_count(reader, 4096).await?;
			let mut wires = Vec::with_capacity(count);
			for _ in 0..count {
				wires.push(WireValue::read(reader).await?);
			}
			let arrival = self.arrival();
			for wire in wires {
				args.push(decode_value(&self.registry, &self.peer, &arrival, wire)?);
			}
		}

		tracing::debug!(peer = %self.peer, type_name = %type_name, "create instance");
		match self.container.construct(&type_name, args) {
			Ok(obj) => {
				self.registry.register(&obj);
				let wire = encode_value(&self.registry, &self.peer, &Value::object(obj))?;
				let mut body = Vec::new();
				put_i32(&mut body, 1);
				wire.put(&mut body);
				self.link
					.send(CallKind::MethodReply, header.sequence, &body)
					.await
			}
			Err(err) => send_exception(&self.link, header.sequence, &err).await,
		}
	}

	async fn handle_method_call(&mut self, header: CallHeader, reader: &mut BoxRead) -> Result<()> {
		let target = ObjectId::from_wire(read_str(reader).await?);
		let _declaring_type = read_str(reader).await?;
		let method_id = read_str(reader).await?;
		let generic_count = read_checked_count(reader, 64).await?;
		let mut generic_args = Vec::with_capacity(generic_count);
		for _ in 0..generic_count {
			generic_args.push(read_str(reader).await?);
		}
		let arg_count = read_checked_count(reader, 4096).await?;
		let mut wires = Vec::with_capacity(arg_count);
		for _ in 0..arg_count {
			wires.push(WireValue::read(reader).await?);
		}

		// Run the call concurrently: a handler may legitimately call back
		// into this peer (or be called again) before it returns.
		let registry = self.registry.clone();
		let link = self.link.clone();
		let peer = self.peer.clone();
		let arrival = self.arrival();
		tokio::spawn(async move {
			let outcome =
				invoke_target(&registry, &peer, &arrival, &target, &method_id, &generic_args, wires)
					.await;
			let sent = match outcome {
				Ok(Some(reply)) => send_reply(&registry, &link, &peer, header.sequence, &reply).await,
				Ok(None) => {
					// Delegate target vanished between raise and unsubscribe:
					// complete the call with an empty reply.
					tracing::debug!(%target, "delegate target gone, empty reply");
					link.send(CallKind::MethodReply, header.sequence, &put_count(0)).await
				}
				Err(err) => send_exception(&link, header.sequence, &err).await,
			};
			if let Err(err) = sent {
				tracing::warn!(error = %err, "reply write failed");
				link.terminator().cancel();
			}
		});
		Ok(())
	}
}

/// Resolves and invokes a call target.
///
/// `Ok(None)` is the missing-delegate-target race; any other missing
/// target is an error that travels back as `InstanceNotFound`.
async fn invoke_target(
	registry: &Arc<InstanceRegistry>,
	peer: &PeerId,
	arrival: &Arc<dyn Invoker>,
	target: &ObjectId,
	method_id: &str,
	generic_args: &[String],
	wires: Vec<WireValue>,
) -> Result<Option<Reply>> {
	let mut args = Vec::with_capacity(wires.len());
	for wire in wires {
		args.push(decode_value(registry, peer, arrival, wire)?);
	}
	let Some(obj) = registry.try_get(target) else {
		if target.is_delegate_target() {
			return Ok(None);
		}
		return Err(RemotingError::InstanceNotFound(target.clone()));
	};
	tracing::trace!(%target, method = %method_id, "invoke");
	obj.dispatch(method_id, generic_args, args).await.map(Some)
}

/// Encodes and writes a `MethodReply`.
async fn send_reply(
	registry: &Arc<InstanceRegistry>,
	link: &Arc<Link>,
	peer: &PeerId,
	sequence: i32,
	reply: &Reply,
) -> Result<()> {
	let mut body = Vec::new();
	put_i32(&mut body, reply.values.len() as i32);
	for value in &reply.values {
		encode_value(registry, peer, value)?.put(&mut body);
	}
	link.send(CallKind::MethodReply, sequence, &body).await
}

/// Encodes and writes an `ExceptionReturn`.
async fn send_exception(link: &Arc<Link>, sequence: i32, err: &RemotingError) -> Result<()> {
	let (message, detail) = match err {
		RemotingError::Remote {
			message, detail, ..
		} => (message.clone(), detail.clone()),
		other => (other.to_string(), None),
	};
	tracing::debug!(kind = err.wire_kind(), %message, "call faulted");
	let mut body = Vec::new();
	put_str(&mut body, err.wire_kind());
	put_str(&mut body, &message);
	put_bytes(&mut body, &postcard::to_allocvec(&detail)?);
	link.send(CallKind::ExceptionReturn, sequence, &body).await
}

fn put_count(count: i32) -> Vec<u8> {
	let mut body = Vec::new();
	put_i32(&mut body, count);
	body
}

async fn read_checked_count(reader: &mut BoxRead, max: i32) -> Result<usize> {
	let count = read_i32(reader).await?;
	if !(0..=max).contains(&count) {
		return Err(ProtoError::BadLength(i64::from(count)).into());
	}
	Ok(count as usize)
}
