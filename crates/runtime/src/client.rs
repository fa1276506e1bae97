//! Client session assembly.
//!
//! [`RemotingClient::connect`] wires up one peering: it dials the server,
//! binds the reverse-channel listener, announces it with
//! `OpenReverseChannel`, waits for the server to dial back, and spawns the
//! receiver, reverse-dispatch and GC tasks. After that the session is
//! symmetric: calls flow out on the forward link, callbacks flow in on the
//! reverse link.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::channel::{CallChannel, ChannelConfig, run_receiver};
use crate::container::ServiceContainer;
use crate::dispatch::Dispatcher;
use crate::error::{RemotingError, Result};
use crate::gc::{GcConfig, spawn_collector};
use crate::ident::PeerId;
use crate::link::{Link, wrap_stream};
use crate::object::{Invoker, RemoteObject, Value};
use crate::registry::InstanceRegistry;

/// How long to wait for the server to dial the reverse channel back.
const REVERSE_ACCEPT_TIMEOUT: Duration = Duration::from_secs(10);

/// Client connection tuning knobs.
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
	/// Port for the reverse-channel listener.
	///
	/// Defaults to `server port + 1` for a colocated server (falling back
	/// to an ephemeral port when that is taken) and an ephemeral port
	/// otherwise; whatever is bound gets announced to the server.
	pub reverse_port: Option<u16>,
	/// Remote display formatting instead of the local placeholder.
	pub remote_display: bool,
	/// Distributed GC tuning.
	pub gc: GcConfig,
}

/// One client-side peering with a remoting server.
pub struct RemotingClient {
	registry: Arc<InstanceRegistry>,
	channel: CallChannel,
	reverse_addr: SocketAddr,
	terminator: CancellationToken,
}

impl RemotingClient {
	/// Connects to a server and completes the bidirectional handshake.
	///
	/// The `container` serves instance-creation requests arriving on the
	/// reverse channel; a client that hosts no objects passes an empty one.
	pub async fn connect(
		addr: SocketAddr,
		registry: Arc<InstanceRegistry>,
		container: Arc<ServiceContainer>,
		config: ClientConfig,
	) -> Result<Self> {
		let stream = TcpStream::connect(addr).await?;
		let local_ip = stream.local_addr()?.ip();

		// Bind the reverse listener before announcing it.
		let listener = match config.reverse_port {
			Some(port) => TcpListener::bind((local_ip, port)).await?,
			None if addr.ip().is_loopback() => {
				match TcpListener::bind((local_ip, addr.port().wrapping_add(1))).await {
					Ok(listener) => listener,
					Err(_) => TcpListener::bind((local_ip, 0)).await?,
				}
			}
			None => TcpListener::bind((local_ip, 0)).await?,
		};
		let reverse_addr = listener.local_addr()?;

		let terminator = CancellationToken::new();
		let peer = PeerId::new(addr.to_string());
		let (forward_read, forward_write) = wrap_stream(stream);
		let link = Link::new(peer.clone(), forward_write, terminator.child_token());
		let channel = CallChannel::new(
			registry.clone(),
			link,
			ChannelConfig::client().remote_display(config.remote_display),
		);
		registry.add_peer(peer.clone(), Arc::new(channel.clone()))?;
		tokio::spawn(run_receiver(channel.clone(), forward_read));

		channel
			.send_open_reverse_channel(&reverse_addr.ip().to_string(), reverse_addr.port())
			.await?;
		let (reverse_stream, _) =
			tokio::time::timeout(REVERSE_ACCEPT_TIMEOUT, listener.accept())
				.await
				.map_err(|_| {
					RemotingError::Protocol("server did not open the reverse channel".into())
				})??;
		drop(listener);
		tracing::info!(server = %peer, reverse = %reverse_addr, "peering established");

		let (reverse_read, reverse_write) = wrap_stream(reverse_stream);
		let reverse_link = Link::new(peer.clone(), reverse_write, terminator.child_token());
		let hint: Arc<dyn Invoker> = Arc::new(channel.clone());
		let dispatcher = Dispatcher::for_reverse(
			registry.clone(),
			container,
			reverse_link,
			peer.clone(),
			hint,
		);
		tokio::spawn(async move {
			if let Err((peer, err)) = dispatcher.run(reverse_read).await {
				tracing::warn!(%peer, error = %err, "reverse channel worker failed");
			}
		});

		spawn_collector(channel.clone(), config.gc, terminator.child_token());

		Ok(Self {
			registry,
			channel,
			reverse_addr,
			terminator,
		})
	}

	/// The registry this client marshals through.
	#[must_use]
	pub fn registry(&self) -> &Arc<InstanceRegistry> {
		&self.registry
	}

	/// The call channel to the server.
	#[must_use]
	pub fn channel(&self) -> &CallChannel {
		&self.channel
	}

	/// The reverse-channel endpoint announced to the server.
	///
	/// This is also the identity the server tracks this peer under.
	#[must_use]
	pub fn reverse_addr(&self) -> SocketAddr {
		self.reverse_addr
	}

	/// Creates a server-side instance with its default constructor.
	pub async fn create_instance(&self, type_name: &str) -> Result<Arc<dyn RemoteObject>> {
		self.channel.create_instance(type_name, Vec::new()).await
	}

	/// Creates a server-side instance with constructor arguments.
	pub async fn create_instance_with(
		&self,
		type_name: &str,
		args: Vec<Value>,
	) -> Result<Arc<dyn RemoteObject>> {
		self.channel.create_instance(type_name, args).await
	}

	/// Asks the server process to shut down; the link going down as a
	/// result is expected and swallowed.
	pub async fn terminate_server(&self) -> Result<()> {
		self.channel.terminate_server().await
	}

	/// Disconnects, reporting every reference held on the server's behalf.
	pub async fn disconnect(self) {
		let swept = self.registry.sweep_released(self.channel.peer(), true);
		if !swept.is_empty() {
			let _ = self.channel.send_gc_cleanup(&swept).await;
		}
		self.terminator.cancel();
	}
}
