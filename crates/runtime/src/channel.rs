//! The client-side interception path.
//!
//! A [`CallChannel`] turns local invocations into request/reply exchanges
//! on one link: it allocates sequence numbers, parks each call in a
//! pending map keyed by sequence, and a dedicated receiver task matches
//! incoming `MethodReply`/`ExceptionReturn` frames back to their waiting
//! callers. Remote failures re-raise locally with the remote kind and
//! message preserved; a fired link terminator fails every pending call
//! with [`RemotingError::LinkDown`].

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use tether_proto::{CallKind, ProtoError, WireValue, put_i32, put_str, read_bytes, read_i32, read_str};

use crate::error::{RemotingError, Result};
use crate::ident::PeerId;
use crate::link::{BoxRead, Link};
use crate::marshal::{decode_value, encode_value};
use crate::object::{Invoker, RemoteCall, RemoteObject, Reply, Value};
use crate::registry::InstanceRegistry;

/// First sequence number used by the connecting side of a link.
pub const CLIENT_SEQUENCE_BASE: i32 = 1;
/// First sequence number used by the server-originated (callback) side,
/// offset so the two ranges cannot collide on one stream.
pub const CALLBACK_SEQUENCE_BASE: i32 = 10_000;

/// Tuning knobs of one call channel.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
	/// First sequence number this channel allocates.
	pub first_sequence: i32,
	/// Remote display formatting instead of the local placeholder.
	pub remote_display: bool,
	/// Nudge the GC collector after this many intercepted calls.
	pub calls_per_gc_kick: u32,
}

impl ChannelConfig {
	/// Configuration for the connecting side of a link.
	#[must_use]
	pub fn client() -> Self {
		Self {
			first_sequence: CLIENT_SEQUENCE_BASE,
			remote_display: false,
			calls_per_gc_kick: 100,
		}
	}

	/// Configuration for the callback side of a link.
	#[must_use]
	pub fn callback() -> Self {
		Self {
			first_sequence: CALLBACK_SEQUENCE_BASE,
			..Self::client()
		}
	}

	/// Opts display formatting in or out of remoting.
	#[must_use]
	pub fn remote_display(mut self, enabled: bool) -> Self {
		self.remote_display = enabled;
		self
	}
}

/// How one pending call ended.
enum Outcome {
	Replied(Reply),
	Faulted(RemotingError),
}

struct Inner {
	registry: Arc<InstanceRegistry>,
	link: Arc<Link>,
	pending: Mutex<HashMap<i32, oneshot::Sender<Outcome>>>,
	next_sequence: AtomicI32,
	remote_display: bool,
	calls: AtomicU32,
	calls_per_gc_kick: u32,
}

/// The interceptor for one outgoing link.
#[derive(Clone)]
pub struct CallChannel {
	inner: Arc<Inner>,
}

impl CallChannel {
	/// Creates a channel over an established link.
	#[must_use]
	pub fn new(registry: Arc<InstanceRegistry>, link: Arc<Link>, config: ChannelConfig) -> Self {
		Self {
			inner: Arc::new(Inner {
				registry,
				link,
				pending: Mutex::new(HashMap::new()),
				next_sequence: AtomicI32::new(config.first_sequence),
				remote_display: config.remote_display,
				calls: AtomicU32::new(0),
				calls_per_gc_kick: config.calls_per_gc_kick.max(1),
			}),
		}
	}

	/// The peer this channel reaches.
	#[must_use]
	pub fn peer(&self) -> &PeerId {
		self.inner.link.peer()
	}

	/// The terminator of the underlying link.
	#[must_use]
	pub fn terminator(&self) -> &CancellationToken {
		self.inner.link.terminator()
	}

	/// The registry this channel marshals through.
	pub(crate) fn registry(&self) -> &Arc<InstanceRegistry> {
		&self.inner.registry
	}

	fn next_sequence(&self) -> i32 {
		self.inner.next_sequence.fetch_add(1, Ordering::Relaxed)
	}

	/// Performs one request/reply exchange.
	async fn exchange(&self, kind: CallKind, sequence: i32, body: Vec<u8>) -> Result<Reply> {
		if self.inner.link.terminator().is_cancelled() {
			return Err(RemotingError::LinkDown);
		}
		let (tx, rx) = oneshot::channel();
		self.inner.pending.lock().insert(sequence, tx);

		if let Err(err) = self.inner.link.send(kind, sequence, &body).await {
			self.inner.pending.lock().remove(&sequence);
			self.fail_link("send failed");
			return Err(err);
		}

		let terminator = self.inner.link.terminator();
		tokio::select! {
			outcome = rx => match outcome {
				Ok(Outcome::Replied(reply)) => Ok(reply),
				Ok(Outcome::Faulted(err)) => Err(err),
				Err(_) => Err(RemotingError::LinkDown),
			},
			() = terminator.cancelled() => {
				self.inner.pending.lock().remove(&sequence);
				Err(RemotingError::LinkDown)
			}
		}
	}

	/// Asks the peer to construct an instance and returns its proxy.
	pub async fn create_instance(
		&self,
		type_name: &str,
		args: Vec<Value>,
	) -> Result<Arc<dyn RemoteObject>> {
		let kind = if args.is_empty() {
			CallKind::CreateInstanceWithDefaultCtor
		} else {
			CallKind::CreateInstance
		};
		let mut body = Vec::new();
		put_str(&mut body, type_name);
		put_str(&mut body, "");
		put_i32(&mut body, 0); // constructor id
		put_i32(&mut body, 0); // generic argument count
		if !args.is_empty() {
			put_i32(&mut body, args.len() as i32);
			for arg in &args {
				encode_value(&self.inner.registry, self.peer(), arg)?.put(&mut body);
			}
		}
		let sequence = self.next_sequence();
		let reply = self.exchange(kind, sequence, body).await?;
		match reply.returned() {
			Some(Value::Object(obj)) => Ok(obj.clone()),
			other => Err(RemotingError::Protocol(format!(
				"create reply carried {other:?} instead of a reference"
			))),
		}
	}

	/// Reports released proxies to the owning peer. Fire-and-forget.
	pub async fn send_gc_cleanup(&self, ids: &[crate::ident::ObjectId]) -> Result<()> {
		let mut body = Vec::new();
		put_i32(&mut body, ids.len() as i32);
		for id in ids {
			put_str(&mut body, id.as_str());
		}
		let sequence = self.next_sequence();
		self.inner.link.send(CallKind::GcCleanup, sequence, &body).await
	}

	/// Announces this side's reverse-channel endpoint. Fire-and-forget;
	/// the peer answers by dialling the endpoint, not by replying.
	pub(crate) async fn send_open_reverse_channel(&self, ip: &str, port: u16) -> Result<()> {
		let mut body = Vec::new();
		put_str(&mut body, ip);
		put_i32(&mut body, i32::from(port));
		let sequence = self.next_sequence();
		self.inner
			.link
			.send(CallKind::OpenReverseChannel, sequence, &body)
			.await
	}

	/// Asks the server process to shut down.
	///
	/// The expected outcome is the link going down, so link-down and I/O
	/// failures are swallowed; any other fault is surfaced.
	pub async fn terminate_server(&self) -> Result<()> {
		let sequence = self.next_sequence();
		if self.inner.link.send(CallKind::ShutdownServer, sequence, &[]).await.is_err() {
			return Ok(());
		}
		let terminator = self.inner.link.terminator();
		let _ = tokio::time::timeout(Duration::from_secs(10), terminator.cancelled()).await;
		Ok(())
	}

	/// Completes the pending call for `sequence`, if it is still waiting.
	fn complete(&self, sequence: i32, outcome: Outcome) {
		if let Some(tx) = self.inner.pending.lock().remove(&sequence) {
			let _ = tx.send(outcome);
		} else {
			tracing::debug!(sequence, "reply for unknown sequence dropped");
		}
	}

	/// Fails every pending call and cancels the link terminator.
	pub(crate) fn fail_link(&self, reason: &str) {
		let pending: Vec<_> = {
			let mut map = self.inner.pending.lock();
			map.drain().collect()
		};
		if !pending.is_empty() {
			tracing::warn!(peer = %self.peer(), count = pending.len(), reason, "failing pending calls");
		}
		for (_, tx) in pending {
			let _ = tx.send(Outcome::Faulted(RemotingError::LinkDown));
		}
		self.inner.link.terminator().cancel();
	}

	fn count_call(&self) {
		let calls = self.inner.calls.fetch_add(1, Ordering::Relaxed) + 1;
		if calls % self.inner.calls_per_gc_kick == 0 {
			self.inner.registry.gc_kick().notify_waiters();
		}
	}
}

#[async_trait]
impl Invoker for CallChannel {
	fn peer(&self) -> &PeerId {
		self.inner.link.peer()
	}

	fn remote_display(&self) -> bool {
		self.inner.remote_display
	}

	async fn invoke(&self, call: RemoteCall) -> Result<Reply> {
		self.count_call();
		let mut body = Vec::new();
		put_str(&mut body, call.target.as_str());
		put_str(&mut body, &call.declaring_type);
		put_str(&mut body, &call.method_id);
		put_i32(&mut body, call.generic_args.len() as i32);
		for name in &call.generic_args {
			put_str(&mut body, name);
		}
		put_i32(&mut body, call.args.len() as i32);
		for arg in &call.args {
			encode_value(&self.inner.registry, self.peer(), arg)?.put(&mut body);
		}
		let sequence = self.next_sequence();
		tracing::trace!(target = %call.target, method = %call.method_id, sequence, "call out");
		self.exchange(CallKind::MethodCall, sequence, body).await
	}
}

/// Drives the receive side of a channel's link.
///
/// Matches replies to pending calls by sequence. Never propagates errors
/// into user code: faults are recorded into the pending contexts and the
/// loop exits after cancelling the terminator.
pub(crate) async fn run_receiver(channel: CallChannel, mut reader: BoxRead) {
	let terminator = channel.inner.link.terminator().clone();
	loop {
		let header = tokio::select! {
			() = terminator.cancelled() => break,
			header = tether_proto::CallHeader::read(&mut reader) => header,
		};
		let header = match header {
			Ok(header) => header,
			Err(ProtoError::Eof) => {
				tracing::debug!(peer = %channel.peer(), "link closed");
				channel.fail_link("link closed");
				break;
			}
			Err(err) => {
				tracing::error!(peer = %channel.peer(), error = %err, "receive failed");
				channel.fail_link("receive failed");
				break;
			}
		};
		match header.kind {
			CallKind::MethodReply => match read_reply(&channel, &mut reader).await {
				Ok(reply) => channel.complete(header.sequence, Outcome::Replied(reply)),
				Err(RemotingError::Wire(err)) => {
					// The stream position is gone; no recovery.
					tracing::error!(peer = %channel.peer(), error = %err, "undecodable reply");
					channel.fail_link("undecodable reply");
					break;
				}
				Err(err) => channel.complete(header.sequence, Outcome::Faulted(err)),
			},
			CallKind::ExceptionReturn => match read_exception(&mut reader).await {
				Ok(fault) => channel.complete(header.sequence, Outcome::Faulted(fault)),
				Err(err) => {
					tracing::error!(peer = %channel.peer(), error = %err, "undecodable exception");
					channel.fail_link("undecodable exception");
					break;
				}
			},
			CallKind::ServerShuttingDown => {
				tracing::info!(peer = %channel.peer(), "peer is shutting down");
				channel.fail_link("peer shutting down");
				break;
			}
			other => {
				tracing::error!(peer = %channel.peer(), kind = ?other, "unexpected frame on reply stream");
				channel.fail_link("unexpected frame");
				break;
			}
		}
	}
}

async fn read_reply(channel: &CallChannel, reader: &mut BoxRead) -> Result<Reply> {
	// Consume the whole body before interpreting any of it, so a semantic
	// failure in one value faults only its call, not the stream position.
	let count = read_i32(reader).await?;
	if !(0..=4096).contains(&count) {
		return Err(ProtoError::BadLength(i64::from(count)).into());
	}
	let mut wires = Vec::with_capacity(count as usize);
	for _ in 0..count {
		wires.push(WireValue::read(reader).await?);
	}
	let arrival: Arc<dyn Invoker> = Arc::new(channel.clone());
	let mut values = Vec::with_capacity(wires.len());
	for wire in wires {
		values.push(decode_value(
			&channel.inner.registry,
			channel.peer(),
			&arrival,
			wire,
		)?);
	}
	Ok(Reply { values })
}

async fn read_exception(reader: &mut BoxRead) -> Result<RemotingError> {
	let kind = read_str(reader).await?;
	let message = read_str(reader).await?;
	let payload = read_bytes(reader).await?;
	let detail: Option<String> = postcard::from_bytes(&payload).unwrap_or(None);
	Ok(RemotingError::Remote {
		kind,
		message,
		detail,
	})
}

#[cfg(test)]
mod tests {
	use tokio::io::{ReadHalf, WriteHalf};
	use tokio_util::sync::CancellationToken;

	use tether_proto::{CallHeader, put_bytes};

	use super::*;
	use crate::ident::{MethodDescriptor, ObjectId};

	type ServerIo = (
		ReadHalf<tokio::io::DuplexStream>,
		WriteHalf<tokio::io::DuplexStream>,
	);

	fn pipe() -> (CallChannel, ServerIo) {
		let (client_io, server_io) = tokio::io::duplex(64 * 1024);
		let (client_read, client_write) = tokio::io::split(client_io);
		let link = Link::new(
			PeerId::new("fake-server"),
			Box::new(client_write),
			CancellationToken::new(),
		);
		let channel = CallChannel::new(InstanceRegistry::new(), link, ChannelConfig::client());
		tokio::spawn(run_receiver(channel.clone(), Box::new(client_read)));
		(channel, tokio::io::split(server_io))
	}

	fn call(n: i32) -> RemoteCall {
		RemoteCall::new(
			ObjectId::from_wire("srv:1.1/0"),
			&MethodDescriptor::new("demo.Fake", "echo", ["i32"]),
			vec![Value::serialize(&n).unwrap()],
		)
	}

	/// Reads one method-call frame and returns its sequence.
	async fn drain_call(reader: &mut ReadHalf<tokio::io::DuplexStream>) -> i32 {
		let header = CallHeader::read(reader).await.unwrap();
		assert_eq!(header.kind, CallKind::MethodCall);
		let _target = read_str(reader).await.unwrap();
		let _declaring = read_str(reader).await.unwrap();
		let _method = read_str(reader).await.unwrap();
		assert_eq!(read_i32(reader).await.unwrap(), 0);
		let args = read_i32(reader).await.unwrap();
		for _ in 0..args {
			WireValue::read(reader).await.unwrap();
		}
		header.sequence
	}

	async fn send_reply(
		writer: &mut WriteHalf<tokio::io::DuplexStream>,
		sequence: i32,
		value: i32,
	) {
		let mut body = Vec::new();
		put_i32(&mut body, 1);
		WireValue::Payload(postcard::to_allocvec(&value).unwrap()).put(&mut body);
		tether_proto::write_frame(writer, CallHeader::new(CallKind::MethodReply, sequence), &body)
			.await
			.unwrap();
	}

	#[tokio::test]
	async fn replies_match_by_sequence_not_arrival_order() {
		let (channel, (mut server_read, mut server_write)) = pipe();

		let first = tokio::spawn({
			let channel = channel.clone();
			async move { channel.invoke(call(1)).await }
		});
		let seq_one = drain_call(&mut server_read).await;
		let second = tokio::spawn({
			let channel = channel.clone();
			async move { channel.invoke(call(2)).await }
		});
		let seq_two = drain_call(&mut server_read).await;
		assert_eq!(seq_one, CLIENT_SEQUENCE_BASE);
		assert_eq!(seq_two, CLIENT_SEQUENCE_BASE + 1);

		// Answer out of order; each caller must still get its own reply.
		send_reply(&mut server_write, seq_two, 222).await;
		send_reply(&mut server_write, seq_one, 111).await;

		let first = first.await.unwrap().unwrap();
		let second = second.await.unwrap().unwrap();
		assert_eq!(first.returned_or_default::<i32>().unwrap(), 111);
		assert_eq!(second.returned_or_default::<i32>().unwrap(), 222);
	}

	#[tokio::test]
	async fn remote_fault_surfaces_kind_and_message() {
		let (channel, (mut server_read, mut server_write)) = pipe();

		let pending = tokio::spawn({
			let channel = channel.clone();
			async move { channel.invoke(call(1)).await }
		});
		let sequence = drain_call(&mut server_read).await;

		let mut body = Vec::new();
		put_str(&mut body, "InvalidOperationException");
		put_str(&mut body, "nope");
		put_bytes(&mut body, &postcard::to_allocvec(&None::<String>).unwrap());
		tether_proto::write_frame(
			&mut server_write,
			CallHeader::new(CallKind::ExceptionReturn, sequence),
			&body,
		)
		.await
		.unwrap();

		match pending.await.unwrap().unwrap_err() {
			RemotingError::Remote { kind, message, .. } => {
				assert_eq!(kind, "InvalidOperationException");
				assert_eq!(message, "nope");
			}
			other => panic!("expected a remote fault, got {other}"),
		}
	}

	#[tokio::test]
	async fn link_close_faults_pending_calls() {
		let (channel, (mut server_read, server_write)) = pipe();

		let pending = tokio::spawn({
			let channel = channel.clone();
			async move { channel.invoke(call(1)).await }
		});
		drain_call(&mut server_read).await;

		// Both halves go away, so the client sees EOF mid-wait.
		drop(server_read);
		drop(server_write);
		let err = pending.await.unwrap().unwrap_err();
		assert!(matches!(err, RemotingError::LinkDown));
		assert!(channel.terminator().is_cancelled());

		// Later calls short-circuit without touching the stream.
		let err = channel.invoke(call(2)).await.unwrap_err();
		assert!(matches!(err, RemotingError::LinkDown));
	}
}
