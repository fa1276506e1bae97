//! Transparent bidirectional remoting between two processes.
//!
//! A client obtains a handle to an object hosted in a server process and
//! invokes its methods as if it were local. Arguments and results flow
//! over a pair of framed binary TCP streams; objects passed by reference
//! materialise as proxies on the receiving side, and those proxies are
//! themselves first-class remote identities that can travel back to their
//! originator. Callbacks run over a reverse channel the server dials on
//! connect, and a distributed GC releases remote references once they are
//! locally unreachable.
//!
//! The moving parts:
//! * [`InstanceRegistry`]: the process-wide identifier/object table
//! * [`CallChannel`]: the client-side interceptor for one link
//! * [`RemotingServer`]: the accept loop and per-connection dispatch
//! * [`RemotingClient`]: one wired-up peering, reverse channel included
//! * [`ProxyFactory`] / [`ProxyBinder`]: typed-stub synthesis
//! * [`ServiceContainer`]: type-name keyed constructors for remote creation

#![warn(missing_docs)]

pub mod channel;
pub mod client;
pub mod container;
pub mod dispatch;
pub mod error;
pub mod gc;
pub mod ident;
pub mod link;
pub mod marshal;
pub mod object;
pub mod proxy;
pub mod registry;

pub use channel::{CALLBACK_SEQUENCE_BASE, CLIENT_SEQUENCE_BASE, CallChannel, ChannelConfig};
pub use client::{ClientConfig, RemotingClient};
pub use container::ServiceContainer;
pub use dispatch::{RemotingServer, ServerConfig};
pub use error::{RemotingError, Result};
pub use gc::GcConfig;
pub use ident::{MethodDescriptor, ObjectId, PeerId, ProcessId};
pub use link::{BoxRead, BoxWrite, Link, wrap_stream};
pub use marshal::{bind_delegate, decode_value, encode_value};
pub use object::{CallbackFn, Invoker, RemoteCall, RemoteDelegate, RemoteObject, Reply, Value};
pub use proxy::{GenericProxy, ProxyBinder, ProxyFactory, RemoteHandle, binder_fn};
pub use registry::InstanceRegistry;
