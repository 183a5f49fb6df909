//! SHV RPC peer base and the broker client built on it.
//!
//! [`RpcPeer`] owns one connection: an outbound queue, request correlation
//! with timeouts and retries, and the in-band reset handling. A
//! [`NodeDispatcher`] serves the peer's own path tree (discovery via
//! `ls`/`dir` and the mandatory `.app` subtree) from a [`NodeHandler`].
//! [`ShvClient`] adds the broker login workflow, idle keepalive, reconnects
//! and subscription replay.

mod client;
mod node;
mod peer;

pub use client::{ClientConfig, ClientError, ShvClient};
pub use node::{EmptyNode, NodeDispatcher, NodeHandler, Request, Signal, dir_method, ls_method};
pub use peer::{CallError, CallOptions, MessageHandler, RpcPeer};
