//! Message framing over stream and packet media.
//!
//! A [`Link`] carries whole frames: either a message payload (a protocol
//! indicator byte followed by codec bytes) or the in-band RESET control.
//! Three framings exist: length-prefixed Stream, byte-stuffed Serial with
//! optional CRC-32, and WebSocket.

mod error;
mod frame;
mod link;
mod net;
mod serial;
mod stream;
mod websocket;

pub use error::LinkError;
pub use frame::Frame;
pub use link::Link;
pub use net::{Listener, bind_url, connect_url};
pub use serial::SerialLink;
pub use stream::StreamLink;
pub use websocket::WebSocketLink;
