//! SHV RPC message layer.
//!
//! Builds the protocol vocabulary on top of the value model: message
//! envelopes with typed accessors, the error taxonomy, resource identifier
//! globbing, the access-level ladder, method descriptors, login material and
//! RPC URLs.

mod access;
mod dir;
mod error;
mod login;
mod message;
mod ri;
mod stdtypes;
mod url_;

pub use access::RpcAccess;
pub use dir::{DirFlags, RpcDir};
pub use error::{RpcError, RpcErrorCode};
pub use login::{RpcLogin, RpcLoginType, param_int, param_str, sha1_hex};
pub use message::{RpcMessage, next_request_id};
pub use ri::{RpcRI, fnmatch, path_match, tail_pattern};
pub use stdtypes::standard_type;
pub use url_::{RpcProtocol, RpcUrl, UrlError};

/// SHV version this implementation reports on `.app`.
pub const SHV_VERSION_MAJOR: i64 = 3;
pub const SHV_VERSION_MINOR: i64 = 0;
