use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

use shv_value::{MetaMap, RpcValue, Value};

use crate::access::RpcAccess;
use crate::error::RpcError;

/// Meta keys of an RPC message.
mod tag {
    pub const META_TYPE_ID: i64 = 1;
    pub const REQUEST_ID: i64 = 8;
    pub const PATH: i64 = 9;
    /// Method name on requests, signal name on signals.
    pub const METHOD: i64 = 10;
    pub const CALLER_IDS: i64 = 11;
    pub const ACCESS: i64 = 14;
    pub const USER_ID: i64 = 16;
    pub const ACCESS_LEVEL: i64 = 17;
    pub const SOURCE: i64 = 19;
}

/// Body keys of an RPC message.
mod key {
    pub const PARAM: i64 = 1;
    pub const RESULT: i64 = 2;
    pub const ERROR: i64 = 3;
    /// Progress of a pending request, 0.0..1.0.
    pub const DELAY: i64 = 4;
    /// Request abort marker.
    pub const ABORT: i64 = 5;
}

static REQUEST_ID: AtomicI64 = AtomicI64::new(1);

/// Allocate a fresh process-wide request id.
pub fn next_request_id() -> i64 {
    REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

/// A single SHV RPC message: an IMap body with a meta envelope.
///
/// The same type covers requests, responses and signals; the populated meta
/// fields decide the shape. Accessors return `None`/defaults when a field is
/// missing.
#[derive(Clone, Debug, PartialEq)]
pub struct RpcMessage {
    meta: MetaMap,
    body: BTreeMap<i64, RpcValue>,
}

impl RpcMessage {
    fn blank() -> Self {
        let mut meta = MetaMap::new();
        meta.insert(tag::META_TYPE_ID, 1);
        Self {
            meta,
            body: BTreeMap::new(),
        }
    }

    /// New request with a freshly allocated request id.
    pub fn request(path: &str, method: &str, param: Option<RpcValue>) -> Self {
        let mut msg = Self::blank();
        msg.set_request_id(next_request_id());
        msg.set_method(Some(method));
        if !path.is_empty() {
            msg.set_path(Some(path));
        }
        msg.set_param(param);
        msg
    }

    /// New signal message.
    pub fn signal(
        path: &str,
        signal: &str,
        source: &str,
        param: Option<RpcValue>,
        access: RpcAccess,
    ) -> Self {
        let mut msg = Self::blank();
        msg.set_method(Some(signal));
        if !path.is_empty() {
            msg.set_path(Some(path));
        }
        if source != "get" {
            msg.meta.insert(tag::SOURCE, source);
        }
        if access != RpcAccess::Read {
            msg.set_access(Some(access));
        }
        msg.set_param(param);
        msg
    }

    /// Response skeleton matching this request's id and caller ids.
    pub fn make_response(&self) -> Self {
        let mut resp = Self::blank();
        if let Some(rid) = self.request_id() {
            resp.set_request_id(rid);
        }
        resp.set_caller_ids(self.caller_ids());
        resp
    }

    /// Abort marker for an outstanding request.
    ///
    /// Carries the original path and method so that brokers can route it the
    /// same way they routed the request itself.
    pub fn abort_request(request_id: i64, path: &str, method: &str) -> Self {
        let mut msg = Self::blank();
        msg.set_request_id(request_id);
        msg.set_method(Some(method));
        if !path.is_empty() {
            msg.set_path(Some(path));
        }
        msg.body.insert(key::ABORT, RpcValue::from(true));
        msg
    }

    // Shape predicates. An abort marker is checked first: it looks like a
    // request on the wire but must never be dispatched as one.

    pub fn is_request(&self) -> bool {
        self.request_id().is_some() && self.method().is_some() && !self.is_abort()
    }

    pub fn is_response(&self) -> bool {
        self.request_id().is_some() && self.method().is_none() && !self.is_abort()
    }

    pub fn is_signal(&self) -> bool {
        self.request_id().is_none() && self.method().is_some()
    }

    pub fn is_error(&self) -> bool {
        self.body.contains_key(&key::ERROR) && self.delay().is_none()
    }

    pub fn is_abort(&self) -> bool {
        self.request_id().is_some()
            && self
                .body
                .get(&key::ABORT)
                .and_then(RpcValue::as_bool)
                .unwrap_or(false)
    }

    // Meta accessors.

    pub fn request_id(&self) -> Option<i64> {
        self.meta.get(tag::REQUEST_ID).and_then(RpcValue::as_int)
    }

    pub fn set_request_id(&mut self, rid: i64) {
        self.meta.insert(tag::REQUEST_ID, rid);
    }

    /// Replace the request id with a fresh one and return it.
    pub fn new_request_id(&mut self) -> i64 {
        let rid = next_request_id();
        self.set_request_id(rid);
        rid
    }

    pub fn path(&self) -> &str {
        self.meta
            .get(tag::PATH)
            .and_then(RpcValue::as_str)
            .unwrap_or("")
    }

    pub fn set_path(&mut self, path: Option<&str>) {
        match path {
            Some(p) if !p.is_empty() => self.meta.insert(tag::PATH, p),
            _ => {
                self.meta.remove(tag::PATH);
            }
        }
    }

    pub fn method(&self) -> Option<&str> {
        self.meta.get(tag::METHOD).and_then(RpcValue::as_str)
    }

    pub fn set_method(&mut self, method: Option<&str>) {
        match method {
            Some(m) => self.meta.insert(tag::METHOD, m),
            None => {
                self.meta.remove(tag::METHOD);
            }
        }
    }

    /// Signal name of a signal message.
    pub fn signal_name(&self) -> Option<&str> {
        self.method()
    }

    /// Method the signal is associated with, `get` when unspecified.
    pub fn source(&self) -> &str {
        self.meta
            .get(tag::SOURCE)
            .and_then(RpcValue::as_str)
            .unwrap_or("get")
    }

    pub fn set_source(&mut self, source: Option<&str>) {
        match source {
            Some(s) => self.meta.insert(tag::SOURCE, s),
            None => {
                self.meta.remove(tag::SOURCE);
            }
        }
    }

    pub fn caller_ids(&self) -> Vec<i64> {
        self.meta
            .get(tag::CALLER_IDS)
            .map(|v| match v.value() {
                Value::List(items) => items.iter().filter_map(RpcValue::as_int).collect(),
                Value::Int(v) => vec![*v],
                Value::UInt(v) => vec![*v as i64],
                _ => Vec::new(),
            })
            .unwrap_or_default()
    }

    pub fn set_caller_ids(&mut self, ids: Vec<i64>) {
        if ids.is_empty() {
            self.meta.remove(tag::CALLER_IDS);
        } else {
            self.meta.insert(
                tag::CALLER_IDS,
                Value::List(ids.into_iter().map(RpcValue::from).collect()),
            );
        }
    }

    /// Push a caller id on top of the stack.
    pub fn push_caller_id(&mut self, id: i64) {
        let mut ids = self.caller_ids();
        ids.push(id);
        self.set_caller_ids(ids);
    }

    /// Pop the topmost caller id.
    pub fn pop_caller_id(&mut self) -> Option<i64> {
        let mut ids = self.caller_ids();
        let id = ids.pop();
        self.set_caller_ids(ids);
        id
    }

    /// Access level, read from the integer form with the string form as
    /// fallback.
    pub fn access(&self) -> Option<RpcAccess> {
        self.meta
            .get(tag::ACCESS_LEVEL)
            .and_then(RpcAccess::from_value)
            .or_else(|| self.meta.get(tag::ACCESS).and_then(RpcAccess::from_value))
    }

    pub fn set_access(&mut self, access: Option<RpcAccess>) {
        match access {
            Some(a) => {
                self.meta.insert(tag::ACCESS_LEVEL, a.as_i64());
                self.meta.insert(tag::ACCESS, a.as_str());
            }
            None => {
                self.meta.remove(tag::ACCESS_LEVEL);
                self.meta.remove(tag::ACCESS);
            }
        }
    }

    pub fn user_id(&self) -> Option<&str> {
        self.meta.get(tag::USER_ID).and_then(RpcValue::as_str)
    }

    pub fn set_user_id(&mut self, user_id: Option<&str>) {
        match user_id {
            Some(u) => self.meta.insert(tag::USER_ID, u),
            None => {
                self.meta.remove(tag::USER_ID);
            }
        }
    }

    // Body accessors.

    pub fn param(&self) -> Option<&RpcValue> {
        self.body.get(&key::PARAM)
    }

    pub fn set_param(&mut self, param: Option<RpcValue>) {
        match param {
            Some(p) => {
                self.body.insert(key::PARAM, p);
            }
            None => {
                self.body.remove(&key::PARAM);
            }
        }
    }

    pub fn result(&self) -> Option<&RpcValue> {
        self.body.get(&key::RESULT)
    }

    pub fn set_result(&mut self, result: RpcValue) {
        self.body.remove(&key::ERROR);
        self.body.insert(key::RESULT, result);
    }

    pub fn error(&self) -> Option<RpcError> {
        if !self.is_error() {
            return None;
        }
        self.body.get(&key::ERROR).map(RpcError::from_value)
    }

    pub fn set_error(&mut self, error: RpcError) {
        self.body.remove(&key::RESULT);
        self.body.insert(key::ERROR, error.to_value());
    }

    /// Progress carried by a pending response, in either wire shape.
    pub fn delay(&self) -> Option<f64> {
        if let Some(delay) = self.body.get(&key::DELAY).and_then(RpcValue::as_double) {
            return Some(delay);
        }
        self.body.get(&key::ERROR).and_then(RpcError::delay_from_value)
    }

    /// Progress response for the given request.
    pub fn delay_response(request_id: i64, caller_ids: Vec<i64>, delay: f64) -> Self {
        let mut msg = Self::blank();
        msg.set_request_id(request_id);
        msg.set_caller_ids(caller_ids);
        msg.body.insert(key::DELAY, RpcValue::from(delay));
        msg
    }

    // Conversions.

    /// View as a plain value, e.g. for codec encoding.
    pub fn to_value(&self) -> RpcValue {
        RpcValue::new(Value::IMap(self.body.clone()), Some(self.meta.clone()))
    }

    /// Interpret a decoded value as an RPC message.
    ///
    /// The value must be an IMap with a meta map; anything else is not a
    /// valid message.
    pub fn from_value(value: RpcValue) -> Option<Self> {
        let meta = value.meta().cloned()?;
        match value.into_value() {
            Value::IMap(body) => Some(Self { meta, body }),
            _ => None,
        }
    }
}

impl fmt::Display for RpcMessage {
    /// Cpon rendering, the form used in logs.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_value())
    }
}
