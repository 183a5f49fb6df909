use std::collections::BTreeMap;
use std::fmt;

use shv_value::{RpcValue, Value};

/// Wire-compatible SHV RPC error codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RpcErrorCode {
    NoError,
    InvalidRequest,
    MethodNotFound,
    InvalidParam,
    InternalError,
    ParseError,
    MethodCallTimeout,
    MethodCallCancelled,
    MethodCallException,
    Unknown,
    LoginRequired,
    UserIdRequired,
    NotImplemented,
    TryAgainLater,
    RequestInvalid,
    /// Application defined codes, `32` and above.
    UserCode(i64),
}

impl RpcErrorCode {
    pub fn as_i64(self) -> i64 {
        match self {
            RpcErrorCode::NoError => 0,
            RpcErrorCode::InvalidRequest => 1,
            RpcErrorCode::MethodNotFound => 2,
            RpcErrorCode::InvalidParam => 3,
            RpcErrorCode::InternalError => 4,
            RpcErrorCode::ParseError => 5,
            RpcErrorCode::MethodCallTimeout => 6,
            RpcErrorCode::MethodCallCancelled => 7,
            RpcErrorCode::MethodCallException => 8,
            RpcErrorCode::Unknown => 9,
            RpcErrorCode::LoginRequired => 10,
            RpcErrorCode::UserIdRequired => 11,
            RpcErrorCode::NotImplemented => 12,
            RpcErrorCode::TryAgainLater => 13,
            RpcErrorCode::RequestInvalid => 14,
            RpcErrorCode::UserCode(v) => v,
        }
    }

    pub fn from_i64(v: i64) -> Self {
        match v {
            0 => RpcErrorCode::NoError,
            1 => RpcErrorCode::InvalidRequest,
            2 => RpcErrorCode::MethodNotFound,
            3 => RpcErrorCode::InvalidParam,
            4 => RpcErrorCode::InternalError,
            5 => RpcErrorCode::ParseError,
            6 => RpcErrorCode::MethodCallTimeout,
            7 => RpcErrorCode::MethodCallCancelled,
            8 => RpcErrorCode::MethodCallException,
            10 => RpcErrorCode::LoginRequired,
            11 => RpcErrorCode::UserIdRequired,
            12 => RpcErrorCode::NotImplemented,
            13 => RpcErrorCode::TryAgainLater,
            14 => RpcErrorCode::RequestInvalid,
            v if v >= 32 => RpcErrorCode::UserCode(v),
            _ => RpcErrorCode::Unknown,
        }
    }

    fn name(self) -> &'static str {
        match self {
            RpcErrorCode::NoError => "NoError",
            RpcErrorCode::InvalidRequest => "InvalidRequest",
            RpcErrorCode::MethodNotFound => "MethodNotFound",
            RpcErrorCode::InvalidParam => "InvalidParam",
            RpcErrorCode::InternalError => "InternalError",
            RpcErrorCode::ParseError => "ParseError",
            RpcErrorCode::MethodCallTimeout => "MethodCallTimeout",
            RpcErrorCode::MethodCallCancelled => "MethodCallCancelled",
            RpcErrorCode::MethodCallException => "MethodCallException",
            RpcErrorCode::Unknown => "Unknown",
            RpcErrorCode::LoginRequired => "LoginRequired",
            RpcErrorCode::UserIdRequired => "UserIdRequired",
            RpcErrorCode::NotImplemented => "NotImplemented",
            RpcErrorCode::TryAgainLater => "TryAgainLater",
            RpcErrorCode::RequestInvalid => "RequestInvalid",
            RpcErrorCode::UserCode(_) => "UserCode",
        }
    }
}

/// An SHV RPC error as carried in response messages.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RpcError {
    pub code: RpcErrorCode,
    pub message: String,
}

/// Keys of the error IMap inside a response body.
mod key {
    pub const CODE: i64 = 1;
    pub const MESSAGE: i64 = 2;
    /// Legacy progress shape: a `RequestInvalid` error carrying the delay.
    pub const DELAY: i64 = 3;
}

impl RpcError {
    pub fn new(code: RpcErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn method_not_found(message: impl Into<String>) -> Self {
        Self::new(RpcErrorCode::MethodNotFound, message)
    }

    pub fn invalid_param(message: impl Into<String>) -> Self {
        Self::new(RpcErrorCode::InvalidParam, message)
    }

    pub fn method_call_exception(message: impl Into<String>) -> Self {
        Self::new(RpcErrorCode::MethodCallException, message)
    }

    pub fn login_required(message: impl Into<String>) -> Self {
        Self::new(RpcErrorCode::LoginRequired, message)
    }

    pub fn user_id_required(message: impl Into<String>) -> Self {
        Self::new(RpcErrorCode::UserIdRequired, message)
    }

    /// The wire form: `i{1:code, 2:message}`.
    pub fn to_value(&self) -> RpcValue {
        let mut map = BTreeMap::new();
        map.insert(key::CODE, RpcValue::from(self.code.as_i64()));
        if !self.message.is_empty() {
            map.insert(key::MESSAGE, RpcValue::from(self.message.as_str()));
        }
        Value::IMap(map).into()
    }

    /// Decode from the wire form. Anything that is not an error IMap decodes
    /// as `Unknown` with the Cpon rendering as the message.
    pub fn from_value(value: &RpcValue) -> Self {
        if let Some(map) = value.as_imap() {
            let code = map
                .get(&key::CODE)
                .and_then(RpcValue::as_int)
                .map_or(RpcErrorCode::Unknown, RpcErrorCode::from_i64);
            let message = map
                .get(&key::MESSAGE)
                .and_then(RpcValue::as_str)
                .unwrap_or_default()
                .to_string();
            Self { code, message }
        } else {
            Self::new(RpcErrorCode::Unknown, value.to_string())
        }
    }

    /// Build the legacy progress-response error shape.
    pub fn delay_error(delay: f64) -> RpcValue {
        let mut map = BTreeMap::new();
        map.insert(
            key::CODE,
            RpcValue::from(RpcErrorCode::RequestInvalid.as_i64()),
        );
        map.insert(key::DELAY, RpcValue::from(delay));
        Value::IMap(map).into()
    }

    /// Extract a delay from the legacy progress-response error shape.
    pub fn delay_from_value(value: &RpcValue) -> Option<f64> {
        let map = value.as_imap()?;
        let code = map.get(&key::CODE).and_then(RpcValue::as_int)?;
        if RpcErrorCode::from_i64(code) != RpcErrorCode::RequestInvalid {
            return None;
        }
        map.get(&key::DELAY).and_then(RpcValue::as_double)
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{} ({})", self.code.name(), self.code.as_i64())
        } else {
            write!(
                f,
                "{} ({}): {}",
                self.code.name(),
                self.code.as_i64(),
                self.message
            )
        }
    }
}

impl std::error::Error for RpcError {}
