use std::collections::BTreeMap;

use bitflags::bitflags;
use shv_value::{RpcValue, Value};

use crate::access::RpcAccess;
use crate::error::RpcError;

bitflags! {
    /// Flags assigned to SHV RPC methods.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct DirFlags: u32 {
        const NOT_CALLABLE = 1 << 0;
        const GETTER = 1 << 1;
        const SETTER = 1 << 2;
        const LARGE_RESULT_HINT = 1 << 3;
        const NOT_IDEMPOTENT = 1 << 4;
        const USER_ID_REQUIRED = 1 << 5;
        const IS_UPDATABLE = 1 << 6;
    }
}

/// Keys of the method description IMap returned by `dir`.
mod key {
    pub const NAME: i64 = 1;
    pub const FLAGS: i64 = 2;
    pub const PARAM: i64 = 3;
    pub const RESULT: i64 = 4;
    pub const ACCESS: i64 = 5;
    pub const SIGNALS: i64 = 6;
    pub const EXTRA: i64 = 63;
}

/// Description of a single SHV RPC method.
#[derive(Clone, Debug, PartialEq)]
pub struct RpcDir {
    pub name: String,
    pub flags: DirFlags,
    /// Parameter type string; `"n"` (Null) when the method takes nothing.
    pub param: String,
    /// Result type string; `"n"` (Null) when the method returns nothing.
    pub result: String,
    /// Minimal access level needed to call the method.
    pub access: RpcAccess,
    /// Signals this method emits, mapped to the type they carry.
    pub signals: BTreeMap<String, String>,
    /// Free-form additional fields, commonly `description`.
    pub extra: BTreeMap<String, RpcValue>,
}

impl RpcDir {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            flags: DirFlags::empty(),
            param: "n".into(),
            result: "n".into(),
            access: RpcAccess::Browse,
            signals: BTreeMap::new(),
            extra: BTreeMap::new(),
        }
    }

    pub fn with_access(mut self, access: RpcAccess) -> Self {
        self.access = access;
        self
    }

    pub fn with_flags(mut self, flags: DirFlags) -> Self {
        self.flags |= flags;
        self
    }

    pub fn with_param(mut self, param: impl Into<String>) -> Self {
        self.param = param.into();
        self
    }

    pub fn with_result(mut self, result: impl Into<String>) -> Self {
        self.result = result.into();
        self
    }

    pub fn with_signal(mut self, name: impl Into<String>, value_type: impl Into<String>) -> Self {
        self.signals.insert(name.into(), value_type.into());
        self
    }

    /// Getter method description: read access, `GETTER` flag.
    pub fn getter(name: impl Into<String>, param: &str, result: &str) -> Self {
        Self::new(name)
            .with_flags(DirFlags::GETTER)
            .with_param(param)
            .with_result(result)
            .with_access(RpcAccess::Read)
    }

    /// Setter method description: write access, `SETTER` flag.
    pub fn setter(name: impl Into<String>, param: &str, result: &str) -> Self {
        Self::new(name)
            .with_flags(DirFlags::SETTER)
            .with_param(param)
            .with_result(result)
            .with_access(RpcAccess::Write)
    }

    /// The standard `dir` method.
    pub fn stddir() -> Self {
        Self::new("dir").with_param("n|b|s").with_result("[!dir]|b")
    }

    /// The standard `ls` method with its `lsmod` signal.
    pub fn stdls() -> Self {
        Self::new("ls")
            .with_param("s|n")
            .with_result("[s]|b")
            .with_signal("lsmod", "{b}")
    }

    /// The IMap wire form used as a `dir` result element.
    pub fn to_value(&self) -> RpcValue {
        self.to_value_with(true)
    }

    /// The IMap wire form, optionally leaving the free-form extra fields
    /// out (`dir` with a false/Null parameter).
    pub fn to_value_with(&self, include_extra: bool) -> RpcValue {
        let mut map = BTreeMap::new();
        map.insert(key::NAME, RpcValue::from(self.name.as_str()));
        map.insert(key::FLAGS, RpcValue::from(u64::from(self.flags.bits())));
        if self.param != "n" {
            map.insert(key::PARAM, RpcValue::from(self.param.as_str()));
        }
        if self.result != "n" {
            map.insert(key::RESULT, RpcValue::from(self.result.as_str()));
        }
        map.insert(key::ACCESS, RpcValue::from(self.access.as_i64()));
        if !self.signals.is_empty() {
            let signals: BTreeMap<String, RpcValue> = self
                .signals
                .iter()
                .map(|(name, tp)| {
                    let v = if *tp == self.result {
                        RpcValue::null()
                    } else {
                        RpcValue::from(tp.as_str())
                    };
                    (name.clone(), v)
                })
                .collect();
            map.insert(key::SIGNALS, Value::Map(signals).into());
        }
        if include_extra && !self.extra.is_empty() {
            map.insert(key::EXTRA, Value::Map(self.extra.clone()).into());
        }
        Value::IMap(map).into()
    }

    /// Decode the IMap wire form.
    pub fn from_value(value: &RpcValue) -> Result<Self, RpcError> {
        let map = value
            .as_imap()
            .ok_or_else(|| RpcError::invalid_param("expected IMap"))?;
        let name = map
            .get(&key::NAME)
            .and_then(RpcValue::as_str)
            .ok_or_else(|| RpcError::invalid_param("missing method name"))?
            .to_string();
        let flags = map
            .get(&key::FLAGS)
            .and_then(RpcValue::as_uint)
            .map(|v| DirFlags::from_bits_truncate(v as u32))
            .unwrap_or_default();
        let param = map
            .get(&key::PARAM)
            .and_then(RpcValue::as_str)
            .unwrap_or("n")
            .to_string();
        let result = map
            .get(&key::RESULT)
            .and_then(RpcValue::as_str)
            .unwrap_or("n")
            .to_string();
        let access = map
            .get(&key::ACCESS)
            .and_then(RpcAccess::from_value)
            .unwrap_or(RpcAccess::Browse);
        let signals = map
            .get(&key::SIGNALS)
            .and_then(RpcValue::as_map)
            .map(|m| {
                m.iter()
                    .map(|(name, tp)| {
                        let tp = tp.as_str().unwrap_or(&result).to_string();
                        (name.clone(), tp)
                    })
                    .collect()
            })
            .unwrap_or_default();
        let extra = map
            .get(&key::EXTRA)
            .and_then(RpcValue::as_map)
            .cloned()
            .unwrap_or_default();
        Ok(Self {
            name,
            flags,
            param,
            result,
            access,
            signals,
            extra,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_round_trip() {
        let dir = RpcDir::getter("temperature", "n", "d")
            .with_signal("chng", "d")
            .with_flags(DirFlags::USER_ID_REQUIRED);
        let back = RpcDir::from_value(&dir.to_value()).unwrap();
        assert_eq!(back, dir);
    }

    #[test]
    fn null_types_are_omitted() {
        let dir = RpcDir::new("ping");
        let value = dir.to_value();
        let map = value.as_imap().unwrap();
        assert!(!map.contains_key(&key::PARAM));
        assert!(!map.contains_key(&key::RESULT));
        assert_eq!(RpcDir::from_value(&value).unwrap(), dir);
    }

    #[test]
    fn signal_type_same_as_result_encodes_null() {
        let dir = RpcDir::getter("get", "n", "d").with_signal("chng", "d");
        let value = dir.to_value();
        let map = value.as_imap().unwrap();
        let signals = map.get(&key::SIGNALS).unwrap().as_map().unwrap();
        assert!(signals.get("chng").unwrap().is_null());
        // Decoding restores the result type for the signal.
        assert_eq!(RpcDir::from_value(&value).unwrap().signals["chng"], "d");
    }

    #[test]
    fn standard_methods() {
        assert_eq!(RpcDir::stddir().name, "dir");
        assert_eq!(RpcDir::stdls().name, "ls");
        assert_eq!(RpcDir::stdls().signals["lsmod"], "{b}");
    }
}
