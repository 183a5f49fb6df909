use std::collections::BTreeMap;
use std::fmt;

use crate::datetime::DateTime;
use crate::decimal::Decimal;

/// Key of a [`MetaMap`] entry. Meta maps mix integer and string keys.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MetaKey {
    Int(i64),
    Str(String),
}

impl From<i64> for MetaKey {
    fn from(v: i64) -> Self {
        MetaKey::Int(v)
    }
}

impl From<i32> for MetaKey {
    fn from(v: i32) -> Self {
        MetaKey::Int(v.into())
    }
}

impl From<&str> for MetaKey {
    fn from(v: &str) -> Self {
        MetaKey::Str(v.into())
    }
}

impl From<String> for MetaKey {
    fn from(v: String) -> Self {
        MetaKey::Str(v)
    }
}

/// Meta attributes attached to a value.
///
/// Integer keys sort before string keys which is also the order both codecs
/// write them in.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MetaMap {
    ints: BTreeMap<i64, RpcValue>,
    strs: BTreeMap<String, RpcValue>,
}

impl MetaMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.ints.is_empty() && self.strs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ints.len() + self.strs.len()
    }

    pub fn insert(&mut self, key: impl Into<MetaKey>, value: impl Into<RpcValue>) {
        match key.into() {
            MetaKey::Int(k) => {
                self.ints.insert(k, value.into());
            }
            MetaKey::Str(k) => {
                self.strs.insert(k, value.into());
            }
        }
    }

    pub fn remove(&mut self, key: impl Into<MetaKey>) -> Option<RpcValue> {
        match key.into() {
            MetaKey::Int(k) => self.ints.remove(&k),
            MetaKey::Str(k) => self.strs.remove(&k),
        }
    }

    pub fn get(&self, key: impl Into<MetaKey>) -> Option<&RpcValue> {
        match key.into() {
            MetaKey::Int(k) => self.ints.get(&k),
            MetaKey::Str(k) => self.strs.get(&k),
        }
    }

    /// Iterate entries, integer keys first.
    pub fn iter(&self) -> impl Iterator<Item = (MetaKey, &RpcValue)> {
        self.ints
            .iter()
            .map(|(k, v)| (MetaKey::Int(*k), v))
            .chain(self.strs.iter().map(|(k, v)| (MetaKey::Str(k.clone()), v)))
    }
}

impl<K: Into<MetaKey>, V: Into<RpcValue>> FromIterator<(K, V)> for MetaMap {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut map = MetaMap::new();
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}

/// The SHV data model.
///
/// `Int` and `UInt` are distinct variants even for numerically equal values;
/// they encode differently and never compare equal.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Double(f64),
    Decimal(Decimal),
    DateTime(DateTime),
    Blob(Vec<u8>),
    String(String),
    List(Vec<RpcValue>),
    Map(BTreeMap<String, RpcValue>),
    IMap(BTreeMap<i64, RpcValue>),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "Null",
            Value::Bool(_) => "Bool",
            Value::Int(_) => "Int",
            Value::UInt(_) => "UInt",
            Value::Double(_) => "Double",
            Value::Decimal(_) => "Decimal",
            Value::DateTime(_) => "DateTime",
            Value::Blob(_) => "Blob",
            Value::String(_) => "String",
            Value::List(_) => "List",
            Value::Map(_) => "Map",
            Value::IMap(_) => "IMap",
        }
    }
}

/// A [`Value`] together with its optional meta attributes.
///
/// Meta participates in equality and in both codecs. Values without meta pay
/// no allocation for it.
#[derive(Clone, Debug, PartialEq)]
pub struct RpcValue {
    value: Value,
    meta: Option<Box<MetaMap>>,
}

impl RpcValue {
    pub fn new(value: Value, meta: Option<MetaMap>) -> Self {
        Self {
            value,
            meta: meta.filter(|m| !m.is_empty()).map(Box::new),
        }
    }

    pub fn null() -> Self {
        Value::Null.into()
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn into_value(self) -> Value {
        self.value
    }

    pub fn meta(&self) -> Option<&MetaMap> {
        self.meta.as_deref()
    }

    pub fn meta_mut(&mut self) -> &mut MetaMap {
        self.meta.get_or_insert_with(Default::default)
    }

    pub fn set_meta(&mut self, meta: Option<MetaMap>) {
        self.meta = meta.filter(|m| !m.is_empty()).map(Box::new);
    }

    /// Same value with the given meta attached.
    pub fn with_meta(mut self, meta: MetaMap) -> Self {
        self.set_meta(Some(meta));
        self
    }

    pub fn is_null(&self) -> bool {
        matches!(self.value, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self.value {
            Value::Bool(v) => Some(v),
            _ => None,
        }
    }

    /// Signed view of `Int` and in-range `UInt` values.
    pub fn as_int(&self) -> Option<i64> {
        match self.value {
            Value::Int(v) => Some(v),
            Value::UInt(v) => i64::try_from(v).ok(),
            _ => None,
        }
    }

    pub fn as_uint(&self) -> Option<u64> {
        match self.value {
            Value::UInt(v) => Some(v),
            Value::Int(v) => u64::try_from(v).ok(),
            _ => None,
        }
    }

    pub fn as_double(&self) -> Option<f64> {
        match self.value {
            Value::Double(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match &self.value {
            Value::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_blob(&self) -> Option<&[u8]> {
        match &self.value {
            Value::Blob(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[RpcValue]> {
        match &self.value {
            Value::List(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, RpcValue>> {
        match &self.value {
            Value::Map(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_imap(&self) -> Option<&BTreeMap<i64, RpcValue>> {
        match &self.value {
            Value::IMap(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_datetime(&self) -> Option<DateTime> {
        match self.value {
            Value::DateTime(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_decimal(&self) -> Option<Decimal> {
        match self.value {
            Value::Decimal(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for RpcValue {
    /// Single-line Cpon rendering.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut buf = Vec::new();
        let mut wr = crate::CponWriter::new(&mut buf);
        wr.write(self).map_err(|_| fmt::Error)?;
        f.write_str(&String::from_utf8_lossy(&buf))
    }
}

impl From<Value> for RpcValue {
    fn from(value: Value) -> Self {
        Self { value, meta: None }
    }
}

impl From<()> for RpcValue {
    fn from(_: ()) -> Self {
        Value::Null.into()
    }
}

impl From<bool> for RpcValue {
    fn from(v: bool) -> Self {
        Value::Bool(v).into()
    }
}

impl From<i64> for RpcValue {
    fn from(v: i64) -> Self {
        Value::Int(v).into()
    }
}

impl From<i32> for RpcValue {
    fn from(v: i32) -> Self {
        Value::Int(v.into()).into()
    }
}

impl From<u64> for RpcValue {
    fn from(v: u64) -> Self {
        Value::UInt(v).into()
    }
}

impl From<u32> for RpcValue {
    fn from(v: u32) -> Self {
        Value::UInt(v.into()).into()
    }
}

impl From<f64> for RpcValue {
    fn from(v: f64) -> Self {
        Value::Double(v).into()
    }
}

impl From<Decimal> for RpcValue {
    fn from(v: Decimal) -> Self {
        Value::Decimal(v).into()
    }
}

impl From<DateTime> for RpcValue {
    fn from(v: DateTime) -> Self {
        Value::DateTime(v).into()
    }
}

impl From<&str> for RpcValue {
    fn from(v: &str) -> Self {
        Value::String(v.into()).into()
    }
}

impl From<String> for RpcValue {
    fn from(v: String) -> Self {
        Value::String(v).into()
    }
}

impl From<&[u8]> for RpcValue {
    fn from(v: &[u8]) -> Self {
        Value::Blob(v.into()).into()
    }
}

impl From<Vec<u8>> for RpcValue {
    fn from(v: Vec<u8>) -> Self {
        Value::Blob(v).into()
    }
}

impl From<Vec<RpcValue>> for RpcValue {
    fn from(v: Vec<RpcValue>) -> Self {
        Value::List(v).into()
    }
}

impl From<BTreeMap<String, RpcValue>> for RpcValue {
    fn from(v: BTreeMap<String, RpcValue>) -> Self {
        Value::Map(v).into()
    }
}

impl From<BTreeMap<i64, RpcValue>> for RpcValue {
    fn from(v: BTreeMap<i64, RpcValue>) -> Self {
        Value::IMap(v).into()
    }
}

impl<T: Into<RpcValue>> From<Option<T>> for RpcValue {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => Value::Null.into(),
        }
    }
}

/// Build a `Map` value from string keyed pairs.
#[macro_export]
macro_rules! shv_map {
    ($($key:expr => $val:expr),* $(,)?) => {{
        let mut map = ::std::collections::BTreeMap::<String, $crate::RpcValue>::new();
        $(map.insert($key.into(), $val.into());)*
        $crate::RpcValue::from($crate::Value::Map(map))
    }};
}

/// Build an `IMap` value from integer keyed pairs.
#[macro_export]
macro_rules! shv_imap {
    ($($key:expr => $val:expr),* $(,)?) => {{
        let mut map = ::std::collections::BTreeMap::<i64, $crate::RpcValue>::new();
        $(map.insert($key, $val.into());)*
        $crate::RpcValue::from($crate::Value::IMap(map))
    }};
}

/// Build a `List` value.
#[macro_export]
macro_rules! shv_list {
    ($($val:expr),* $(,)?) => {{
        $crate::RpcValue::from($crate::Value::List(vec![$($val.into()),*]))
    }};
}
