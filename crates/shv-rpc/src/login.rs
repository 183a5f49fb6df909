use std::collections::BTreeMap;

use sha1::{Digest, Sha1};
use shv_value::{RpcValue, Value};

/// SHA-1 of `data` as a lowercase hex string.
pub fn sha1_hex(data: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(data.as_bytes());
    hex::encode(hasher.finalize())
}

/// Password format used in the login step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RpcLoginType {
    Plain,
    Sha1,
}

impl RpcLoginType {
    pub fn as_str(self) -> &'static str {
        match self {
            RpcLoginType::Plain => "PLAIN",
            RpcLoginType::Sha1 => "SHA1",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "PLAIN" => Some(RpcLoginType::Plain),
            "SHA1" => Some(RpcLoginType::Sha1),
            _ => None,
        }
    }
}

/// Login material and device options for connecting to a broker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RpcLogin {
    pub username: String,
    pub password: String,
    pub login_type: RpcLoginType,
    pub device_id: Option<String>,
    pub device_mount_point: Option<String>,
}

impl Default for RpcLogin {
    fn default() -> Self {
        Self {
            username: String::new(),
            password: String::new(),
            login_type: RpcLoginType::Plain,
            device_id: None,
            device_mount_point: None,
        }
    }
}

impl RpcLogin {
    /// The `login` request parameter.
    ///
    /// A `PLAIN` login is elevated to `SHA1` with the server provided nonce
    /// unless `force_plain` is set.
    pub fn to_param(
        &self,
        nonce: &str,
        idle_timeout: Option<i64>,
        force_plain: bool,
    ) -> RpcValue {
        let (password, login_type) = match self.login_type {
            RpcLoginType::Plain if !force_plain => (
                sha1_login_password(nonce, &sha1_hex(&self.password)),
                RpcLoginType::Sha1,
            ),
            RpcLoginType::Plain => (self.password.clone(), RpcLoginType::Plain),
            RpcLoginType::Sha1 => (
                sha1_login_password(nonce, &self.password),
                RpcLoginType::Sha1,
            ),
        };
        let mut login = BTreeMap::new();
        login.insert("user".to_string(), RpcValue::from(self.username.as_str()));
        login.insert("password".to_string(), RpcValue::from(password));
        login.insert("type".to_string(), RpcValue::from(login_type.as_str()));

        let mut options: BTreeMap<String, RpcValue> = BTreeMap::new();
        let mut device = BTreeMap::new();
        if let Some(device_id) = &self.device_id {
            device.insert("deviceId".to_string(), RpcValue::from(device_id.as_str()));
        }
        if let Some(mount_point) = &self.device_mount_point {
            device.insert(
                "mountPoint".to_string(),
                RpcValue::from(mount_point.as_str()),
            );
        }
        if !device.is_empty() {
            options.insert("device".to_string(), Value::Map(device).into());
        }
        if let Some(timeout) = idle_timeout {
            options.insert("idleWatchDogTimeOut".to_string(), RpcValue::from(timeout));
        }

        let mut param = BTreeMap::new();
        param.insert("login".to_string(), Value::Map(login).into());
        param.insert("options".to_string(), Value::Map(options).into());
        Value::Map(param).into()
    }

    /// Server-side check of a received login against this stored secret.
    ///
    /// Works for every combination of stored plain/SHA1 secret and plain/SHA1
    /// login type; `SHA1` logins must carry `sha1_hex(nonce || stored_sha1)`.
    pub fn validate_password(&self, password: &str, nonce: &str, login_type: RpcLoginType) -> bool {
        match login_type {
            RpcLoginType::Plain => match self.login_type {
                RpcLoginType::Plain => self.password == password,
                RpcLoginType::Sha1 => self.password == sha1_hex(password),
            },
            RpcLoginType::Sha1 => sha1_login_password(nonce, &self.shapass()) == password,
        }
    }

    /// The stored password in SHA-1 form.
    pub fn shapass(&self) -> String {
        match self.login_type {
            RpcLoginType::Sha1 => self.password.clone(),
            RpcLoginType::Plain => sha1_hex(&self.password),
        }
    }
}

/// The challenge response: `sha1_hex(nonce || sha1_password)`.
fn sha1_login_password(nonce: &str, sha1_password: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(nonce.as_bytes());
    hasher.update(sha1_password.as_bytes());
    hex::encode(hasher.finalize())
}

/// Pull a nested string field out of a Map-tree parameter.
pub fn param_str<'a>(param: &'a RpcValue, path: &[&str]) -> Option<&'a str> {
    let mut value = param;
    for key in path {
        value = value.as_map()?.get(*key)?;
    }
    value.as_str()
}

/// Pull a nested integer field out of a Map-tree parameter.
pub fn param_int(param: &RpcValue, path: &[&str]) -> Option<i64> {
    let mut value = param;
    for key in path {
        value = value.as_map()?.get(*key)?;
    }
    value.as_int()
}
