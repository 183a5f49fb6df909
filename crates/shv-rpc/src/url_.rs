use std::fmt;

use url::Url;

use crate::login::{RpcLogin, RpcLoginType};

/// Transport protocols an RPC URL can select.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RpcProtocol {
    /// TCP/IP with Stream framing.
    Tcp,
    /// TCP/IP with Serial framing.
    TcpS,
    /// TLS TCP/IP with Stream framing.
    Ssl,
    /// TLS TCP/IP with Serial framing.
    SslS,
    /// Unix domain socket with Stream framing.
    Unix,
    /// Unix domain socket with Serial framing.
    UnixS,
    /// Serial port.
    Tty,
    /// WebSocket.
    Ws,
    /// WebSocket over TLS.
    Wss,
}

impl RpcProtocol {
    fn scheme(self) -> &'static str {
        match self {
            RpcProtocol::Tcp => "tcp",
            RpcProtocol::TcpS => "tcps",
            RpcProtocol::Ssl => "ssl",
            RpcProtocol::SslS => "ssls",
            RpcProtocol::Unix => "unix",
            RpcProtocol::UnixS => "unixs",
            RpcProtocol::Tty => "serial",
            RpcProtocol::Ws => "ws",
            RpcProtocol::Wss => "wss",
        }
    }

    fn from_scheme(scheme: &str) -> Option<Self> {
        Some(match scheme {
            "tcp" => RpcProtocol::Tcp,
            "tcps" => RpcProtocol::TcpS,
            "ssl" => RpcProtocol::Ssl,
            "ssls" => RpcProtocol::SslS,
            "unix" => RpcProtocol::Unix,
            "unixs" => RpcProtocol::UnixS,
            "serial" | "tty" => RpcProtocol::Tty,
            "ws" => RpcProtocol::Ws,
            "wss" => RpcProtocol::Wss,
            _ => return None,
        })
    }

    /// Default port, or `None` for path-addressed protocols.
    fn default_port(self) -> Option<u16> {
        match self {
            RpcProtocol::Tcp => Some(3755),
            RpcProtocol::TcpS => Some(3765),
            RpcProtocol::Ssl => Some(3756),
            RpcProtocol::SslS => Some(3766),
            RpcProtocol::Ws => Some(80),
            RpcProtocol::Wss => Some(443),
            _ => None,
        }
    }

    fn is_path_based(self) -> bool {
        matches!(
            self,
            RpcProtocol::Unix | RpcProtocol::UnixS | RpcProtocol::Tty
        )
    }
}

/// Invalid RPC URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlError(pub String);

impl fmt::Display for UrlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid RPC URL: {}", self.0)
    }
}

impl std::error::Error for UrlError {}

/// Locator of an SHV RPC endpoint, including login material.
///
/// `<scheme>://[user@]host[:port][?query]` for socket protocols and
/// `<scheme>:<path>[?query]` for path-addressed ones. Query keys: `user`,
/// `password`, `shapass`, `devid`, `devmount`, `baudrate`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RpcUrl {
    /// Hostname, or filesystem path for path-addressed protocols.
    pub location: String,
    pub port: u16,
    pub protocol: RpcProtocol,
    pub login: RpcLogin,
    /// Line speed for serial ports.
    pub baudrate: u32,
}

impl RpcUrl {
    pub fn new(protocol: RpcProtocol, location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            port: protocol.default_port().unwrap_or(0),
            protocol,
            login: RpcLogin::default(),
            baudrate: 115200,
        }
    }

    pub fn parse(text: &str) -> Result<Self, UrlError> {
        let url = Url::parse(text).map_err(|e| UrlError(format!("{text}: {e}")))?;
        let protocol = RpcProtocol::from_scheme(url.scheme())
            .ok_or_else(|| UrlError(format!("unknown scheme: {}", url.scheme())))?;

        let mut res = Self::new(protocol, "");
        if protocol.is_path_based() {
            // `unix:///tmp/x` and `unix:/tmp/x` both address the same path.
            res.location = url.path().to_string();
            if let Some(host) = url.host_str() {
                res.location = format!("/{host}{}", url.path());
            }
        } else {
            res.location = url.host_str().unwrap_or("").to_string();
            if let Some(port) = url.port() {
                res.port = port;
            }
            if !url.path().is_empty() && url.path() != "/" {
                if matches!(protocol, RpcProtocol::Ws | RpcProtocol::Wss) {
                    res.location.push_str(url.path());
                } else {
                    return Err(UrlError(format!(
                        "path not supported for {}: {}",
                        protocol.scheme(),
                        url.path()
                    )));
                }
            }
        }
        if !url.username().is_empty() {
            res.login.username = url.username().to_string();
        }

        let mut password: Option<(String, RpcLoginType)> = None;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "user" => res.login.username = value.into_owned(),
                "password" => {
                    if password.is_none() {
                        password = Some((value.into_owned(), RpcLoginType::Plain));
                    }
                }
                "shapass" => {
                    if value.len() != 40 {
                        return Err(UrlError("SHA1 password must have 40 characters".into()));
                    }
                    password = Some((value.into_owned(), RpcLoginType::Sha1));
                }
                "devid" => res.login.device_id = Some(value.into_owned()),
                "devmount" => res.login.device_mount_point = Some(value.into_owned()),
                "baudrate" if protocol == RpcProtocol::Tty => {
                    res.baudrate = value
                        .parse()
                        .map_err(|_| UrlError(format!("invalid baudrate: {value}")))?;
                }
                other => return Err(UrlError(format!("unsupported URL query: {other}"))),
            }
        }
        if let Some((password, login_type)) = password {
            res.login.password = password;
            res.login.login_type = login_type;
        }
        Ok(res)
    }

    /// String form. With `public` set the login credentials are left out.
    pub fn to_url(&self, public: bool) -> String {
        let mut res = format!("{}:", self.protocol.scheme());
        if self.protocol.is_path_based() {
            res.push_str(&self.location);
        } else {
            res.push_str("//");
            if !self.login.username.is_empty() {
                res.push_str(&self.login.username);
                res.push('@');
            }
            if self.location.contains(':') {
                res.push_str(&format!("[{}]", self.location));
            } else {
                res.push_str(&self.location);
            }
            res.push_str(&format!(":{}", self.port));
        }
        let mut opts = Vec::new();
        if let Some(device_id) = &self.login.device_id {
            opts.push(format!("devid={device_id}"));
        }
        if let Some(mount_point) = &self.login.device_mount_point {
            opts.push(format!("devmount={mount_point}"));
        }
        if !self.login.password.is_empty() && !public {
            match self.login.login_type {
                RpcLoginType::Sha1 => opts.push(format!("shapass={}", self.login.password)),
                RpcLoginType::Plain => opts.push(format!("password={}", self.login.password)),
            }
        }
        if self.protocol == RpcProtocol::Tty && self.baudrate != 115200 {
            opts.push(format!("baudrate={}", self.baudrate));
        }
        if !opts.is_empty() {
            res.push('?');
            res.push_str(&opts.join("&"));
        }
        res
    }
}

impl fmt::Display for RpcUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_url(true))
    }
}

impl std::str::FromStr for RpcUrl {
    type Err = UrlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
