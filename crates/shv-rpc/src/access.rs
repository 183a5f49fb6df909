use shv_value::{RpcValue, Value};

/// The nine ordered access levels.
///
/// Smaller grants less. The numeric gaps leave room for broker-local
/// intermediate levels without breaking the wire form.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RpcAccess {
    Browse,
    Read,
    Write,
    Command,
    Config,
    Service,
    SuperService,
    Devel,
    Admin,
}

impl RpcAccess {
    pub fn as_i64(self) -> i64 {
        match self {
            RpcAccess::Browse => 1,
            RpcAccess::Read => 8,
            RpcAccess::Write => 16,
            RpcAccess::Command => 24,
            RpcAccess::Config => 32,
            RpcAccess::Service => 40,
            RpcAccess::SuperService => 48,
            RpcAccess::Devel => 56,
            RpcAccess::Admin => 63,
        }
    }

    /// Closest level not above `v`, saturating at `Browse`.
    pub fn from_i64(v: i64) -> Self {
        match v {
            v if v >= 63 => RpcAccess::Admin,
            v if v >= 56 => RpcAccess::Devel,
            v if v >= 48 => RpcAccess::SuperService,
            v if v >= 40 => RpcAccess::Service,
            v if v >= 32 => RpcAccess::Config,
            v if v >= 24 => RpcAccess::Command,
            v if v >= 16 => RpcAccess::Write,
            v if v >= 8 => RpcAccess::Read,
            _ => RpcAccess::Browse,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RpcAccess::Browse => "bws",
            RpcAccess::Read => "rd",
            RpcAccess::Write => "wr",
            RpcAccess::Command => "cmd",
            RpcAccess::Config => "cfg",
            RpcAccess::Service => "srv",
            RpcAccess::SuperService => "ssrv",
            RpcAccess::Devel => "dev",
            RpcAccess::Admin => "su",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        Some(match s {
            "bws" => RpcAccess::Browse,
            "rd" => RpcAccess::Read,
            "wr" => RpcAccess::Write,
            "cmd" => RpcAccess::Command,
            "cfg" => RpcAccess::Config,
            "srv" => RpcAccess::Service,
            "ssrv" => RpcAccess::SuperService,
            "dev" => RpcAccess::Devel,
            "su" => RpcAccess::Admin,
            _ => return None,
        })
    }

    /// Accept either wire form: the integer level or the short string.
    pub fn from_value(value: &RpcValue) -> Option<Self> {
        match value.value() {
            Value::Int(v) => Some(Self::from_i64(*v)),
            Value::UInt(v) => Some(Self::from_i64(i64::try_from(*v).ok()?)),
            Value::String(s) => Self::from_str_opt(s),
            _ => None,
        }
    }
}

impl std::str::FromStr for RpcAccess {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_str_opt(s).ok_or(())
    }
}

impl std::fmt::Display for RpcAccess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
