use std::collections::BTreeMap;
use std::fmt;

use shv_value::{RpcValue, Value};

use crate::error::RpcError;

/// Shell-style glob match for a single name.
///
/// Supports `*` (any run of characters), `?` (any single character) and
/// `[...]`/`[!...]` character classes. Matching is case sensitive.
pub fn fnmatch(name: &str, pattern: &str) -> bool {
    fn matches(name: &[char], pat: &[char]) -> bool {
        let Some(&p) = pat.first() else {
            return name.is_empty();
        };
        match p {
            '*' => {
                (0..=name.len()).any(|skip| matches(&name[skip..], &pat[1..]))
            }
            '?' => !name.is_empty() && matches(&name[1..], &pat[1..]),
            '[' => {
                let Some(&c) = name.first() else { return false };
                let (negate, mut i) = if pat.get(1) == Some(&'!') {
                    (true, 2)
                } else {
                    (false, 1)
                };
                let mut hit = false;
                let mut prev: Option<char> = None;
                while let Some(&pc) = pat.get(i) {
                    if pc == ']' && prev.is_some() {
                        return hit != negate && matches(&name[1..], &pat[i + 1..]);
                    }
                    if pc == '-'
                        && prev.is_some()
                        && pat.get(i + 1).is_some_and(|&n| n != ']')
                    {
                        let lo = prev.take().expect("range start");
                        let hi = pat[i + 1];
                        if (lo..=hi).contains(&c) {
                            hit = true;
                        }
                        i += 2;
                        continue;
                    }
                    if pc == c {
                        hit = true;
                    }
                    prev = Some(pc);
                    i += 1;
                }
                // Unterminated class matches a literal '['.
                c == '[' && matches(&name[1..], &pat[1..])
            }
            p => name.first() == Some(&p) && matches(&name[1..], &pat[1..]),
        }
    }
    let name: Vec<char> = name.chars().collect();
    let pat: Vec<char> = pattern.chars().collect();
    matches(&name, &pat)
}

/// Whether the whole `path` matches the whole `pattern`.
///
/// `*` matches exactly one segment, `**` matches zero or more whole segments
/// (so consecutive `**` collapse).
pub fn path_match(path: &str, pattern: &str) -> bool {
    fn rec(path: &[&str], pat: &[&str]) -> bool {
        match pat.split_first() {
            None => path.is_empty(),
            Some((&"**", rest)) => (0..=path.len()).any(|skip| rec(&path[skip..], rest)),
            Some((p, rest)) => path
                .split_first()
                .is_some_and(|(node, tail)| fnmatch(node, p) && rec(tail, rest)),
        }
    }
    let segs: Vec<&str> = path.split('/').collect();
    let ptn: Vec<&str> = pattern.split('/').collect();
    rec(&segs, &ptn)
}

/// Greedy walk of `path` segments against `pattern` segments used for tail
/// extraction. Returns how many pattern segments were consumed, or `None`
/// when some path segment fails to match.
fn consume_segments(path: &str, pattern: &[&str]) -> Option<usize> {
    let mut i = 0;
    for node in path.split('/') {
        if i >= pattern.len() {
            return None;
        }
        if pattern[i] == "**" {
            if pattern.len() == i + 1 {
                return Some(i + 1);
            }
            if pattern[i + 1] == "**" {
                i += 1;
            } else if fnmatch(node, pattern[i + 1]) {
                i += 2;
            }
            continue;
        }
        if !fnmatch(node, pattern[i]) {
            return None;
        }
        i += 1;
    }
    Some(i)
}

/// Remove the pattern prefix consumed by `path`.
///
/// The returned tail matches nodes below `path`; `None` means the pattern
/// cannot apply to anything under it.
pub fn tail_pattern(path: &str, pattern: &str) -> Option<String> {
    let ptn: Vec<&str> = pattern.split('/').collect();
    let mut consumed = consume_segments(path, &ptn)?;
    if consumed == ptn.len() && ptn.last() == Some(&"**") {
        consumed -= 1;
    }
    if consumed == ptn.len() {
        return None;
    }
    Some(ptn[consumed..].join("/"))
}

/// Resource identifier: a `path:method:signal` glob triple.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RpcRI {
    /// Pattern for SHV path matching.
    pub path: String,
    /// Pattern for method name matching.
    pub method: String,
    /// Pattern for signal name matching.
    pub signal: String,
}

impl Default for RpcRI {
    fn default() -> Self {
        Self {
            path: "**".into(),
            method: "*".into(),
            signal: "*".into(),
        }
    }
}

impl RpcRI {
    pub fn new(
        path: impl Into<String>,
        method: impl Into<String>,
        signal: impl Into<String>,
    ) -> Self {
        Self {
            path: path.into(),
            method: method.into(),
            signal: signal.into(),
        }
    }

    /// Parse `PATH[:METHOD[:SIGNAL]]`. `PATH::SIGNAL` defaults the method to
    /// `get`.
    pub fn parse(value: &str) -> Self {
        match value.split_once(':') {
            None => Self {
                path: value.into(),
                ..Self::default()
            },
            Some((path, rest)) => match rest.split_once(':') {
                None => Self {
                    path: path.into(),
                    method: rest.into(),
                    signal: "*".into(),
                },
                Some((method, signal)) => Self {
                    path: path.into(),
                    method: if method.is_empty() { "get" } else { method }.into(),
                    signal: if signal.is_empty() { "*" } else { signal }.into(),
                },
            },
        }
    }

    /// Whether a method call on `(path, method)` is covered. The signal
    /// field is disregarded here.
    pub fn method_match(&self, path: &str, method: &str) -> bool {
        path_match(path, &self.path) && fnmatch(method, &self.method)
    }

    /// Whether a signal `(path, source, signal)` is covered; all three
    /// fields apply.
    pub fn signal_match(&self, path: &str, source: &str, signal: &str) -> bool {
        path_match(path, &self.path)
            && fnmatch(signal, &self.signal)
            && fnmatch(source, &self.method)
    }

    /// The RI as seen from below `path`, used when a subscription is
    /// forwarded across a mount point. `None` means nothing under `path`
    /// can match this RI.
    pub fn relative_to(&self, path: &str) -> Option<Self> {
        let path = path.trim_end_matches('/');
        if path.is_empty() {
            return Some(self.clone());
        }
        tail_pattern(path, &self.path).map(|tail| Self {
            path: tail,
            method: self.method.clone(),
            signal: self.signal.clone(),
        })
    }

    /// Subscription parameter in the current wire form.
    pub fn to_subscription(&self) -> RpcValue {
        let mut map = BTreeMap::new();
        if self.path != "**" {
            map.insert("paths".to_string(), RpcValue::from(self.path.as_str()));
        }
        if self.signal != "*" {
            map.insert("signal".to_string(), RpcValue::from(self.signal.as_str()));
        }
        if self.method != "*" {
            map.insert("source".to_string(), RpcValue::from(self.method.as_str()));
        }
        Value::Map(map).into()
    }

    /// Subscription parameter in the legacy (pre-3.0) wire form.
    ///
    /// The legacy encoding splits wildcarded and literal fields and has no
    /// slot for a signal source; a non-trivial source is an error rather
    /// than something to drop silently.
    pub fn to_legacy_subscription(&self) -> Result<RpcValue, RpcError> {
        if self.method != "*" {
            return Err(RpcError::invalid_param(
                "signal source cannot be expressed in legacy subscription",
            ));
        }
        let mut map = BTreeMap::new();
        let (head, tail) = match self.path.rsplit_once('/') {
            Some((head, tail)) => (head, tail),
            None => ("", self.path.as_str()),
        };
        if head.contains('*') || tail != "**" {
            map.insert("paths".to_string(), RpcValue::from(self.path.as_str()));
        } else {
            map.insert("path".to_string(), RpcValue::from(head));
        }
        if self.signal.contains('*') && self.signal != "*" {
            map.insert("methods".to_string(), RpcValue::from(self.signal.as_str()));
        } else {
            map.insert(
                "method".to_string(),
                RpcValue::from(if self.signal == "*" { "" } else { &self.signal }),
            );
        }
        Ok(Value::Map(map).into())
    }

    /// Parse either subscription wire form. Unknown keys are ignored.
    pub fn from_subscription(value: &RpcValue) -> Result<Self, RpcError> {
        let map = value
            .as_map()
            .ok_or_else(|| RpcError::invalid_param("expected Map"))?;
        let field = |name: &str| -> Result<Option<&str>, RpcError> {
            match map.get(name) {
                None => Ok(None),
                Some(v) => v
                    .as_str()
                    .map(Some)
                    .ok_or_else(|| RpcError::invalid_param(format!("'{name}' must be String"))),
            }
        };
        let mut path = "**".to_string();
        if let Some(p) = field("path")? {
            path = if p.is_empty() {
                "**".into()
            } else {
                format!("{p}/**")
            };
        }
        if let Some(p) = field("paths")? {
            path = p.into();
        }
        let method = field("source")?.unwrap_or("*").to_string();
        // "methods"/"method" is the legacy name for the signal pattern.
        let signal = field("methods")?
            .or(field("method")?)
            .or(field("signal")?)
            .map(|s| if s.is_empty() { "*" } else { s })
            .unwrap_or("*")
            .to_string();
        Ok(Self {
            path,
            method,
            signal,
        })
    }
}

impl fmt::Display for RpcRI {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.signal == "*" {
            if self.method == "*" {
                write!(f, "{}", self.path)
            } else {
                write!(f, "{}:{}", self.path, self.method)
            }
        } else {
            let method = if self.method == "get" { "" } else { &self.method };
            write!(f, "{}:{}:{}", self.path, method, self.signal)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnmatch_basics() {
        assert!(fnmatch("chng", "*"));
        assert!(fnmatch("chng", "*chng"));
        assert!(fnmatch("fchng", "*chng"));
        assert!(!fnmatch("chngx", "*chng"));
        assert!(fnmatch("a", "?"));
        assert!(!fnmatch("ab", "?"));
        assert!(fnmatch("b", "[abc]"));
        assert!(!fnmatch("d", "[abc]"));
        assert!(fnmatch("d", "[!abc]"));
        assert!(fnmatch("5", "[0-9]"));
        assert!(!fnmatch("x", "[0-9]"));
    }

    #[test]
    fn path_match_table() {
        assert!(path_match("", "**"));
        assert!(path_match("a", "**"));
        assert!(path_match("a/b/c", "**"));
        assert!(path_match("a", "a/**"));
        assert!(path_match("a/b/c", "a/**"));
        assert!(!path_match("b", "a/**"));
        assert!(path_match("a/b", "*/b"));
        assert!(!path_match("a/b/c", "*/b"));
        assert!(path_match("a/b/c", "**/c"));
        assert!(path_match("a/b/c", "a/**/**/c"));
        assert!(!path_match("a/b", "a/b/c"));
    }

    #[test]
    fn tail_pattern_table() {
        assert_eq!(tail_pattern("a", "a/b/**"), Some("b/**".into()));
        assert_eq!(tail_pattern("a", "a/**"), Some("**".into()));
        assert_eq!(tail_pattern("a", "**"), Some("**".into()));
        assert_eq!(tail_pattern("a/b", "a/b/c"), Some("c".into()));
        assert_eq!(tail_pattern("a", "b/**"), None);
        assert_eq!(tail_pattern("a/b", "a/b"), None);
        assert_eq!(tail_pattern("test/some", "test/some/*"), Some("*".into()));
        assert_eq!(tail_pattern("test", "test/some/*"), Some("some/*".into()));
        assert_eq!(tail_pattern("tes", "test/some/*"), None);
        assert_eq!(tail_pattern("test/some/node", "test/some/*"), None);
        assert_eq!(
            tail_pattern("test/it/some", "**/some/*"),
            Some("*".into())
        );
        assert_eq!(
            tail_pattern("test/it", "**/some/*"),
            Some("**/some/*".into())
        );
    }

    #[test]
    fn parse_and_display() {
        assert_eq!(RpcRI::parse("a/b"), RpcRI::new("a/b", "*", "*"));
        assert_eq!(RpcRI::parse("a/b:get"), RpcRI::new("a/b", "get", "*"));
        assert_eq!(RpcRI::parse("a/b::chng"), RpcRI::new("a/b", "get", "chng"));
        assert_eq!(
            RpcRI::parse("a/b:set:mod"),
            RpcRI::new("a/b", "set", "mod")
        );
        assert_eq!(RpcRI::parse("a/b").to_string(), "a/b");
        assert_eq!(RpcRI::parse("a/b:get").to_string(), "a/b:get");
        assert_eq!(RpcRI::parse("a/b::chng").to_string(), "a/b::chng");
        assert_eq!(RpcRI::new("a", "set", "chng").to_string(), "a:set:chng");
    }

    #[test]
    fn method_and_signal_match() {
        let ri = RpcRI::parse("a/**:get:*chng");
        assert!(ri.method_match("a", "get"));
        assert!(ri.method_match("a/b/c", "get"));
        assert!(!ri.method_match("b", "get"));
        assert!(ri.signal_match("a/b", "get", "chng"));
        assert!(ri.signal_match("a/b", "get", "fchng"));
        assert!(!ri.signal_match("a/b", "set", "chng"));
        assert!(!ri.signal_match("b", "get", "chng"));
    }

    #[test]
    fn relative_to_mounts() {
        let ri = RpcRI::parse("a/b/**:get");
        assert_eq!(ri.relative_to("a"), Some(RpcRI::parse("b/**:get")));
        assert_eq!(ri.relative_to(""), Some(ri.clone()));
        assert_eq!(ri.relative_to("x"), None);
        let all = RpcRI::default();
        assert_eq!(all.relative_to("any/mount"), Some(RpcRI::default()));
    }

    #[test]
    fn subscription_round_trip() {
        let ri = RpcRI::parse("a/**:get:*chng");
        let back = RpcRI::from_subscription(&ri.to_subscription()).unwrap();
        assert_eq!(back, ri);
        let all = RpcRI::default();
        assert_eq!(
            RpcRI::from_subscription(&all.to_subscription()).unwrap(),
            all
        );
    }

    #[test]
    fn legacy_subscription() {
        let ri = RpcRI::new("a/b/**", "*", "chng");
        let legacy = ri.to_legacy_subscription().unwrap();
        let map = legacy.as_map().unwrap();
        assert_eq!(map.get("path").unwrap().as_str(), Some("a/b"));
        assert_eq!(map.get("method").unwrap().as_str(), Some("chng"));

        let wild = RpcRI::new("a/*/c/**", "*", "*chng*");
        let legacy = wild.to_legacy_subscription().unwrap();
        let map = legacy.as_map().unwrap();
        assert_eq!(map.get("paths").unwrap().as_str(), Some("a/*/c/**"));
        assert_eq!(map.get("methods").unwrap().as_str(), Some("*chng*"));

        let sourced = RpcRI::new("a/**", "get", "chng");
        assert!(sourced.to_legacy_subscription().is_err());
    }
}
