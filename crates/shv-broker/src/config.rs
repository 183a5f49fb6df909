use std::collections::HashMap;

use shv_rpc::{RpcAccess, RpcLogin, RpcLoginType, RpcRI, RpcUrl, fnmatch};

/// A named grant: the access level applied to every resource the role's
/// identifiers match.
#[derive(Clone, Debug)]
pub struct BrokerRole {
    pub name: String,
    pub access: RpcAccess,
    /// Resource identifiers this role applies to, checked in order.
    pub r#match: Vec<RpcRI>,
}

impl BrokerRole {
    pub fn new(name: impl Into<String>, access: RpcAccess, r#match: Vec<RpcRI>) -> Self {
        Self {
            name: name.into(),
            access,
            r#match,
        }
    }

    fn method_applies(&self, path: &str, method: &str) -> bool {
        self.r#match.iter().any(|ri| ri.method_match(path, method))
    }

    fn signal_applies(&self, path: &str, source: &str, signal: &str) -> bool {
        self.r#match
            .iter()
            .any(|ri| ri.signal_match(path, source, signal))
    }
}

/// A user the broker lets in, with the secret and the ordered role list.
#[derive(Clone, Debug)]
pub struct BrokerUser {
    pub name: String,
    pub login: RpcLogin,
    pub roles: Vec<String>,
}

impl BrokerUser {
    pub fn new(name: impl Into<String>, password: &str, roles: Vec<String>) -> Self {
        let name = name.into();
        Self {
            login: RpcLogin {
                username: name.clone(),
                password: password.into(),
                login_type: RpcLoginType::Plain,
                ..Default::default()
            },
            name,
            roles,
        }
    }

    pub fn new_sha1(name: impl Into<String>, sha1_password: &str, roles: Vec<String>) -> Self {
        let name = name.into();
        Self {
            login: RpcLogin {
                username: name.clone(),
                password: sha1_password.into(),
                login_type: RpcLoginType::Sha1,
                ..Default::default()
            },
            name,
            roles,
        }
    }
}

/// Mount point generation rule applied when a device logs in without an
/// explicit mount point.
///
/// Format tokens: `%%` a literal percent, `%d` the device id, `%u` the user
/// name, `%r` the user's roles joined by `-`, `%i` an index suffix that
/// starts empty and counts up until the mount is free, `%I` the same but
/// starting at `1`.
#[derive(Clone, Debug)]
pub struct AutosetupRule {
    /// Glob matched against the device id.
    pub device_id: String,
    /// Roles at least one of which the user must have; empty matches all.
    pub roles: Vec<String>,
    pub mount_point: String,
    /// Subscriptions installed for the peer right after login.
    pub subscriptions: Vec<RpcRI>,
}

impl AutosetupRule {
    pub fn new(device_id: impl Into<String>, mount_point: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            roles: Vec::new(),
            mount_point: mount_point.into(),
            subscriptions: Vec::new(),
        }
    }

    fn applies(&self, device_id: &str, user: &BrokerUser) -> bool {
        fnmatch(device_id, &self.device_id)
            && (self.roles.is_empty() || self.roles.iter().any(|r| user.roles.contains(r)))
    }

    /// Expand the format for one index value.
    fn expand(&self, index: u32, device_id: &str, user: &BrokerUser) -> String {
        let suffix = |start_at_one: bool| -> String {
            match (index, start_at_one) {
                (0, false) => String::new(),
                (i, false) => i.to_string(),
                (i, true) => (i + 1).to_string(),
            }
        };
        let mut res = String::new();
        let mut chars = self.mount_point.chars();
        while let Some(c) = chars.next() {
            if c != '%' {
                res.push(c);
                continue;
            }
            match chars.next() {
                Some('%') => res.push('%'),
                Some('i') => res.push_str(&suffix(false)),
                Some('I') => res.push_str(&suffix(true)),
                Some('d') => res.push_str(device_id),
                Some('r') => res.push_str(&user.roles.join("-")),
                Some('u') => res.push_str(&user.name),
                Some(other) => {
                    res.push('%');
                    res.push(other);
                }
                None => res.push('%'),
            }
        }
        res
    }
}

/// An outgoing connection the broker keeps to another broker or device.
#[derive(Clone, Debug)]
pub struct ConnectConfig {
    pub url: RpcUrl,
    /// Local user whose roles govern what the remote side may do here.
    pub user: String,
    /// Where the remote tree mounts locally.
    pub mount_point: Option<String>,
}

/// The broker setup: identity, credentials, grants and endpoints.
#[derive(Clone, Debug, Default)]
pub struct BrokerConfig {
    /// Broker name, recorded in forwarded user ids.
    pub name: String,
    pub listen: Vec<RpcUrl>,
    pub connect: Vec<ConnectConfig>,
    pub autosetup: Vec<AutosetupRule>,
    users: HashMap<String, BrokerUser>,
    roles: Vec<BrokerRole>,
}

impl BrokerConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn add_role(&mut self, role: BrokerRole) {
        if let Some(existing) = self.roles.iter_mut().find(|r| r.name == role.name) {
            *existing = role;
        } else {
            self.roles.push(role);
        }
    }

    pub fn add_user(&mut self, user: BrokerUser) {
        self.users.insert(user.name.clone(), user);
    }

    pub fn user(&self, name: &str) -> Option<&BrokerUser> {
        self.users.get(name)
    }

    fn role(&self, name: &str) -> Option<&BrokerRole> {
        self.roles.iter().find(|r| r.name == name)
    }

    /// Validate a login attempt; the matching user on success.
    pub fn login(
        &self,
        username: &str,
        password: &str,
        nonce: &str,
        login_type: RpcLoginType,
    ) -> Option<&BrokerUser> {
        let user = self.users.get(username)?;
        user.login
            .validate_password(password, nonce, login_type)
            .then_some(user)
    }

    /// Effective access level of `user` for a method call.
    ///
    /// The first matching role rule in declaration order decides; a few
    /// standard paths keep a minimal floor so that discovery always works.
    pub fn access_level(&self, user: &BrokerUser, path: &str, method: &str) -> Option<RpcAccess> {
        for role_name in &user.roles {
            if let Some(role) = self.role(role_name) {
                if role.method_applies(path, method) {
                    return Some(role.access);
                }
            }
        }
        if path == ".broker/currentClient" {
            return Some(RpcAccess::Read);
        }
        if matches!(path, "" | ".app" | ".broker") {
            return Some(RpcAccess::Browse);
        }
        None
    }

    /// Effective access level of `user` for a delivered signal.
    pub fn access_level_signal(
        &self,
        user: &BrokerUser,
        path: &str,
        source: &str,
        signal: &str,
    ) -> Option<RpcAccess> {
        for role_name in &user.roles {
            if let Some(role) = self.role(role_name) {
                if role.signal_applies(path, source, signal) {
                    return Some(role.access);
                }
            }
        }
        None
    }

    /// Generate a mount point for a device without an explicit one.
    ///
    /// `conflicts` reports whether a candidate collides with the current
    /// mount table; index values are tried until a free one comes up.
    pub fn autosetup_mount(
        &self,
        device_id: &str,
        user: &BrokerUser,
        mut conflicts: impl FnMut(&str) -> bool,
    ) -> Option<String> {
        let rule = self
            .autosetup
            .iter()
            .find(|rule| rule.applies(device_id, user))?;
        let indexed = rule.mount_point.contains("%i") || rule.mount_point.contains("%I");
        for index in 0..10_000 {
            let candidate = rule.expand(index, device_id, user);
            if !conflicts(&candidate) {
                return Some(candidate);
            }
            if !indexed {
                break;
            }
        }
        None
    }

    /// The autosetup rule applying to this device, for its subscription
    /// list.
    pub fn autosetup_rule(&self, device_id: &str, user: &BrokerUser) -> Option<&AutosetupRule> {
        self.autosetup
            .iter()
            .find(|rule| rule.applies(device_id, user))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> BrokerConfig {
        let mut config = BrokerConfig::new("testbroker");
        config.add_role(BrokerRole::new(
            "admin",
            RpcAccess::Admin,
            vec![RpcRI::parse("**:*")],
        ));
        config.add_role(BrokerRole::new(
            "tester",
            RpcAccess::Write,
            vec![RpcRI::parse("test/**:*")],
        ));
        config.add_role(BrokerRole::new(
            "browse",
            RpcAccess::Browse,
            vec![RpcRI::parse("**:ls"), RpcRI::parse("**:dir")],
        ));
        config.add_user(BrokerUser::new("admin", "admin!123", vec!["admin".into()]));
        config.add_user(BrokerUser::new(
            "test",
            "test",
            vec!["tester".into(), "browse".into()],
        ));
        config
    }

    #[test]
    fn login_validation() {
        let config = test_config();
        assert!(
            config
                .login("admin", "admin!123", "x", RpcLoginType::Plain)
                .is_some()
        );
        assert!(
            config
                .login("admin", "wrong", "x", RpcLoginType::Plain)
                .is_none()
        );
        assert!(
            config
                .login("ghost", "admin!123", "x", RpcLoginType::Plain)
                .is_none()
        );
    }

    #[test]
    fn first_matching_role_wins() {
        let config = test_config();
        let user = config.user("test").unwrap();
        assert_eq!(
            config.access_level(user, "test/device", "get"),
            Some(RpcAccess::Write)
        );
        // The later browse role covers ls everywhere but tester matched
        // first on the test subtree.
        assert_eq!(
            config.access_level(user, "test/device", "ls"),
            Some(RpcAccess::Write)
        );
        assert_eq!(
            config.access_level(user, "other", "ls"),
            Some(RpcAccess::Browse)
        );
        assert_eq!(config.access_level(user, "other", "get"), None);
    }

    #[test]
    fn standard_path_floors() {
        let config = test_config();
        let user = config.user("test").unwrap();
        assert_eq!(config.access_level(user, "", "ls"), Some(RpcAccess::Browse));
        assert_eq!(
            config.access_level(user, ".app", "ping"),
            Some(RpcAccess::Browse)
        );
        assert_eq!(
            config.access_level(user, ".broker/currentClient", "subscribe"),
            Some(RpcAccess::Read)
        );
        assert_eq!(config.access_level(user, ".broker/client/1", "get"), None);
    }

    #[test]
    fn signal_access() {
        let config = test_config();
        let user = config.user("test").unwrap();
        assert_eq!(
            config.access_level_signal(user, "test/device", "get", "chng"),
            Some(RpcAccess::Write)
        );
        assert_eq!(
            config.access_level_signal(user, "other", "get", "chng"),
            None
        );
    }

    #[test]
    fn autosetup_expansion() {
        let mut config = test_config();
        config.autosetup.push(AutosetupRule::new("example*", "test/%d%i"));
        let user = config.user("test").unwrap().clone();

        let mount = config
            .autosetup_mount("example", &user, |_| false)
            .unwrap();
        assert_eq!(mount, "test/example");

        // First candidate taken, index counts up past conflicts.
        let taken = ["test/example", "test/example1"];
        let mount = config
            .autosetup_mount("example", &user, |m| taken.contains(&m))
            .unwrap();
        assert_eq!(mount, "test/example2");

        assert!(config.autosetup_mount("other", &user, |_| false).is_none());
    }

    #[test]
    fn autosetup_tokens() {
        let user = BrokerUser::new("joe", "x", vec!["a".into(), "b".into()]);
        let rule = AutosetupRule::new("*", "%u/%r/%d%%x%I");
        assert_eq!(rule.expand(0, "dev", &user), "joe/a-b/dev%x1");
        assert_eq!(rule.expand(1, "dev", &user), "joe/a-b/dev%x2");
    }
}
