//! The broker's own path tree: `.app`, `.broker` and discovery over the
//! mount table.

use std::collections::BTreeMap;

use shv_client::{dir_method, ls_method};
use shv_rpc::{
    DirFlags, RpcAccess, RpcDir, RpcError, RpcMessage, RpcRI, SHV_VERSION_MAJOR,
    SHV_VERSION_MINOR,
};
use shv_value::{DateTime, RpcValue, Value};

use crate::broker::RpcBroker;
use crate::state::BrokerState;

const APP_NAME: &str = "shv-broker";
const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Direct children of a broker-local path.
fn children(state: &BrokerState, path: &str) -> Vec<String> {
    let mut res: Vec<String> = Vec::new();
    let mut push = |name: String| {
        if !res.contains(&name) {
            res.push(name);
        }
    };
    match path {
        "" => {
            push(".app".into());
            push(".broker".into());
        }
        ".broker" => {
            push("currentClient".into());
            push("client".into());
        }
        ".broker/client" => {
            for id in state.peer_ids() {
                push(id.to_string());
            }
        }
        _ => {}
    }
    // Intermediate nodes of the mount tree; paths at or below a mount are
    // routed to the peer and never served here.
    for mount in state.mounts() {
        if path.is_empty() {
            push(mount.split('/').next().unwrap_or_default().to_string());
        } else if let Some(rest) = mount.strip_prefix(&format!("{path}/")) {
            push(rest.split('/').next().unwrap_or_default().to_string());
        }
    }
    res
}

fn valid_path(state: &BrokerState, path: &str) -> bool {
    if path.is_empty() {
        return true;
    }
    let (parent, name) = path.rsplit_once('/').unwrap_or(("", path));
    children(state, parent).iter().any(|c| c == name)
}

/// Methods of a broker-local path.
fn describe(path: &str) -> Vec<RpcDir> {
    let mut res = vec![RpcDir::stddir(), RpcDir::stdls()];
    match path {
        ".app" => {
            res.push(RpcDir::getter("shvVersionMajor", "n", "i"));
            res.push(RpcDir::getter("shvVersionMinor", "n", "i"));
            res.push(RpcDir::getter("name", "n", "s"));
            res.push(RpcDir::getter("version", "n", "s"));
            res.push(RpcDir::getter("date", "n", "t"));
            res.push(RpcDir::new("ping"));
        }
        ".broker" => {
            res.push(
                RpcDir::getter("name", "n", "s").with_access(RpcAccess::SuperService),
            );
            res.push(
                RpcDir::new("clientInfo")
                    .with_param("i")
                    .with_result("!clientInfo|n")
                    .with_access(RpcAccess::SuperService),
            );
            res.push(
                RpcDir::new("mountedClientInfo")
                    .with_param("s")
                    .with_result("!clientInfo|n")
                    .with_access(RpcAccess::SuperService),
            );
            res.push(
                RpcDir::getter("clients", "n", "[i]").with_access(RpcAccess::SuperService),
            );
            res.push(
                RpcDir::getter("mounts", "n", "[s]").with_access(RpcAccess::SuperService),
            );
            res.push(
                RpcDir::new("disconnectClient")
                    .with_param("i")
                    .with_flags(DirFlags::NOT_IDEMPOTENT)
                    .with_access(RpcAccess::SuperService),
            );
        }
        ".broker/currentClient" => {
            res.push(RpcDir::getter("info", "n", "!clientInfo").with_access(RpcAccess::Browse));
            res.push(
                RpcDir::new("subscribe")
                    .with_param("s|[s,i]")
                    .with_result("b")
                    .with_access(RpcAccess::Browse),
            );
            res.push(
                RpcDir::new("unsubscribe")
                    .with_param("s")
                    .with_result("b")
                    .with_access(RpcAccess::Browse),
            );
            res.push(
                RpcDir::getter("subscriptions", "n", "[s]").with_access(RpcAccess::Browse),
            );
        }
        _ => {}
    }
    res
}

/// The `!clientInfo` struct for one peer.
fn client_info(state: &BrokerState, id: i64) -> RpcValue {
    let Some(entry) = state.entry(id) else {
        return RpcValue::null();
    };
    let mut map: BTreeMap<i64, RpcValue> = BTreeMap::new();
    map.insert(1, RpcValue::from(id));
    map.insert(2, entry.user.clone().into());
    map.insert(3, entry.mount.clone().into());
    let subscriptions: BTreeMap<String, RpcValue> = state
        .subscriptions(Some(id))
        .into_iter()
        .map(|ri| (ri.to_string(), RpcValue::null()))
        .collect();
    map.insert(4, Value::Map(subscriptions).into());
    let mut extra: BTreeMap<String, RpcValue> = BTreeMap::new();
    extra.insert(
        "idleTime".into(),
        RpcValue::from(entry.peer.idle_receive().as_millis() as i64),
    );
    extra.insert(
        "idleTimeMax".into(),
        RpcValue::from(entry.idle_timeout.as_millis() as i64),
    );
    map.insert(63, Value::Map(extra).into());
    Value::IMap(map).into()
}

/// Parse the subscribe parameter: an RI string, `[ri, ttl]`, or the legacy
/// map form.
fn subscription_param(param: Option<&RpcValue>) -> Result<(RpcRI, Option<u64>), RpcError> {
    let param = param.ok_or_else(|| RpcError::invalid_param("Use String with RPC RI"))?;
    match param.value() {
        Value::String(ri) => Ok((RpcRI::parse(ri), None)),
        Value::List(items) => {
            let ri = items
                .first()
                .and_then(|v| v.as_str())
                .ok_or_else(|| RpcError::invalid_param("Use [String, Int]"))?;
            let ttl = items.get(1).and_then(|v| v.as_uint());
            Ok((RpcRI::parse(ri), ttl))
        }
        Value::Map(_) => Ok((RpcRI::from_subscription(param)?, None)),
        _ => Err(RpcError::invalid_param("Use String with RPC RI")),
    }
}

/// Serve a request that resolved to the broker itself.
pub(crate) async fn local_method_call(
    broker: &RpcBroker,
    caller_id: i64,
    msg: &RpcMessage,
) -> Result<RpcValue, RpcError> {
    let path = msg.path().to_string();
    let method = msg.method().unwrap_or_default().to_string();
    let param = msg.param().cloned();
    let access = msg.access().unwrap_or(RpcAccess::Browse);

    match method.as_str() {
        "ls" => {
            let state = broker.state.lock();
            return ls_method(
                children(&state, &path),
                valid_path(&state, &path),
                param.as_ref(),
            );
        }
        "dir" => {
            let state = broker.state.lock();
            return dir_method(describe(&path), valid_path(&state, &path), param.as_ref());
        }
        _ => {}
    }
    // Access floor declared by the method description.
    if let Some(desc) = describe(&path).into_iter().find(|d| d.name == method) {
        if access < desc.access {
            return Err(RpcError::method_not_found("No access"));
        }
    }
    match (path.as_str(), method.as_str()) {
        (".app", "shvVersionMajor") => Ok(SHV_VERSION_MAJOR.into()),
        (".app", "shvVersionMinor") => Ok(SHV_VERSION_MINOR.into()),
        (".app", "name") => Ok(APP_NAME.into()),
        (".app", "version") => Ok(APP_VERSION.into()),
        (".app", "date") => Ok(DateTime::now().into()),
        (".app", "ping") => Ok(RpcValue::null()),
        (".broker", "name") => Ok(broker.config.name.as_str().into()),
        (".broker", "clientInfo") => {
            let id = param
                .as_ref()
                .and_then(|p| p.as_int())
                .ok_or_else(|| RpcError::invalid_param("Use Int"))?;
            let state = broker.state.lock();
            Ok(client_info(&state, id))
        }
        (".broker", "mountedClientInfo") => {
            let path = param
                .as_ref()
                .and_then(|p| p.as_str())
                .ok_or_else(|| RpcError::invalid_param("Use String with SHV path"))?;
            let state = broker.state.lock();
            match state.peer_on_path(path) {
                Some((id, _)) => Ok(client_info(&state, id)),
                None => Ok(RpcValue::null()),
            }
        }
        (".broker", "clients") => {
            let state = broker.state.lock();
            Ok(Value::List(
                state.peer_ids().into_iter().map(RpcValue::from).collect(),
            )
            .into())
        }
        (".broker", "mounts") => {
            let state = broker.state.lock();
            Ok(Value::List(state.mounts().into_iter().map(RpcValue::from).collect()).into())
        }
        (".broker", "disconnectClient") => {
            let id = param
                .as_ref()
                .and_then(|p| p.as_int())
                .ok_or_else(|| RpcError::invalid_param("Use Int"))?;
            let peer = broker.state.lock().peer(id).ok_or_else(|| {
                RpcError::method_call_exception(format!("No such client with ID: {id}"))
            })?;
            peer.disconnect();
            Ok(RpcValue::null())
        }
        (".broker/currentClient", "info") => {
            let state = broker.state.lock();
            Ok(client_info(&state, caller_id))
        }
        (".broker/currentClient", "subscriptions") => {
            let state = broker.state.lock();
            Ok(Value::List(
                state
                    .subscriptions(Some(caller_id))
                    .into_iter()
                    .map(|ri| ri.to_string().into())
                    .collect(),
            )
            .into())
        }
        (".broker/currentClient", "subscribe") => {
            let (ri, ttl) = subscription_param(param.as_ref())?;
            Ok(broker.subscribe_peer(caller_id, ri, ttl).await.into())
        }
        (".broker/currentClient", "unsubscribe") => {
            let (ri, _) = subscription_param(param.as_ref())?;
            Ok(broker.unsubscribe_peer(caller_id, &ri).await.into())
        }
        _ => Err(RpcError::method_not_found(format!(
            "No such path '{path}' or method '{method}' or access rights."
        ))),
    }
}
