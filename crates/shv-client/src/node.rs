use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use shv_rpc::{
    DirFlags, RpcAccess, RpcDir, RpcError, RpcMessage, SHV_VERSION_MAJOR, SHV_VERSION_MINOR,
};
use shv_value::{DateTime, RpcValue, Value};
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::peer::{MessageHandler, RpcPeer};

/// An inbound method call as seen by a [`NodeHandler`].
pub struct Request {
    pub path: String,
    pub method: String,
    pub param: Option<RpcValue>,
    pub access: RpcAccess,
    pub user_id: Option<String>,
    rid: i64,
    caller_ids: Vec<i64>,
    peer: RpcPeer,
}

impl Request {
    /// Emit a progress response for this still-running request.
    pub fn progress(&self, delay: f64) {
        let _ = self.peer.send(RpcMessage::delay_response(
            self.rid,
            self.caller_ids.clone(),
            delay.clamp(0.0, 1.0),
        ));
    }

    pub fn peer(&self) -> &RpcPeer {
        &self.peer
    }
}

/// An inbound signal as seen by a [`NodeHandler`].
#[derive(Clone, Debug)]
pub struct Signal {
    pub path: String,
    pub signal: String,
    pub source: String,
    pub param: Option<RpcValue>,
    pub access: RpcAccess,
    pub user_id: Option<String>,
}

/// The capability set of a path tree served by a peer.
///
/// Discovery (`ls`/`dir`) and the `.app` subtree are provided by
/// [`NodeDispatcher`]; implementations only describe and serve their own
/// nodes. `children` and `describe` are consulted for every path, `invoke`
/// only after the described access constraints passed.
pub trait NodeHandler: Send + Sync + 'static {
    /// Direct children of `path`.
    fn children(&self, path: &str) -> Vec<String> {
        let _ = path;
        Vec::new()
    }

    /// Methods of the node at `path`, on top of the standard `dir`/`ls`.
    fn describe(&self, path: &str) -> Vec<RpcDir> {
        let _ = path;
        Vec::new()
    }

    /// Serve a method call.
    fn invoke<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<RpcValue, RpcError>> {
        let _ = request;
        Box::pin(async {
            Err(RpcError::method_not_found(
                "No such path or method or access rights",
            ))
        })
    }

    /// Deliver a signal received from the peer.
    fn on_signal(&self, signal: Signal) {
        let _ = signal;
    }
}

/// No-op handler for peers that only place calls.
pub struct EmptyNode;

impl NodeHandler for EmptyNode {}

/// The `ls` method protocol: Null lists children, String checks existence.
pub fn ls_method(
    children: Vec<String>,
    path_is_valid: bool,
    param: Option<&RpcValue>,
) -> Result<RpcValue, RpcError> {
    match param.map(RpcValue::value) {
        None | Some(Value::Null) => {
            if children.is_empty() && !path_is_valid {
                return Err(RpcError::method_not_found("No such node"));
            }
            let mut seen = Vec::new();
            for child in children {
                if !seen.iter().any(|v| *v == child) {
                    seen.push(child);
                }
            }
            Ok(Value::List(seen.into_iter().map(RpcValue::from).collect()).into())
        }
        Some(Value::String(name)) => Ok(children.iter().any(|c| c == name).into()),
        _ => Err(RpcError::invalid_param("Use Null or String with node name")),
    }
}

/// The `dir` method protocol: Null/Bool lists descriptors, String checks
/// existence.
pub fn dir_method(
    descriptors: Vec<RpcDir>,
    path_is_valid: bool,
    param: Option<&RpcValue>,
) -> Result<RpcValue, RpcError> {
    if !path_is_valid {
        return Err(RpcError::method_not_found("No such node"));
    }
    match param.map(RpcValue::value) {
        None | Some(Value::Null) | Some(Value::Bool(_)) => {
            let extra = matches!(param.map(RpcValue::value), Some(Value::Bool(true)));
            Ok(Value::List(
                descriptors
                    .into_iter()
                    .map(|d| d.to_value_with(extra))
                    .collect(),
            )
            .into())
        }
        Some(Value::String(name)) => Ok(descriptors.iter().any(|d| d.name == *name).into()),
        _ => Err(RpcError::invalid_param(
            "Use Null or Bool or String with node name",
        )),
    }
}

struct DispatcherInner {
    node: Arc<dyn NodeHandler>,
    app_name: String,
    app_version: String,
    running: Mutex<HashMap<i64, AbortHandle>>,
}

/// Serves a peer's own path tree: discovery, `.app`, access constraints,
/// request task management with abort support.
#[derive(Clone)]
pub struct NodeDispatcher {
    inner: Arc<DispatcherInner>,
}

impl NodeDispatcher {
    pub fn new(node: Arc<dyn NodeHandler>, app_name: &str, app_version: &str) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                node,
                app_name: app_name.into(),
                app_version: app_version.into(),
                running: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn node(&self) -> &Arc<dyn NodeHandler> {
        &self.inner.node
    }
}

impl MessageHandler for NodeDispatcher {
    fn handle(&self, peer: RpcPeer, msg: RpcMessage) -> BoxFuture<'static, ()> {
        let inner = self.inner.clone();
        Box::pin(async move {
            if msg.is_abort() {
                let rid = msg.request_id().expect("abort carries an id");
                if let Some(handle) = inner.running.lock().remove(&rid) {
                    handle.abort();
                    let mut resp = msg.make_response();
                    resp.set_error(RpcError::new(
                        shv_rpc::RpcErrorCode::RequestInvalid,
                        "Request cancelled",
                    ));
                    let _ = peer.send(resp);
                }
                return;
            }
            if msg.is_signal() {
                inner.node.on_signal(Signal {
                    path: msg.path().to_string(),
                    signal: msg.signal_name().unwrap_or_default().to_string(),
                    source: msg.source().to_string(),
                    param: msg.param().cloned(),
                    access: msg.access().unwrap_or(RpcAccess::Read),
                    user_id: msg.user_id().map(str::to_string),
                });
                return;
            }
            if !msg.is_request() {
                debug!("dropping message that fits no shape: {msg}");
                return;
            }

            let rid = msg.request_id().expect("requests carry an id");
            let task_inner = inner.clone();
            // The task starts only after its abort handle is registered, so
            // its cleanup always finds the entry.
            let (registered_tx, registered_rx) = tokio::sync::oneshot::channel::<()>();
            let task = tokio::spawn(async move {
                let _ = registered_rx.await;
                let request = Request {
                    path: msg.path().to_string(),
                    method: msg.method().unwrap_or_default().to_string(),
                    param: msg.param().cloned(),
                    access: msg.access().unwrap_or(RpcAccess::Browse),
                    user_id: msg.user_id().map(str::to_string),
                    rid,
                    caller_ids: msg.caller_ids(),
                    peer: peer.clone(),
                };
                let mut resp = msg.make_response();
                match task_inner.dispatch(&request).await {
                    Ok(result) => resp.set_result(result),
                    Err(err) => resp.set_error(err),
                }
                task_inner.running.lock().remove(&rid);
                if let Err(err) = peer.send(resp) {
                    warn!("failed to send response: {err}");
                }
            });
            inner.running.lock().insert(rid, task.abort_handle());
            let _ = registered_tx.send(());
        })
    }
}

impl DispatcherInner {
    fn children(&self, path: &str) -> Vec<String> {
        let mut res = Vec::new();
        if path.is_empty() {
            res.push(".app".to_string());
        }
        res.extend(self.node.children(path));
        res
    }

    fn valid_path(&self, path: &str) -> bool {
        if path.is_empty() {
            return true;
        }
        let (parent, name) = path.rsplit_once('/').unwrap_or(("", path));
        self.children(parent).iter().any(|c| c == name)
    }

    fn describe(&self, path: &str) -> Vec<RpcDir> {
        let mut res = vec![RpcDir::stddir(), RpcDir::stdls()];
        if path == ".app" {
            res.push(RpcDir::getter("shvVersionMajor", "n", "i"));
            res.push(RpcDir::getter("shvVersionMinor", "n", "i"));
            res.push(RpcDir::getter("name", "n", "s"));
            res.push(RpcDir::getter("version", "n", "s"));
            res.push(RpcDir::getter("date", "n", "t"));
            res.push(RpcDir::new("ping"));
        }
        res.extend(self.node.describe(path));
        res
    }

    async fn dispatch(&self, request: &Request) -> Result<RpcValue, RpcError> {
        match request.method.as_str() {
            "ls" => {
                return ls_method(
                    self.children(&request.path),
                    self.valid_path(&request.path),
                    request.param.as_ref(),
                );
            }
            "dir" => {
                return dir_method(
                    self.describe(&request.path),
                    self.valid_path(&request.path),
                    request.param.as_ref(),
                );
            }
            _ => {}
        }
        if request.path == ".app" {
            return match request.method.as_str() {
                "shvVersionMajor" => Ok(SHV_VERSION_MAJOR.into()),
                "shvVersionMinor" => Ok(SHV_VERSION_MINOR.into()),
                "name" => Ok(self.app_name.as_str().into()),
                "version" => Ok(self.app_version.as_str().into()),
                "date" => Ok(DateTime::now().into()),
                "ping" => Ok(RpcValue::null()),
                _ => Err(RpcError::method_not_found(format!(
                    "No such method '{}' on '.app'",
                    request.method
                ))),
            };
        }
        // The described constraints gate the call before the node sees it.
        if let Some(desc) = self
            .describe(&request.path)
            .into_iter()
            .find(|d| d.name == request.method)
        {
            if request.access < desc.access {
                return Err(RpcError::method_not_found("No access"));
            }
            if desc.flags.contains(DirFlags::USER_ID_REQUIRED) && request.user_id.is_none() {
                return Err(RpcError::user_id_required(
                    "Method requires UserID in the request",
                ));
            }
        }
        self.node.invoke(request).await
    }
}
