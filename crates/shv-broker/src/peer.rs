use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use rand::Rng;
use shv_client::{MessageHandler, RpcPeer};
use shv_rpc::{RpcError, RpcErrorCode, RpcLoginType, RpcMessage, param_int, param_str};
use shv_value::{RpcValue, Value};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::broker::RpcBroker;
use crate::node;
use crate::state::DEFAULT_IDLE_TIMEOUT;

/// Per-connection broker logic: the login state machine and, once a user is
/// attached, request, response and signal routing.
///
/// Clones share the connection's state; the message pump and its spawned
/// request tasks all hold one.
#[derive(Clone)]
pub(crate) struct BrokerPeer {
    broker: RpcBroker,
    id: Arc<AtomicI64>,
    nonce: Arc<Mutex<Option<String>>>,
    /// Locally served requests still in flight, for abort support.
    running: Arc<Mutex<HashMap<i64, AbortHandle>>>,
}

impl BrokerPeer {
    pub fn new(broker: RpcBroker, id: i64) -> Self {
        Self {
            broker,
            id: Arc::new(AtomicI64::new(id)),
            nonce: Arc::new(Mutex::new(None)),
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn current_id(&self) -> i64 {
        self.id.load(Ordering::Acquire)
    }

    fn logged_in_user(&self) -> Option<String> {
        let state = self.broker.state.lock();
        state.entry(self.current_id())?.user.clone()
    }
}

impl MessageHandler for BrokerPeer {
    fn handle(&self, peer: RpcPeer, msg: RpcMessage) -> BoxFuture<'static, ()> {
        let this = self.clone();
        Box::pin(async move {
            match this.logged_in_user() {
                // Login exchanges run detached: validating a sub-broker
                // mount calls back into the peer and must not stall the
                // message pump.
                None => {
                    tokio::spawn(async move { this.handle_login(peer, msg).await });
                }
                Some(user) => this.route(peer, msg, user).await,
            }
        })
    }

    fn reset(&self, _peer: RpcPeer) -> BoxFuture<'static, ()> {
        let this = self.clone();
        Box::pin(async move {
            let old = this.current_id();
            let new = this.broker.reset_peer(old).await;
            this.id.store(new, Ordering::Release);
            *this.nonce.lock() = None;
            this.running.lock().clear();
            info!("peer {old} reset, continuing as {new}");
        })
    }
}

impl BrokerPeer {
    /// Pre-login protocol: `hello` hands out a nonce, `login` validates the
    /// credentials and attaches a user; anything else is out of order.
    async fn handle_login(&self, peer: RpcPeer, msg: RpcMessage) {
        if !msg.is_request() {
            return;
        }
        let mut resp = msg.make_response();
        if !msg.path().is_empty() {
            resp.set_error(RpcError::login_required("Use hello and login methods"));
            let _ = peer.send(resp);
            return;
        }
        match msg.method() {
            Some("hello") => {
                let nonce: String = {
                    let mut rng = rand::thread_rng();
                    (0..10)
                        .map(|_| {
                            let digit = rng.gen_range(0..16u32);
                            char::from_digit(digit, 16).expect("hex digit")
                        })
                        .collect()
                };
                *self.nonce.lock() = Some(nonce.clone());
                let mut result = BTreeMap::new();
                result.insert("nonce".to_string(), RpcValue::from(nonce));
                resp.set_result(Value::Map(result).into());
            }
            Some("login") if self.nonce.lock().is_some() => match self.try_login(&msg).await {
                Ok(result) => resp.set_result(result),
                Err(err) => resp.set_error(err),
            },
            _ => {
                let error = if self.nonce.lock().is_some() {
                    RpcError::login_required("Use hello and login methods")
                } else {
                    RpcError::login_required("Use hello method")
                };
                resp.set_error(error);
            }
        }
        let _ = peer.send(resp);
    }

    async fn try_login(&self, msg: &RpcMessage) -> Result<RpcValue, RpcError> {
        let id = self.current_id();
        let nonce = self.nonce.lock().clone().unwrap_or_default();
        let param = msg
            .param()
            .filter(|p| p.as_map().is_some())
            .ok_or_else(|| RpcError::invalid_param("Invalid type of parameters"))?;
        let username = param_str(param, &["login", "user"]).unwrap_or("");
        let password = param_str(param, &["login", "password"]).unwrap_or("");
        let login_type = param_str(param, &["login", "type"])
            .and_then(RpcLoginType::from_str_opt)
            .unwrap_or(RpcLoginType::Sha1);

        let user = self
            .broker
            .config
            .login(username, password, &nonce, login_type)
            .ok_or_else(|| RpcError::method_call_exception("Invalid login"))?
            .clone();
        info!("peer {id} logged in as user: {}", user.name);

        let device_id = param_str(param, &["options", "device", "deviceId"]).unwrap_or("");
        let explicit_mount =
            param_str(param, &["options", "device", "mountPoint"]).map(str::to_string);
        let idle_timeout = param_int(param, &["options", "idleWatchDogTimeOut"])
            .map(|secs| Duration::from_secs(secs.max(1) as u64))
            .unwrap_or(DEFAULT_IDLE_TIMEOUT);

        let mount = match explicit_mount {
            Some(mount) if !mount.is_empty() => Some(mount),
            _ if !device_id.is_empty() => {
                let state = self.broker.state.clone();
                self.broker
                    .config
                    .autosetup_mount(device_id, &user, |candidate| {
                        state.lock().mount_conflicts(candidate)
                    })
            }
            _ => None,
        };

        {
            let mut state = self.broker.state.lock();
            let entry = state
                .entry_mut(id)
                .ok_or_else(|| RpcError::method_call_exception("Peer is gone"))?;
            entry.user = Some(user.name.clone());
            entry.idle_timeout = idle_timeout;
        }
        if let Some(mount) = &mount {
            self.broker.mount_peer(id, mount)?;
        }
        // Autosetup may come with an initial subscription set.
        if let Some(rule) = self.broker.config.autosetup_rule(device_id, &user) {
            for ri in rule.subscriptions.clone() {
                self.broker.subscribe_peer(id, ri, None).await;
            }
        }

        let mut result = BTreeMap::new();
        result.insert("clientId".to_string(), RpcValue::from(id));
        Ok(Value::Map(result).into())
    }

    /// Post-login message routing.
    async fn route(&self, peer: RpcPeer, mut msg: RpcMessage, username: String) {
        let id = self.current_id();
        if msg.is_request() || msg.is_abort() {
            let Some(user) = self.broker.config.user(&username) else {
                warn!("peer {id} has unknown user {username}");
                return;
            };
            let path = msg.path().to_string();
            let method = msg.method().unwrap_or_default().to_string();

            let Some(granted) = self.broker.config.access_level(user, &path, &method) else {
                let mut resp = msg.make_response();
                resp.set_error(RpcError::method_not_found("No access"));
                let _ = peer.send(resp);
                return;
            };
            let access = match msg.access() {
                Some(incoming) => incoming.min(granted),
                None => granted,
            };
            msg.set_access(Some(access));
            if let Some(existing) = msg.user_id().map(str::to_string) {
                let broker_name = &self.broker.config.name;
                let chained = if existing.is_empty() {
                    format!("{broker_name}:{username}")
                } else {
                    format!("{existing},{broker_name}:{username}")
                };
                msg.set_user_id(Some(&chained));
            }

            let target = self.broker.state.lock().peer_on_path(&path);
            match target {
                Some((target_id, relative)) => {
                    msg.push_caller_id(id);
                    msg.set_path(Some(&relative));
                    let forwarded = {
                        let state = self.broker.state.lock();
                        state.peer(target_id).map(|p| p.send(msg))
                    };
                    if !matches!(forwarded, Some(Ok(()))) {
                        debug!("request for gone peer {target_id} dropped");
                    }
                }
                None => self.serve_local(peer, msg).await,
            }
        } else if msg.is_response() {
            // Responses for the broker's own calls never reach this point;
            // everything else pops the topmost caller id to pick the hop.
            let Some(next) = msg.pop_caller_id() else {
                debug!("response with empty caller ids dropped");
                return;
            };
            let target = self.broker.state.lock().peer(next);
            match target {
                Some(target) => {
                    let _ = target.send(msg);
                }
                None => debug!("response for gone peer {next} dropped"),
            }
        } else if msg.is_signal() {
            self.broker.signal_from(id, msg).await;
        }
    }

    /// Requests that end at the broker itself: the `.app` and `.broker`
    /// subtrees plus discovery over the mount tree.
    async fn serve_local(&self, peer: RpcPeer, msg: RpcMessage) {
        let rid = msg.request_id().expect("requests carry an id");
        if msg.is_abort() {
            if let Some(handle) = self.running.lock().remove(&rid) {
                handle.abort();
                let mut resp = msg.make_response();
                resp.set_error(RpcError::new(
                    RpcErrorCode::RequestInvalid,
                    "Request cancelled",
                ));
                let _ = peer.send(resp);
            }
            return;
        }
        let broker = self.broker.clone();
        let caller_id = self.current_id();
        let running = self.running.clone();
        // The task starts only after its abort handle is registered, so its
        // cleanup always finds the entry.
        let (registered_tx, registered_rx) = tokio::sync::oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let _ = registered_rx.await;
            let mut resp = msg.make_response();
            match node::local_method_call(&broker, caller_id, &msg).await {
                Ok(result) => resp.set_result(result),
                Err(err) => resp.set_error(err),
            }
            running.lock().remove(&rid);
            let _ = peer.send(resp);
        });
        self.running.lock().insert(rid, task.abort_handle());
        let _ = registered_tx.send(());
    }
}
