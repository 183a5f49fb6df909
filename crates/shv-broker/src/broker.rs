use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use shv_client::{CallError, RpcPeer};
use shv_rpc::{RpcAccess, RpcMessage, RpcRI};
use shv_transport::{Link, LinkError, bind_url, connect_url};
use shv_value::{RpcValue, Value};
use tracing::{debug, info, warn};

use crate::config::{BrokerConfig, ConnectConfig};
use crate::peer::BrokerPeer;
use crate::state::{BrokerState, DEFAULT_IDLE_TIMEOUT};

/// The SHV RPC broker: accepts peers, owns the mount and subscription
/// tables and moves messages between connections.
///
/// Cloning is cheap and clones share the same broker.
#[derive(Clone)]
pub struct RpcBroker {
    pub(crate) config: Arc<BrokerConfig>,
    pub(crate) state: Arc<Mutex<BrokerState>>,
}

impl RpcBroker {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config: Arc::new(config),
            state: Arc::new(Mutex::new(BrokerState::default())),
        }
    }

    /// Take over a freshly connected link: the peer starts in the
    /// pre-login state. Returns the assigned caller id.
    pub fn accept(&self, link: Link) -> i64 {
        let peer = RpcPeer::new(link);
        let id = self.state.lock().register(peer.clone());
        info!("peer registered with id {id}");
        let handler = Arc::new(BrokerPeer::new(self.clone(), id));
        let broker = self.clone();
        tokio::spawn({
            let peer = peer.clone();
            let handler = handler.clone();
            async move {
                let watchdog = tokio::spawn(idle_watchdog(
                    broker.clone(),
                    handler.clone(),
                    peer.clone(),
                ));
                peer.run(handler.clone()).await;
                watchdog.abort();
                broker.drop_peer(handler.current_id()).await;
            }
        });
        id
    }

    /// Listen on every configured endpoint and dial every configured
    /// connection; runs until the task is dropped.
    pub async fn serve(&self) -> Result<(), LinkError> {
        for url in &self.config.listen {
            let listener = bind_url(url).await?;
            info!("listening on {url}");
            let broker = self.clone();
            tokio::spawn(async move {
                loop {
                    match listener.accept().await {
                        Ok(link) => {
                            broker.accept(link);
                        }
                        Err(err) => {
                            warn!("accept failed: {err}");
                            break;
                        }
                    }
                }
            });
        }
        for connect in self.config.connect.clone() {
            let broker = self.clone();
            tokio::spawn(async move { broker.keep_connected(connect).await });
        }
        futures_util::future::pending().await
    }

    /// Dial an outgoing connection and register it as a local peer; redial
    /// with backoff when it drops.
    async fn keep_connected(&self, connect: ConnectConfig) {
        let mut attempt: u32 = 0;
        loop {
            match self.connect_once(&connect).await {
                Ok(()) => attempt = 0,
                Err(err) => debug!("connection to {} failed: {err}", connect.url),
            }
            attempt += 1;
            tokio::time::sleep(Duration::from_secs(60u64.min(1 << attempt.min(6)))).await;
        }
    }

    async fn connect_once(&self, connect: &ConnectConfig) -> Result<(), CallError> {
        let link = connect_url(&connect.url)
            .await
            .map_err(|_| CallError::Disconnected)?;
        let peer = RpcPeer::new(link);
        let id = self.state.lock().register(peer.clone());
        let handler = Arc::new(BrokerPeer::new(self.clone(), id));
        let run = {
            let peer = peer.clone();
            let handler = handler.clone();
            tokio::spawn(async move { peer.run(handler).await })
        };

        // Log in to the remote side, then treat it as a local peer with the
        // configured user and mount.
        let hello = peer.call("", "hello", None).await?;
        let nonce = hello
            .as_map()
            .and_then(|m| m.get("nonce"))
            .and_then(RpcValue::as_str)
            .unwrap_or("")
            .to_string();
        let param = connect.url.login.to_param(&nonce, None, false);
        peer.call("", "login", Some(param)).await?;
        info!("connected to {}", connect.url);

        {
            let mut state = self.state.lock();
            if let Some(entry) = state.entry_mut(id) {
                entry.user = Some(connect.user.clone());
                entry.idle_timeout = DEFAULT_IDLE_TIMEOUT;
            }
        }
        if let Some(mount) = &connect.mount_point {
            if let Err(err) = self.mount_peer(id, mount) {
                warn!("cannot mount {}: {err}", connect.url);
            }
        }
        // Keep the remote side from idling us out.
        let keepalive = tokio::spawn({
            let peer = peer.clone();
            async move {
                let half = DEFAULT_IDLE_TIMEOUT / 2;
                loop {
                    let idle = peer.idle_send();
                    if idle < half {
                        tokio::time::sleep(half - idle).await;
                        continue;
                    }
                    if peer.send(RpcMessage::request(".app", "ping", None)).is_err() {
                        break;
                    }
                    tokio::time::sleep(half).await;
                }
            }
        });
        let _ = run.await;
        keepalive.abort();
        self.drop_peer(id).await;
        Err(CallError::Disconnected)
    }

    /// Disconnect every peer.
    pub fn terminate(&self) {
        let peers: Vec<RpcPeer> = {
            let state = self.state.lock();
            state
                .peer_ids()
                .into_iter()
                .filter_map(|id| state.peer(id))
                .collect()
        };
        for peer in peers {
            peer.disconnect();
        }
    }

    /// Install a mount for a peer.
    ///
    /// The `lsmod` signal and the sub-broker probing run in their own task:
    /// probing calls back into the peer, and its login exchange must not
    /// wait on that.
    pub(crate) fn mount_peer(&self, id: i64, mount: &str) -> Result<(), shv_rpc::RpcError> {
        let mount = mount.trim_end_matches('/').to_string();
        {
            let mut state = self.state.lock();
            if mount.is_empty() || state.mount_conflicts(&mount) {
                return Err(shv_rpc::RpcError::method_call_exception(
                    "Mount point already mounted",
                ));
            }
            state.mount(id, mount.clone());
        }
        info!("peer {id} mounted on: {mount}");
        let broker = self.clone();
        tokio::spawn(async move {
            broker.emit_lsmod(&mount, true).await;
            broker.setup_forwarding(id, &mount).await;
        });
        Ok(())
    }

    /// Probe the freshly mounted peer and install forwarded subscriptions
    /// when it turns out to be a broker.
    async fn setup_forwarding(&self, id: i64, mount: &str) {
        if !self.peer_is_broker(id).await {
            return;
        }
        let forwards = self.state.lock().forward_rebuild(mount);
        for rel in forwards {
            self.forward_subscribe(id, &rel, true).await;
        }
    }

    /// Check (and cache) whether the peer serves a `.broker` subtree.
    pub(crate) async fn peer_is_broker(&self, id: i64) -> bool {
        let (peer, cached) = {
            let state = self.state.lock();
            match state.entry(id) {
                Some(entry) => (entry.peer.clone(), entry.is_broker),
                None => return false,
            }
        };
        if let Some(cached) = cached {
            return cached;
        }
        let result = matches!(
            peer.call("", "ls", Some(".broker".into())).await,
            Ok(value) if value.as_bool() == Some(true)
        );
        if let Some(entry) = self.state.lock().entry_mut(id) {
            entry.is_broker = Some(result);
        }
        result
    }

    /// Install or remove one forwarded subscription on a sub-broker.
    pub(crate) async fn forward_subscribe(&self, id: i64, rel: &RpcRI, install: bool) {
        let Some(peer) = self.state.lock().peer(id) else {
            return;
        };
        let method = if install { "subscribe" } else { "unsubscribe" };
        let result = if peer.peer_is_shv3().await {
            peer.call(
                ".broker/currentClient",
                method,
                Some(rel.to_string().into()),
            )
            .await
        } else {
            match rel.to_legacy_subscription() {
                Ok(param) => peer.call(".broker/app", method, Some(param)).await,
                Err(err) => Err(CallError::Rpc(err)),
            }
        };
        if let Err(err) = result {
            debug!("failed to {method} {rel} on sub-broker {id}: {err}");
        }
    }

    /// Add a subscription for a peer, forwarding it to mounted sub-brokers
    /// whose subtree it can apply to.
    pub(crate) async fn subscribe_peer(&self, id: i64, ri: RpcRI, ttl: Option<u64>) -> bool {
        let (newly, forwards) = self.state.lock().subscribe(ri.clone(), id);
        for (sub_id, rel) in forwards {
            self.forward_subscribe(sub_id, &rel, true).await;
        }
        if let Some(ttl) = ttl {
            let broker = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(ttl)).await;
                broker.unsubscribe_peer(id, &ri).await;
            });
        }
        newly
    }

    /// Remove a peer's subscription, dropping upstream forwards that lost
    /// their last reference.
    pub(crate) async fn unsubscribe_peer(&self, id: i64, ri: &RpcRI) -> bool {
        let (known, drops) = self.state.lock().unsubscribe(ri, id);
        for (sub_id, rel) in drops {
            self.forward_subscribe(sub_id, &rel, false).await;
        }
        known
    }

    /// Deliver a signal coming from a mounted peer: prefix the mount path
    /// and fan out to subscribers their access level allows.
    pub(crate) async fn signal_from(&self, id: i64, mut msg: RpcMessage) {
        let Some(mount) = self.state.lock().mount_of(id) else {
            debug!("dropping signal from unmounted peer {id}");
            return;
        };
        let full_path = if msg.path().is_empty() {
            mount
        } else {
            format!("{mount}/{}", msg.path())
        };
        msg.set_path(Some(&full_path));
        self.deliver_signal(msg).await;
    }

    /// Fan a signal out to every subscriber with sufficient access.
    pub(crate) async fn deliver_signal(&self, msg: RpcMessage) {
        let path = msg.path().to_string();
        let source = msg.source().to_string();
        let Some(signal) = msg.signal_name().map(str::to_string) else {
            return;
        };
        let msg_access = msg.access().unwrap_or(RpcAccess::Read);
        let targets: Vec<RpcPeer> = {
            let state = self.state.lock();
            state
                .signal_targets(&path, &source, &signal)
                .into_iter()
                .filter_map(|target| {
                    let entry = state.entry(target)?;
                    let user = self.config.user(entry.user.as_deref()?)?;
                    let level =
                        self.config
                            .access_level_signal(user, &path, &source, &signal)?;
                    (level >= msg_access).then(|| entry.peer.clone())
                })
                .collect()
        };
        for peer in targets {
            let _ = peer.send(msg.clone());
        }
    }

    /// Announce a mount appearing or disappearing with an `lsmod` signal on
    /// the parent of the topmost changed node.
    pub(crate) async fn emit_lsmod(&self, mount: &str, added: bool) {
        let (parent, name) = {
            let state = self.state.lock();
            let others: Vec<String> = state
                .mounts()
                .into_iter()
                .filter(|m| m != mount)
                .collect();
            BrokerState::lsmod_change(mount, &others)
        };
        let mut param = BTreeMap::new();
        param.insert(name, RpcValue::from(added));
        let msg = RpcMessage::signal(
            &parent,
            "lsmod",
            "ls",
            Some(Value::Map(param).into()),
            RpcAccess::Browse,
        );
        self.deliver_signal(msg).await;
    }

    /// Forget a disconnected peer: its subscriptions, forwards and mount.
    pub(crate) async fn drop_peer(&self, id: i64) {
        let (mount, gone_upstream) = self.state.lock().unregister(id);
        info!("peer {id} disconnected");
        for (sub_id, rel) in gone_upstream {
            self.forward_subscribe(sub_id, &rel, false).await;
        }
        if let Some(mount) = mount {
            self.emit_lsmod(&mount, false).await;
        }
    }

    /// Give a peer a fresh identity after a RESET control message.
    pub(crate) async fn reset_peer(&self, old_id: i64) -> i64 {
        let peer = self.state.lock().peer(old_id);
        self.drop_peer(old_id).await;
        match peer {
            Some(peer) => self.state.lock().register(peer),
            None => old_id,
        }
    }
}

/// Disconnect the peer once it stays quiet past its idle limit.
async fn idle_watchdog(broker: RpcBroker, handler: Arc<BrokerPeer>, peer: RpcPeer) {
    loop {
        let timeout = {
            let state = broker.state.lock();
            match state.entry(handler.current_id()) {
                Some(entry) => entry.idle_timeout,
                None => return,
            }
        };
        let idle = peer.idle_receive();
        if idle >= timeout {
            debug!("disconnecting idle peer {}", handler.current_id());
            peer.disconnect();
            return;
        }
        tokio::time::sleep(timeout - idle).await;
    }
}
