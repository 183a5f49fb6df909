use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use shv_rpc::{RpcMessage, RpcRI, RpcUrl};
use shv_transport::{Link, LinkError, connect_url};
use shv_value::RpcValue;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::node::{NodeDispatcher, NodeHandler};
use crate::peer::{CallError, CallOptions, MessageHandler, RpcPeer};

/// Failure to establish or keep a client session.
#[derive(Debug)]
pub enum ClientError {
    Link(LinkError),
    Call(CallError),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::Link(err) => write!(f, "{err}"),
            ClientError::Call(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<LinkError> for ClientError {
    fn from(err: LinkError) -> Self {
        ClientError::Link(err)
    }
}

impl From<CallError> for ClientError {
    fn from(err: CallError) -> Self {
        ClientError::Call(err)
    }
}

/// Settings of a broker client session.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub url: RpcUrl,
    /// How many reconnect attempts to make after a drop; negative means
    /// keep trying forever, `0` disables reconnecting.
    pub reconnects: i32,
    /// Server-side inactivity limit this client signs up for; pings go out
    /// after half of it passes without traffic.
    pub idle_timeout: Duration,
    pub app_name: String,
    pub app_version: String,
}

impl ClientConfig {
    pub fn new(url: RpcUrl) -> Self {
        Self {
            url,
            reconnects: -1,
            idle_timeout: Duration::from_secs(180),
            app_name: "shv-rs".into(),
            app_version: env!("CARGO_PKG_VERSION").into(),
        }
    }
}

struct ClientInner {
    config: ClientConfig,
    dispatcher: NodeDispatcher,
    peer: Mutex<Option<RpcPeer>>,
    ready: watch::Sender<bool>,
    subscriptions: Mutex<BTreeSet<RpcRI>>,
    stopped: AtomicBool,
}

/// Connection to an SHV broker: login, keepalive, reconnects and
/// subscription replay on top of [`RpcPeer`].
#[derive(Clone)]
pub struct ShvClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for ShvClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShvClient").finish_non_exhaustive()
    }
}

impl ShvClient {
    /// Dial the configured URL, log in and keep the session up.
    pub async fn connect(
        config: ClientConfig,
        node: Arc<dyn NodeHandler>,
    ) -> Result<Self, ClientError> {
        let link = connect_url(&config.url).await?;
        Self::with_link(link, config, node).await
    }

    /// Run a session over an already connected link.
    ///
    /// Reconnecting needs an address to dial, so it stays available only for
    /// sessions created through [`connect`](Self::connect).
    pub async fn with_link(
        link: Link,
        config: ClientConfig,
        node: Arc<dyn NodeHandler>,
    ) -> Result<Self, ClientError> {
        let dispatcher = NodeDispatcher::new(node, &config.app_name, &config.app_version);
        let (ready, _) = watch::channel(false);
        let inner = Arc::new(ClientInner {
            config,
            dispatcher,
            peer: Mutex::new(None),
            ready,
            subscriptions: Mutex::new(BTreeSet::new()),
            stopped: AtomicBool::new(false),
        });
        let client = Self { inner };

        let peer = RpcPeer::new(link);
        let run = {
            let peer = peer.clone();
            let handler: Arc<dyn MessageHandler> = Arc::new(ClientHandler {
                inner: Arc::downgrade(&client.inner),
            });
            tokio::spawn(async move { peer.run(handler).await })
        };
        if let Err(err) = client.login(&peer).await {
            peer.disconnect();
            return Err(err.into());
        }
        *client.inner.peer.lock() = Some(peer.clone());
        client.inner.ready.send_replace(true);
        tokio::spawn(supervise(client.inner.clone(), peer, run));
        Ok(client)
    }

    async fn login(&self, peer: &RpcPeer) -> Result<(), CallError> {
        let opts = CallOptions {
            attempts: 1,
            ..Default::default()
        };
        let hello = peer.call_with("", "hello", None, opts.clone()).await?;
        let nonce = hello
            .as_map()
            .and_then(|m| m.get("nonce"))
            .and_then(RpcValue::as_str)
            .unwrap_or("")
            .to_string();
        let param = self.inner.config.url.login.to_param(
            &nonce,
            Some(self.inner.config.idle_timeout.as_secs() as i64),
            false,
        );
        peer.call_with("", "login", Some(param), opts).await?;
        info!("logged in to {}", self.inner.config.url);
        Ok(())
    }

    /// Wait until a logged-in connection is available.
    async fn wait_ready(&self) -> Result<RpcPeer, CallError> {
        let mut ready = self.inner.ready.subscribe();
        loop {
            if self.inner.stopped.load(Ordering::Acquire) {
                return Err(CallError::Disconnected);
            }
            if *ready.borrow() {
                if let Some(peer) = self.inner.peer.lock().clone() {
                    return Ok(peer);
                }
            }
            if ready.changed().await.is_err() {
                return Err(CallError::Disconnected);
            }
        }
    }

    /// Call `method` on `path` through the broker session.
    pub async fn call(
        &self,
        path: &str,
        method: &str,
        param: Option<RpcValue>,
    ) -> Result<RpcValue, CallError> {
        self.call_with(path, method, param, CallOptions::default())
            .await
    }

    pub async fn call_with(
        &self,
        path: &str,
        method: &str,
        param: Option<RpcValue>,
        opts: CallOptions,
    ) -> Result<RpcValue, CallError> {
        let peer = self.wait_ready().await?;
        peer.call_with(path, method, param, opts).await
    }

    /// Emit a signal from this peer's own tree.
    pub fn send_signal(
        &self,
        path: &str,
        signal: &str,
        source: &str,
        param: Option<RpcValue>,
        access: shv_rpc::RpcAccess,
    ) -> Result<(), CallError> {
        let peer = self
            .inner
            .peer
            .lock()
            .clone()
            .ok_or(CallError::Disconnected)?;
        peer.send(RpcMessage::signal(path, signal, source, param, access))
    }

    /// Register interest in signals matching `ri`.
    ///
    /// The subscription survives reconnects: it is replayed after every
    /// login. Returns whether the broker newly added it.
    pub async fn subscribe(&self, ri: RpcRI) -> Result<bool, CallError> {
        let peer = self.wait_ready().await?;
        let newly = subscribe_on(&peer, &ri).await?;
        self.inner.subscriptions.lock().insert(ri);
        Ok(newly)
    }

    /// Drop a previously registered subscription.
    pub async fn unsubscribe(&self, ri: &RpcRI) -> Result<bool, CallError> {
        if !self.inner.subscriptions.lock().remove(ri) {
            return Ok(false);
        }
        let peer = self.wait_ready().await?;
        let removed = if peer.peer_is_shv3().await {
            peer.call(
                ".broker/currentClient",
                "unsubscribe",
                Some(ri.to_string().into()),
            )
            .await?
        } else {
            peer.call(".broker/app", "unsubscribe", Some(ri.to_legacy_subscription()?))
                .await?
        };
        Ok(removed.as_bool().unwrap_or(false))
    }

    /// The currently registered subscriptions.
    pub fn subscriptions(&self) -> Vec<RpcRI> {
        self.inner.subscriptions.lock().iter().cloned().collect()
    }

    pub fn is_connected(&self) -> bool {
        self.inner
            .peer
            .lock()
            .as_ref()
            .is_some_and(RpcPeer::is_connected)
    }

    /// Tear the session down; no reconnect follows.
    pub fn disconnect(&self) {
        self.inner.stopped.store(true, Ordering::Release);
        if let Some(peer) = self.inner.peer.lock().clone() {
            peer.disconnect();
        }
        self.inner.ready.send_replace(false);
    }
}

async fn subscribe_on(peer: &RpcPeer, ri: &RpcRI) -> Result<bool, CallError> {
    let res = if peer.peer_is_shv3().await {
        peer.call(
            ".broker/currentClient",
            "subscribe",
            Some(ri.to_string().into()),
        )
        .await?
    } else {
        peer.call(".broker/app", "subscribe", Some(ri.to_legacy_subscription()?))
            .await?
    };
    Ok(res.as_bool().unwrap_or(false))
}

/// Re-install every registered subscription, after login or re-login.
async fn replay_subscriptions(inner: &Arc<ClientInner>, peer: &RpcPeer) {
    let subscriptions: Vec<RpcRI> = inner.subscriptions.lock().iter().cloned().collect();
    for ri in subscriptions {
        if let Err(err) = subscribe_on(peer, &ri).await {
            warn!("failed to replay subscription {ri}: {err}");
        }
    }
}

/// Client side message dispatch: the node tree plus re-login on RESET.
struct ClientHandler {
    inner: std::sync::Weak<ClientInner>,
}

impl MessageHandler for ClientHandler {
    fn handle(&self, peer: RpcPeer, msg: RpcMessage) -> BoxFuture<'static, ()> {
        match self.inner.upgrade() {
            Some(inner) => inner.dispatcher.handle(peer, msg),
            None => Box::pin(async {}),
        }
    }

    fn reset(&self, peer: RpcPeer) -> BoxFuture<'static, ()> {
        let Some(inner) = self.inner.upgrade() else {
            return Box::pin(async {});
        };
        Box::pin(async move {
            debug!("peer reset, restarting login");
            inner.ready.send_replace(false);
            // Detached: the login exchange needs the message pump that
            // called us to keep reading.
            tokio::spawn(async move {
                let client = ShvClient {
                    inner: inner.clone(),
                };
                match client.login(&peer).await {
                    Ok(()) => {
                        replay_subscriptions(&inner, &peer).await;
                        inner.ready.send_replace(true);
                    }
                    Err(err) => {
                        warn!("login after reset failed: {err}");
                        peer.disconnect();
                    }
                }
            });
        })
    }
}

/// Keep the session alive: ping on idle, reconnect with backoff on drop.
async fn supervise(
    inner: Arc<ClientInner>,
    mut peer: RpcPeer,
    mut run: tokio::task::JoinHandle<()>,
) {
    let mut attempt: u32 = 0;
    loop {
        let activity = tokio::spawn(activity_loop(inner.clone(), peer.clone()));
        let _ = (&mut run).await;
        activity.abort();
        inner.ready.send_replace(false);
        *inner.peer.lock() = None;

        if inner.stopped.load(Ordering::Acquire) || inner.config.reconnects == 0 {
            break;
        }
        // Reconnect with bounded exponential backoff.
        let reconnected = loop {
            if inner.config.reconnects > 0 && attempt >= inner.config.reconnects as u32 {
                break None;
            }
            attempt += 1;
            let delay = Duration::from_secs(60u64.min(1u64 << attempt.min(6)));
            debug!("reconnecting to {} in {delay:?}", inner.config.url);
            tokio::time::sleep(delay).await;
            match connect_url(&inner.config.url).await {
                Ok(link) => break Some(RpcPeer::new(link)),
                Err(err) => debug!("reconnect failed: {err}"),
            }
        };
        let Some(new_peer) = reconnected else { break };
        peer = new_peer;
        run = {
            let peer = peer.clone();
            let handler: Arc<dyn MessageHandler> = Arc::new(ClientHandler {
                inner: Arc::downgrade(&inner),
            });
            tokio::spawn(async move { peer.run(handler).await })
        };
        let client = ShvClient {
            inner: inner.clone(),
        };
        match client.login(&peer).await {
            Ok(()) => {
                attempt = 0;
                replay_subscriptions(&inner, &peer).await;
                *inner.peer.lock() = Some(peer.clone());
                inner.ready.send_replace(true);
            }
            Err(err) => {
                warn!("login failed: {err}");
                peer.disconnect();
            }
        }
    }
    inner.ready.send_replace(false);
}

/// Ping whenever half of the idle window passes without outbound traffic.
async fn activity_loop(inner: Arc<ClientInner>, peer: RpcPeer) {
    let half = inner.config.idle_timeout / 2;
    loop {
        let idle = peer.idle_send();
        if idle < half {
            tokio::time::sleep(half - idle).await;
            continue;
        }
        let path = if peer.peer_is_shv3().await {
            ".app"
        } else {
            ".broker/app"
        };
        if peer.send(RpcMessage::request(path, "ping", None)).is_err() {
            break;
        }
        tokio::time::sleep(half).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::EmptyNode;
    use shv_rpc::{RpcError, param_str, sha1_hex};
    use shv_transport::Frame;
    use std::collections::BTreeMap;

    async fn fake_broker_step(link: &Link) -> RpcMessage {
        match link.receive().await.unwrap() {
            Frame::Message(payload) => crate::peer::decode_payload(&payload).unwrap(),
            Frame::Reset => panic!("unexpected reset"),
        }
    }

    async fn answer(link: &Link, msg: RpcMessage) {
        link.send(Frame::Message(crate::peer::encode_message(&msg)))
            .await
            .unwrap();
    }

    fn test_config() -> ClientConfig {
        let url = RpcUrl::parse("tcp://admin@test?password=admin!123").unwrap();
        let mut config = ClientConfig::new(url);
        config.reconnects = 0;
        config
    }

    /// Serve hello and login like a broker would, checking the password.
    async fn serve_login(link: &Link) {
        let hello = fake_broker_step(link).await;
        assert_eq!(hello.method(), Some("hello"));
        let mut resp = hello.make_response();
        let mut nonce = BTreeMap::new();
        nonce.insert("nonce".to_string(), RpcValue::from("1234567890"));
        resp.set_result(shv_value::Value::Map(nonce).into());
        answer(link, resp).await;

        let login = fake_broker_step(link).await;
        assert_eq!(login.method(), Some("login"));
        let param = login.param().unwrap();
        assert_eq!(param_str(param, &["login", "user"]), Some("admin"));
        assert_eq!(param_str(param, &["login", "type"]), Some("SHA1"));
        let expected = sha1_hex(&format!("1234567890{}", sha1_hex("admin!123")));
        assert_eq!(param_str(param, &["login", "password"]), Some(expected.as_str()));
        let mut resp = login.make_response();
        let mut result = BTreeMap::new();
        result.insert("clientId".to_string(), RpcValue::from(4));
        resp.set_result(shv_value::Value::Map(result).into());
        answer(link, resp).await;
    }

    #[tokio::test]
    async fn login_workflow() {
        let (client_link, broker_link) = Link::pair();
        let broker = tokio::spawn(async move {
            serve_login(&broker_link).await;
            broker_link
        });
        let client = ShvClient::with_link(client_link, test_config(), Arc::new(EmptyNode))
            .await
            .unwrap();
        let broker_link = broker.await.unwrap();
        assert!(client.is_connected());

        // Calls flow once logged in.
        let call = tokio::spawn({
            let client = client.clone();
            async move { client.call(".app", "ping", None).await }
        });
        let ping = fake_broker_step(&broker_link).await;
        assert_eq!(ping.method(), Some("ping"));
        let mut resp = ping.make_response();
        resp.set_result(RpcValue::null());
        answer(&broker_link, resp).await;
        assert!(call.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn failed_login_surfaces() {
        let (client_link, broker_link) = Link::pair();
        tokio::spawn(async move {
            let hello = fake_broker_step(&broker_link).await;
            let mut resp = hello.make_response();
            let mut nonce = BTreeMap::new();
            nonce.insert("nonce".to_string(), RpcValue::from("0000000000"));
            resp.set_result(shv_value::Value::Map(nonce).into());
            answer(&broker_link, resp).await;
            let login = fake_broker_step(&broker_link).await;
            let mut resp = login.make_response();
            resp.set_error(RpcError::method_call_exception("Invalid login"));
            answer(&broker_link, resp).await;
        });
        let res = ShvClient::with_link(client_link, test_config(), Arc::new(EmptyNode)).await;
        assert!(matches!(res, Err(ClientError::Call(CallError::Rpc(_)))));
    }

    #[tokio::test]
    async fn subscribe_targets_current_client() {
        let (client_link, broker_link) = Link::pair();
        let broker = tokio::spawn(async move {
            serve_login(&broker_link).await;
            broker_link
        });
        let client = ShvClient::with_link(client_link, test_config(), Arc::new(EmptyNode))
            .await
            .unwrap();
        let broker_link = broker.await.unwrap();

        let subscribe = tokio::spawn({
            let client = client.clone();
            async move { client.subscribe(RpcRI::parse("test/**:get:chng")).await }
        });
        // First the 3.x probe, then the subscribe call itself.
        let probe = fake_broker_step(&broker_link).await;
        assert_eq!(probe.method(), Some("shvVersionMajor"));
        let mut resp = probe.make_response();
        resp.set_result(3.into());
        answer(&broker_link, resp).await;

        let sub = fake_broker_step(&broker_link).await;
        assert_eq!(sub.path(), ".broker/currentClient");
        assert_eq!(sub.method(), Some("subscribe"));
        assert_eq!(sub.param().unwrap().as_str(), Some("test/**:get:chng"));
        let mut resp = sub.make_response();
        resp.set_result(true.into());
        answer(&broker_link, resp).await;

        assert!(subscribe.await.unwrap().unwrap());
        assert_eq!(client.subscriptions().len(), 1);
    }
}
