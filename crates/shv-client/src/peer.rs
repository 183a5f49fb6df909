use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use shv_rpc::{RpcError, RpcErrorCode, RpcMessage};
use shv_transport::{Frame, Link};
use shv_value::{CHAINPACK_PROTOCOL, CPON_PROTOCOL, ChainPackReader, ChainPackWriter, CponReader, RpcValue};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Failure of an outgoing RPC call.
#[derive(Debug)]
pub enum CallError {
    /// The peer answered with an error response.
    Rpc(RpcError),
    /// All attempts ran out without a response.
    Timeout,
    /// The connection went away while the call was outstanding.
    Disconnected,
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallError::Rpc(err) => write!(f, "{err}"),
            CallError::Timeout => write!(f, "call timed out"),
            CallError::Disconnected => write!(f, "peer disconnected"),
        }
    }
}

impl std::error::Error for CallError {}

impl From<RpcError> for CallError {
    fn from(err: RpcError) -> Self {
        CallError::Rpc(err)
    }
}

/// Knobs of the call protocol.
#[derive(Clone, Debug)]
pub struct CallOptions {
    /// How many times the request is sent before giving up; `0` means no
    /// bound.
    pub attempts: u32,
    /// How long to wait for any response activity before resending.
    pub query_timeout: Duration,
    /// Pause before resending after `TryAgainLater`.
    pub retry_timeout: Duration,
    /// User id supplied when the callee demands one.
    pub user_id: Option<String>,
    /// Access level claimed in the request. Left out by default; a broker on
    /// the way fills in the granted level.
    pub access: Option<shv_rpc::RpcAccess>,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            attempts: 3,
            query_timeout: Duration::from_secs(5),
            retry_timeout: Duration::from_millis(500),
            user_id: None,
            access: None,
        }
    }
}

enum CallUpdate {
    Message(Box<RpcMessage>),
    Reset,
}

/// Consumer of inbound messages the peer itself does not resolve.
///
/// The peer resolves responses addressed to its own outstanding calls;
/// requests, signals and routed responses land here. `handle` is called from
/// the reader task, so implementations spawn for anything slow.
pub trait MessageHandler: Send + Sync + 'static {
    fn handle(&self, peer: RpcPeer, msg: RpcMessage) -> BoxFuture<'static, ()>;

    /// Called after a RESET control message was processed.
    fn reset(&self, peer: RpcPeer) -> BoxFuture<'static, ()> {
        let _ = peer;
        Box::pin(async {})
    }
}

struct PeerShared {
    link: Link,
    sender: mpsc::UnboundedSender<RpcMessage>,
    calls: Mutex<HashMap<i64, mpsc::UnboundedSender<CallUpdate>>>,
    peer_shv3: Mutex<Option<bool>>,
    last_send: Arc<Mutex<Instant>>,
    last_receive: Mutex<Instant>,
    active: AtomicBool,
}

/// One SHV RPC connection: outbound queue, request correlation and reset
/// semantics.
///
/// Cloning is cheap and clones refer to the same connection.
#[derive(Clone)]
pub struct RpcPeer {
    shared: Arc<PeerShared>,
}

impl fmt::Debug for RpcPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcPeer").finish_non_exhaustive()
    }
}

impl RpcPeer {
    /// Wrap a connected link. The outbound writer task starts immediately;
    /// [`run`](Self::run) drives the inbound side.
    pub fn new(link: Link) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let last_send = Arc::new(Mutex::new(Instant::now()));
        tokio::spawn(writer_task(link.clone(), last_send.clone(), receiver));
        Self {
            shared: Arc::new(PeerShared {
                link,
                sender,
                calls: Mutex::new(HashMap::new()),
                peer_shv3: Mutex::new(None),
                last_send,
                last_receive: Mutex::new(Instant::now()),
                active: AtomicBool::new(true),
            }),
        }
    }

    /// Queue a message for sending.
    pub fn send(&self, msg: RpcMessage) -> Result<(), CallError> {
        self.shared
            .sender
            .send(msg)
            .map_err(|_| CallError::Disconnected)
    }

    /// Queue the RESET control message.
    pub async fn send_reset(&self) -> Result<(), CallError> {
        self.shared
            .link
            .send_reset()
            .await
            .map_err(|_| CallError::Disconnected)
    }

    pub fn is_connected(&self) -> bool {
        self.shared.active.load(Ordering::Acquire) && !self.shared.link.is_closed()
    }

    /// Close the connection; the reader loop ends shortly after.
    pub fn disconnect(&self) {
        self.shared.active.store(false, Ordering::Release);
        self.shared.link.close();
    }

    /// Time since the last outbound message.
    pub fn idle_send(&self) -> Duration {
        self.shared.last_send.lock().elapsed()
    }

    /// Time since the last inbound message.
    pub fn idle_receive(&self) -> Duration {
        self.shared.last_receive.lock().elapsed()
    }

    /// Inbound pump: dispatches messages until EOF or disconnect.
    ///
    /// Responses to this peer's own calls are resolved here; everything else
    /// goes through `handler`. Codec failures drop the frame and keep the
    /// connection up.
    pub async fn run(&self, handler: Arc<dyn MessageHandler>) {
        loop {
            let frame = match self.shared.link.receive().await {
                Ok(frame) => frame,
                Err(err) => {
                    if !err.is_eof() {
                        debug!("link failed: {err}");
                    }
                    break;
                }
            };
            *self.shared.last_receive.lock() = Instant::now();
            match frame {
                Frame::Reset => {
                    debug!("received RESET control message");
                    self.wake_all(true);
                    *self.shared.peer_shv3.lock() = None;
                    handler.reset(self.clone()).await;
                }
                Frame::Message(payload) => {
                    let Some(msg) = decode_payload(&payload) else {
                        continue;
                    };
                    if msg.is_response() && msg.caller_ids().is_empty() {
                        if let Some(rid) = msg.request_id() {
                            let slot = self.shared.calls.lock().get(&rid).cloned();
                            if let Some(slot) = slot {
                                let _ = slot.send(CallUpdate::Message(Box::new(msg)));
                                continue;
                            }
                        }
                        debug!("dropping response with unknown request id");
                        continue;
                    }
                    handler.handle(self.clone(), msg).await;
                }
            }
        }
        self.shared.active.store(false, Ordering::Release);
        self.shared.link.close();
        self.wake_all(false);
    }

    /// Wake every outstanding call, either as a retriable reset or by
    /// dropping the slots (disconnect).
    fn wake_all(&self, retriable: bool) {
        let mut calls = self.shared.calls.lock();
        if retriable {
            for slot in calls.values() {
                let _ = slot.send(CallUpdate::Reset);
            }
        } else {
            calls.clear();
        }
    }

    /// Call `method` on `path` with default options.
    pub async fn call(
        &self,
        path: &str,
        method: &str,
        param: Option<RpcValue>,
    ) -> Result<RpcValue, CallError> {
        self.call_with(path, method, param, CallOptions::default())
            .await
    }

    /// The full call protocol: resend on silence, follow progress, satisfy
    /// `UserIDRequired`, back off on `TryAgainLater`, abort on drop.
    pub async fn call_with(
        &self,
        path: &str,
        method: &str,
        param: Option<RpcValue>,
        opts: CallOptions,
    ) -> Result<RpcValue, CallError> {
        let mut request = RpcMessage::request(path, method, param);
        if opts.access.is_some() {
            request.set_access(opts.access);
        }
        let (tx, mut rx) = mpsc::unbounded_channel();
        let rid = request.request_id().expect("requests carry an id");
        self.shared.calls.lock().insert(rid, tx);
        let guard = CallGuard {
            shared: self.shared.clone(),
            rid: AtomicI64::new(rid),
            path: path.to_string(),
            method: method.to_string(),
            done: AtomicBool::new(false),
        };

        let mut attempt: u32 = 0;
        'resend: loop {
            if opts.attempts != 0 && attempt >= opts.attempts {
                guard.finish();
                return Err(CallError::Timeout);
            }
            attempt += 1;
            self.send(request.clone()).inspect_err(|_| guard.finish())?;

            loop {
                let update = match tokio::time::timeout(opts.query_timeout, rx.recv()).await {
                    Err(_) => continue 'resend,
                    Ok(None) => {
                        guard.finish();
                        return Err(CallError::Disconnected);
                    }
                    Ok(Some(update)) => update,
                };
                let resp = match update {
                    CallUpdate::Reset => continue 'resend,
                    CallUpdate::Message(resp) => resp,
                };
                if let Some(delay) = resp.delay() {
                    debug!("request {rid} progress: {delay:.2}");
                    continue;
                }
                if let Some(err) = resp.error() {
                    match err.code {
                        RpcErrorCode::UserIdRequired => {
                            request.set_user_id(Some(opts.user_id.as_deref().unwrap_or("")));
                            attempt -= 1;
                        }
                        RpcErrorCode::TryAgainLater => {
                            tokio::time::sleep(opts.retry_timeout).await;
                            attempt -= 1;
                        }
                        _ => {
                            guard.finish();
                            return Err(CallError::Rpc(err));
                        }
                    }
                    // Resend under a fresh request id, keeping the slot.
                    let old = guard.rid.load(Ordering::Relaxed);
                    let new = request.new_request_id();
                    let mut calls = self.shared.calls.lock();
                    if let Some(slot) = calls.remove(&old) {
                        calls.insert(new, slot);
                    }
                    drop(calls);
                    guard.rid.store(new, Ordering::Relaxed);
                    continue 'resend;
                }
                guard.finish();
                return Ok(resp.result().cloned().unwrap_or_else(RpcValue::null));
            }
        }
    }

    /// Check whether the peer speaks SHV 3.x, probing `.app` once.
    pub async fn peer_is_shv3(&self) -> bool {
        if let Some(cached) = *self.shared.peer_shv3.lock() {
            return cached;
        }
        let result = match self.call(".app", "shvVersionMajor", None).await {
            Ok(value) => value.as_int().is_some_and(|v| v >= 3),
            Err(_) => false,
        };
        *self.shared.peer_shv3.lock() = Some(result);
        result
    }

    /// Ping the peer over the path its generation understands.
    pub async fn ping(&self) -> Result<(), CallError> {
        let path = if self.peer_is_shv3().await {
            ".app"
        } else {
            ".broker/app"
        };
        self.call(path, "ping", None).await.map(|_| ())
    }

    /// `ls` on `path`, expecting the list form.
    pub async fn ls(&self, path: &str) -> Result<Vec<String>, CallError> {
        let res = self.call(path, "ls", None).await?;
        res.as_list()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .ok_or_else(|| {
                CallError::Rpc(RpcError::method_call_exception("invalid ls result"))
            })
    }

    /// `ls` existence check for a single child.
    pub async fn ls_has_child(&self, path: &str, name: &str) -> Result<bool, CallError> {
        let res = self.call(path, "ls", Some(name.into())).await?;
        res.as_bool().ok_or_else(|| {
            CallError::Rpc(RpcError::method_call_exception("invalid ls result"))
        })
    }

    /// `dir` on `path`, decoding the descriptor list.
    pub async fn dir(&self, path: &str) -> Result<Vec<shv_rpc::RpcDir>, CallError> {
        let res = self.call(path, "dir", None).await?;
        let items = res.as_list().ok_or_else(|| {
            CallError::Rpc(RpcError::method_call_exception("invalid dir result"))
        })?;
        items
            .iter()
            .map(|v| shv_rpc::RpcDir::from_value(v).map_err(CallError::Rpc))
            .collect()
    }
}

/// Pending-call registration: drops send an abort for calls that never
/// finished, which is how caller cancellation reaches the server.
struct CallGuard {
    shared: Arc<PeerShared>,
    rid: AtomicI64,
    path: String,
    method: String,
    done: AtomicBool,
}

impl CallGuard {
    fn finish(&self) {
        self.done.store(true, Ordering::Release);
        let rid = self.rid.load(Ordering::Relaxed);
        self.shared.calls.lock().remove(&rid);
    }
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        if self.done.load(Ordering::Acquire) {
            return;
        }
        let rid = self.rid.load(Ordering::Relaxed);
        self.shared.calls.lock().remove(&rid);
        let _ = self
            .shared
            .sender
            .send(RpcMessage::abort_request(rid, &self.path, &self.method));
    }
}

async fn writer_task(
    link: Link,
    last_send: Arc<Mutex<Instant>>,
    mut receiver: mpsc::UnboundedReceiver<RpcMessage>,
) {
    while let Some(msg) = receiver.recv().await {
        let payload = encode_message(&msg);
        *last_send.lock() = Instant::now();
        if let Err(err) = link.send(Frame::Message(payload)).await {
            if !err.is_eof() {
                warn!("failed to send message: {err}");
            }
            break;
        }
    }
    link.close();
}

/// ChainPack wire form of a message, with the protocol indicator.
pub(crate) fn encode_message(msg: &RpcMessage) -> Bytes {
    let mut payload = vec![CHAINPACK_PROTOCOL];
    let mut writer = ChainPackWriter::new(&mut payload);
    writer
        .write(&msg.to_value())
        .expect("write to Vec cannot fail");
    Bytes::from(payload)
}

/// Decode a frame payload in either codec; `None` drops the frame.
pub(crate) fn decode_payload(payload: &[u8]) -> Option<RpcMessage> {
    let (indicator, body) = payload.split_first()?;
    let value = match *indicator {
        CHAINPACK_PROTOCOL => ChainPackReader::unpack(body),
        CPON_PROTOCOL => CponReader::unpack(body),
        other => {
            debug!("dropping frame with unknown protocol {other}");
            return None;
        }
    };
    let value = match value {
        Ok(value) => value,
        Err(err) => {
            debug!("dropping undecodable frame: {err}");
            return None;
        }
    };
    match RpcMessage::from_value(value) {
        Some(msg) => Some(msg),
        None => {
            debug!("dropping frame that is not an RPC message");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Ignore;
    impl MessageHandler for Ignore {
        fn handle(&self, _peer: RpcPeer, _msg: RpcMessage) -> BoxFuture<'static, ()> {
            Box::pin(async {})
        }
    }

    fn pair() -> (RpcPeer, Link) {
        let (a, b) = Link::pair();
        let peer = RpcPeer::new(a);
        let run = peer.clone();
        tokio::spawn(async move { run.run(Arc::new(Ignore)).await });
        (peer, b)
    }

    async fn expect_request(link: &Link) -> RpcMessage {
        match link.receive().await.unwrap() {
            Frame::Message(payload) => decode_payload(&payload).unwrap(),
            Frame::Reset => panic!("unexpected reset"),
        }
    }

    async fn reply(link: &Link, msg: RpcMessage) {
        link.send(Frame::Message(encode_message(&msg))).await.unwrap();
    }

    #[tokio::test]
    async fn simple_call() {
        let (peer, link) = pair();
        let call = tokio::spawn(async move { peer.call("a/b", "get", None).await });
        let req = expect_request(&link).await;
        assert_eq!(req.path(), "a/b");
        assert_eq!(req.method(), Some("get"));
        let mut resp = req.make_response();
        resp.set_result(7.into());
        reply(&link, resp).await;
        assert_eq!(call.await.unwrap().unwrap(), RpcValue::from(7));
    }

    #[tokio::test]
    async fn error_response_raises() {
        let (peer, link) = pair();
        let call = tokio::spawn(async move { peer.call("x", "get", None).await });
        let req = expect_request(&link).await;
        let mut resp = req.make_response();
        resp.set_error(RpcError::method_not_found("no access"));
        reply(&link, resp).await;
        match call.await.unwrap() {
            Err(CallError::Rpc(err)) => assert_eq!(err.code, RpcErrorCode::MethodNotFound),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn progress_keeps_call_alive() {
        let (peer, link) = pair();
        let opts = CallOptions {
            query_timeout: Duration::from_millis(200),
            ..Default::default()
        };
        let call = tokio::spawn(async move {
            peer.call_with("slow", "work", None, opts).await
        });
        let req = expect_request(&link).await;
        let rid = req.request_id().unwrap();
        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(120)).await;
            reply(&link, RpcMessage::delay_response(rid, Vec::new(), 0.5)).await;
        }
        let mut resp = req.make_response();
        resp.set_result("done".into());
        reply(&link, resp).await;
        assert_eq!(call.await.unwrap().unwrap(), RpcValue::from("done"));
    }

    #[tokio::test]
    async fn timeout_resends_same_id() {
        let (peer, link) = pair();
        let opts = CallOptions {
            attempts: 2,
            query_timeout: Duration::from_millis(100),
            ..Default::default()
        };
        let call = tokio::spawn(async move { peer.call_with("x", "get", None, opts).await });
        let first = expect_request(&link).await;
        let second = expect_request(&link).await;
        assert_eq!(first.request_id(), second.request_id());
        assert!(matches!(call.await.unwrap(), Err(CallError::Timeout)));
    }

    #[tokio::test]
    async fn user_id_elevation() {
        let (peer, link) = pair();
        let call = tokio::spawn(async move { peer.call("x", "op", None).await });
        let req = expect_request(&link).await;
        assert_eq!(req.user_id(), None);
        let mut resp = req.make_response();
        resp.set_error(RpcError::user_id_required("user id needed"));
        reply(&link, resp).await;

        let retry = expect_request(&link).await;
        assert_eq!(retry.user_id(), Some(""));
        assert_ne!(retry.request_id(), req.request_id());
        let mut resp = retry.make_response();
        resp.set_result(1.into());
        reply(&link, resp).await;
        assert_eq!(call.await.unwrap().unwrap(), RpcValue::from(1));
    }

    #[tokio::test]
    async fn try_again_later_backs_off() {
        let (peer, link) = pair();
        let opts = CallOptions {
            retry_timeout: Duration::from_millis(10),
            ..Default::default()
        };
        let call = tokio::spawn(async move { peer.call_with("x", "get", None, opts).await });
        let req = expect_request(&link).await;
        let mut resp = req.make_response();
        resp.set_error(RpcError::new(RpcErrorCode::TryAgainLater, "busy"));
        reply(&link, resp).await;

        let retry = expect_request(&link).await;
        assert_ne!(retry.request_id(), req.request_id());
        let mut resp = retry.make_response();
        resp.set_result(2.into());
        reply(&link, resp).await;
        assert_eq!(call.await.unwrap().unwrap(), RpcValue::from(2));
    }

    #[tokio::test]
    async fn dropped_call_sends_abort() {
        let (peer, link) = pair();
        let call = tokio::spawn({
            let peer = peer.clone();
            async move { peer.call("x", "get", None).await }
        });
        let req = expect_request(&link).await;
        call.abort();
        let abort = expect_request(&link).await;
        assert!(abort.is_abort());
        assert_eq!(abort.request_id(), req.request_id());
    }

    #[tokio::test]
    async fn eof_wakes_callers() {
        let (peer, link) = pair();
        let call = tokio::spawn(async move { peer.call("x", "get", None).await });
        let _ = expect_request(&link).await;
        link.close();
        drop(link);
        assert!(matches!(call.await.unwrap(), Err(CallError::Disconnected)));
    }
}
