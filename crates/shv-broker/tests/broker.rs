//! End-to-end broker scenarios over in-memory links.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use shv_broker::{AutosetupRule, BrokerConfig, BrokerRole, BrokerUser, RpcBroker};
use shv_client::{
    CallError, ClientConfig, ClientError, EmptyNode, NodeHandler, Request, ShvClient, Signal,
};
use shv_rpc::{DirFlags, RpcAccess, RpcDir, RpcError, RpcErrorCode, RpcRI, RpcUrl};
use shv_transport::Link;
use shv_value::{RpcValue, Value};
use tokio::sync::mpsc;

fn broker_config() -> BrokerConfig {
    let mut config = BrokerConfig::new("testbroker");
    config.add_role(BrokerRole::new(
        "admin",
        RpcAccess::Admin,
        vec![RpcRI::parse("**:*:*")],
    ));
    config.add_role(BrokerRole::new(
        "tester",
        RpcAccess::Write,
        vec![RpcRI::parse("test/**:*:*"), RpcRI::parse("a/**:*:*")],
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

fn client_url(user: &str, password: &str) -> RpcUrl {
    RpcUrl::parse(&format!("tcp://{user}@testbroker?password={password}")).unwrap()
}

async fn connect(
    broker: &RpcBroker,
    user: &str,
    password: &str,
    node: Arc<dyn NodeHandler>,
    mount: Option<&str>,
) -> Result<ShvClient, ClientError> {
    let (client_link, broker_link) = Link::pair();
    broker.accept(broker_link);
    let mut url = client_url(user, password);
    url.login.device_mount_point = mount.map(str::to_string);
    if mount.is_some() {
        url.login.device_id = Some("testdevice".into());
    }
    let mut config = ClientConfig::new(url);
    config.reconnects = 0;
    config.app_name = "testclient".into();
    ShvClient::with_link(client_link, config, node).await
}

/// Device node used by routing tests: serves `foo.get` and remembers the
/// requests it saw.
struct Device {
    seen: Mutex<Vec<(String, Option<String>)>>,
}

impl Device {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            seen: Mutex::new(Vec::new()),
        })
    }
}

impl NodeHandler for Device {
    fn children(&self, path: &str) -> Vec<String> {
        match path {
            "" => vec!["foo".into()],
            _ => Vec::new(),
        }
    }

    fn describe(&self, path: &str) -> Vec<RpcDir> {
        match path {
            "foo" => vec![
                RpcDir::getter("get", "n", "i"),
                RpcDir::new("log")
                    .with_access(RpcAccess::Read)
                    .with_flags(DirFlags::USER_ID_REQUIRED),
            ],
            _ => Vec::new(),
        }
    }

    fn invoke<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<RpcValue, RpcError>> {
        Box::pin(async move {
            self.seen
                .lock()
                .push((request.path.clone(), request.user_id.clone()));
            match (request.path.as_str(), request.method.as_str()) {
                ("foo", "get") => Ok(7.into()),
                ("foo", "log") => Ok(request.user_id.clone().unwrap_or_default().into()),
                _ => Err(RpcError::method_not_found("No such path or method")),
            }
        })
    }
}

/// Node collecting signals it receives.
struct SignalSink {
    tx: mpsc::UnboundedSender<Signal>,
}

impl NodeHandler for SignalSink {
    fn on_signal(&self, signal: Signal) {
        let _ = self.tx.send(signal);
    }
}

fn signal_sink() -> (Arc<SignalSink>, mpsc::UnboundedReceiver<Signal>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(SignalSink { tx }), rx)
}

#[tokio::test]
async fn echo_ping() {
    let _ = tracing_subscriber::fmt().with_env_filter("debug").try_init();
    let broker = RpcBroker::new(broker_config());
    let client = connect(&broker, "admin", "admin!123", Arc::new(EmptyNode), None)
        .await
        .unwrap();
    assert!(client.call(".app", "ping", None).await.unwrap().is_null());
}

#[tokio::test]
async fn wrong_password_fails_login() {
    let broker = RpcBroker::new(broker_config());
    let res = connect(&broker, "admin", "nope", Arc::new(EmptyNode), None).await;
    match res {
        Err(ClientError::Call(CallError::Rpc(err))) => {
            assert_eq!(err.code, RpcErrorCode::MethodCallException);
            assert_eq!(err.message, "Invalid login");
        }
        other => panic!("unexpected: {other:?}"),
    }
}

#[tokio::test]
async fn plain_login_against_sha1_secret() {
    let mut config = broker_config();
    let sha1 = shv_rpc::sha1_hex("secret");
    config.add_user(BrokerUser::new_sha1("hashed", &sha1, vec!["admin".into()]));
    let broker = RpcBroker::new(config);
    let client = connect(&broker, "hashed", "secret", Arc::new(EmptyNode), None)
        .await
        .unwrap();
    assert!(client.call(".app", "ping", None).await.is_ok());
}

#[tokio::test]
async fn request_routing_strips_mount_prefix() {
    let broker = RpcBroker::new(broker_config());
    let device = Device::new();
    let _dev = connect(
        &broker,
        "test",
        "test",
        device.clone(),
        Some("test/device"),
    )
    .await
    .unwrap();
    let client = connect(&broker, "admin", "admin!123", Arc::new(EmptyNode), None)
        .await
        .unwrap();

    let res = client.call("test/device/foo", "get", None).await.unwrap();
    assert_eq!(res, RpcValue::from(7));
    // The device saw the path relative to its mount.
    assert_eq!(device.seen.lock()[0].0, "foo");
}

#[tokio::test]
async fn longest_mount_prefix_wins() {
    let broker = RpcBroker::new(broker_config());
    let deep = Device::new();
    let shallow = Device::new();
    let _a = connect(&broker, "admin", "admin!123", deep.clone(), Some("x/y"))
        .await
        .unwrap();
    let _b = connect(&broker, "admin", "admin!123", shallow.clone(), Some("x"))
        .await
        .err()
        .map(|_| ());
    // Mounting x while x/y is held is refused, so remount elsewhere.
    let _b = connect(&broker, "admin", "admin!123", shallow.clone(), Some("z"))
        .await
        .unwrap();
    let client = connect(&broker, "admin", "admin!123", Arc::new(EmptyNode), None)
        .await
        .unwrap();
    let res = client.call("x/y/foo", "get", None).await.unwrap();
    assert_eq!(res, RpcValue::from(7));
    assert_eq!(deep.seen.lock()[0].0, "foo");
    assert!(shallow.seen.lock().is_empty());
}

#[tokio::test]
async fn mount_collisions_fail_login() {
    let broker = RpcBroker::new(broker_config());
    let _holder = connect(
        &broker,
        "admin",
        "admin!123",
        Arc::new(EmptyNode),
        Some("x/y"),
    )
    .await
    .unwrap();
    for mount in ["x/y", "x/y/w", "x"] {
        let res = connect(&broker, "admin", "admin!123", Arc::new(EmptyNode), Some(mount)).await;
        match res {
            Err(ClientError::Call(CallError::Rpc(err))) => {
                assert_eq!(err.message, "Mount point already mounted", "mount {mount}");
            }
            other => panic!("mount {mount} unexpectedly gave {other:?}"),
        }
    }
}

#[tokio::test]
async fn no_access_is_method_not_found() {
    let broker = RpcBroker::new(broker_config());
    let device = Device::new();
    let _dev = connect(&broker, "admin", "admin!123", device, Some("private/dev"))
        .await
        .unwrap();
    // The "test" user has no role covering the private subtree.
    let client = connect(&broker, "test", "test", Arc::new(EmptyNode), None)
        .await
        .unwrap();
    match client.call("private/dev/foo", "get", None).await {
        Err(CallError::Rpc(err)) => {
            assert_eq!(err.code, RpcErrorCode::MethodNotFound);
            assert_eq!(err.message, "No access");
        }
        other => panic!("unexpected: {other:?}"),
    }
}

#[tokio::test]
async fn signal_fanout_with_mount_prefix() {
    let broker = RpcBroker::new(broker_config());
    let device = connect(
        &broker,
        "test",
        "test",
        Arc::new(EmptyNode),
        Some("test/dev"),
    )
    .await
    .unwrap();

    let (sink_x, mut rx_x) = signal_sink();
    let x = connect(&broker, "admin", "admin!123", sink_x, None)
        .await
        .unwrap();
    x.subscribe(RpcRI::parse("test/**:get:chng")).await.unwrap();

    let (sink_y, mut rx_y) = signal_sink();
    let y = connect(&broker, "admin", "admin!123", sink_y, None)
        .await
        .unwrap();
    y.subscribe(RpcRI::parse("**:get:*")).await.unwrap();

    device
        .send_signal("state", "chng", "get", Some(3.into()), RpcAccess::Read)
        .unwrap();

    for rx in [&mut rx_x, &mut rx_y] {
        let signal = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("signal delivered")
            .unwrap();
        assert_eq!(signal.path, "test/dev/state");
        assert_eq!(signal.signal, "chng");
        assert_eq!(signal.source, "get");
        assert_eq!(signal.param, Some(RpcValue::from(3)));
    }
}

#[tokio::test]
async fn signals_filtered_by_subscription_and_access() {
    let broker = RpcBroker::new(broker_config());
    let device = connect(
        &broker,
        "admin",
        "admin!123",
        Arc::new(EmptyNode),
        Some("private/dev"),
    )
    .await
    .unwrap();

    // The "test" user subscribes everywhere but has no access to the
    // private subtree, so nothing arrives.
    let (sink, mut rx) = signal_sink();
    let listener = connect(&broker, "test", "test", sink, None).await.unwrap();
    listener.subscribe(RpcRI::parse("**:get:*")).await.unwrap();

    device
        .send_signal("state", "chng", "get", None, RpcAccess::Read)
        .unwrap();
    assert!(
        tokio::time::timeout(Duration::from_millis(300), rx.recv())
            .await
            .is_err()
    );
}

#[tokio::test]
async fn lsmod_on_mount_and_disconnect() {
    let broker = RpcBroker::new(broker_config());
    let _existing = connect(
        &broker,
        "admin",
        "admin!123",
        Arc::new(EmptyNode),
        Some("a/x"),
    )
    .await
    .unwrap();

    let (sink, mut rx) = signal_sink();
    let listener = connect(&broker, "admin", "admin!123", sink, None)
        .await
        .unwrap();
    listener.subscribe(RpcRI::parse("**:ls:lsmod")).await.unwrap();

    let device = connect(
        &broker,
        "admin",
        "admin!123",
        Arc::new(EmptyNode),
        Some("a/b/c"),
    )
    .await
    .unwrap();

    let signal = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("lsmod emitted")
        .unwrap();
    assert_eq!(signal.path, "a");
    assert_eq!(signal.signal, "lsmod");
    assert_eq!(signal.source, "ls");
    let mut expected = BTreeMap::new();
    expected.insert("b".to_string(), RpcValue::from(true));
    assert_eq!(signal.param, Some(Value::Map(expected).into()));

    device.disconnect();
    let signal = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("lsmod emitted on disconnect")
        .unwrap();
    assert_eq!(signal.path, "a");
    let mut expected = BTreeMap::new();
    expected.insert("b".to_string(), RpcValue::from(false));
    assert_eq!(signal.param, Some(Value::Map(expected).into()));
}

#[tokio::test]
async fn user_id_elevation_through_broker() {
    let broker = RpcBroker::new(broker_config());
    let device = Device::new();
    let _dev = connect(
        &broker,
        "test",
        "test",
        device.clone(),
        Some("test/device"),
    )
    .await
    .unwrap();
    let client = connect(&broker, "admin", "admin!123", Arc::new(EmptyNode), None)
        .await
        .unwrap();

    // The first attempt carries no user id; the device demands one and the
    // retried request arrives with the broker chain prepended.
    let res = client.call("test/device/foo", "log", None).await.unwrap();
    assert_eq!(res.as_str(), Some("testbroker:admin"));
}

#[tokio::test]
async fn broker_admin_subtree() {
    let broker = RpcBroker::new(broker_config());
    let _dev = connect(
        &broker,
        "test",
        "test",
        Arc::new(EmptyNode),
        Some("test/device"),
    )
    .await
    .unwrap();
    let admin = connect(&broker, "admin", "admin!123", Arc::new(EmptyNode), None)
        .await
        .unwrap();

    assert_eq!(
        admin.call(".broker", "name", None).await.unwrap(),
        RpcValue::from("testbroker")
    );
    let mounts = admin.call(".broker", "mounts", None).await.unwrap();
    assert_eq!(
        mounts.as_list().unwrap()[0].as_str(),
        Some("test/device")
    );
    let clients = admin.call(".broker", "clients", None).await.unwrap();
    assert_eq!(clients.as_list().unwrap().len(), 2);

    let info = admin
        .call(".broker/currentClient", "info", None)
        .await
        .unwrap();
    let info = info.as_imap().unwrap();
    assert_eq!(info.get(&2).unwrap().as_str(), Some("admin"));
    assert!(info.get(&3).unwrap().is_null());

    let mounted = admin
        .call(
            ".broker",
            "mountedClientInfo",
            Some("test/device/sub".into()),
        )
        .await
        .unwrap();
    let mounted = mounted.as_imap().unwrap();
    assert_eq!(mounted.get(&3).unwrap().as_str(), Some("test/device"));

    // The low-privilege user is kept out of the admin methods.
    let user = connect(&broker, "test", "test", Arc::new(EmptyNode), None)
        .await
        .unwrap();
    match user.call(".broker", "clients", None).await {
        Err(CallError::Rpc(err)) => assert_eq!(err.code, RpcErrorCode::MethodNotFound),
        other => panic!("unexpected: {other:?}"),
    }
}

#[tokio::test]
async fn subscriptions_listed_and_removed() {
    let broker = RpcBroker::new(broker_config());
    let client = connect(&broker, "admin", "admin!123", Arc::new(EmptyNode), None)
        .await
        .unwrap();
    let ri = RpcRI::parse("test/**:get:chng");
    assert!(client.subscribe(ri.clone()).await.unwrap());

    let listed = client
        .call(".broker/currentClient", "subscriptions", None)
        .await
        .unwrap();
    assert_eq!(
        listed.as_list().unwrap()[0].as_str(),
        Some("test/**::chng")
    );

    assert!(client.unsubscribe(&ri).await.unwrap());
    let listed = client
        .call(".broker/currentClient", "subscriptions", None)
        .await
        .unwrap();
    assert!(listed.as_list().unwrap().is_empty());
}

#[tokio::test]
async fn disconnect_client_by_admin() {
    let broker = RpcBroker::new(broker_config());
    let victim = connect(&broker, "test", "test", Arc::new(EmptyNode), None)
        .await
        .unwrap();
    let admin = connect(&broker, "admin", "admin!123", Arc::new(EmptyNode), None)
        .await
        .unwrap();
    let clients = admin.call(".broker", "clients", None).await.unwrap();
    let victim_id = clients.as_list().unwrap()[0].as_int().unwrap();
    admin
        .call(".broker", "disconnectClient", Some(victim_id.into()))
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while victim.is_connected() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("victim disconnected");
}

#[tokio::test]
async fn autosetup_generates_mount() {
    let mut config = broker_config();
    config
        .autosetup
        .push(AutosetupRule::new("testdevice", "test/%d%i"));
    let broker = RpcBroker::new(config);
    // Devices pass a device id but no explicit mount point.
    let mut url = client_url("admin", "admin!123");
    url.login.device_id = Some("testdevice".into());
    for expected in ["test/testdevice", "test/testdevice1"] {
        let (client_link, broker_link) = Link::pair();
        broker.accept(broker_link);
        let mut cfg = ClientConfig::new(url.clone());
        cfg.reconnects = 0;
        let _client = ShvClient::with_link(client_link, cfg, Arc::new(EmptyNode))
            .await
            .unwrap();
        let admin = connect(&broker, "admin", "admin!123", Arc::new(EmptyNode), None)
            .await
            .unwrap();
        let mounts = admin.call(".broker", "mounts", None).await.unwrap();
        let mounts: Vec<&str> = mounts
            .as_list()
            .unwrap()
            .iter()
            .filter_map(|v| v.as_str())
            .collect();
        assert!(mounts.contains(&expected), "{expected} in {mounts:?}");
        admin.disconnect();
    }
}

/// A peer that looks like a sub-broker: it serves `.broker` and records the
/// subscribe calls forwarded to it.
struct FakeSubBroker {
    subscribes: Mutex<Vec<(String, String)>>,
}

impl FakeSubBroker {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            subscribes: Mutex::new(Vec::new()),
        })
    }
}

impl NodeHandler for FakeSubBroker {
    fn children(&self, path: &str) -> Vec<String> {
        match path {
            "" => vec![".broker".into()],
            ".broker" => vec!["currentClient".into()],
            _ => Vec::new(),
        }
    }

    fn describe(&self, path: &str) -> Vec<RpcDir> {
        match path {
            ".broker/currentClient" => vec![
                RpcDir::new("subscribe").with_param("s").with_result("b"),
                RpcDir::new("unsubscribe").with_param("s").with_result("b"),
            ],
            _ => Vec::new(),
        }
    }

    fn invoke<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<RpcValue, RpcError>> {
        Box::pin(async move {
            match (request.path.as_str(), request.method.as_str()) {
                (".broker/currentClient", method @ ("subscribe" | "unsubscribe")) => {
                    let ri = request
                        .param
                        .as_ref()
                        .and_then(|p| p.as_str())
                        .unwrap_or_default()
                        .to_string();
                    self.subscribes.lock().push((method.to_string(), ri));
                    Ok(true.into())
                }
                _ => Err(RpcError::method_not_found("No such path or method")),
            }
        })
    }
}

#[tokio::test]
async fn subbroker_subscription_forwarding() {
    let broker = RpcBroker::new(broker_config());
    let sub = FakeSubBroker::new();
    let _sub_conn = connect(&broker, "admin", "admin!123", sub.clone(), Some("m"))
        .await
        .unwrap();

    let client = connect(&broker, "admin", "admin!123", Arc::new(EmptyNode), None)
        .await
        .unwrap();

    // Wait for the sub-broker probe to finish.
    tokio::time::sleep(Duration::from_millis(200)).await;

    // First matching subscription is forwarded relative to the mount.
    client.subscribe(RpcRI::parse("m/a/**:get")).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if !sub.subscribes.lock().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("forwarded subscribe");
    assert_eq!(
        sub.subscribes.lock().clone(),
        vec![("subscribe".to_string(), "a/**:get".to_string())]
    );

    // A second RI with the same relative form only counts.
    client.subscribe(RpcRI::parse("*/a/**:get")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(sub.subscribes.lock().len(), 1);

    // Unsubscribes drop the forward when the last reference goes away.
    client.unsubscribe(&RpcRI::parse("m/a/**:get")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(sub.subscribes.lock().len(), 1);
    client.unsubscribe(&RpcRI::parse("*/a/**:get")).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if sub.subscribes.lock().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("forwarded unsubscribe");
    assert_eq!(
        sub.subscribes.lock()[1],
        ("unsubscribe".to_string(), "a/**:get".to_string())
    );
}

#[tokio::test]
async fn discovery_over_mount_tree() {
    let broker = RpcBroker::new(broker_config());
    let _dev = connect(
        &broker,
        "admin",
        "admin!123",
        Device::new(),
        Some("test/device"),
    )
    .await
    .unwrap();
    let client = connect(&broker, "admin", "admin!123", Arc::new(EmptyNode), None)
        .await
        .unwrap();

    let root = client.call("", "ls", None).await.unwrap();
    let root: Vec<&str> = root
        .as_list()
        .unwrap()
        .iter()
        .filter_map(|v| v.as_str())
        .collect();
    assert!(root.contains(&".app"));
    assert!(root.contains(&".broker"));
    assert!(root.contains(&"test"));

    // An intermediate mount-tree node is served by the broker...
    let test = client.call("test", "ls", None).await.unwrap();
    assert_eq!(test.as_list().unwrap()[0].as_str(), Some("device"));
    // ...while the mount itself is served by the device.
    let device = client.call("test/device", "ls", None).await.unwrap();
    assert_eq!(device.as_list().unwrap().len(), 2);
}
