use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::runtime::Handle;

use tether::auth::DialAuth;
use tether::rpc::{ChannelKind, Metadata, RpcChannel, RpcRequest, RpcResponse};
use tether::session::{SESSION_METADATA_KEY, SessionService, StartSessionResponse};
use tether::{Client, Code, Connection, DialConfig, Dialer, LinkError, Status};

/// A local robot whose every service answers `DoCommand` by echoing the command.
#[derive(Default)]
struct LocalRobot {
    calls: Mutex<Vec<RpcRequest>>,
    expire_next: Mutex<bool>,
}

#[async_trait]
impl RpcChannel for LocalRobot {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Direct
    }

    async fn invoke(&self, request: RpcRequest) -> Result<RpcResponse, LinkError> {
        self.calls.lock().push(request.clone());
        if std::mem::take(&mut *self.expire_next.lock()) {
            return Err(Status::new(Code::InvalidArgument, "SESSION_EXPIRED").into());
        }
        let body: Value = serde_json::from_slice(&request.message).unwrap();
        let reply = serde_json::to_vec(&json!({ "result": body["command"] })).unwrap();
        Ok(RpcResponse::new(
            Metadata::new(),
            Box::pin(stream::iter(vec![Ok(Bytes::from(reply))])),
        ))
    }

    async fn close(&self) {}

    fn is_closed(&self) -> bool {
        false
    }
}

struct LocalDialer {
    robot: Arc<LocalRobot>,
}

#[async_trait]
impl Dialer for LocalDialer {
    async fn dial_webrtc(&self, _: &DialConfig, _: &DialAuth) -> Result<Connection, LinkError> {
        Err(Status::new(Code::Unavailable, "no signaling").into())
    }

    async fn dial_direct(&self, _: &DialConfig, _: &DialAuth) -> Result<Connection, LinkError> {
        Ok(Connection::direct(self.robot.clone()))
    }
}

#[derive(Default)]
struct Sessions {
    starts: AtomicU32,
    heartbeats: AtomicU32,
}

#[async_trait]
impl SessionService for Sessions {
    async fn start_session(&self, _resume: Option<&str>) -> Result<StartSessionResponse, LinkError> {
        let n = self.starts.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(StartSessionResponse {
            id: format!("session-{n}"),
            heartbeat_window_ms: Some(10_000),
        })
    }

    async fn send_heartbeat(&self, _id: &str) -> Result<(), LinkError> {
        self.heartbeats.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

async fn connected_client() -> (Client, Arc<LocalRobot>, Arc<Sessions>) {
    let robot = Arc::new(LocalRobot::default());
    let sessions = Arc::new(Sessions::default());
    let client = Client::builder(DialConfig::new("local-bot").no_reconnect(true))
        .dialer(Arc::new(LocalDialer {
            robot: robot.clone(),
        }))
        .session_service(sessions.clone())
        .heartbeat_runtime(Handle::current())
        .build()
        .unwrap();
    client.connect().await.unwrap();
    (client, robot, sessions)
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn calls_carry_one_session_id() {
    let (client, robot, sessions) = connected_client().await;
    let arm = client.service("acme.component.arm.v1.ArmService");

    let first = arm.do_command("arm-1", json!({"move": "home"})).await.unwrap();
    let second = arm.do_command("arm-1", json!({"move": "rest"})).await.unwrap();
    assert_eq!(first, json!({"move": "home"}));
    assert_eq!(second, json!({"move": "rest"}));
    assert_eq!(sessions.starts.load(Ordering::SeqCst), 1);

    let calls = robot.calls.lock();
    assert_eq!(calls[0].method, "/acme.component.arm.v1.ArmService/DoCommand");
    for call in calls.iter() {
        assert_eq!(call.metadata.get(SESSION_METADATA_KEY), Some("session-1"));
    }
    drop(calls);
    assert_eq!(client.session_id().as_deref(), Some("session-1"));
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn heartbeats_keep_running_while_idle() {
    let (client, _robot, sessions) = connected_client().await;
    client
        .service("acme.robot.v1.Base")
        .do_command("base", json!({}))
        .await
        .unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(10_500)).await;
    assert_eq!(sessions.heartbeats.load(Ordering::SeqCst), 5);
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn expired_session_surfaces_error_then_renews() {
    let (client, robot, sessions) = connected_client().await;
    let base = client.service("acme.robot.v1.Base");
    base.do_command("base", json!({})).await.unwrap();

    *robot.expire_next.lock() = true;
    let err = base.do_command("base", json!({})).await.unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
    assert_eq!(client.session_id(), None);

    base.do_command("base", json!({})).await.unwrap();
    assert_eq!(sessions.starts.load(Ordering::SeqCst), 2);
    assert_eq!(client.session_id().as_deref(), Some("session-2"));
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn disconnect_clears_the_session() {
    let (client, _robot, _sessions) = connected_client().await;
    client
        .service("acme.robot.v1.Base")
        .do_command("base", json!({}))
        .await
        .unwrap();
    assert!(client.session_id().is_some());

    client.disconnect().await;
    assert_eq!(client.session_id(), None);
    let err = client
        .service("acme.robot.v1.Base")
        .do_command("base", json!({}))
        .await
        .unwrap_err();
    assert!(err.is_connection_closed());
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn disabled_sessions_send_no_header() {
    let robot = Arc::new(LocalRobot::default());
    let sessions = Arc::new(Sessions::default());
    let client = Client::builder(DialConfig::new("bot.local").disable_sessions(true))
        .dialer(Arc::new(LocalDialer {
            robot: robot.clone(),
        }))
        .session_service(sessions.clone())
        .build()
        .unwrap();
    client.connect().await.unwrap();

    client
        .service("acme.robot.v1.Base")
        .do_command("base", json!({}))
        .await
        .unwrap();
    assert_eq!(sessions.starts.load(Ordering::SeqCst), 0);
    assert!(robot.calls.lock()[0].metadata.is_empty());
}
