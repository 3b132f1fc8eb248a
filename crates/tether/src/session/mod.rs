pub mod channel;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Code, LinkError};
use crate::rpc::{ChannelProvider, Metadata, ServiceStub};
use crate::runtime::{background_handle, spawn_with_handle};

pub use self::channel::SessionChannel;

/// Call metadata key carrying the session id.
pub const SESSION_METADATA_KEY: &str = "session-id";
pub const ROBOT_SERVICE: &str = "tether.robot.v1.RobotService";
const HEARTBEAT_FRACTION: u32 = 5;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StartSessionRequest {
    #[serde(default)]
    pub resume: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StartSessionResponse {
    pub id: String,
    #[serde(default)]
    pub heartbeat_window_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendSessionHeartbeatRequest {
    pub id: String,
}

/// The server side of session bookkeeping.
#[async_trait]
pub trait SessionService: Send + Sync {
    async fn start_session(&self, resume: Option<&str>) -> Result<StartSessionResponse, LinkError>;

    async fn send_heartbeat(&self, id: &str) -> Result<(), LinkError>;
}

/// Session calls over the raw (session-less) channel.
pub struct RpcSessionService {
    stub: ServiceStub,
}

impl RpcSessionService {
    pub fn new(provider: Arc<dyn ChannelProvider>) -> Self {
        Self {
            stub: ServiceStub::new(provider, ROBOT_SERVICE),
        }
    }
}

#[async_trait]
impl SessionService for RpcSessionService {
    async fn start_session(&self, resume: Option<&str>) -> Result<StartSessionResponse, LinkError> {
        let request = StartSessionRequest {
            resume: resume.unwrap_or_default().to_string(),
        };
        self.stub.unary("StartSession", &request).await
    }

    async fn send_heartbeat(&self, id: &str) -> Result<(), LinkError> {
        let request = SendSessionHeartbeatRequest { id: id.to_string() };
        let _: serde::de::IgnoredAny = self.stub.unary("SendSessionHeartbeat", &request).await?;
        Ok(())
    }
}

#[derive(Default)]
struct SessionState {
    id: Option<String>,
    // Survives reset so the next start can ask to resume it.
    last_id: Option<String>,
    unsupported: bool,
    heartbeat: Option<JoinHandle<()>>,
}

impl SessionState {
    fn known_metadata(&self) -> Option<Metadata> {
        if self.unsupported {
            return Some(Metadata::new());
        }
        self.id
            .as_ref()
            .map(|id| Metadata::new().with(SESSION_METADATA_KEY, id.clone()))
    }
}

/// Owns the session id and its heartbeat.
pub struct SessionManager {
    service: Arc<dyn SessionService>,
    state: Mutex<SessionState>,
    start_lock: AsyncMutex<()>,
    starting: AtomicBool,
    heartbeat_runtime: Option<Handle>,
    me: Weak<SessionManager>,
}

impl SessionManager {
    /// Heartbeats run on `heartbeat_runtime`, or on the background runtime when `None`.
    pub fn new(service: Arc<dyn SessionService>, heartbeat_runtime: Option<Handle>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            service,
            state: Mutex::new(SessionState::default()),
            start_lock: AsyncMutex::new(()),
            starting: AtomicBool::new(false),
            heartbeat_runtime,
            me: me.clone(),
        })
    }

    pub fn session_id(&self) -> Option<String> {
        self.state.lock().id.clone()
    }

    pub fn is_unsupported(&self) -> bool {
        self.state.lock().unsupported
    }

    /// Metadata to attach to the next call, starting a session if none is known.
    pub async fn metadata(&self) -> Result<Metadata, LinkError> {
        if let Some(metadata) = self.state.lock().known_metadata() {
            return Ok(metadata);
        }
        let _start = self.start_lock.lock().await;
        if let Some(metadata) = self.state.lock().known_metadata() {
            return Ok(metadata);
        }
        self.starting.store(true, Ordering::SeqCst);
        let result = self.start().await;
        self.starting.store(false, Ordering::SeqCst);
        result
    }

    async fn start(&self) -> Result<Metadata, LinkError> {
        let resume = self.state.lock().last_id.clone();
        let response = match self.service.start_session(resume.as_deref()).await {
            Ok(response) => response,
            Err(err) if err.code() == Code::Unimplemented => {
                info!(target: "tether::session", "sessions not supported by remote");
                self.state.lock().unsupported = true;
                return Ok(Metadata::new());
            }
            Err(err) => return Err(err),
        };
        let window = match response.heartbeat_window_ms {
            Some(ms) if ms > 0 => Duration::from_millis(ms),
            _ => {
                return Err(LinkError::Protocol(
                    "session started without a heartbeat window".into(),
                ));
            }
        };

        let interval = window / HEARTBEAT_FRACTION;
        debug!(
            target: "tether::session",
            session = %response.id,
            resumed = resume.as_deref() == Some(response.id.as_str()),
            interval_ms = interval.as_millis() as u64,
            "session started"
        );
        let heartbeat = self.spawn_heartbeat(response.id.clone(), interval);
        let mut state = self.state.lock();
        if let Some(previous) = state.heartbeat.replace(heartbeat) {
            previous.abort();
        }
        state.id = Some(response.id.clone());
        state.last_id = Some(response.id.clone());
        Ok(Metadata::new().with(SESSION_METADATA_KEY, response.id))
    }

    fn spawn_heartbeat(&self, id: String, interval: Duration) -> JoinHandle<()> {
        let service = self.service.clone();
        let manager = self.me.clone();
        let handle = self
            .heartbeat_runtime
            .clone()
            .unwrap_or_else(background_handle);
        spawn_with_handle(Some(&handle), async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            loop {
                ticker.tick().await;
                match service.send_heartbeat(&id).await {
                    Ok(()) => {}
                    Err(err) if err.is_connection_closed() => {
                        debug!(target: "tether::session", session = %id, "connection closed, dropping session");
                        // Aborting our own handle only cancels at the next await.
                        if let Some(manager) = manager.upgrade() {
                            manager.reset();
                        }
                        return;
                    }
                    Err(err) => {
                        warn!(target: "tether::session", session = %id, error = %err, "heartbeat failed");
                    }
                }
            }
        })
    }

    /// Forget the session so the next call starts a new one. No-op while a start is in flight.
    pub fn reset(&self) {
        if self.starting.load(Ordering::SeqCst) {
            debug!(target: "tether::session", "reset ignored while a session is starting");
            return;
        }
        let mut state = self.state.lock();
        state.id = None;
        state.unsupported = false;
        if let Some(heartbeat) = state.heartbeat.take() {
            heartbeat.abort();
        }
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        if let Some(heartbeat) = self.state.get_mut().heartbeat.take() {
            heartbeat.abort();
        }
    }
}
