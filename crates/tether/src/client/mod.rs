pub mod dialer;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{Mutex as AsyncMutex, broadcast, watch};
use tracing::{debug, info, warn};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;

use crate::auth::{CredentialsExchange, DialAuth};
use crate::config::{AbortHandle, DialConfig};
use crate::error::{Code, ConfigError, DialFailure, LinkError};
use crate::events::{ClientEvent, ConnectionState, DialMethod, EventHub, EventKind};
use crate::retry::{RetryPolicy, retry};
use crate::rpc::direct::{LocalHostPredicate, default_local_predicate};
use crate::rpc::{ChannelProvider, RpcChannel, ServiceStub};
use crate::runtime::spawn_with_handle;
use crate::session::{RpcSessionService, SessionChannel, SessionManager, SessionService};
use crate::webrtc::handle::{PeerEvent, PeerEventKind, PeerHandle};

pub use self::dialer::{Connection, Dialer, HandlerSlots, NetworkDialer};

pub struct ClientBuilder {
    config: DialConfig,
    dialer: Arc<dyn Dialer>,
    local_predicate: LocalHostPredicate,
    session_service: Option<Arc<dyn SessionService>>,
    exchange: Option<Arc<dyn CredentialsExchange>>,
    heartbeat_runtime: Option<Handle>,
}

impl ClientBuilder {
    pub fn dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = dialer;
        self
    }

    /// Replace the check that decides whether a host may be dialed directly.
    pub fn local_predicate(mut self, predicate: LocalHostPredicate) -> Self {
        self.local_predicate = predicate;
        self
    }

    pub fn session_service(mut self, service: Arc<dyn SessionService>) -> Self {
        self.session_service = Some(service);
        self
    }

    pub fn credentials_exchange(mut self, exchange: Arc<dyn CredentialsExchange>) -> Self {
        self.exchange = Some(exchange);
        self
    }

    /// Run session heartbeats on `handle` instead of the background runtime.
    pub fn heartbeat_runtime(mut self, handle: Handle) -> Self {
        self.heartbeat_runtime = Some(handle);
        self
    }

    /// Validate the configuration and assemble an unconnected client.
    pub fn build(self) -> Result<Client, LinkError> {
        self.config.validate()?;
        let auth = DialAuth::from_config(&self.config, self.exchange.as_ref())?;
        let ClientBuilder {
            config,
            dialer,
            local_predicate,
            session_service,
            heartbeat_runtime,
            ..
        } = self;

        let inner = Arc::new_cyclic(|me: &Weak<ClientInner>| {
            let session = (!config.disable_sessions).then(|| {
                let service: Arc<dyn SessionService> = match session_service {
                    Some(service) => service,
                    None => Arc::new(RpcSessionService::new(Arc::new(RawChannel(me.clone())))),
                };
                SessionManager::new(service, heartbeat_runtime)
            });
            ClientInner {
                config,
                auth,
                dialer,
                local_predicate,
                events: EventHub::new(),
                session,
                connect_lock: AsyncMutex::new(()),
                link: Mutex::new(None),
                handlers: Mutex::new(HandlerSlots::default()),
                closed: AtomicBool::new(false),
                connecting: AtomicBool::new(false),
                recovering_link: AtomicU64::new(0),
                dial_generation: AtomicU64::new(0),
                next_link_id: AtomicU64::new(0),
                me: me.clone(),
            }
        });
        Ok(Client { inner })
    }
}

/// A connection to one remote machine, redialed as needed.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("host", &self.inner.config.host)
            .field("state", &self.inner.events.state())
            .finish_non_exhaustive()
    }
}

impl Client {
    pub fn builder(config: DialConfig) -> ClientBuilder {
        ClientBuilder {
            config,
            dialer: Arc::new(NetworkDialer),
            local_predicate: default_local_predicate(),
            session_service: None,
            exchange: None,
            heartbeat_runtime: None,
        }
    }

    /// Dial, replacing any current link. Concurrent callers run one after another.
    pub async fn connect(&self) -> Result<(), LinkError> {
        self.inner.connect().await
    }

    /// Tear the link down and stop reconnecting. Waits for an in-flight connect first.
    pub async fn disconnect(&self) {
        self.inner.disconnect().await;
    }

    pub fn config(&self) -> &DialConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.events.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn is_connecting(&self) -> bool {
        self.inner.connecting.load(Ordering::SeqCst)
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.events.watch_state()
    }

    pub fn subscribe(&self, kind: EventKind) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe(kind)
    }

    pub fn dial_method(&self) -> Option<DialMethod> {
        self.inner
            .link
            .lock()
            .as_ref()
            .map(|link| link.connection.method)
    }

    pub fn session_id(&self) -> Option<String> {
        self.inner.session.as_ref().and_then(|session| session.session_id())
    }

    /// A stub for `service` bound to whichever session-aware channel is current at call time.
    pub fn service(&self, service: impl Into<String>) -> ServiceStub {
        ServiceStub::new(Arc::new(self.clone()), service)
    }
}

impl ChannelProvider for Client {
    fn channel(&self) -> Result<Arc<dyn RpcChannel>, LinkError> {
        let raw = self.inner.current_channel()?;
        Ok(match &self.inner.session {
            Some(session) => Arc::new(SessionChannel::new(raw, session.clone())),
            None => raw,
        })
    }
}

/// The current channel without session metadata, for the session calls themselves.
struct RawChannel(Weak<ClientInner>);

impl ChannelProvider for RawChannel {
    fn channel(&self) -> Result<Arc<dyn RpcChannel>, LinkError> {
        self.0
            .upgrade()
            .ok_or(LinkError::Closed)?
            .current_channel()
    }
}

struct Link {
    id: u64,
    connection: Connection,
}

struct ClientInner {
    config: DialConfig,
    auth: DialAuth,
    dialer: Arc<dyn Dialer>,
    local_predicate: LocalHostPredicate,
    events: EventHub,
    session: Option<Arc<SessionManager>>,
    // Held for the whole body of connect, reconnect and disconnect.
    connect_lock: AsyncMutex<()>,
    link: Mutex<Option<Link>>,
    handlers: Mutex<HandlerSlots>,
    closed: AtomicBool,
    connecting: AtomicBool,
    // Highest link id already handed to recover; link ids only grow.
    recovering_link: AtomicU64,
    // Bumped by every connect; an older dial stops retrying once it sees a newer value.
    dial_generation: AtomicU64,
    next_link_id: AtomicU64,
    me: Weak<ClientInner>,
}

impl ClientInner {
    fn current_channel(&self) -> Result<Arc<dyn RpcChannel>, LinkError> {
        self.link
            .lock()
            .as_ref()
            .map(|link| link.connection.channel.clone())
            .ok_or(LinkError::Closed)
    }

    fn current_link_id(&self) -> Option<u64> {
        self.link.lock().as_ref().map(|link| link.id)
    }

    async fn connect(&self) -> Result<(), LinkError> {
        let generation = self.dial_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = self.connect_lock.lock().await;
        self.closed.store(false, Ordering::SeqCst);
        self.run_connect(generation, false).await
    }

    async fn run_connect(&self, generation: u64, reconnect: bool) -> Result<(), LinkError> {
        self.connecting.store(true, Ordering::SeqCst);
        self.teardown_link().await;
        self.events.emit(ClientEvent::Connecting);
        let result = self.establish(generation, reconnect).await;
        self.connecting.store(false, Ordering::SeqCst);
        match result {
            Ok(connection) => {
                self.install(connection);
                self.events.emit(ClientEvent::Connected);
                Ok(())
            }
            Err(err) => {
                warn!(
                    target: "tether::client",
                    host = %self.config.host,
                    error = %err,
                    "connect failed"
                );
                self.events.emit(ClientEvent::Disconnected {
                    error: Some(err.to_string()),
                });
                Err(err)
            }
        }
    }

    /// Whether dial attempt `generation` may keep retrying.
    fn still_wanted(&self, generation: u64, reconnect: bool) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        if self.dial_generation.load(Ordering::SeqCst) != generation {
            debug!(target: "tether::client", generation, "dial superseded");
            return false;
        }
        if reconnect
            && self
                .config
                .reconnect_abort
                .as_ref()
                .is_some_and(AbortHandle::is_aborted)
        {
            debug!(target: "tether::client", "reconnect aborted");
            return false;
        }
        true
    }

    async fn establish(&self, generation: u64, reconnect: bool) -> Result<Connection, LinkError> {
        let policy = RetryPolicy::for_dial(&self.config);
        let abort = if reconnect {
            self.config.reconnect_abort.as_ref()
        } else {
            None
        };
        let mut failure = DialFailure {
            webrtc: None,
            direct: None,
        };

        if self.config.is_webrtc() {
            let result = retry(
                &policy,
                abort,
                |attempt| {
                    self.events.emit(ClientEvent::Dialing {
                        method: DialMethod::WebRtc,
                        attempt,
                    });
                    debug!(target: "tether::client", attempt, "dialing over webrtc");
                    self.dialer.dial_webrtc(&self.config, &self.auth)
                },
                |_, _| self.still_wanted(generation, reconnect),
            )
            .await;
            match result {
                Ok(connection) => return Ok(connection),
                Err(err) => {
                    warn!(target: "tether::client", error = %err, "webrtc dial failed");
                    self.forget_rejected_auth(&err).await;
                    failure.webrtc = Some(Box::new(err));
                }
            }
            if !self.still_wanted(generation, reconnect) {
                return Err(LinkError::DialFailed(failure));
            }
        }

        if !(self.local_predicate)(&self.config.host) {
            debug!(
                target: "tether::client",
                host = %self.config.host,
                "host does not look local; skipping direct dial"
            );
            failure.direct = Some(Box::new(
                ConfigError::NotLocal {
                    host: self.config.host.clone(),
                }
                .into(),
            ));
            return Err(LinkError::DialFailed(failure));
        }

        let result = retry(
            &policy,
            abort,
            |attempt| {
                self.events.emit(ClientEvent::Dialing {
                    method: DialMethod::Grpc,
                    attempt,
                });
                debug!(target: "tether::client", attempt, "dialing directly");
                self.dialer.dial_direct(&self.config, &self.auth)
            },
            |_, _| self.still_wanted(generation, reconnect),
        )
        .await;
        match result {
            Ok(connection) => Ok(connection),
            Err(err) => {
                self.forget_rejected_auth(&err).await;
                failure.direct = Some(Box::new(err));
                Err(LinkError::DialFailed(failure))
            }
        }
    }

    async fn forget_rejected_auth(&self, err: &LinkError) {
        if err.code() == Code::Unauthenticated {
            debug!(target: "tether::client", "credentials rejected; dropping cached token");
            self.auth.invalidate().await;
        }
    }

    fn install(&self, connection: Connection) {
        let id = self.next_link_id.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(session) = &self.session {
            session.reset();
        }
        let peer = connection.peer.clone();
        info!(
            target: "tether::client",
            host = %self.config.host,
            method = connection.method.as_str(),
            link = id,
            "connected"
        );
        *self.link.lock() = Some(Link { id, connection });
        if let Some(peer) = peer {
            self.install_handlers(&peer, id);
        }
    }

    fn install_handlers(&self, peer: &Arc<dyn PeerHandle>, link_id: u64) {
        let mut slots = self.handlers.lock();

        let me = self.me.clone();
        slots.replace(
            peer,
            PeerEventKind::IceConnectionState,
            Arc::new(move |event: PeerEvent| {
                if let PeerEvent::IceConnectionState(state) = event {
                    if matches!(
                        state,
                        RTCIceConnectionState::Disconnected
                            | RTCIceConnectionState::Failed
                            | RTCIceConnectionState::Closed
                    ) {
                        ClientInner::link_lost(&me, link_id, format!("ice connection {state}"));
                    }
                }
            }),
        );

        let me = self.me.clone();
        slots.replace(
            peer,
            PeerEventKind::DataChannelClose,
            Arc::new(move |_: PeerEvent| {
                ClientInner::link_lost(&me, link_id, "data channel closed".to_string());
            }),
        );

        let me = self.me.clone();
        slots.replace(
            peer,
            PeerEventKind::Track,
            Arc::new(move |event: PeerEvent| {
                if let (PeerEvent::Track(track), Some(inner)) = (event, me.upgrade()) {
                    inner.events.emit(ClientEvent::Track(track));
                }
            }),
        );
        debug!(target: "tether::client", link = link_id, handlers = slots.len(), "peer handlers installed");
    }

    async fn teardown_link(&self) {
        self.handlers.lock().clear();
        let link = self.link.lock().take();
        if let Some(link) = link {
            debug!(target: "tether::client", link = link.id, "closing link");
            link.connection.close().await;
        }
    }

    fn link_lost(me: &Weak<ClientInner>, link_id: u64, reason: String) {
        let Some(inner) = me.upgrade() else {
            return;
        };
        if inner.closed.load(Ordering::SeqCst) || inner.current_link_id() != Some(link_id) {
            return;
        }
        let claimed = inner
            .recovering_link
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (current < link_id).then_some(link_id)
            })
            .is_ok();
        if !claimed {
            return;
        }
        spawn_with_handle(None, async move {
            inner.recover(link_id, reason).await;
        });
    }

    async fn recover(&self, link_id: u64, reason: String) {
        let _guard = self.connect_lock.lock().await;
        if self.closed.load(Ordering::SeqCst) || self.current_link_id() != Some(link_id) {
            return;
        }
        warn!(
            target: "tether::client",
            host = %self.config.host,
            reason = %reason,
            "connection lost"
        );
        let aborted = self
            .config
            .reconnect_abort
            .as_ref()
            .is_some_and(AbortHandle::is_aborted);
        if self.config.no_reconnect || aborted {
            self.teardown_link().await;
            if let Some(session) = &self.session {
                session.reset();
            }
            self.events.emit(ClientEvent::Disconnected {
                error: Some(reason),
            });
            return;
        }
        let generation = self.dial_generation.fetch_add(1, Ordering::SeqCst) + 1;
        if let Err(err) = self.run_connect(generation, true).await {
            warn!(target: "tether::client", error = %err, "reconnect gave up");
        }
    }

    async fn disconnect(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let _guard = self.connect_lock.lock().await;
        self.events.emit(ClientEvent::Disconnecting);
        self.teardown_link().await;
        if let Some(session) = &self.session {
            session.reset();
        }
        info!(target: "tether::client", host = %self.config.host, "disconnected");
        self.events.emit(ClientEvent::Disconnected { error: None });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthProvider;
    use crate::error::Status;
    use crate::rpc::{ChannelKind, RpcRequest, RpcResponse};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    struct NullChannel;

    #[async_trait]
    impl RpcChannel for NullChannel {
        fn kind(&self) -> ChannelKind {
            ChannelKind::Direct
        }

        async fn invoke(&self, _request: RpcRequest) -> Result<RpcResponse, LinkError> {
            Err(LinkError::Closed)
        }

        async fn close(&self) {}

        fn is_closed(&self) -> bool {
            false
        }
    }

    #[derive(Default)]
    struct FailingDialer {
        webrtc: AtomicU32,
        direct: AtomicU32,
    }

    #[async_trait]
    impl Dialer for FailingDialer {
        async fn dial_webrtc(&self, _: &DialConfig, _: &DialAuth) -> Result<Connection, LinkError> {
            self.webrtc.fetch_add(1, Ordering::SeqCst);
            Err(Status::new(Code::Unavailable, "no route").into())
        }

        async fn dial_direct(&self, _: &DialConfig, _: &DialAuth) -> Result<Connection, LinkError> {
            self.direct.fetch_add(1, Ordering::SeqCst);
            Ok(Connection::direct(Arc::new(NullChannel)))
        }
    }

    #[test]
    fn build_rejects_conflicting_auth() {
        let mut config = DialConfig::new("bot.local").with_access_token("t");
        config.credentials = Some(crate::config::Credentials {
            kind: "api-key".into(),
            payload: "p".into(),
            auth_entity: None,
        });
        let err = Client::builder(config).build().unwrap_err();
        assert!(matches!(
            err,
            LinkError::Config(ConfigError::AccessTokenWithCredentials)
        ));
    }

    #[test_timeout::tokio_timeout_test(10, paused)]
    async fn webrtc_exhaustion_falls_back_to_direct_for_local_hosts() {
        let dialer = Arc::new(FailingDialer::default());
        let client = Client::builder(
            DialConfig::new("bot.local")
                .with_signaling("https://signal.example.com")
                .reconnect_max_attempts(2)
                .disable_sessions(true),
        )
        .dialer(dialer.clone())
        .build()
        .unwrap();
        let mut dialing = client.subscribe(EventKind::Dialing);

        client.connect().await.unwrap();
        assert_eq!(dialer.webrtc.load(Ordering::SeqCst), 2);
        assert_eq!(dialer.direct.load(Ordering::SeqCst), 1);
        assert_eq!(client.dial_method(), Some(DialMethod::Grpc));

        let mut seen = Vec::new();
        while let Ok(ClientEvent::Dialing { method, attempt }) = dialing.try_recv() {
            seen.push((method, attempt));
        }
        assert_eq!(
            seen,
            vec![
                (DialMethod::WebRtc, 1),
                (DialMethod::WebRtc, 2),
                (DialMethod::Grpc, 1)
            ]
        );
    }

    #[test_timeout::tokio_timeout_test(10, paused)]
    async fn custom_local_predicate_gates_direct_dial() {
        let dialer = Arc::new(FailingDialer::default());
        let client = Client::builder(DialConfig::new("10.0.0.7").disable_sessions(true))
            .dialer(dialer.clone())
            .local_predicate(Arc::new(|host: &str| host.starts_with("10.")))
            .build()
            .unwrap();

        client.connect().await.unwrap();
        assert_eq!(dialer.webrtc.load(Ordering::SeqCst), 0);
        assert_eq!(dialer.direct.load(Ordering::SeqCst), 1);
    }

    #[test_timeout::tokio_timeout_test(10, paused)]
    async fn service_without_link_reports_closed() {
        let client = Client::builder(DialConfig::new("bot.local"))
            .dialer(Arc::new(FailingDialer::default()))
            .build()
            .unwrap();
        let err = client
            .service("acme.v1.ArmService")
            .do_command("arm", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(err.is_connection_closed());
    }

    struct TokenCheckingDialer {
        seen: parking_lot::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Dialer for TokenCheckingDialer {
        async fn dial_webrtc(&self, _: &DialConfig, _: &DialAuth) -> Result<Connection, LinkError> {
            Err(Status::new(Code::Unavailable, "no signaling").into())
        }

        async fn dial_direct(&self, _: &DialConfig, auth: &DialAuth) -> Result<Connection, LinkError> {
            let header = auth.target.as_ref().unwrap().authorization().await?;
            let first = {
                let mut seen = self.seen.lock();
                seen.push(header);
                seen.len() == 1
            };
            if first {
                return Err(Status::new(Code::Unauthenticated, "token expired").into());
            }
            Ok(Connection::direct(Arc::new(NullChannel)))
        }
    }

    struct SequentialTokens(AtomicU32);

    #[async_trait]
    impl CredentialsExchange for SequentialTokens {
        async fn exchange(&self, _: &crate::config::Credentials) -> Result<String, LinkError> {
            Ok(format!("token-{}", self.0.fetch_add(1, Ordering::SeqCst)))
        }
    }

    #[test_timeout::tokio_timeout_test(10, paused)]
    async fn rejected_token_is_exchanged_again_on_next_connect() {
        let dialer = Arc::new(TokenCheckingDialer {
            seen: parking_lot::Mutex::new(Vec::new()),
        });
        let config = DialConfig::new("bot.local")
            .disable_sessions(true)
            .with_credentials(crate::config::Credentials {
                kind: "api-key".into(),
                payload: "p".into(),
                auth_entity: None,
            });
        let client = Client::builder(config)
            .dialer(dialer.clone())
            .credentials_exchange(Arc::new(SequentialTokens(AtomicU32::new(0))))
            .build()
            .unwrap();

        let err = client.connect().await.unwrap_err();
        assert!(matches!(err, LinkError::DialFailed(_)));
        client.connect().await.unwrap();
        assert_eq!(
            *dialer.seen.lock(),
            vec!["Bearer token-0".to_string(), "Bearer token-1".to_string()]
        );
    }
}
