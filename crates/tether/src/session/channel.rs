use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tracing::info;

use crate::error::{Code, LinkError};
use crate::rpc::{ChannelKind, RpcChannel, RpcRequest, RpcResponse};
use crate::session::SessionManager;

const SESSION_EXPIRED: &str = "SESSION_EXPIRED";

pub fn is_session_expired(err: &LinkError) -> bool {
    err.status().is_some_and(|status| {
        status.code == Code::InvalidArgument && status.message.contains(SESSION_EXPIRED)
    })
}

/// Attaches the session header to every call and drops the session when the remote says it expired.
pub struct SessionChannel {
    inner: Arc<dyn RpcChannel>,
    session: Arc<SessionManager>,
}

impl SessionChannel {
    pub fn new(inner: Arc<dyn RpcChannel>, session: Arc<SessionManager>) -> Self {
        Self { inner, session }
    }
}

fn expire(session: &SessionManager, err: &LinkError) {
    if is_session_expired(err) {
        info!(target: "tether::session", "session expired, resetting");
        session.reset();
    }
}

#[async_trait]
impl RpcChannel for SessionChannel {
    fn kind(&self) -> ChannelKind {
        self.inner.kind()
    }

    async fn invoke(&self, mut request: RpcRequest) -> Result<RpcResponse, LinkError> {
        let metadata = self.session.metadata().await?;
        request.metadata.merge(&metadata);
        match self.inner.invoke(request).await {
            Ok(response) => {
                let session = self.session.clone();
                let messages = response.messages.inspect(move |item| {
                    if let Err(err) = item {
                        expire(&session, err);
                    }
                });
                Ok(RpcResponse::new(response.headers, Box::pin(messages)))
            }
            Err(err) => {
                expire(&self.session, &err);
                Err(err)
            }
        }
    }

    async fn close(&self) {
        self.inner.close().await;
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Status;
    use crate::rpc::Metadata;
    use crate::session::{SESSION_METADATA_KEY, SessionService, StartSessionResponse};
    use bytes::Bytes;
    use futures::stream;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::runtime::Handle;

    #[derive(Default)]
    struct CountingSessions {
        starts: AtomicUsize,
    }

    #[async_trait]
    impl SessionService for CountingSessions {
        async fn start_session(&self, _resume: Option<&str>) -> Result<StartSessionResponse, LinkError> {
            let n = self.starts.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(StartSessionResponse {
                id: format!("s{n}"),
                heartbeat_window_ms: Some(60_000),
            })
        }

        async fn send_heartbeat(&self, _id: &str) -> Result<(), LinkError> {
            Ok(())
        }
    }

    /// Fails the first call with `failure`, then answers every call.
    struct Scripted {
        failure: Mutex<Option<LinkError>>,
        seen: Mutex<Vec<Metadata>>,
    }

    impl Scripted {
        fn failing_with(err: LinkError) -> Arc<Self> {
            Arc::new(Self {
                failure: Mutex::new(Some(err)),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl RpcChannel for Scripted {
        fn kind(&self) -> ChannelKind {
            ChannelKind::WebRtc
        }

        async fn invoke(&self, request: RpcRequest) -> Result<RpcResponse, LinkError> {
            self.seen.lock().push(request.metadata.clone());
            if let Some(err) = self.failure.lock().take() {
                return Err(err);
            }
            Ok(RpcResponse::new(
                Metadata::new(),
                Box::pin(stream::iter(vec![Ok(Bytes::from_static(b"{}"))])),
            ))
        }

        async fn close(&self) {}

        fn is_closed(&self) -> bool {
            false
        }
    }

    fn expired() -> LinkError {
        Status::new(Code::InvalidArgument, "SESSION_EXPIRED").into()
    }

    #[test_timeout::tokio_timeout_test(10, paused)]
    async fn expiry_resets_once_and_surfaces_the_error() {
        let sessions = Arc::new(CountingSessions::default());
        let manager = SessionManager::new(sessions.clone(), Some(Handle::current()));
        let inner = Scripted::failing_with(expired());
        let channel = SessionChannel::new(inner.clone(), manager.clone());

        let err = channel
            .invoke(RpcRequest::new("/svc/Call", Bytes::new()))
            .await
            .unwrap_err();
        assert!(is_session_expired(&err));
        assert_eq!(manager.session_id(), None);

        channel
            .invoke(RpcRequest::new("/svc/Call", Bytes::new()))
            .await
            .unwrap()
            .into_unary()
            .await
            .unwrap();
        assert_eq!(sessions.starts.load(Ordering::SeqCst), 2);

        let seen = inner.seen.lock();
        assert_eq!(seen[0].get(SESSION_METADATA_KEY), Some("s1"));
        assert_eq!(seen[1].get(SESSION_METADATA_KEY), Some("s2"));
    }

    #[test_timeout::tokio_timeout_test(10, paused)]
    async fn other_errors_keep_the_session() {
        let sessions = Arc::new(CountingSessions::default());
        let manager = SessionManager::new(sessions.clone(), Some(Handle::current()));
        let inner = Scripted::failing_with(Status::new(Code::InvalidArgument, "bad input").into());
        let channel = SessionChannel::new(inner, manager.clone());

        assert!(
            channel
                .invoke(RpcRequest::new("/svc/Call", Bytes::new()))
                .await
                .is_err()
        );
        assert_eq!(manager.session_id().as_deref(), Some("s1"));
        assert_eq!(sessions.starts.load(Ordering::SeqCst), 1);
    }
}
