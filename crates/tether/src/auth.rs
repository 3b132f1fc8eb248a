use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex as AsyncMutex;

use crate::config::{Credentials, DialConfig};
use crate::error::{ConfigError, LinkError};

/// Produces the `authorization` header value attached to outgoing calls.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn authorization(&self) -> Result<String, LinkError>;

    /// Drop any cached token after the remote rejected it.
    async fn invalidate(&self) {}
}

#[derive(Clone)]
pub struct AccessToken(String);

impl AccessToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessToken(..)")
    }
}

#[async_trait]
impl AuthProvider for AccessToken {
    async fn authorization(&self) -> Result<String, LinkError> {
        Ok(format!("Bearer {}", self.0))
    }
}

/// Turns opaque credentials into an access token.
#[async_trait]
pub trait CredentialsExchange: Send + Sync {
    async fn exchange(&self, credentials: &Credentials) -> Result<String, LinkError>;
}

/// Exchanges credentials on first use and caches the token.
pub struct CredentialsAuth {
    credentials: Credentials,
    exchange: Arc<dyn CredentialsExchange>,
    cached: AsyncMutex<Option<String>>,
}

impl CredentialsAuth {
    pub fn new(credentials: Credentials, exchange: Arc<dyn CredentialsExchange>) -> Self {
        Self {
            credentials,
            exchange,
            cached: AsyncMutex::new(None),
        }
    }
}

#[async_trait]
impl AuthProvider for CredentialsAuth {
    async fn authorization(&self) -> Result<String, LinkError> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref() {
            return Ok(format!("Bearer {token}"));
        }
        let token = self.exchange.exchange(&self.credentials).await?;
        let header = format!("Bearer {token}");
        *cached = Some(token);
        Ok(header)
    }

    async fn invalidate(&self) {
        self.cached.lock().await.take();
    }
}

pub fn provider_for(
    access_token: Option<&str>,
    credentials: Option<&Credentials>,
    exchange: Option<&Arc<dyn CredentialsExchange>>,
) -> Result<Option<Arc<dyn AuthProvider>>, ConfigError> {
    if let Some(token) = access_token {
        return Ok(Some(Arc::new(AccessToken::new(token))));
    }
    match credentials {
        Some(credentials) => {
            let exchange = exchange.ok_or(ConfigError::NoCredentialsExchange)?;
            Ok(Some(Arc::new(CredentialsAuth::new(
                credentials.clone(),
                exchange.clone(),
            ))))
        }
        None => Ok(None),
    }
}

/// Authorization for the target machine and for its signaling service.
#[derive(Clone, Default)]
pub struct DialAuth {
    pub target: Option<Arc<dyn AuthProvider>>,
    pub signaling: Option<Arc<dyn AuthProvider>>,
}

impl fmt::Debug for DialAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DialAuth")
            .field("target", &self.target.is_some())
            .field("signaling", &self.signaling.is_some())
            .finish()
    }
}

impl DialAuth {
    /// Signaling falls back to the target's auth when it has none of its own.
    pub fn from_config(
        config: &DialConfig,
        exchange: Option<&Arc<dyn CredentialsExchange>>,
    ) -> Result<Self, ConfigError> {
        let target = provider_for(
            config.access_token.as_deref(),
            config.credentials.as_ref(),
            exchange,
        )?;
        let signaling = provider_for(
            config.signaling_access_token.as_deref(),
            config.signaling_credentials.as_ref(),
            exchange,
        )?
        .or_else(|| target.clone());
        Ok(Self { target, signaling })
    }

    /// Forget cached tokens so the next dial exchanges credentials again.
    pub async fn invalidate(&self) {
        if let Some(target) = &self.target {
            target.invalidate().await;
        }
        if let Some(signaling) = &self.signaling {
            signaling.invalidate().await;
        }
    }
}
