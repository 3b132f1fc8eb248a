use std::sync::Arc;

use async_trait::async_trait;
use serde::de::IgnoredAny;
use serde_json::json;

use crate::auth::AuthProvider;
use crate::error::LinkError;
use crate::rpc::direct::DirectChannel;
use crate::rpc::{FixedChannel, RpcChannel, ServiceStub};
use crate::webrtc::signaling::{
    CallRequest, CallResponseStream, CallUpdateRequest, OptionalWebRtcConfigResponse,
    SignalingService,
};

pub const SIGNALING_SERVICE: &str = "tether.webrtc.v1.SignalingService";
pub const RPC_HOST_KEY: &str = "rpc-host";
pub const DIAL_PRIORITY_KEY: &str = "dial-priority";

/// Signaling service reached over a plain RPC channel.
pub struct RpcSignalingClient {
    channel: Arc<dyn RpcChannel>,
    priority: Option<i32>,
}

impl RpcSignalingClient {
    pub fn new(channel: Arc<dyn RpcChannel>, priority: Option<i32>) -> Self {
        Self { channel, priority }
    }

    pub fn connect(
        address: &str,
        insecure: bool,
        auth: Option<Arc<dyn AuthProvider>>,
        priority: Option<i32>,
    ) -> Result<Self, LinkError> {
        let channel = DirectChannel::new(address, insecure, auth)?;
        Ok(Self::new(Arc::new(channel), priority))
    }

    fn stub_for(&self, host: &str) -> ServiceStub {
        let stub = ServiceStub::new(Arc::new(FixedChannel(self.channel.clone())), SIGNALING_SERVICE)
            .with_metadata(RPC_HOST_KEY, host);
        match self.priority {
            Some(priority) => stub.with_metadata(DIAL_PRIORITY_KEY, priority.to_string()),
            None => stub,
        }
    }
}

#[async_trait]
impl SignalingService for RpcSignalingClient {
    async fn optional_webrtc_config(
        &self,
        host: &str,
    ) -> Result<OptionalWebRtcConfigResponse, LinkError> {
        self.stub_for(host)
            .unary("OptionalWebRTCConfig", &json!({}))
            .await
    }

    async fn call(&self, host: &str, request: CallRequest) -> Result<CallResponseStream, LinkError> {
        self.stub_for(host).server_stream("Call", &request).await
    }

    async fn call_update(&self, host: &str, request: CallUpdateRequest) -> Result<(), LinkError> {
        let _: IgnoredAny = self.stub_for(host).unary("CallUpdate", &request).await?;
        Ok(())
    }
}
