pub mod codec;
pub mod direct;

use std::collections::BTreeMap;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Code, LinkError, Status};

/// Call metadata. Keys are lower-cased on insert.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(BTreeMap<String, String>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into().to_ascii_lowercase(), value.into());
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(&key.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(&key.to_ascii_lowercase())
    }

    /// Copy every entry of `other` over this one.
    pub fn merge(&mut self, other: &Metadata) {
        for (key, value) in &other.0 {
            self.0.insert(key.clone(), value.clone());
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    WebRtc,
    Direct,
}

#[derive(Debug, Clone)]
pub struct RpcRequest {
    /// Full method path, `/<package.Service>/<Method>`.
    pub method: String,
    pub metadata: Metadata,
    pub message: Bytes,
    pub timeout: Option<Duration>,
}

impl RpcRequest {
    pub fn new(method: impl Into<String>, message: Bytes) -> Self {
        Self {
            method: method.into(),
            metadata: Metadata::new(),
            message,
            timeout: None,
        }
    }
}

/// Response messages in arrival order. A non-OK trailer arrives as the final `Err`.
pub type MessageStream = Pin<Box<dyn Stream<Item = Result<Bytes, LinkError>> + Send>>;

pub struct RpcResponse {
    pub headers: Metadata,
    pub messages: MessageStream,
}

impl fmt::Debug for RpcResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcResponse")
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

impl RpcResponse {
    pub fn new(headers: Metadata, messages: MessageStream) -> Self {
        Self { headers, messages }
    }

    /// Wait for the single response message and the closing status.
    pub async fn into_unary(mut self) -> Result<Bytes, LinkError> {
        let mut first = None;
        while let Some(item) = self.messages.next().await {
            let message = item?;
            if first.is_none() {
                first = Some(message);
            }
        }
        first.ok_or_else(|| Status::new(Code::Internal, "response ended without a message").into())
    }
}

#[async_trait]
pub trait RpcChannel: Send + Sync {
    fn kind(&self) -> ChannelKind;

    async fn invoke(&self, request: RpcRequest) -> Result<RpcResponse, LinkError>;

    async fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Hands out whatever channel is current at call time.
pub trait ChannelProvider: Send + Sync {
    fn channel(&self) -> Result<Arc<dyn RpcChannel>, LinkError>;
}

pub struct FixedChannel(pub Arc<dyn RpcChannel>);

impl ChannelProvider for FixedChannel {
    fn channel(&self) -> Result<Arc<dyn RpcChannel>, LinkError> {
        Ok(self.0.clone())
    }
}

#[derive(Debug, Serialize)]
struct DoCommandRequest<'a> {
    name: &'a str,
    command: &'a serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct DoCommandResponse {
    #[serde(default)]
    result: serde_json::Value,
}

/// Typed entry point for one remote service. Messages travel as JSON.
#[derive(Clone)]
pub struct ServiceStub {
    provider: Arc<dyn ChannelProvider>,
    service: String,
    metadata: Metadata,
    timeout: Option<Duration>,
}

impl fmt::Debug for ServiceStub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceStub")
            .field("service", &self.service)
            .field("metadata", &self.metadata)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl ServiceStub {
    pub fn new(provider: Arc<dyn ChannelProvider>, service: impl Into<String>) -> Self {
        Self {
            provider,
            service: service.into(),
            metadata: Metadata::new(),
            timeout: None,
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key, value);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn method_path(&self, method: &str) -> String {
        format!("/{}/{}", self.service, method)
    }

    pub async fn invoke_raw(&self, method: &str, message: Bytes) -> Result<RpcResponse, LinkError> {
        let channel = self.provider.channel()?;
        let request = RpcRequest {
            method: self.method_path(method),
            metadata: self.metadata.clone(),
            message,
            timeout: self.timeout,
        };
        channel.invoke(request).await
    }

    pub async fn unary<Req, Resp>(&self, method: &str, request: &Req) -> Result<Resp, LinkError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let body = encode_json(method, request)?;
        let reply = self.invoke_raw(method, body).await?.into_unary().await?;
        decode_json(method, &reply)
    }

    pub async fn server_stream<Req, Resp>(
        &self,
        method: &str,
        request: &Req,
    ) -> Result<Pin<Box<dyn Stream<Item = Result<Resp, LinkError>> + Send>>, LinkError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned + Send + 'static,
    {
        let body = encode_json(method, request)?;
        let response = self.invoke_raw(method, body).await?;
        let method = method.to_string();
        let stream = response
            .messages
            .map(move |item| item.and_then(|bytes| decode_json(&method, &bytes)));
        Ok(Box::pin(stream))
    }

    /// Run an arbitrary named command with a structured payload.
    pub async fn do_command(
        &self,
        name: &str,
        command: serde_json::Value,
    ) -> Result<serde_json::Value, LinkError> {
        let response: DoCommandResponse = self
            .unary(
                "DoCommand",
                &DoCommandRequest {
                    name,
                    command: &command,
                },
            )
            .await?;
        Ok(response.result)
    }
}

pub(crate) fn encode_json<T: Serialize + ?Sized>(method: &str, value: &T) -> Result<Bytes, LinkError> {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(|err| Status::new(Code::Internal, format!("encode {method}: {err}")).into())
}

pub(crate) fn decode_json<T: DeserializeOwned>(method: &str, bytes: &[u8]) -> Result<T, LinkError> {
    serde_json::from_slice(bytes)
        .map_err(|err| Status::new(Code::Internal, format!("decode {method}: {err}")).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use parking_lot::Mutex;

    struct Canned {
        seen: Mutex<Vec<RpcRequest>>,
        reply: Vec<Result<Bytes, LinkError>>,
    }

    #[async_trait]
    impl RpcChannel for Canned {
        fn kind(&self) -> ChannelKind {
            ChannelKind::Direct
        }

        async fn invoke(&self, request: RpcRequest) -> Result<RpcResponse, LinkError> {
            self.seen.lock().push(request);
            Ok(RpcResponse::new(
                Metadata::new(),
                Box::pin(stream::iter(self.reply.clone())),
            ))
        }

        async fn close(&self) {}

        fn is_closed(&self) -> bool {
            false
        }
    }

    fn stub(reply: Vec<Result<Bytes, LinkError>>) -> (ServiceStub, Arc<Canned>) {
        let channel = Arc::new(Canned {
            seen: Mutex::new(Vec::new()),
            reply,
        });
        let stub = ServiceStub::new(Arc::new(FixedChannel(channel.clone())), "acme.arm.v1.ArmService")
            .with_metadata("X-Trace", "abc");
        (stub, channel)
    }

    #[tokio::test]
    async fn do_command_posts_to_service_method() {
        let (stub, channel) = stub(vec![Ok(Bytes::from_static(br#"{"result":{"moved":true}}"#))]);
        let result = stub
            .do_command("arm1", serde_json::json!({"move": 1}))
            .await
            .expect("command");
        assert_eq!(result, serde_json::json!({"moved": true}));

        let seen = channel.seen.lock();
        assert_eq!(seen[0].method, "/acme.arm.v1.ArmService/DoCommand");
        assert_eq!(seen[0].metadata.get("x-trace"), Some("abc"));
        let sent: serde_json::Value = serde_json::from_slice(&seen[0].message).unwrap();
        assert_eq!(sent["name"], "arm1");
    }

    #[tokio::test]
    async fn unary_surfaces_trailer_status() {
        let (stub, _) = stub(vec![
            Ok(Bytes::from_static(b"{}")),
            Err(Status::new(Code::NotFound, "gone").into()),
        ]);
        let err = stub
            .unary::<_, serde_json::Value>("Get", &serde_json::json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::NotFound);
    }

    #[tokio::test]
    async fn server_stream_decodes_each_message() {
        let (stub, _) = stub(vec![
            Ok(Bytes::from_static(b"1")),
            Ok(Bytes::from_static(b"2")),
        ]);
        let values: Vec<u32> = stub
            .server_stream::<_, u32>("Watch", &())
            .await
            .unwrap()
            .map(|item| item.unwrap())
            .collect()
            .await;
        assert_eq!(values, vec![1, 2]);
    }

    #[test]
    fn metadata_keys_are_case_insensitive() {
        let mut md = Metadata::new().with("Session-Id", "a");
        md.merge(&Metadata::new().with("session-id", "b").with("x", "y"));
        assert_eq!(md.get("SESSION-ID"), Some("b"));
        assert_eq!(md.len(), 2);
    }
}
