use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt, stream};
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, HeaderMap};
use tracing::{debug, trace};
use url::Url;

use crate::auth::AuthProvider;
use crate::error::{Code, ConfigError, LinkError, Status, network_error};
use crate::rpc::codec::{FLAG_DATA, FrameDecoder, encode_frame, parse_trailers};
use crate::rpc::{ChannelKind, Metadata, MessageStream, RpcChannel, RpcRequest, RpcResponse};
use crate::webrtc::stream::MAX_MESSAGE_SIZE;

const GRPC_WEB_CONTENT_TYPE: &str = "application/grpc-web+proto";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Decides whether a host may be dialed directly.
pub type LocalHostPredicate = Arc<dyn Fn(&str) -> bool + Send + Sync>;

pub fn default_local_predicate() -> LocalHostPredicate {
    Arc::new(looks_local)
}

// Deliberately loose: existing deployments rely on names like `bot.local` and `local-bot`.
pub fn looks_local(host: &str) -> bool {
    host.contains("local")
}

/// Base URL for `address`, keeping an explicit scheme and defaulting to https.
pub fn base_url(address: &str, insecure: bool) -> Result<Url, ConfigError> {
    let raw = if address.contains("://") {
        address.to_string()
    } else {
        let scheme = if insecure { "http" } else { "https" };
        format!("{scheme}://{address}")
    };
    let mut url = Url::parse(&raw).map_err(|err| ConfigError::InvalidAddress {
        address: address.to_string(),
        reason: err.to_string(),
    })?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

/// gRPC-web over HTTP, used for direct dials and for reaching signaling.
pub struct DirectChannel {
    client: reqwest::Client,
    base: Url,
    auth: Option<Arc<dyn AuthProvider>>,
    closed: AtomicBool,
}

impl DirectChannel {
    pub fn new(
        address: &str,
        insecure: bool,
        auth: Option<Arc<dyn AuthProvider>>,
    ) -> Result<Self, LinkError> {
        let base = base_url(address, insecure)?;
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(network_error)?;
        Ok(Self {
            client,
            base,
            auth,
            closed: AtomicBool::new(false),
        })
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    fn endpoint(&self, method: &str) -> Result<Url, LinkError> {
        self.base.join(method.trim_start_matches('/')).map_err(|err| {
            Status::new(Code::InvalidArgument, format!("invalid method {method:?}: {err}")).into()
        })
    }
}

#[async_trait]
impl RpcChannel for DirectChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Direct
    }

    async fn invoke(&self, request: RpcRequest) -> Result<RpcResponse, LinkError> {
        if self.is_closed() {
            return Err(LinkError::Closed);
        }
        let url = self.endpoint(&request.method)?;
        let mut builder = self
            .client
            .post(url)
            .header(CONTENT_TYPE, GRPC_WEB_CONTENT_TYPE)
            .header(ACCEPT, GRPC_WEB_CONTENT_TYPE)
            .header("x-grpc-web", "1");
        for (key, value) in request.metadata.iter() {
            builder = builder.header(key, value);
        }
        if let Some(timeout) = request.timeout {
            builder = builder
                .header("grpc-timeout", format!("{}m", timeout.as_millis()))
                .timeout(timeout);
        }
        if let Some(auth) = &self.auth {
            builder = builder.header(AUTHORIZATION, auth.authorization().await?);
        }

        trace!(target: "tether::rpc::direct", method = %request.method, "sending request");
        let response = builder
            .body(encode_frame(FLAG_DATA, &request.message))
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status();
        if !status.is_success() {
            debug!(
                target: "tether::rpc::direct",
                method = %request.method,
                http_status = %status,
                "request rejected"
            );
            return Err(Status::new(code_for_http(status), format!("http status {status}")).into());
        }

        let headers = metadata_from_headers(response.headers());
        // Trailers-only responses put the status in the headers.
        let header_status = headers
            .get("grpc-status")
            .and_then(|value| value.parse::<i32>().ok());
        if let Some(code) = header_status.filter(|code| *code != 0) {
            let message = headers.get("grpc-message").unwrap_or_default().to_string();
            return Err(Status::from_parts(code, message).into());
        }

        let body: Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>> =
            Box::pin(response.bytes_stream());
        Ok(RpcResponse::new(
            headers,
            decode_body(body, header_status == Some(0)),
        ))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct BodyState {
    body: Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>,
    decoder: FrameDecoder,
    finished: bool,
    status_in_headers: bool,
}

fn decode_body(
    body: Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>,
    status_in_headers: bool,
) -> MessageStream {
    let state = BodyState {
        body,
        decoder: FrameDecoder::new(MAX_MESSAGE_SIZE),
        finished: false,
        status_in_headers,
    };
    Box::pin(stream::unfold(state, |mut state| async move {
        if state.finished {
            return None;
        }
        loop {
            match state.decoder.next_frame() {
                Err(err) => {
                    state.finished = true;
                    return Some((Err(LinkError::Protocol(err.to_string())), state));
                }
                Ok(Some(frame)) if frame.is_trailer() => {
                    state.finished = true;
                    return match parse_trailers(&frame.payload) {
                        Ok(trailers) if trailers.code == 0 => None,
                        Ok(trailers) => Some((
                            Err(Status::from_parts(trailers.code, trailers.message).into()),
                            state,
                        )),
                        Err(err) => Some((Err(LinkError::Protocol(err.to_string())), state)),
                    };
                }
                Ok(Some(frame)) => return Some((Ok(frame.payload), state)),
                Ok(None) => {}
            }
            match state.body.next().await {
                Some(Ok(chunk)) => state.decoder.push(&chunk),
                Some(Err(err)) => {
                    state.finished = true;
                    return Some((Err(map_reqwest_error(err)), state));
                }
                None => {
                    state.finished = true;
                    if state.status_in_headers && !state.decoder.has_remaining() {
                        return None;
                    }
                    let err = Status::new(Code::Internal, "response ended without trailers");
                    return Some((Err(err.into()), state));
                }
            }
        }
    }))
}

fn metadata_from_headers(headers: &HeaderMap) -> Metadata {
    let mut metadata = Metadata::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            metadata.insert(name.as_str(), value);
        }
    }
    metadata
}

fn map_reqwest_error(err: reqwest::Error) -> LinkError {
    if err.is_timeout() {
        LinkError::Timeout(err.to_string())
    } else {
        network_error(err)
    }
}

/// gRPC-web mapping of HTTP failures onto status codes.
pub fn code_for_http(status: StatusCode) -> Code {
    match status.as_u16() {
        400 => Code::Internal,
        401 => Code::Unauthenticated,
        403 => Code::PermissionDenied,
        404 => Code::Unimplemented,
        429 | 502 | 503 | 504 => Code::Unavailable,
        _ => Code::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::codec::encode_trailers;

    fn body_of(chunks: Vec<Bytes>) -> Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>> {
        Box::pin(stream::iter(chunks.into_iter().map(Ok)))
    }

    #[test]
    fn loose_local_match() {
        assert!(looks_local("local-bot"));
        assert!(looks_local("bot.local"));
        assert!(looks_local("localhost:8080"));
        assert!(!looks_local("bot.example.com"));
    }

    #[test]
    fn base_url_respects_scheme_and_insecure() {
        assert_eq!(base_url("bot.local:8080", false).unwrap().as_str(), "https://bot.local:8080/");
        assert_eq!(base_url("bot.local:8080", true).unwrap().scheme(), "http");
        assert_eq!(
            base_url("http://signal.local/api", false).unwrap().as_str(),
            "http://signal.local/api/"
        );
        assert!(base_url("http://[bad", false).is_err());
    }

    #[test]
    fn http_failures_map_to_codes() {
        assert_eq!(code_for_http(StatusCode::SERVICE_UNAVAILABLE), Code::Unavailable);
        assert_eq!(code_for_http(StatusCode::UNAUTHORIZED), Code::Unauthenticated);
        assert_eq!(code_for_http(StatusCode::NOT_FOUND), Code::Unimplemented);
        assert_eq!(code_for_http(StatusCode::IM_A_TEAPOT), Code::Unknown);
    }

    #[tokio::test]
    async fn body_yields_messages_then_ends_on_ok_trailer() {
        let mut wire = encode_frame(FLAG_DATA, b"one").to_vec();
        wire.extend_from_slice(&encode_frame(FLAG_DATA, b"two"));
        wire.extend_from_slice(&encode_trailers(0, ""));
        let (a, b) = wire.split_at(7);
        let mut messages = decode_body(
            body_of(vec![Bytes::copy_from_slice(a), Bytes::copy_from_slice(b)]),
            false,
        );
        assert_eq!(messages.next().await.unwrap().unwrap(), Bytes::from_static(b"one"));
        assert_eq!(messages.next().await.unwrap().unwrap(), Bytes::from_static(b"two"));
        assert!(messages.next().await.is_none());
    }

    #[tokio::test]
    async fn body_surfaces_error_trailer_and_missing_trailer() {
        let mut messages = decode_body(body_of(vec![encode_trailers(5, "no such arm")]), false);
        let err = messages.next().await.unwrap().unwrap_err();
        assert_eq!(err.code(), Code::NotFound);
        assert!(messages.next().await.is_none());

        let mut messages = decode_body(body_of(vec![encode_frame(FLAG_DATA, b"x")]), false);
        assert!(messages.next().await.unwrap().is_ok());
        assert_eq!(messages.next().await.unwrap().unwrap_err().code(), Code::Internal);

        let mut messages = decode_body(body_of(Vec::new()), true);
        assert!(messages.next().await.is_none());
    }
}
