use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::error::{Code, LinkError, Status};
use crate::rpc::{ChannelKind, MessageStream, Metadata, RpcChannel, RpcRequest, RpcResponse};
use crate::runtime::spawn_with_handle;
use crate::webrtc::stream::{
    ClientStream, RequestEnvelope, RequestKind, StreamEvent, decode_response, encode_request,
    packetize,
};

/// Outbound half of the data channel.
#[async_trait]
pub trait DataChannelSink: Send + Sync {
    async fn send(&self, data: Bytes) -> Result<(), LinkError>;

    async fn close(&self);
}

/// Many concurrent calls multiplexed over one ordered data channel.
#[derive(Clone)]
pub struct WebRtcChannel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    sink: Arc<dyn DataChannelSink>,
    streams: Mutex<HashMap<u64, ClientStream>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl WebRtcChannel {
    pub fn new(sink: Arc<dyn DataChannelSink>) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                sink,
                streams: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn open_streams(&self) -> usize {
        self.inner.streams.lock().len()
    }

    /// Feed one inbound data-channel message.
    pub fn handle_message(&self, data: &[u8]) {
        let envelope = match decode_response(data) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(
                    target: "tether::webrtc::channel",
                    error = %err,
                    bytes = data.len(),
                    "dropping undecodable response"
                );
                return;
            }
        };
        let mut streams = self.inner.streams.lock();
        let Some(stream) = streams.get_mut(&envelope.stream_id) else {
            trace!(
                target: "tether::webrtc::channel",
                stream_id = envelope.stream_id,
                "response for unknown stream"
            );
            return;
        };
        if stream.on_response(envelope.kind) {
            streams.remove(&envelope.stream_id);
        }
    }

    /// Reset a stream at the peer and fail it locally. Unknown ids are ignored.
    pub async fn cancel_stream(&self, stream_id: u64) {
        self.inner.cancel_stream(stream_id).await;
    }
}

impl ChannelInner {
    async fn send_request(&self, stream_id: u64, kind: RequestKind) -> Result<(), LinkError> {
        let bytes = encode_request(&RequestEnvelope { stream_id, kind })
            .map_err(|err| LinkError::Protocol(err.to_string()))?;
        self.sink.send(bytes).await
    }

    async fn cancel_stream(&self, stream_id: u64) {
        let Some(mut stream) = self.streams.lock().remove(&stream_id) else {
            return;
        };
        stream.finish(Err(Status::new(Code::Canceled, "stream canceled").into()));
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        if let Err(err) = self.send_request(stream_id, RequestKind::RstStream).await {
            debug!(
                target: "tether::webrtc::channel",
                stream_id,
                error = %err,
                "failed to send stream reset"
            );
        }
    }

    async fn write_call(&self, stream_id: u64, request: &RpcRequest) -> Result<(), LinkError> {
        self.send_request(
            stream_id,
            RequestKind::Headers {
                method: request.method.clone(),
                metadata: request.metadata.clone(),
                timeout_ms: request.timeout.map(|t| t.as_millis() as u64),
            },
        )
        .await?;
        self.with_stream(stream_id, ClientStream::mark_headers_sent);

        for packet in packetize(&request.message) {
            self.send_request(
                stream_id,
                RequestKind::Message {
                    packet: Some(packet),
                    eos: false,
                },
            )
            .await?;
            self.with_stream(stream_id, ClientStream::mark_message_sent);
        }

        self.send_request(
            stream_id,
            RequestKind::Message {
                packet: None,
                eos: true,
            },
        )
        .await?;
        self.with_stream(stream_id, ClientStream::mark_half_closed);
        Ok(())
    }

    fn with_stream(&self, stream_id: u64, f: impl FnOnce(&mut ClientStream)) {
        if let Some(stream) = self.streams.lock().get_mut(&stream_id) {
            f(stream);
        }
    }
}

/// Resets the stream when the caller drops the response early.
struct CallGuard {
    channel: Weak<ChannelInner>,
    stream_id: u64,
    finished: bool,
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let Some(channel) = self.channel.upgrade() else {
            return;
        };
        if !channel.streams.lock().contains_key(&self.stream_id) {
            return;
        }
        let stream_id = self.stream_id;
        spawn_with_handle(None, async move {
            channel.cancel_stream(stream_id).await;
        });
    }
}

struct ResponseState {
    events: mpsc::UnboundedReceiver<StreamEvent>,
    deadline: Option<Instant>,
    guard: CallGuard,
}

/// `None` once `deadline` passes.
async fn recv_until(
    events: &mut mpsc::UnboundedReceiver<StreamEvent>,
    deadline: Option<Instant>,
) -> Option<Option<StreamEvent>> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, events.recv()).await.ok(),
        None => Some(events.recv().await),
    }
}

fn deadline_exceeded() -> LinkError {
    Status::new(Code::DeadlineExceeded, "deadline exceeded").into()
}

fn message_stream(state: ResponseState) -> MessageStream {
    Box::pin(stream::unfold(state, |mut state| async move {
        if state.guard.finished {
            return None;
        }
        loop {
            let Some(event) = recv_until(&mut state.events, state.deadline).await else {
                state.guard.finished = true;
                if let Some(channel) = state.guard.channel.upgrade() {
                    channel.cancel_stream(state.guard.stream_id).await;
                }
                return Some((Err(deadline_exceeded()), state));
            };
            match event {
                Some(StreamEvent::Message(message)) => return Some((Ok(message), state)),
                Some(StreamEvent::Headers(_)) => continue,
                Some(StreamEvent::End(Ok(()))) => {
                    state.guard.finished = true;
                    return None;
                }
                Some(StreamEvent::End(Err(err))) => {
                    state.guard.finished = true;
                    return Some((Err(err), state));
                }
                None => {
                    state.guard.finished = true;
                    return Some((Err(LinkError::Closed), state));
                }
            }
        }
    }))
}

#[async_trait]
impl RpcChannel for WebRtcChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::WebRtc
    }

    async fn invoke(&self, request: RpcRequest) -> Result<RpcResponse, LinkError> {
        if self.is_closed() {
            return Err(LinkError::Closed);
        }
        // The deadline covers the whole call, trailers included.
        let deadline = request.timeout.map(|timeout| Instant::now() + timeout);
        let stream_id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.inner
            .streams
            .lock()
            .insert(stream_id, ClientStream::new(stream_id, tx));
        let mut guard = CallGuard {
            channel: Arc::downgrade(&self.inner),
            stream_id,
            finished: false,
        };

        trace!(
            target: "tether::webrtc::channel",
            stream_id,
            method = %request.method,
            "starting call"
        );
        if let Err(err) = self.inner.write_call(stream_id, &request).await {
            guard.finished = true;
            self.inner.streams.lock().remove(&stream_id);
            return Err(err);
        }

        let Some(first) = recv_until(&mut rx, deadline).await else {
            guard.finished = true;
            self.inner.cancel_stream(stream_id).await;
            return Err(deadline_exceeded());
        };

        let headers = match first {
            Some(StreamEvent::Headers(headers)) => headers,
            Some(StreamEvent::End(Ok(()))) => {
                guard.finished = true;
                return Ok(RpcResponse::new(Metadata::new(), Box::pin(stream::empty())));
            }
            Some(StreamEvent::End(Err(err))) => {
                guard.finished = true;
                return Err(err);
            }
            Some(StreamEvent::Message(_)) => {
                guard.finished = true;
                return Err(LinkError::Protocol("message received before headers".into()));
            }
            None => {
                guard.finished = true;
                return Err(LinkError::Closed);
            }
        };

        Ok(RpcResponse::new(
            headers,
            message_stream(ResponseState {
                events: rx,
                deadline,
                guard,
            }),
        ))
    }

    /// Fails every open stream so no caller is left waiting.
    async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let streams: Vec<ClientStream> = self
            .inner
            .streams
            .lock()
            .drain()
            .map(|(_, stream)| stream)
            .collect();
        debug!(
            target: "tether::webrtc::channel",
            open_streams = streams.len(),
            "closing channel"
        );
        for mut stream in streams {
            stream.finish(Err(LinkError::Closed));
        }
        self.inner.sink.close().await;
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}
