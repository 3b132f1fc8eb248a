//! Per-stream framing for RPCs multiplexed over one data channel.
//!
//! Every data-channel message is one codec frame whose payload is a bincode
//! envelope addressed to a stream id. Large messages travel as several
//! packets; the last one carries `eom`.

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::error::{LinkError, Status};
use crate::rpc::Metadata;
use crate::rpc::codec::{FLAG_DATA, FLAG_TRAILER, Frame, FrameError, decode_frame, encode_frame};

/// Largest data slice carried by one packet. The bincode envelope and frame
/// header add up to 28 bytes on top, so a full request packet is 16401 bytes.
pub const MAX_PACKET_DATA_SIZE: usize = 16373;
pub const MAX_MESSAGE_SIZE: usize = 32 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketMessage {
    pub data: Bytes,
    pub eom: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestKind {
    Headers {
        method: String,
        metadata: Metadata,
        timeout_ms: Option<u64>,
    },
    Message {
        packet: Option<PacketMessage>,
        eos: bool,
    },
    RstStream,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub stream_id: u64,
    pub kind: RequestKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseKind {
    Headers {
        metadata: Metadata,
    },
    Message {
        packet: PacketMessage,
    },
    Trailers {
        code: i32,
        message: String,
        metadata: Metadata,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub stream_id: u64,
    pub kind: ResponseKind,
}

pub fn encode_request(envelope: &RequestEnvelope) -> Result<Bytes, FrameError> {
    let payload =
        bincode::serialize(envelope).map_err(|err| FrameError::Envelope(err.to_string()))?;
    Ok(encode_frame(FLAG_DATA, &payload))
}

pub fn decode_request(bytes: &[u8]) -> Result<RequestEnvelope, FrameError> {
    let frame = decode_frame(bytes)?;
    bincode::deserialize(&frame.payload).map_err(|err| FrameError::Envelope(err.to_string()))
}

pub fn encode_response(envelope: &ResponseEnvelope) -> Result<Bytes, FrameError> {
    let payload =
        bincode::serialize(envelope).map_err(|err| FrameError::Envelope(err.to_string()))?;
    let flags = match envelope.kind {
        ResponseKind::Trailers { .. } => FLAG_TRAILER,
        _ => FLAG_DATA,
    };
    Ok(encode_frame(flags, &payload))
}

pub fn decode_response(bytes: &[u8]) -> Result<ResponseEnvelope, FrameError> {
    let Frame { flags, payload } = decode_frame(bytes)?;
    let envelope: ResponseEnvelope =
        bincode::deserialize(&payload).map_err(|err| FrameError::Envelope(err.to_string()))?;
    let is_trailer = matches!(envelope.kind, ResponseKind::Trailers { .. });
    if is_trailer != (flags & FLAG_TRAILER != 0) {
        return Err(FrameError::Envelope(format!(
            "trailer flag {flags:#04x} disagrees with envelope"
        )));
    }
    Ok(envelope)
}

/// Split a message into packets. An empty message still yields one `eom` packet.
pub fn packetize(message: &Bytes) -> Vec<PacketMessage> {
    if message.is_empty() {
        return vec![PacketMessage {
            data: Bytes::new(),
            eom: true,
        }];
    }
    let count = message.len().div_ceil(MAX_PACKET_DATA_SIZE);
    (0..count)
        .map(|index| {
            let start = index * MAX_PACKET_DATA_SIZE;
            let end = (start + MAX_PACKET_DATA_SIZE).min(message.len());
            PacketMessage {
                data: message.slice(start..end),
                eom: index + 1 == count,
            }
        })
        .collect()
}

/// Inbound reassembly for one stream.
#[derive(Debug)]
pub struct BaseStream {
    stream_id: u64,
    chunks: Vec<Bytes>,
    buffered: usize,
    limit: usize,
    discarding: bool,
}

impl BaseStream {
    pub fn new(stream_id: u64) -> Self {
        Self::with_limit(stream_id, MAX_MESSAGE_SIZE)
    }

    pub fn with_limit(stream_id: u64, limit: usize) -> Self {
        Self {
            stream_id,
            chunks: Vec::new(),
            buffered: 0,
            limit,
            discarding: false,
        }
    }

    pub fn stream_id(&self) -> u64 {
        self.stream_id
    }

    pub fn buffered(&self) -> usize {
        self.buffered
    }

    /// Returns the complete message once a packet with `eom` arrives.
    /// An oversized message is dropped through its final packet.
    pub fn push_packet(&mut self, packet: PacketMessage) -> Option<Bytes> {
        if self.discarding {
            if packet.eom {
                self.discarding = false;
            }
            return None;
        }
        if self.buffered + packet.data.len() > self.limit {
            error!(
                target: "tether::webrtc::stream",
                stream_id = self.stream_id,
                buffered = self.buffered,
                incoming = packet.data.len(),
                limit = self.limit,
                "message exceeds maximum size; discarding"
            );
            self.chunks.clear();
            self.buffered = 0;
            self.discarding = !packet.eom;
            return None;
        }
        self.buffered += packet.data.len();
        self.chunks.push(packet.data);
        if !packet.eom {
            return None;
        }
        let message = match self.chunks.len() {
            1 => self.chunks.pop().unwrap_or_default(),
            _ => {
                let mut joined = BytesMut::with_capacity(self.buffered);
                for chunk in self.chunks.drain(..) {
                    joined.extend_from_slice(&chunk);
                }
                joined.freeze()
            }
        };
        self.chunks.clear();
        self.buffered = 0;
        Some(message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    Unstarted,
    HeadersSent,
    Messages,
    HalfClosed,
    Closed,
}

#[derive(Debug)]
pub enum StreamEvent {
    Headers(Metadata),
    Message(Bytes),
    End(Result<(), LinkError>),
}

/// Client half of one call: tracks what was sent and validates what arrives.
#[derive(Debug)]
pub struct ClientStream {
    base: BaseStream,
    phase: StreamPhase,
    headers_received: bool,
    trailers_received: bool,
    events: mpsc::UnboundedSender<StreamEvent>,
}

impl ClientStream {
    pub fn new(stream_id: u64, events: mpsc::UnboundedSender<StreamEvent>) -> Self {
        Self {
            base: BaseStream::new(stream_id),
            phase: StreamPhase::Unstarted,
            headers_received: false,
            trailers_received: false,
            events,
        }
    }

    pub fn stream_id(&self) -> u64 {
        self.base.stream_id()
    }

    pub fn phase(&self) -> StreamPhase {
        self.phase
    }

    pub fn mark_headers_sent(&mut self) {
        if self.phase == StreamPhase::Unstarted {
            self.phase = StreamPhase::HeadersSent;
        }
    }

    pub fn mark_message_sent(&mut self) {
        if matches!(self.phase, StreamPhase::HeadersSent | StreamPhase::Messages) {
            self.phase = StreamPhase::Messages;
        }
    }

    pub fn mark_half_closed(&mut self) {
        if self.phase != StreamPhase::Closed {
            self.phase = StreamPhase::HalfClosed;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.phase == StreamPhase::Closed
    }

    /// Apply one response. Returns true once the stream has terminated.
    pub fn on_response(&mut self, kind: ResponseKind) -> bool {
        if self.is_closed() {
            return true;
        }
        match kind {
            ResponseKind::Headers { metadata } => {
                if self.trailers_received {
                    return self.violation("headers received after trailers");
                }
                if self.headers_received {
                    return self.violation("headers received more than once");
                }
                self.headers_received = true;
                let _ = self.events.send(StreamEvent::Headers(metadata));
                false
            }
            ResponseKind::Message { packet } => {
                if !self.headers_received {
                    return self.violation("message received before headers");
                }
                if let Some(message) = self.base.push_packet(packet) {
                    let _ = self.events.send(StreamEvent::Message(message));
                }
                false
            }
            ResponseKind::Trailers { code, message, .. } => {
                self.trailers_received = true;
                let result = if code == 0 {
                    Ok(())
                } else {
                    Err(Status::from_parts(code, message).into())
                };
                self.finish(result);
                true
            }
        }
    }

    /// Terminate the stream locally with `result`; later calls are ignored.
    pub fn finish(&mut self, result: Result<(), LinkError>) {
        if self.is_closed() {
            return;
        }
        self.phase = StreamPhase::Closed;
        let _ = self.events.send(StreamEvent::End(result));
    }

    fn violation(&mut self, reason: &'static str) -> bool {
        debug!(
            target: "tether::webrtc::stream",
            stream_id = self.stream_id(),
            reason,
            "protocol violation; terminating stream"
        );
        self.finish(Err(LinkError::Protocol(reason.to_string())));
        true
    }
}
