use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tracing::debug;
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::track::track_remote::TrackRemote;

use crate::error::{LinkError, network_error};
use crate::events::TrackEvent;
use crate::rpc::RpcChannel;
use crate::webrtc::channel::{DataChannelSink, WebRtcChannel};

#[derive(Debug, Clone)]
pub enum PeerEvent {
    IceConnectionState(RTCIceConnectionState),
    Track(TrackEvent),
    DataChannelClose,
}

impl PeerEvent {
    pub fn kind(&self) -> PeerEventKind {
        match self {
            PeerEvent::IceConnectionState(_) => PeerEventKind::IceConnectionState,
            PeerEvent::Track(_) => PeerEventKind::Track,
            PeerEvent::DataChannelClose => PeerEventKind::DataChannelClose,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerEventKind {
    IceConnectionState,
    Track,
    DataChannelClose,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

pub type PeerListener = Arc<dyn Fn(PeerEvent) + Send + Sync>;

/// Removable listeners keyed by event kind.
#[derive(Default)]
pub struct ListenerTable {
    next_id: AtomicU64,
    listeners: RwLock<HashMap<PeerEventKind, Vec<(ListenerId, PeerListener)>>>,
}

impl fmt::Debug for ListenerTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let listeners = self.listeners.read();
        f.debug_map()
            .entries(listeners.iter().map(|(kind, list)| (kind, list.len())))
            .finish()
    }
}

impl ListenerTable {
    pub fn add(&self, kind: PeerEventKind, listener: PeerListener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .write()
            .entry(kind)
            .or_default()
            .push((id, listener));
        id
    }

    pub fn remove(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        for list in listeners.values_mut() {
            if let Some(index) = list.iter().position(|(existing, _)| *existing == id) {
                list.remove(index);
                return true;
            }
        }
        false
    }

    pub fn count(&self, kind: PeerEventKind) -> usize {
        self.listeners.read().get(&kind).map_or(0, Vec::len)
    }

    pub fn dispatch(&self, event: PeerEvent) {
        // Snapshot so a listener may add or remove listeners.
        let targets: Vec<PeerListener> = self
            .listeners
            .read()
            .get(&event.kind())
            .map(|list| list.iter().map(|(_, listener)| listener.clone()).collect())
            .unwrap_or_default();
        for listener in targets {
            listener(event.clone());
        }
    }
}

/// The live peer behind a WebRTC connection, as seen by the dial orchestrator.
#[async_trait]
pub trait PeerHandle: Send + Sync {
    fn add_listener(&self, kind: PeerEventKind, listener: PeerListener) -> ListenerId;

    fn remove_listener(&self, id: ListenerId) -> bool;

    async fn close(&self);
}

pub struct RtcDataChannelSink {
    dc: Arc<RTCDataChannel>,
}

impl RtcDataChannelSink {
    pub fn new(dc: Arc<RTCDataChannel>) -> Self {
        Self { dc }
    }
}

#[async_trait]
impl DataChannelSink for RtcDataChannelSink {
    async fn send(&self, data: Bytes) -> Result<(), LinkError> {
        self.dc.send(&data).await.map_err(network_error)?;
        Ok(())
    }

    async fn close(&self) {
        if let Err(err) = self.dc.close().await {
            debug!(target: "tether::webrtc::handle", error = %err, "data channel close failed");
        }
    }
}

/// Owns the peer connection and forwards its single-slot callbacks to a listener table.
pub struct RtcPeer {
    pc: Arc<RTCPeerConnection>,
    listeners: Arc<ListenerTable>,
}

impl RtcPeer {
    pub fn attach(
        pc: Arc<RTCPeerConnection>,
        dc: &Arc<RTCDataChannel>,
        channel: WebRtcChannel,
    ) -> Arc<Self> {
        let listeners = Arc::new(ListenerTable::default());

        let table = listeners.clone();
        pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            debug!(target: "tether::webrtc::handle", state = %state, "ice connection state");
            table.dispatch(PeerEvent::IceConnectionState(state));
            Box::pin(async {})
        }));

        let table = listeners.clone();
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                table.dispatch(PeerEvent::Track(TrackEvent {
                    id: track.id(),
                    stream_id: track.stream_id(),
                    kind: track.kind().to_string(),
                    track: Some(track),
                }));
                Box::pin(async {})
            },
        ));

        let inbound = channel.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            inbound.handle_message(&msg.data);
            Box::pin(async {})
        }));

        let table = listeners.clone();
        let closing = channel;
        dc.on_close(Box::new(move || {
            let table = table.clone();
            let channel = closing.clone();
            Box::pin(async move {
                debug!(target: "tether::webrtc::handle", "data channel closed");
                channel.close().await;
                table.dispatch(PeerEvent::DataChannelClose);
            })
        }));

        Arc::new(Self { pc, listeners })
    }
}

#[async_trait]
impl PeerHandle for RtcPeer {
    fn add_listener(&self, kind: PeerEventKind, listener: PeerListener) -> ListenerId {
        self.listeners.add(kind, listener)
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    async fn close(&self) {
        if let Err(err) = self.pc.close().await {
            debug!(target: "tether::webrtc::handle", error = %err, "peer close failed");
        }
    }
}
