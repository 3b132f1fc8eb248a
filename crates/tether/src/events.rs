use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use webrtc::track::track_remote::TrackRemote;

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DialMethod {
    WebRtc,
    Grpc,
}

impl DialMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            DialMethod::WebRtc => "webrtc",
            DialMethod::Grpc => "grpc",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

/// A remote media track surfaced unchanged from the peer connection.
#[derive(Clone)]
pub struct TrackEvent {
    pub id: String,
    pub stream_id: String,
    pub kind: String,
    pub track: Option<Arc<TrackRemote>>,
}

impl fmt::Debug for TrackEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackEvent")
            .field("id", &self.id)
            .field("stream_id", &self.stream_id)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub enum ClientEvent {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected { error: Option<String> },
    Dialing { method: DialMethod, attempt: u32 },
    Track(TrackEvent),
}

impl ClientEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ClientEvent::Connecting => EventKind::Connecting,
            ClientEvent::Connected => EventKind::Connected,
            ClientEvent::Disconnecting => EventKind::Disconnecting,
            ClientEvent::Disconnected { .. } => EventKind::Disconnected,
            ClientEvent::Dialing { .. } => EventKind::Dialing,
            ClientEvent::Track(_) => EventKind::Track,
        }
    }

    fn is_connection_change(&self) -> bool {
        !matches!(self, ClientEvent::Track(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
    Dialing,
    /// Receives every event of the five kinds above.
    ConnectionStateChange,
    Track,
}

/// Per-kind broadcast fan-out of client events.
#[derive(Debug)]
pub struct EventHub {
    topics: parking_lot::RwLock<HashMap<EventKind, broadcast::Sender<ClientEvent>>>,
    state: watch::Sender<ConnectionState>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHub {
    pub fn new() -> Self {
        Self {
            topics: parking_lot::RwLock::new(HashMap::new()),
            state: watch::channel(ConnectionState::Idle).0,
        }
    }

    fn sender_for(&self, kind: EventKind) -> broadcast::Sender<ClientEvent> {
        if let Some(sender) = self.topics.read().get(&kind) {
            return sender.clone();
        }
        self.topics
            .write()
            .entry(kind)
            .or_insert_with(|| broadcast::channel(EVENT_CAPACITY).0)
            .clone()
    }

    pub fn subscribe(&self, kind: EventKind) -> broadcast::Receiver<ClientEvent> {
        self.sender_for(kind).subscribe()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    /// Publish to the event's own kind, and to the superset topic for connection changes.
    /// Events without subscribers are dropped.
    pub fn emit(&self, event: ClientEvent) {
        let next_state = match &event {
            ClientEvent::Connecting => Some(ConnectionState::Connecting),
            ClientEvent::Connected => Some(ConnectionState::Connected),
            ClientEvent::Disconnecting => Some(ConnectionState::Disconnecting),
            ClientEvent::Disconnected { .. } => Some(ConnectionState::Disconnected),
            _ => None,
        };
        if let Some(state) = next_state {
            self.set_state(state);
        }
        let topics = self.topics.read();
        if event.is_connection_change() {
            if let Some(sender) = topics.get(&EventKind::ConnectionStateChange) {
                let _ = sender.send(event.clone());
            }
        }
        if let Some(sender) = topics.get(&event.kind()) {
            let _ = sender.send(event);
        }
    }
}
