use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::trace;

use crate::auth::DialAuth;
use crate::config::DialConfig;
use crate::error::LinkError;
use crate::events::DialMethod;
use crate::rpc::RpcChannel;
use crate::rpc::direct::DirectChannel;
use crate::webrtc::handle::{ListenerId, PeerEventKind, PeerHandle, PeerListener};

/// A freshly dialed link, ready to be installed.
pub struct Connection {
    pub method: DialMethod,
    pub channel: Arc<dyn RpcChannel>,
    /// Present for WebRTC links only.
    pub peer: Option<Arc<dyn PeerHandle>>,
}

impl Connection {
    pub fn direct(channel: Arc<dyn RpcChannel>) -> Self {
        Self {
            method: DialMethod::Grpc,
            channel,
            peer: None,
        }
    }

    pub fn webrtc(channel: Arc<dyn RpcChannel>, peer: Arc<dyn PeerHandle>) -> Self {
        Self {
            method: DialMethod::WebRtc,
            channel,
            peer: Some(peer),
        }
    }

    pub async fn close(&self) {
        self.channel.close().await;
        if let Some(peer) = &self.peer {
            peer.close().await;
        }
    }
}

/// One attempt of each dial method. Retries are the caller's business.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial_webrtc(&self, config: &DialConfig, auth: &DialAuth) -> Result<Connection, LinkError>;

    async fn dial_direct(&self, config: &DialConfig, auth: &DialAuth) -> Result<Connection, LinkError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NetworkDialer;

#[async_trait]
impl Dialer for NetworkDialer {
    async fn dial_webrtc(&self, config: &DialConfig, auth: &DialAuth) -> Result<Connection, LinkError> {
        let connection = crate::webrtc::dial_webrtc(config, auth).await?;
        Ok(Connection::webrtc(
            Arc::new(connection.channel),
            connection.peer,
        ))
    }

    async fn dial_direct(&self, config: &DialConfig, auth: &DialAuth) -> Result<Connection, LinkError> {
        let channel = DirectChannel::new(&config.host, config.insecure, auth.target.clone())?;
        Ok(Connection::direct(Arc::new(channel)))
    }
}

/// At most one registered listener per event kind, across peer replacements.
#[derive(Default)]
pub struct HandlerSlots {
    slots: HashMap<PeerEventKind, (Arc<dyn PeerHandle>, ListenerId)>,
}

impl HandlerSlots {
    /// Remove whatever listener holds `kind`, then register `listener` on `peer`.
    pub fn replace(
        &mut self,
        peer: &Arc<dyn PeerHandle>,
        kind: PeerEventKind,
        listener: PeerListener,
    ) {
        if let Some((previous, id)) = self.slots.remove(&kind) {
            previous.remove_listener(id);
        }
        let id = peer.add_listener(kind, listener);
        trace!(target: "tether::client", ?kind, "peer listener installed");
        self.slots.insert(kind, (peer.clone(), id));
    }

    pub fn clear(&mut self) {
        for (_, (peer, id)) in self.slots.drain() {
            peer.remove_listener(id);
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webrtc::handle::{ListenerTable, PeerEvent};

    #[derive(Default)]
    struct TablePeer {
        table: ListenerTable,
    }

    #[async_trait]
    impl PeerHandle for TablePeer {
        fn add_listener(&self, kind: PeerEventKind, listener: PeerListener) -> ListenerId {
            self.table.add(kind, listener)
        }

        fn remove_listener(&self, id: ListenerId) -> bool {
            self.table.remove(id)
        }

        async fn close(&self) {}
    }

    fn noop() -> PeerListener {
        Arc::new(|_: PeerEvent| {})
    }

    #[test]
    fn replace_moves_listener_to_new_peer() {
        let first = Arc::new(TablePeer::default());
        let second = Arc::new(TablePeer::default());
        let first_handle: Arc<dyn PeerHandle> = first.clone();
        let second_handle: Arc<dyn PeerHandle> = second.clone();
        let mut slots = HandlerSlots::default();

        slots.replace(&first_handle, PeerEventKind::DataChannelClose, noop());
        slots.replace(&first_handle, PeerEventKind::DataChannelClose, noop());
        assert_eq!(first.table.count(PeerEventKind::DataChannelClose), 1);

        slots.replace(&second_handle, PeerEventKind::DataChannelClose, noop());
        assert_eq!(first.table.count(PeerEventKind::DataChannelClose), 0);
        assert_eq!(second.table.count(PeerEventKind::DataChannelClose), 1);

        slots.clear();
        assert!(slots.is_empty());
        assert_eq!(second.table.count(PeerEventKind::DataChannelClose), 0);
    }
}
