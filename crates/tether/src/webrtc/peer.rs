use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::config::IceServer;
use crate::error::{LinkError, setup_error};
use crate::webrtc::signaling::{ExchangePeer, IceCandidate};

pub const DATA_CHANNEL_LABEL: &str = "data";
pub const NEGOTIATION_CHANNEL_LABEL: &str = "negotiation";
const DATA_CHANNEL_ID: u16 = 0;
const NEGOTIATION_CHANNEL_ID: u16 = 1;

#[derive(Debug, Clone, Default)]
pub struct PeerOptions {
    pub trickle: bool,
    pub ice_servers: Vec<IceServer>,
    /// Extra `a=` attributes for the session section of every local offer.
    pub sdp_fields: Vec<(String, String)>,
}

/// A fresh client-side peer connection with its two negotiated channels.
pub struct ClientPeer {
    pub pc: Arc<RTCPeerConnection>,
    pub data_channel: Arc<RTCDataChannel>,
    pub negotiation_channel: Arc<RTCDataChannel>,
    /// `Some` per gathered candidate, `None` once gathering completes.
    pub local_candidates: mpsc::UnboundedReceiver<Option<IceCandidate>>,
    pub data_ready: DataReady,
    pub sdp_fields: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Readiness {
    Pending,
    Open,
    Failed(String),
}

/// Settles once: open when the data channel opens, failed when the link dies first.
#[derive(Debug, Clone)]
pub struct DataReady {
    state: Arc<watch::Sender<Readiness>>,
}

impl Default for DataReady {
    fn default() -> Self {
        Self {
            state: Arc::new(watch::Sender::new(Readiness::Pending)),
        }
    }
}

impl DataReady {
    pub fn open(&self) {
        self.settle(Readiness::Open);
    }

    pub fn fail(&self, reason: impl Into<String>) {
        self.settle(Readiness::Failed(reason.into()));
    }

    fn settle(&self, next: Readiness) {
        self.state.send_if_modified(|state| {
            if *state != Readiness::Pending {
                return false;
            }
            *state = next;
            true
        });
    }

    pub fn is_settled(&self) -> bool {
        *self.state.borrow() != Readiness::Pending
    }

    pub async fn wait(&self) -> Result<(), LinkError> {
        let mut state = self.state.subscribe();
        let settled = state
            .wait_for(|state| *state != Readiness::Pending)
            .await
            .map_err(|_| LinkError::Closed)?
            .clone();
        match settled {
            Readiness::Failed(reason) => Err(LinkError::Network(reason)),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SdpPayload {
    sdp: String,
    #[serde(rename = "type")]
    typ: String,
}

fn build_api() -> Result<API, LinkError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(setup_error)?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine).map_err(setup_error)?;

    Ok(APIBuilder::new()
        .with_setting_engine(SettingEngine::default())
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

pub fn description_to_json(description: &RTCSessionDescription) -> Result<String, LinkError> {
    serde_json::to_string(&SdpPayload {
        sdp: description.sdp.clone(),
        typ: description.sdp_type.to_string(),
    })
    .map_err(setup_error)
}

pub fn description_from_json(json: &str) -> Result<RTCSessionDescription, LinkError> {
    let payload: SdpPayload = serde_json::from_str(json).map_err(setup_error)?;
    match RTCSdpType::from(payload.typ.as_str()) {
        RTCSdpType::Offer => RTCSessionDescription::offer(payload.sdp).map_err(setup_error),
        RTCSdpType::Answer => RTCSessionDescription::answer(payload.sdp).map_err(setup_error),
        RTCSdpType::Pranswer => RTCSessionDescription::pranswer(payload.sdp).map_err(setup_error),
        RTCSdpType::Rollback | RTCSdpType::Unspecified => Err(LinkError::Setup(format!(
            "unsupported sdp type {}",
            payload.typ
        ))),
    }
}

/// Insert `a=` lines before the first media section.
pub fn append_sdp_fields(sdp: &str, fields: &[(String, String)]) -> String {
    if fields.is_empty() {
        return sdp.to_string();
    }
    let attributes: String = fields
        .iter()
        .map(|(key, value)| {
            if value.is_empty() {
                format!("a={key}\r\n")
            } else {
                format!("a={key}:{value}\r\n")
            }
        })
        .collect();
    match sdp.find("\r\nm=") {
        Some(index) => {
            let split = index + 2;
            format!("{}{}{}", &sdp[..split], attributes, &sdp[split..])
        }
        None => {
            let mut out = sdp.to_string();
            if !out.is_empty() && !out.ends_with("\r\n") {
                out.push_str("\r\n");
            }
            out.push_str(&attributes);
            out
        }
    }
}

fn candidate_from_rtc(candidate: &RTCIceCandidate) -> Option<IceCandidate> {
    match candidate.to_json() {
        Ok(init) => Some(IceCandidate {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }),
        Err(err) => {
            warn!(target: "tether::webrtc::peer", error = %err, "failed to serialize local candidate");
            None
        }
    }
}

/// Create the peer connection plus its `data` and `negotiation` channels.
pub async fn new_peer_connection_for_client(options: &PeerOptions) -> Result<ClientPeer, LinkError> {
    let api = build_api()?;
    let config = RTCConfiguration {
        ice_servers: options.ice_servers.iter().map(IceServer::to_rtc).collect(),
        ..Default::default()
    };
    let pc = Arc::new(api.new_peer_connection(config).await.map_err(setup_error)?);

    let data_channel = pc
        .create_data_channel(
            DATA_CHANNEL_LABEL,
            Some(RTCDataChannelInit {
                ordered: Some(true),
                negotiated: Some(DATA_CHANNEL_ID),
                ..Default::default()
            }),
        )
        .await
        .map_err(setup_error)?;
    let negotiation_channel = pc
        .create_data_channel(
            NEGOTIATION_CHANNEL_LABEL,
            Some(RTCDataChannelInit {
                ordered: Some(true),
                negotiated: Some(NEGOTIATION_CHANNEL_ID),
                ..Default::default()
            }),
        )
        .await
        .map_err(setup_error)?;

    let data_ready = DataReady::default();
    let ready = data_ready.clone();
    data_channel.on_open(Box::new(move || {
        let ready = ready.clone();
        Box::pin(async move {
            debug!(target: "tether::webrtc::peer", "data channel opened");
            ready.open();
        })
    }));
    let ready = data_ready.clone();
    data_channel.on_error(Box::new(move |err: webrtc::Error| {
        warn!(target: "tether::webrtc::peer", error = %err, "data channel error");
        ready.fail(format!("data channel error: {err}"));
        Box::pin(async {})
    }));
    let ready = data_ready.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        debug!(target: "tether::webrtc::peer", state = %state, "peer connection state");
        if matches!(
            state,
            RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed
        ) {
            ready.fail(format!("peer connection {state} before data channel opened"));
        }
        Box::pin(async {})
    }));

    let (candidate_tx, local_candidates) = mpsc::unbounded_channel();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let sender = candidate_tx.clone();
        Box::pin(async move {
            match candidate {
                Some(candidate) => {
                    if let Some(candidate) = candidate_from_rtc(&candidate) {
                        trace!(target: "tether::webrtc::peer", candidate = %candidate.candidate, "local candidate");
                        let _ = sender.send(Some(candidate));
                    }
                }
                None => {
                    trace!(target: "tether::webrtc::peer", "local gathering complete");
                    let _ = sender.send(None);
                }
            }
        })
    }));

    install_renegotiation(&pc, &negotiation_channel, options.sdp_fields.clone());

    Ok(ClientPeer {
        pc,
        data_channel,
        negotiation_channel,
        local_candidates,
        data_ready,
        sdp_fields: options.sdp_fields.clone(),
    })
}

/// Create and apply the initial offer, returning it as JSON.
///
/// Without trickle this waits for gathering so the offer carries every candidate.
pub async fn create_local_offer(
    pc: &RTCPeerConnection,
    trickle: bool,
    sdp_fields: &[(String, String)],
) -> Result<String, LinkError> {
    let offer = pc.create_offer(None).await.map_err(setup_error)?;
    let offer = RTCSessionDescription::offer(append_sdp_fields(&offer.sdp, sdp_fields))
        .map_err(setup_error)?;
    let mut gather = pc.gathering_complete_promise().await;
    pc.set_local_description(offer).await.map_err(setup_error)?;
    if !trickle {
        let _ = gather.recv().await;
    }
    let local = pc
        .local_description()
        .await
        .ok_or_else(|| LinkError::Setup("missing local description".into()))?;
    description_to_json(&local)
}

fn install_renegotiation(
    pc: &Arc<RTCPeerConnection>,
    negotiation_channel: &Arc<RTCDataChannel>,
    sdp_fields: Vec<(String, String)>,
) {
    let weak_pc = Arc::downgrade(pc);
    let weak_channel = Arc::downgrade(negotiation_channel);
    pc.on_negotiation_needed(Box::new(move || {
        let pc = weak_pc.clone();
        let channel = weak_channel.clone();
        let fields = sdp_fields.clone();
        Box::pin(async move {
            if let Err(err) = renegotiate(pc, channel, &fields).await {
                warn!(target: "tether::webrtc::peer", error = %err, "renegotiation failed");
            }
        })
    }));

    let weak_pc = Arc::downgrade(pc);
    let weak_channel = Arc::downgrade(negotiation_channel);
    negotiation_channel.on_message(Box::new(move |msg: DataChannelMessage| {
        let pc = weak_pc.clone();
        let channel = weak_channel.clone();
        Box::pin(async move {
            if let Err(err) = apply_remote_renegotiation(pc, channel, &msg.data).await {
                warn!(
                    target: "tether::webrtc::peer",
                    error = %err,
                    "failed to apply remote renegotiation"
                );
            }
        })
    }));
}

async fn renegotiate(
    pc: Weak<RTCPeerConnection>,
    channel: Weak<RTCDataChannel>,
    sdp_fields: &[(String, String)],
) -> Result<(), LinkError> {
    let (Some(pc), Some(channel)) = (pc.upgrade(), channel.upgrade()) else {
        return Ok(());
    };
    // The first offer goes through signaling instead.
    if channel.ready_state() != RTCDataChannelState::Open {
        return Ok(());
    }
    let offer = pc.create_offer(None).await.map_err(setup_error)?;
    let offer = RTCSessionDescription::offer(append_sdp_fields(&offer.sdp, sdp_fields))
        .map_err(setup_error)?;
    pc.set_local_description(offer).await.map_err(setup_error)?;
    send_local_description(&pc, &channel).await
}

async fn apply_remote_renegotiation(
    pc: Weak<RTCPeerConnection>,
    channel: Weak<RTCDataChannel>,
    data: &[u8],
) -> Result<(), LinkError> {
    let (Some(pc), Some(channel)) = (pc.upgrade(), channel.upgrade()) else {
        return Ok(());
    };
    let json = std::str::from_utf8(data).map_err(setup_error)?;
    let description = description_from_json(json)?;
    let is_offer = description.sdp_type == RTCSdpType::Offer;
    pc.set_remote_description(description)
        .await
        .map_err(setup_error)?;
    if is_offer {
        let answer = pc.create_answer(None).await.map_err(setup_error)?;
        pc.set_local_description(answer).await.map_err(setup_error)?;
        send_local_description(&pc, &channel).await?;
    }
    Ok(())
}

async fn send_local_description(
    pc: &RTCPeerConnection,
    channel: &RTCDataChannel,
) -> Result<(), LinkError> {
    let local = pc
        .local_description()
        .await
        .ok_or_else(|| LinkError::Setup("missing local description".into()))?;
    let json = description_to_json(&local)?;
    channel.send_text(json).await.map_err(setup_error)?;
    Ok(())
}

/// Applies signaling results to a real peer connection.
pub struct PeerExchange {
    pc: Arc<RTCPeerConnection>,
}

impl PeerExchange {
    pub fn new(pc: Arc<RTCPeerConnection>) -> Self {
        Self { pc }
    }
}

#[async_trait]
impl ExchangePeer for PeerExchange {
    async fn apply_answer(&self, description_json: &str) -> Result<(), LinkError> {
        let description = description_from_json(description_json)?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(setup_error)
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), LinkError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await
            .map_err(setup_error)
    }

    async fn close(&self) {
        if let Err(err) = self.pc.close().await {
            debug!(target: "tether::webrtc::peer", error = %err, "peer close failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OFFER: &str = "v=0\r\no=- 1 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\nm=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\na=mid:0\r\n";

    #[test]
    fn sdp_fields_land_in_session_section() {
        let fields = vec![
            ("x-tether-priority".to_string(), "5".to_string()),
            ("x-flag".to_string(), String::new()),
        ];
        let out = append_sdp_fields(OFFER, &fields);
        let media = out.find("m=application").unwrap();
        let priority = out.find("a=x-tether-priority:5\r\n").unwrap();
        let flag = out.find("a=x-flag\r\n").unwrap();
        assert!(priority < media && flag < media);
        assert!(out.find("t=0 0").unwrap() < priority);
        assert_eq!(append_sdp_fields(OFFER, &[]), OFFER);
    }

    #[test]
    fn description_json_uses_type_and_sdp() {
        let json = r#"{"type":"rollback","sdp":""}"#;
        assert!(description_from_json(json).is_err());
        assert!(description_from_json("not json").is_err());
    }

    #[tokio::test]
    async fn client_peer_has_negotiated_channels() {
        let peer = new_peer_connection_for_client(&PeerOptions {
            trickle: true,
            ..Default::default()
        })
        .await
        .expect("peer");
        assert_eq!(peer.data_channel.label(), DATA_CHANNEL_LABEL);
        assert_eq!(peer.negotiation_channel.label(), NEGOTIATION_CHANNEL_LABEL);
        assert!(peer.data_channel.ordered());

        let offer = create_local_offer(&peer.pc, true, &[("x-extra".into(), String::new())])
            .await
            .expect("offer");
        let payload: serde_json::Value = serde_json::from_str(&offer).unwrap();
        assert_eq!(payload["type"], "offer");
        assert!(payload["sdp"].as_str().unwrap().contains("a=x-extra"));
        peer.pc.close().await.expect("close");
    }

    #[tokio::test]
    async fn readiness_settles_once() {
        let ready = DataReady::default();
        assert!(!ready.is_settled());
        ready.open();
        ready.fail("late");
        ready.wait().await.expect("first settlement wins");

        let ready = DataReady::default();
        let waiter = tokio::spawn({
            let ready = ready.clone();
            async move { ready.wait().await }
        });
        ready.fail("data channel closed");
        ready.open();
        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, LinkError::Network(reason) if reason == "data channel closed"));
    }

    #[tokio::test]
    async fn closing_peer_before_open_fails_readiness() {
        let peer = new_peer_connection_for_client(&PeerOptions::default())
            .await
            .expect("peer");
        peer.pc.close().await.expect("close");
        let err = tokio::time::timeout(std::time::Duration::from_secs(5), peer.data_ready.wait())
            .await
            .expect("readiness settled")
            .unwrap_err();
        assert!(err.is_retryable(), "{err}");
    }
}
