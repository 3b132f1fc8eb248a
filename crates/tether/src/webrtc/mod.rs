pub mod channel;
pub mod handle;
pub mod peer;
pub mod signaling;
pub mod signaling_rpc;
pub mod stream;

use std::sync::Arc;

use tracing::{debug, info};
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;

use crate::auth::DialAuth;
use crate::config::{DialConfig, DialTarget};
use crate::error::{Code, ConfigError, LinkError};
use crate::rpc::RpcChannel;

use self::channel::WebRtcChannel;
use self::handle::{PeerEvent, PeerEventKind, PeerHandle, RtcDataChannelSink, RtcPeer};
use self::peer::{PeerExchange, PeerOptions, create_local_offer, new_peer_connection_for_client};
use self::signaling::{ExchangeOptions, SignalingService, run_exchange};
use self::signaling_rpc::RpcSignalingClient;

/// An established WebRTC link: the multiplexed channel and the peer that carries it.
pub struct WebRtcConnection {
    pub channel: WebRtcChannel,
    pub peer: Arc<RtcPeer>,
}

/// Dial `config.host` through its signaling service.
pub async fn dial_webrtc(config: &DialConfig, auth: &DialAuth) -> Result<WebRtcConnection, LinkError> {
    let DialTarget::WebRtc { signaling_address } = config.target() else {
        return Err(ConfigError::MissingHost.into());
    };
    let signaling: Arc<dyn SignalingService> = Arc::new(RpcSignalingClient::connect(
        &signaling_address,
        config.insecure,
        auth.signaling.clone(),
        config.priority,
    )?);
    dial_webrtc_with(config, signaling).await
}

pub async fn dial_webrtc_with(
    config: &DialConfig,
    signaling: Arc<dyn SignalingService>,
) -> Result<WebRtcConnection, LinkError> {
    let mut ice_servers = config.ice_servers.clone();
    let mut trickle = !config.disable_trickle;
    match signaling.optional_webrtc_config(&config.host).await {
        Ok(extra) => {
            ice_servers.extend(extra.ice_servers);
            trickle &= !extra.disable_trickle;
        }
        Err(err) if err.code() == Code::Unimplemented => {
            debug!(target: "tether::webrtc", "signaling has no optional config");
        }
        Err(err) => return Err(err),
    }
    debug!(
        target: "tether::webrtc",
        host = %config.host,
        trickle,
        ice_servers = ice_servers.len(),
        priority = ?config.priority,
        "dialing over webrtc"
    );

    let client_peer = new_peer_connection_for_client(&PeerOptions {
        trickle,
        ice_servers,
        sdp_fields: config.sdp_fields.clone(),
    })
    .await?;
    let channel = WebRtcChannel::new(Arc::new(RtcDataChannelSink::new(
        client_peer.data_channel.clone(),
    )));
    let peer = RtcPeer::attach(
        client_peer.pc.clone(),
        &client_peer.data_channel,
        channel.clone(),
    );

    let offer = match create_local_offer(&client_peer.pc, trickle, &client_peer.sdp_fields).await {
        Ok(offer) => offer,
        Err(err) => {
            let _ = client_peer.pc.close().await;
            return Err(err);
        }
    };

    if client_peer.data_channel.ready_state() == RTCDataChannelState::Open {
        client_peer.data_ready.open();
    }
    let ready = client_peer.data_ready.clone();
    let closed = peer.add_listener(
        PeerEventKind::DataChannelClose,
        Arc::new(move |_: PeerEvent| ready.fail("data channel closed before it opened")),
    );
    let ready = client_peer.data_ready.clone();
    let ice = peer.add_listener(
        PeerEventKind::IceConnectionState,
        Arc::new(move |event: PeerEvent| {
            if let PeerEvent::IceConnectionState(
                state @ (RTCIceConnectionState::Failed | RTCIceConnectionState::Closed),
            ) = event
            {
                ready.fail(format!("ice connection {state} before data channel opened"));
            }
        }),
    );

    let exchange = run_exchange(
        signaling,
        Arc::new(PeerExchange::new(client_peer.pc.clone())),
        ExchangeOptions {
            host: config.host.clone(),
            trickle,
            dial_timeout: config.dial_timeout,
        },
        &offer,
        client_peer.local_candidates,
        client_peer.data_ready.wait(),
    )
    .await;
    peer.remove_listener(closed);
    peer.remove_listener(ice);
    if let Err(err) = exchange {
        channel.close().await;
        return Err(err);
    }

    info!(target: "tether::webrtc", host = %config.host, "webrtc connection established");
    Ok(WebRtcConnection { channel, peer })
}
