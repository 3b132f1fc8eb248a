use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

use crate::config::IceServer;
use crate::error::{Code, LinkError, SignalingError};
use crate::runtime::spawn_with_handle;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallRequest {
    /// Base64 of the JSON session description.
    pub sdp: String,
    #[serde(default)]
    pub disable_trickle: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStage {
    Init { sdp: String },
    Update { candidate: IceCandidate },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallResponse {
    pub uuid: String,
    pub stage: CallStage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallUpdate {
    Candidate(IceCandidate),
    Done,
    Error { code: i32, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallUpdateRequest {
    pub uuid: String,
    pub update: CallUpdate,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionalWebRtcConfigResponse {
    #[serde(default)]
    pub ice_servers: Vec<IceServer>,
    #[serde(default)]
    pub disable_trickle: bool,
}

pub type CallResponseStream = Pin<Box<dyn Stream<Item = Result<CallResponse, LinkError>> + Send>>;

/// Remote service that brokers offers and answers for a host.
#[async_trait]
pub trait SignalingService: Send + Sync {
    async fn optional_webrtc_config(
        &self,
        host: &str,
    ) -> Result<OptionalWebRtcConfigResponse, LinkError>;

    async fn call(&self, host: &str, request: CallRequest) -> Result<CallResponseStream, LinkError>;

    async fn call_update(&self, host: &str, request: CallUpdateRequest) -> Result<(), LinkError>;
}

/// The local end of the exchange.
#[async_trait]
pub trait ExchangePeer: Send + Sync {
    async fn apply_answer(&self, description_json: &str) -> Result<(), LinkError>;

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), LinkError>;

    async fn close(&self);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeStep {
    ApplyAnswer { uuid: String, sdp: String },
    AddCandidate(IceCandidate),
}

/// Stage ordering for one signaling call.
#[derive(Debug, Default)]
pub struct ExchangeState {
    uuid: Option<String>,
    saw_update: bool,
    terminal_sent: bool,
}

impl ExchangeState {
    pub fn uuid(&self) -> Option<&str> {
        self.uuid.as_deref()
    }

    pub fn has_init(&self) -> bool {
        self.uuid.is_some()
    }

    pub fn on_response(&mut self, response: CallResponse) -> Result<ExchangeStep, SignalingError> {
        match response.stage {
            CallStage::Init { sdp } => {
                if self.saw_update {
                    return Err(SignalingError::InitAfterUpdate);
                }
                if self.uuid.is_some() {
                    return Err(SignalingError::DuplicateInit);
                }
                self.uuid = Some(response.uuid.clone());
                Ok(ExchangeStep::ApplyAnswer {
                    uuid: response.uuid,
                    sdp,
                })
            }
            CallStage::Update { candidate } => {
                let Some(uuid) = self.uuid.as_deref() else {
                    return Err(SignalingError::UpdateBeforeInit);
                };
                if uuid != response.uuid {
                    return Err(SignalingError::UuidMismatch {
                        have: response.uuid,
                        want: uuid.to_string(),
                    });
                }
                self.saw_update = true;
                Ok(ExchangeStep::AddCandidate(candidate))
            }
        }
    }

    /// True the first time only; `done` and `error` share this slot.
    pub fn take_terminal(&mut self) -> bool {
        !std::mem::replace(&mut self.terminal_sent, true)
    }
}

pub fn encode_description(description_json: &str) -> String {
    BASE64.encode(description_json)
}

pub fn decode_description(encoded: &str) -> Result<String, SignalingError> {
    let raw = BASE64
        .decode(encoded.trim())
        .map_err(|err| SignalingError::InvalidDescription(err.to_string()))?;
    String::from_utf8(raw).map_err(|err| SignalingError::InvalidDescription(err.to_string()))
}

#[derive(Debug, Clone)]
pub struct ExchangeOptions {
    pub host: String,
    pub trickle: bool,
    pub dial_timeout: Option<Duration>,
}

#[derive(Clone)]
struct Terminal {
    service: Arc<dyn SignalingService>,
    host: String,
    state: Arc<Mutex<ExchangeState>>,
}

impl Terminal {
    async fn send(&self, uuid: String, update: CallUpdate) {
        if !self.state.lock().take_terminal() {
            return;
        }
        let kind = match &update {
            CallUpdate::Done => "done",
            CallUpdate::Error { .. } => "error",
            CallUpdate::Candidate(_) => "candidate",
        };
        if let Err(err) = self
            .service
            .call_update(&self.host, CallUpdateRequest { uuid, update })
            .await
        {
            debug!(
                target: "tether::webrtc::signaling",
                kind,
                error = %err,
                "failed to send terminal update"
            );
        }
    }

    async fn fail(&self, uuid: String, err: &LinkError) {
        self.send(
            uuid,
            CallUpdate::Error {
                code: Code::InvalidArgument.as_i32(),
                message: err.to_string(),
            },
        )
        .await;
    }
}

/// Drive one offer/answer exchange until the channel is ready and the call ends.
///
/// `local_candidates` yields `Some(candidate)` per gathered candidate and
/// `None` once gathering completes. Any failure closes `peer`.
pub async fn run_exchange<R>(
    service: Arc<dyn SignalingService>,
    peer: Arc<dyn ExchangePeer>,
    options: ExchangeOptions,
    offer_json: &str,
    local_candidates: mpsc::UnboundedReceiver<Option<IceCandidate>>,
    ready: R,
) -> Result<(), LinkError>
where
    R: Future<Output = Result<(), LinkError>> + Send,
{
    let request = CallRequest {
        sdp: encode_description(offer_json),
        disable_trickle: !options.trickle,
    };
    let responses = match service.call(&options.host, request).await {
        Ok(responses) => responses,
        Err(err) => {
            peer.close().await;
            return Err(err);
        }
    };
    debug!(
        target: "tether::webrtc::signaling",
        host = %options.host,
        trickle = options.trickle,
        "offer sent"
    );

    let terminal = Terminal {
        service: service.clone(),
        host: options.host.clone(),
        state: Arc::new(Mutex::new(ExchangeState::default())),
    };
    let (remote_tx, remote_rx) = watch::channel(None::<String>);

    let sender = options.trickle.then(|| {
        spawn_with_handle(
            None,
            send_local_candidates(terminal.clone(), remote_rx, local_candidates),
        )
    });

    let ready = async {
        match options.dial_timeout {
            Some(limit) if !limit.is_zero() => tokio::time::timeout(limit, ready)
                .await
                .map_err(|_| LinkError::Timeout("timed out".into()))?,
            _ => ready.await,
        }
    };
    let receiver = receive_responses(
        terminal.clone(),
        peer.clone(),
        responses,
        remote_tx,
        options.trickle,
    );

    match tokio::try_join!(ready, receiver) {
        Ok(_) => Ok(()),
        Err(err) => {
            warn!(
                target: "tether::webrtc::signaling",
                host = %options.host,
                error = %err,
                "signaling exchange failed"
            );
            if let Some(sender) = sender {
                sender.abort();
            }
            peer.close().await;
            Err(err)
        }
    }
}

async fn receive_responses(
    terminal: Terminal,
    peer: Arc<dyn ExchangePeer>,
    mut responses: CallResponseStream,
    remote_tx: watch::Sender<Option<String>>,
    trickle: bool,
) -> Result<(), LinkError> {
    while let Some(item) = responses.next().await {
        let response = item?;
        let reply_uuid = terminal
            .state
            .lock()
            .uuid()
            .map(str::to_string)
            .unwrap_or_else(|| response.uuid.clone());
        let step = terminal.state.lock().on_response(response);
        match step {
            Err(violation) => {
                let err = LinkError::from(violation);
                terminal.fail(reply_uuid, &err).await;
                return Err(err);
            }
            Ok(ExchangeStep::ApplyAnswer { uuid, sdp }) => {
                let applied = match decode_description(&sdp) {
                    Ok(json) => peer.apply_answer(&json).await,
                    Err(err) => Err(err.into()),
                };
                if let Err(err) = applied {
                    terminal.fail(uuid, &err).await;
                    return Err(err);
                }
                trace!(target: "tether::webrtc::signaling", uuid = %uuid, "answer applied");
                remote_tx.send_replace(Some(uuid.clone()));
                if !trickle {
                    terminal.send(uuid, CallUpdate::Done).await;
                }
            }
            Ok(ExchangeStep::AddCandidate(candidate)) => {
                if let Err(err) = peer.add_remote_candidate(candidate).await {
                    terminal.fail(reply_uuid, &err).await;
                    return Err(err);
                }
            }
        }
    }
    if terminal.state.lock().has_init() {
        Ok(())
    } else {
        Err(SignalingError::NoAnswer.into())
    }
}

// Candidates queue until the answer is applied; sending earlier confuses the remote.
async fn send_local_candidates(
    terminal: Terminal,
    mut remote_rx: watch::Receiver<Option<String>>,
    mut local_candidates: mpsc::UnboundedReceiver<Option<IceCandidate>>,
) {
    let uuid = match remote_rx.wait_for(Option::is_some).await {
        Ok(uuid) => uuid.clone().unwrap_or_default(),
        Err(_) => return,
    };
    while let Some(next) = local_candidates.recv().await {
        match next {
            Some(candidate) => {
                let request = CallUpdateRequest {
                    uuid: uuid.clone(),
                    update: CallUpdate::Candidate(candidate),
                };
                if let Err(err) = terminal.service.call_update(&terminal.host, request).await {
                    debug!(
                        target: "tether::webrtc::signaling",
                        error = %err,
                        "failed to send local candidate"
                    );
                }
            }
            None => {
                terminal.send(uuid, CallUpdate::Done).await;
                return;
            }
        }
    }
}
