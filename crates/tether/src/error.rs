use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Status codes shared by every channel kind. Values match the gRPC codes so
/// trailers from either transport map onto the same variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Code {
    Ok,
    Canceled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
}

impl Code {
    pub fn from_i32(value: i32) -> Self {
        match value {
            0 => Code::Ok,
            1 => Code::Canceled,
            3 => Code::InvalidArgument,
            4 => Code::DeadlineExceeded,
            5 => Code::NotFound,
            6 => Code::AlreadyExists,
            7 => Code::PermissionDenied,
            8 => Code::ResourceExhausted,
            9 => Code::FailedPrecondition,
            10 => Code::Aborted,
            11 => Code::OutOfRange,
            12 => Code::Unimplemented,
            13 => Code::Internal,
            14 => Code::Unavailable,
            15 => Code::DataLoss,
            16 => Code::Unauthenticated,
            _ => Code::Unknown,
        }
    }

    pub fn as_i32(self) -> i32 {
        match self {
            Code::Ok => 0,
            Code::Canceled => 1,
            Code::Unknown => 2,
            Code::InvalidArgument => 3,
            Code::DeadlineExceeded => 4,
            Code::NotFound => 5,
            Code::AlreadyExists => 6,
            Code::PermissionDenied => 7,
            Code::ResourceExhausted => 8,
            Code::FailedPrecondition => 9,
            Code::Aborted => 10,
            Code::OutOfRange => 11,
            Code::Unimplemented => 12,
            Code::Internal => 13,
            Code::Unavailable => 14,
            Code::DataLoss => 15,
            Code::Unauthenticated => 16,
        }
    }

    /// Transient codes that a dial or reconnect loop may try again.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Code::Unavailable
                | Code::DeadlineExceeded
                | Code::Aborted
                | Code::Internal
                | Code::Unknown
                | Code::ResourceExhausted
                | Code::DataLoss
        )
    }
}

/// Typed RPC error surfaced from trailers or HTTP status.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("rpc error: code = {code:?} desc = {message}")]
pub struct Status {
    pub code: Code,
    pub message: String,
}

impl Status {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn from_parts(code: i32, message: impl Into<String>) -> Self {
        Self::new(Code::from_i32(code), message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("host is required")]
    MissingHost,
    #[error("cannot set access token together with credentials")]
    AccessTokenWithCredentials,
    #[error("cannot set access token together with signaling credentials or signaling access token")]
    AccessTokenWithSignalingAuth,
    #[error("{field} must be a positive integer")]
    NotPositive { field: &'static str },
    #[error("cannot dial {host:?} directly, use a local address instead")]
    NotLocal { host: String },
    #[error("invalid address {address:?}: {reason}")]
    InvalidAddress { address: String, reason: String },
    #[error("credentials were provided but no credentials exchange is configured")]
    NoCredentialsExchange,
}

/// Violations of the signaling call ordering.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignalingError {
    #[error("got init stage more than once")]
    DuplicateInit,
    #[error("got init stage after update stage")]
    InitAfterUpdate,
    #[error("got update stage before init stage")]
    UpdateBeforeInit,
    #[error("uuid mismatch; have={have} want={want}")]
    UuidMismatch { have: String, want: String },
    #[error("invalid session description: {0}")]
    InvalidDescription(String),
    #[error("signaling call ended before an answer was received")]
    NoAnswer,
}

#[derive(Debug, Clone, Error)]
pub enum LinkError {
    #[error("invalid dial configuration: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Rpc(#[from] Status),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("signaling failed: {0}")]
    Signaling(#[from] SignalingError),
    #[error("network error: {0}")]
    Network(String),
    #[error("webrtc setup failed: {0}")]
    Setup(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("connection closed")]
    Closed,
    #[error(transparent)]
    DialFailed(DialFailure),
}

impl LinkError {
    /// Whether a retry loop may try again after this error. Configuration
    /// problems and authoritative server answers are final.
    pub fn is_retryable(&self) -> bool {
        match self {
            LinkError::Config(_) => false,
            LinkError::Rpc(status) => status.code.is_retryable(),
            LinkError::DialFailed(failure) => failure.is_retryable(),
            LinkError::Protocol(_)
            | LinkError::Signaling(_)
            | LinkError::Network(_)
            | LinkError::Setup(_)
            | LinkError::Timeout(_)
            | LinkError::Closed => true,
        }
    }

    pub fn is_connection_closed(&self) -> bool {
        matches!(self, LinkError::Closed)
    }

    pub fn status(&self) -> Option<&Status> {
        match self {
            LinkError::Rpc(status) => Some(status),
            _ => None,
        }
    }

    pub fn code(&self) -> Code {
        match self {
            LinkError::Rpc(status) => status.code,
            LinkError::Config(_) => Code::InvalidArgument,
            LinkError::Timeout(_) => Code::DeadlineExceeded,
            LinkError::Closed | LinkError::Network(_) => Code::Unavailable,
            LinkError::Protocol(_) => Code::Internal,
            LinkError::Signaling(_) | LinkError::Setup(_) | LinkError::DialFailed(_) => {
                Code::Unknown
            }
        }
    }
}

pub(crate) fn setup_error<E: fmt::Display>(err: E) -> LinkError {
    LinkError::Setup(err.to_string())
}

pub(crate) fn network_error<E: fmt::Display>(err: E) -> LinkError {
    LinkError::Network(err.to_string())
}

/// Aggregate failure of a dial that exhausted every method it tried.
#[derive(Debug, Clone)]
pub struct DialFailure {
    pub webrtc: Option<Box<LinkError>>,
    pub direct: Option<Box<LinkError>>,
}

impl DialFailure {
    pub fn is_retryable(&self) -> bool {
        self.webrtc.as_deref().is_some_and(LinkError::is_retryable)
            || self.direct.as_deref().is_some_and(LinkError::is_retryable)
    }
}

impl fmt::Display for DialFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to connect via all methods")?;
        if let Some(err) = &self.webrtc {
            write!(f, "; webrtc: {err}")?;
        }
        if let Some(err) = &self.direct {
            write!(f, "; direct: {err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for DialFailure {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_splits_transient_from_authoritative() {
        for code in [
            Code::Unavailable,
            Code::DeadlineExceeded,
            Code::Aborted,
            Code::Internal,
            Code::Unknown,
        ] {
            assert!(LinkError::from(Status::new(code, "x")).is_retryable(), "{code:?}");
        }
        for code in [
            Code::PermissionDenied,
            Code::Unauthenticated,
            Code::InvalidArgument,
            Code::NotFound,
            Code::AlreadyExists,
            Code::FailedPrecondition,
            Code::OutOfRange,
            Code::Unimplemented,
            Code::Canceled,
        ] {
            assert!(!LinkError::from(Status::new(code, "x")).is_retryable(), "{code:?}");
        }
        assert!(!LinkError::from(ConfigError::MissingHost).is_retryable());
        assert!(LinkError::Network("reset".into()).is_retryable());
        assert!(LinkError::Timeout("dial".into()).is_retryable());
    }

    #[test]
    fn aggregate_names_both_causes() {
        let failure = DialFailure {
            webrtc: Some(Box::new(Status::new(Code::Unavailable, "no peer").into())),
            direct: Some(Box::new(
                ConfigError::NotLocal {
                    host: "robot.example.com".into(),
                }
                .into(),
            )),
        };
        let text = LinkError::DialFailed(failure.clone()).to_string();
        assert!(text.contains("all methods"));
        assert!(text.contains("no peer"));
        assert!(text.contains("robot.example.com"));
        assert!(failure.is_retryable());
    }

    #[test]
    fn codes_round_trip_through_wire_values() {
        for value in 0..=16 {
            assert_eq!(Code::from_i32(value).as_i32(), value);
        }
        assert_eq!(Code::from_i32(99), Code::Unknown);
    }
}
