//! Connection and transport core for calling RPC services on remote machines.
//!
//! A [`Client`] dials a host over WebRTC (through its signaling service) or,
//! for hosts that look local, over direct gRPC-web. Calls made through
//! [`Client::service`] carry the current session id and survive reconnects.

pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod retry;
pub mod rpc;
pub mod runtime;
pub mod session;
pub mod webrtc;

pub use client::{Client, ClientBuilder, Connection, Dialer};
pub use config::{AbortHandle, Credentials, DialConfig, IceServer};
pub use error::{Code, ConfigError, LinkError, Status};
pub use events::{ClientEvent, ConnectionState, DialMethod, EventKind};
pub use rpc::{Metadata, ServiceStub};

/// Validate `config`, dial it, and return the connected client.
pub async fn dial(config: DialConfig) -> Result<Client, LinkError> {
    let client = Client::builder(config).build()?;
    client.connect().await?;
    Ok(client)
}
