use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser};
use tether::logging::{self as logctl, Component, LogConfig, LogLevel};
use tether::{Client, ClientEvent, DialConfig, EventKind, IceServer};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "tether-probe",
    about = "Dial a machine, report connection events and optionally run one command",
    version
)]
struct Cli {
    #[arg(long, env = "TETHER_HOST", help = "Host name of the machine to dial")]
    host: String,

    #[arg(
        long,
        env = "TETHER_SIGNALING_ADDRESS",
        help = "Signaling service address; enables WebRTC"
    )]
    signaling_address: Option<String>,

    #[arg(long, env = "TETHER_ACCESS_TOKEN", hide_env_values = true)]
    access_token: Option<String>,

    #[arg(
        long = "ice-server",
        value_name = "URL",
        help = "Extra STUN/TURN server, may be repeated"
    )]
    ice_servers: Vec<String>,

    #[arg(long, env = "TETHER_NO_RECONNECT")]
    no_reconnect: bool,

    #[arg(long, env = "TETHER_DISABLE_SESSIONS")]
    disable_sessions: bool,

    #[arg(long, env = "TETHER_INSECURE", help = "Use plain http for direct dials")]
    insecure: bool,

    #[arg(long, env = "TETHER_RECONNECT_MAX_ATTEMPTS")]
    reconnect_max_attempts: Option<u32>,

    #[arg(long, value_name = "MS", env = "TETHER_DIAL_TIMEOUT_MS")]
    dial_timeout_ms: Option<u64>,

    #[arg(long)]
    priority: Option<i32>,

    #[command(flatten)]
    command: CommandArgs,

    #[arg(
        long,
        value_name = "SECS",
        default_value_t = 0,
        help = "Stay connected this long (or until ctrl-c) before disconnecting"
    )]
    hold_secs: u64,

    #[command(flatten)]
    logging: LoggingArgs,
}

#[derive(Args, Debug)]
struct CommandArgs {
    #[arg(long, value_name = "SERVICE", requires = "resource", help = "Fully qualified service name")]
    service: Option<String>,

    #[arg(long, value_name = "NAME", requires = "service", help = "Resource to send the command to")]
    resource: Option<String>,

    #[arg(long, value_name = "JSON", default_value = "{}")]
    payload: String,
}

#[derive(Args, Debug)]
struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        env = "TETHER_LOG_LEVEL",
        default_value_t = LogLevel::Info,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    level: LogLevel,

    #[arg(
        long = "trace",
        value_enum,
        value_name = "COMPONENT",
        help = "Log one component at trace level, may be repeated"
    )]
    trace: Vec<Component>,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        env = "TETHER_LOG_FILE",
        help = "Write logs to the specified file"
    )]
    file: Option<PathBuf>,
}

impl LoggingArgs {
    fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            trace: self.trace.clone(),
            file: self.file.clone(),
        }
    }
}

impl Cli {
    fn dial_config(&self) -> DialConfig {
        let mut config = DialConfig::new(&self.host)
            .no_reconnect(self.no_reconnect)
            .disable_sessions(self.disable_sessions)
            .insecure(self.insecure);
        if let Some(address) = &self.signaling_address {
            config = config.with_signaling(address);
        }
        if let Some(token) = &self.access_token {
            config = config.with_access_token(token);
        }
        for url in &self.ice_servers {
            config = config.with_ice_server(IceServer::new(vec![url.clone()]));
        }
        if let Some(attempts) = self.reconnect_max_attempts {
            config = config.reconnect_max_attempts(attempts);
        }
        if let Some(ms) = self.dial_timeout_ms {
            config = config.dial_timeout(Duration::from_millis(ms));
        }
        if let Some(priority) = self.priority {
            config = config.priority(priority);
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let log_config = cli.logging.to_config();
    let _log_guard = logctl::init(&log_config, env!("CARGO_CRATE_NAME")).context("configure logging")?;
    debug!(
        log_level = ?log_config.level,
        trace = ?log_config.trace,
        log_file = ?log_config.file,
        "logging configured"
    );

    let client = Client::builder(cli.dial_config())
        .build()
        .context("invalid dial configuration")?;
    let events = client.subscribe(EventKind::ConnectionStateChange);
    let reporter = tokio::spawn(report_events(events));

    client
        .connect()
        .await
        .with_context(|| format!("dial {}", cli.host))?;
    info!(host = %cli.host, method = ?client.dial_method(), "connected");

    if let (Some(service), Some(resource)) = (&cli.command.service, &cli.command.resource) {
        let payload: serde_json::Value =
            serde_json::from_str(&cli.command.payload).context("parse --payload as JSON")?;
        let result = client
            .service(service.as_str())
            .do_command(resource, payload)
            .await
            .with_context(|| format!("{service}/DoCommand on {resource}"))?;
        println!("{}", serde_json::to_string_pretty(&result)?);
    }

    if cli.hold_secs > 0 {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(cli.hold_secs)) => {}
            _ = tokio::signal::ctrl_c() => info!("interrupted"),
        }
    }

    client.disconnect().await;
    reporter.abort();
    Ok(())
}

async fn report_events(mut events: tokio::sync::broadcast::Receiver<ClientEvent>) {
    loop {
        match events.recv().await {
            Ok(ClientEvent::Dialing { method, attempt }) => {
                info!(method = method.as_str(), attempt, "dialing")
            }
            Ok(ClientEvent::Disconnected { error: Some(error) }) => {
                warn!(%error, "disconnected")
            }
            Ok(event) => info!(?event, "connection event"),
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "event reporter lagged"),
            Err(RecvError::Closed) => return,
        }
    }
}
