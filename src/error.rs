use derive_more::From;
use thiserror::Error;

/// Errors raised while accepting or servicing client sessions.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to bind listener on {addr}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
    #[error("failed to read TLS certificate material from `{path}`")]
    CertificateRead {
        path: String,
        source: std::io::Error,
    },
    #[error("TLS certificate material in `{path}` is incomplete or malformed")]
    CertificateInvalid { path: String },
    #[error("failed to build TLS acceptor")]
    TlsConfig(#[from] tokio_rustls::rustls::Error),
    #[error("TLS handshake failed")]
    TlsHandshake { source: std::io::Error },
    #[error("WebSocket handshake failed")]
    Handshake(#[from] Box<tokio_tungstenite::tungstenite::Error>),
    #[error("session socket failed")]
    Io(#[from] std::io::Error),
}

/// Errors raised by TCP device connections and subnet scanning.
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("device `{device_id}` is not connected")]
    NotConnected { device_id: String },
    #[error("device `{device_id}` already has a live connection")]
    AlreadyConnected { device_id: String },
    #[error("device `{device_id}` is owned by another handle")]
    AlreadyOwned { device_id: String },
    #[error("connection limit of {max} reached")]
    ConnectionLimit { max: usize },
    #[error("connecting to {host}:{port} timed out after {timeout_ms} ms")]
    ConnectTimeout {
        host: String,
        port: u16,
        timeout_ms: u64,
    },
    #[error("connecting to {host}:{port} failed")]
    Connect {
        host: String,
        port: u16,
        source: std::io::Error,
    },
    #[error("connection to device `{device_id}` is no longer alive")]
    ConnectionDead { device_id: String },
    #[error("socket I/O failed for device `{device_id}`")]
    Io {
        device_id: String,
        source: std::io::Error,
    },
    #[error("no usable IPv4 interface for subnet scanning")]
    NoLocalSubnet,
    #[error("invalid subnet `{subnet}`")]
    InvalidSubnet { subnet: String },
}

/// Errors raised by device adapters.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{operation} is not available on this platform")]
    UnsupportedOnPlatform { operation: String },
    #[error("device `{device_id}` is not known to any adapter")]
    DeviceNotFound { device_id: String },
    #[error("device `{device_id}` has no open handle")]
    DeviceNotOpen { device_id: String },
    #[error("device `{device_id}` disappeared while in use")]
    DeviceGone { device_id: String },
    #[error("device `{device_id}` is already open")]
    AlreadyOpen { device_id: String },
    #[error("serial operation failed for `{device_id}`")]
    Serial {
        device_id: String,
        source: serialport::Error,
    },
    #[error("HID operation failed for `{device_id}`: {detail}")]
    Hid { device_id: String, detail: String },
    #[error("`{tool}` exited with status {status}: {stderr}")]
    ToolFailed {
        tool: String,
        status: i32,
        stderr: String,
    },
    #[error("failed to run `{tool}`")]
    ToolSpawn {
        tool: String,
        source: std::io::Error,
    },
    #[error("`{tool}` did not finish within {timeout_ms} ms")]
    ToolTimeout { tool: String, timeout_ms: u64 },
    #[error("unknown biometric user `{user_id}`")]
    UnknownUser { user_id: String },
    #[error("adapter I/O failed for `{device_id}`")]
    Io {
        device_id: String,
        source: std::io::Error,
    },
}

/// Errors raised by the durable operation queue.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue store operation failed")]
    Store(#[from] rusqlite::Error),
    #[error("failed to open queue database at `{path}`")]
    Open {
        path: String,
        source: rusqlite::Error,
    },
    #[error("job `{job_id}` does not exist")]
    JobNotFound { job_id: String },
    #[error("queue store worker is gone")]
    WorkerGone,
}

/// Errors raised while loading or persisting broker configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration from `{path}`")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("configuration file `{path}` is not valid JSON")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
    #[error("failed to write configuration to `{path}`")]
    Write {
        path: String,
        source: std::io::Error,
    },
    #[error("no configuration directory could be resolved for this platform")]
    NoProjectDirs,
}

/// Errors returned by telemetry initialisation.
#[derive(Debug, Error)]
pub(crate) enum TelemetryError {
    #[error("failed to install tracing subscriber")]
    Subscriber(#[from] tracing_subscriber::util::TryInitError),
}

/// Top-level broker errors wrapping subsystem-specific error types.
#[derive(Debug, Error, From)]
pub enum BrokerError {
    #[error(transparent)]
    Transport(TransportError),
    #[error(transparent)]
    Network(NetworkError),
    #[error(transparent)]
    Adapter(AdapterError),
    #[error(transparent)]
    Queue(QueueError),
    #[error(transparent)]
    Config(ConfigError),
}
