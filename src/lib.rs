mod adapters;
mod app;
mod broker;
mod cli;
mod config;
mod device;
mod discovery;
mod error;
mod events;
mod net;
mod ownership;
mod protocol;
mod queue;
mod registry;
mod rpc;
mod telemetry;
mod transport;

pub use adapters::{
    AdapterSet, BiometricAdapter, CapabilitiesReport, CloseOutcome, DeviceAdapter, FakeAdapter,
    FlowControlMode, IdentifyOutcome, MatchOutcome, OpenConfig, OpenOutcome, ParityMode,
    PrintFormat, PrinterAdapter, ReadOutcome, SerialAdapter, SerialPortConfig, StatusReport,
    UsbHidAdapter, UserSummary, WriteOutcome,
};
pub use app::run;
pub use broker::{
    Broker, PrintJobParams, PrintOutcome, PrintTransport, SettingsOutcome,
};
pub use cli::{Args, LogLevel};
pub use config::{
    BrokerConfig, DiscoveryConfig, NetworkConfig, QueueConfig, TransportConfig,
};
pub use device::{
    Device, DeviceKind, DeviceStatus, PropertyValue, network_device_id, printer_device_id,
    serial_device_id, usb_device_id,
};
pub use discovery::{DiscoveryEngine, EnumerationSnapshot};
pub use error::{
    AdapterError, BrokerError, ConfigError, NetworkError, QueueError, TransportError,
};
pub use events::{DeviceEvent, EventFabric, EventKind, STREAM_ALL, spawn_fanout};
pub use net::{
    ConnectionInfo, NetworkManager, PingOutcome, ScanHit, ScanOptions, SendOutcome, classify_port,
    scan_subnet,
};
pub use ownership::{DeviceOwnership, Owner};
pub use protocol::{
    INTERNAL_ERROR, INVALID_PARAMS, INVALID_REQUEST, METHOD_NOT_FOUND, PARSE_ERROR,
    PROTOCOL_VERSION, RpcError, RpcErrorObject, RpcRequest, error_frame, notification_frame,
    parse_frame, result_frame,
};
pub use queue::{
    AttemptOutcome, JobRunner, JobStatus, JobStore, OperationJob, OperationQueue, QueueSummary,
};
pub use registry::{DeviceRegistry, UpsertOutcome};
pub use rpc::{Dispatcher, HandlerResult, PayloadEncoding, decode_payload, encode_payload};
pub use transport::{
    OutboundQueue, SESSION_NOTIFICATION_BOUND, SessionHandle, SessionRegistry, serve,
};
