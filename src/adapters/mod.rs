mod biometric;
mod fake;
mod printer;
mod serial;
mod usb;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::{DeserializeFromStr, SerializeDisplay};
use strum_macros::{Display, EnumString};

pub use self::biometric::{
    BiometricAdapter, IdentifyOutcome, MatchOutcome, UserRecord, UserSummary,
};
pub use self::fake::FakeAdapter;
pub use self::printer::{PrintFormat, PrinterAdapter};
pub(crate) use self::printer::run_tool;
pub use self::serial::SerialAdapter;
pub use self::usb::UsbHidAdapter;
use crate::device::{Device, DeviceKind};
use crate::error::AdapterError;

/// Serial line settings accepted by `serial.open`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialPortConfig {
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    pub parity: ParityMode,
    pub flow_control: FlowControlMode,
}

impl Default for SerialPortConfig {
    fn default() -> Self {
        Self {
            baud_rate: 9_600,
            data_bits: 8,
            stop_bits: 1,
            parity: ParityMode::None,
            flow_control: FlowControlMode::None,
        }
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    Eq,
    PartialEq,
    Display,
    EnumString,
    SerializeDisplay,
    DeserializeFromStr,
)]
pub enum ParityMode {
    #[default]
    #[strum(to_string = "none")]
    None,
    #[strum(to_string = "even")]
    Even,
    #[strum(to_string = "odd")]
    Odd,
}

#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    Eq,
    PartialEq,
    Display,
    EnumString,
    SerializeDisplay,
    DeserializeFromStr,
)]
pub enum FlowControlMode {
    #[default]
    #[strum(to_string = "none")]
    None,
    #[strum(to_string = "software")]
    Software,
    #[strum(to_string = "hardware")]
    Hardware,
}

/// Kind-specific settings passed to `open`.
#[derive(Debug, Clone, Default)]
pub enum OpenConfig {
    /// No settings; the adapter uses its defaults.
    #[default]
    None,
    /// Serial line settings.
    Serial(SerialPortConfig),
}

impl OpenConfig {
    pub(crate) fn serial(&self) -> SerialPortConfig {
        match self {
            Self::Serial(config) => *config,
            Self::None => SerialPortConfig::default(),
        }
    }
}

/// Result of a successful `open`.
#[derive(Debug, Clone, Serialize)]
pub struct OpenOutcome {
    pub device_id: String,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub detail: Value,
}

/// Result of `close`; closing an absent handle succeeds with `was_open`
/// false.
#[derive(Debug, Clone, Serialize)]
pub struct CloseOutcome {
    pub device_id: String,
    pub was_open: bool,
}

/// Result of a `write`.
#[derive(Debug, Clone, Serialize)]
pub struct WriteOutcome {
    pub bytes_written: u64,
    /// Submission identifier reported by an OS print tool, when available.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_job_id: Option<String>,
}

/// Result of a `read`.
#[derive(Debug, Clone)]
pub struct ReadOutcome {
    pub bytes: Vec<u8>,
}

/// Result of `status`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub device_id: String,
    pub is_open: bool,
    #[serde(flatten)]
    pub detail: BTreeMap<String, Value>,
}

/// Result of `capabilities` (printer only).
#[derive(Debug, Clone, Serialize)]
pub struct CapabilitiesReport {
    pub device_id: String,
    pub options: BTreeMap<String, Vec<String>>,
}

/// Uniform per-kind device contract.
///
/// One implementation exists per kind and platform; operations a platform
/// cannot express fail with `UnsupportedOnPlatform`, which is fatal to the
/// call and harmless to the process.
#[async_trait]
pub trait DeviceAdapter: Send + Sync {
    /// The device kind this adapter serves.
    fn kind(&self) -> DeviceKind;

    /// Enumerates currently attached devices. May be empty on platforms
    /// that cannot enumerate this kind.
    async fn discover(&self) -> Result<Vec<Device>, AdapterError>;

    /// Opens a handle to one device.
    async fn open(&self, device_id: &str, config: OpenConfig)
    -> Result<OpenOutcome, AdapterError>;

    /// Closes a handle. Idempotent: closing an absent handle succeeds.
    async fn close(&self, device_id: &str) -> Result<CloseOutcome, AdapterError>;

    /// Writes one opaque payload.
    async fn write(&self, device_id: &str, payload: &[u8]) -> Result<WriteOutcome, AdapterError>;

    /// Reads up to `max_bytes`, waiting at most `timeout`.
    async fn read(
        &self,
        device_id: &str,
        max_bytes: usize,
        timeout: Duration,
    ) -> Result<ReadOutcome, AdapterError>;

    /// Reports the device's current state.
    async fn status(&self, device_id: &str) -> Result<StatusReport, AdapterError>;

    /// Reports printer capabilities; other kinds refuse.
    async fn capabilities(&self, device_id: &str) -> Result<CapabilitiesReport, AdapterError> {
        let _ = device_id;
        Err(AdapterError::UnsupportedOnPlatform {
            operation: format!("{}.capabilities", self.kind()),
        })
    }

    /// Whether this adapter currently holds an open handle on the device.
    async fn is_open(&self, device_id: &str) -> bool {
        let _ = device_id;
        false
    }
}

/// The full set of adapters the broker routes through.
pub struct AdapterSet {
    printer: Arc<dyn DeviceAdapter>,
    serial: Arc<dyn DeviceAdapter>,
    usb: Arc<dyn DeviceAdapter>,
    biometric: Arc<BiometricAdapter>,
}

impl AdapterSet {
    /// Assembles the platform adapters.
    #[must_use]
    pub fn platform() -> Self {
        Self {
            printer: Arc::new(PrinterAdapter::new()),
            serial: Arc::new(SerialAdapter::new()),
            usb: Arc::new(UsbHidAdapter::new()),
            biometric: Arc::new(BiometricAdapter::new()),
        }
    }

    /// Assembles an explicit adapter set; used by tests and fake mode.
    #[must_use]
    pub fn new(
        printer: Arc<dyn DeviceAdapter>,
        serial: Arc<dyn DeviceAdapter>,
        usb: Arc<dyn DeviceAdapter>,
        biometric: Arc<BiometricAdapter>,
    ) -> Self {
        Self {
            printer,
            serial,
            usb,
            biometric,
        }
    }

    /// Returns the adapter serving `kind`; the network kind has none, its
    /// I/O goes through the connection manager.
    #[must_use]
    pub fn for_kind(&self, kind: DeviceKind) -> Option<Arc<dyn DeviceAdapter>> {
        match kind {
            DeviceKind::Printer => Some(Arc::clone(&self.printer)),
            DeviceKind::Serial => Some(Arc::clone(&self.serial)),
            DeviceKind::UsbHid => Some(Arc::clone(&self.usb)),
            DeviceKind::Biometric => {
                let adapter: Arc<dyn DeviceAdapter> = Arc::clone(&self.biometric) as Arc<dyn DeviceAdapter>;
                Some(adapter)
            }
            DeviceKind::Network => None,
        }
    }

    /// The biometric adapter's template operations.
    #[must_use]
    pub fn biometric(&self) -> &Arc<BiometricAdapter> {
        &self.biometric
    }

    /// Whether any adapter holds an open handle on `device_id`.
    pub async fn has_open_handle(&self, device_id: &str) -> bool {
        self.printer.is_open(device_id).await
            || self.serial.is_open(device_id).await
            || self.usb.is_open(device_id).await
            || self.biometric.is_open(device_id).await
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn serial_config_defaults_to_9600_8n1() {
        let config: SerialPortConfig = serde_json::from_str("{}").expect("defaults should parse");
        assert_eq!(9_600, config.baud_rate);
        assert_eq!(8, config.data_bits);
        assert_eq!(1, config.stop_bits);
        assert_eq!(ParityMode::None, config.parity);
        assert_eq!(FlowControlMode::None, config.flow_control);
    }

    #[test]
    fn serial_config_parses_wire_names() {
        let config: SerialPortConfig = serde_json::from_str(
            r#"{"baud_rate":115200,"parity":"even","flow_control":"hardware"}"#,
        )
        .expect("config should parse");
        assert_eq!(115_200, config.baud_rate);
        assert_eq!(ParityMode::Even, config.parity);
        assert_eq!(FlowControlMode::Hardware, config.flow_control);
    }
}
