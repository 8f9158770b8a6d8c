use std::collections::{BTreeMap, HashMap};
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use serde_with::{DeserializeFromStr, SerializeDisplay};
use strum_macros::{Display, EnumString};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::{
    CapabilitiesReport, CloseOutcome, DeviceAdapter, OpenConfig, OpenOutcome, ReadOutcome,
    StatusReport, WriteOutcome,
};
use crate::device::{Device, DeviceKind, printer_device_id};
use crate::error::AdapterError;

/// Bound on every OS tool invocation.
const TOOL_TIMEOUT: Duration = Duration::from_secs(10);

/// Byte-stream format hint attached to a print payload.
///
/// The hint only influences transport selection; payload bytes are never
/// transformed.
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
pub enum PrintFormat {
    #[default]
    #[strum(to_string = "raw")]
    Raw,
    #[strum(to_string = "escpos")]
    Escpos,
    #[strum(to_string = "zpl")]
    Zpl,
    #[strum(to_string = "epl")]
    Epl,
}

impl PrintFormat {
    /// Whether payloads in this format are printer-language byte streams
    /// that should reach the device over a direct socket when an endpoint
    /// is known, instead of going through an OS print queue.
    #[must_use]
    pub fn prefers_direct_socket(self) -> bool {
        matches!(self, Self::Escpos | Self::Zpl | Self::Epl)
    }
}

/// OS print queue adapter.
///
/// Non-Windows platforms shell out to the CUPS tools (`lpstat`, `lp`,
/// `lpoptions`); Windows queries the print system through PowerShell CIM.
/// Submission returns the tool's job identifier when one is reported.
pub struct PrinterAdapter {
    queues: Mutex<HashMap<String, String>>,
}

impl PrinterAdapter {
    #[must_use]
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
        }
    }

    fn queue_for(&self, device_id: &str) -> Result<String, AdapterError> {
        self.queues
            .lock()
            .expect("printer queues lock poisoned")
            .get(device_id)
            .cloned()
            .ok_or_else(|| AdapterError::DeviceNotFound {
                device_id: device_id.to_owned(),
            })
    }

    fn remember(&self, devices: &[Device]) {
        let mut queues = self.queues.lock().expect("printer queues lock poisoned");
        for device in devices {
            queues.insert(device.id.clone(), device.name.clone());
        }
    }
}

impl Default for PrinterAdapter {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs one OS tool with a bounded timeout, returning stdout.
pub(crate) async fn run_tool(
    tool: &str,
    args: &[&str],
    stdin: Option<&[u8]>,
    timeout: Duration,
) -> Result<String, AdapterError> {
    let mut command = tokio::process::Command::new(tool);
    command
        .args(args)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn().map_err(|source| AdapterError::ToolSpawn {
        tool: tool.to_owned(),
        source,
    })?;

    if let (Some(payload), Some(mut handle)) = (stdin, child.stdin.take()) {
        handle
            .write_all(payload)
            .await
            .map_err(|source| AdapterError::ToolSpawn {
                tool: tool.to_owned(),
                source,
            })?;
        drop(handle);
    }

    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| AdapterError::ToolTimeout {
            tool: tool.to_owned(),
            timeout_ms: timeout.as_millis() as u64,
        })?
        .map_err(|source| AdapterError::ToolSpawn {
            tool: tool.to_owned(),
            source,
        })?;

    if !output.status.success() {
        return Err(AdapterError::ToolFailed {
            tool: tool.to_owned(),
            status: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Parses `lpstat -v` output: `device for NAME: URI`.
fn parse_lpstat_devices(output: &str) -> Vec<(String, String)> {
    output
        .lines()
        .filter_map(|line| {
            let rest = line.strip_prefix("device for ")?;
            let (name, uri) = rest.split_once(':')?;
            Some((name.trim().to_owned(), uri.trim().to_owned()))
        })
        .collect()
}

/// Parses the job id out of `lp` output: `request id is NAME-17 (1 file(s))`.
fn parse_lp_request_id(output: &str) -> Option<String> {
    let rest = output.lines().next()?.strip_prefix("request id is ")?;
    Some(rest.split_whitespace().next()?.to_owned())
}

/// Parses `lpstat -p NAME` into a coarse state string.
fn parse_lpstat_state(output: &str) -> &'static str {
    let lowered = output.to_ascii_lowercase();
    if lowered.contains("is idle") {
        "idle"
    } else if lowered.contains("printing") {
        "printing"
    } else if lowered.contains("disabled") {
        "disabled"
    } else {
        "unknown"
    }
}

/// Parses `lpoptions -l` lines: `PageSize/Media Size: *A4 Letter Legal`.
fn parse_lpoptions(output: &str) -> BTreeMap<String, Vec<String>> {
    output
        .lines()
        .filter_map(|line| {
            let (key, values) = line.split_once(':')?;
            let option = key.split('/').next()?.trim().to_owned();
            let choices = values
                .split_whitespace()
                .map(|choice| choice.trim_start_matches('*').to_owned())
                .collect();
            Some((option, choices))
        })
        .collect()
}

fn printer_device(name: &str, uri: Option<&str>) -> Device {
    let mut device = Device::builder()
        .id(printer_device_id(name))
        .kind(DeviceKind::Printer)
        .name(name.to_owned())
        .build();
    if let Some(uri) = uri {
        device.properties.insert("uri".to_owned(), uri.into());
        let connection_type = if uri.starts_with("usb:") {
            "usb"
        } else if uri.contains("://") {
            "network"
        } else {
            "local"
        };
        device
            .properties
            .insert("connection_type".to_owned(), connection_type.into());
    } else {
        device
            .properties
            .insert("connection_type".to_owned(), "local".into());
    }
    device
}

#[cfg(not(windows))]
async fn enumerate_printers() -> Result<Vec<Device>, AdapterError> {
    let output = match run_tool("lpstat", &["-v"], None, TOOL_TIMEOUT).await {
        Ok(output) => output,
        // No CUPS, or no queues configured: both mean "no printers here".
        Err(AdapterError::ToolSpawn { .. } | AdapterError::ToolFailed { .. }) => {
            return Ok(Vec::new());
        }
        Err(error) => return Err(error),
    };
    Ok(parse_lpstat_devices(&output)
        .into_iter()
        .map(|(name, uri)| printer_device(&name, Some(&uri)))
        .collect())
}

#[cfg(windows)]
async fn enumerate_printers() -> Result<Vec<Device>, AdapterError> {
    let output = match run_tool(
        "powershell",
        &[
            "-NoProfile",
            "-Command",
            "Get-CimInstance Win32_Printer | Select-Object Name,DriverName,PortName | ConvertTo-Json",
        ],
        None,
        TOOL_TIMEOUT,
    )
    .await
    {
        Ok(output) => output,
        Err(AdapterError::ToolSpawn { .. } | AdapterError::ToolFailed { .. }) => {
            return Ok(Vec::new());
        }
        Err(error) => return Err(error),
    };

    #[derive(serde::Deserialize)]
    struct CimPrinter {
        #[serde(rename = "Name")]
        name: String,
        #[serde(rename = "DriverName")]
        driver_name: Option<String>,
        #[serde(rename = "PortName")]
        port_name: Option<String>,
    }

    let trimmed = output.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    let printers: Vec<CimPrinter> = if trimmed.starts_with('[') {
        serde_json::from_str(trimmed).unwrap_or_default()
    } else {
        serde_json::from_str::<CimPrinter>(trimmed)
            .map(|printer| vec![printer])
            .unwrap_or_default()
    };

    Ok(printers
        .into_iter()
        .map(|printer| {
            let mut device = printer_device(&printer.name, None);
            if let Some(driver) = printer.driver_name {
                device.model = Some(driver);
            }
            if let Some(port) = printer.port_name {
                device.properties.insert("port_name".to_owned(), port.into());
            }
            device
        })
        .collect())
}

#[async_trait]
impl DeviceAdapter for PrinterAdapter {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Printer
    }

    async fn discover(&self) -> Result<Vec<Device>, AdapterError> {
        let devices = enumerate_printers().await?;
        debug!(count = devices.len(), "enumerated OS printer queues");
        self.remember(&devices);
        Ok(devices)
    }

    async fn open(
        &self,
        device_id: &str,
        _config: OpenConfig,
    ) -> Result<OpenOutcome, AdapterError> {
        // OS queues accept submissions without a handle.
        self.queue_for(device_id)?;
        Ok(OpenOutcome {
            device_id: device_id.to_owned(),
            detail: Value::Null,
        })
    }

    async fn close(&self, device_id: &str) -> Result<CloseOutcome, AdapterError> {
        Ok(CloseOutcome {
            device_id: device_id.to_owned(),
            was_open: false,
        })
    }

    #[cfg(not(windows))]
    async fn write(&self, device_id: &str, payload: &[u8]) -> Result<WriteOutcome, AdapterError> {
        let queue = self.queue_for(device_id)?;
        let output = run_tool(
            "lp",
            &["-d", &queue, "-o", "raw", "--", "-"],
            Some(payload),
            TOOL_TIMEOUT,
        )
        .await?;
        Ok(WriteOutcome {
            bytes_written: payload.len() as u64,
            tool_job_id: parse_lp_request_id(&output),
        })
    }

    #[cfg(windows)]
    async fn write(&self, device_id: &str, _payload: &[u8]) -> Result<WriteOutcome, AdapterError> {
        // Raw spool submission needs winspool, which lives outside this
        // adapter; Windows printing goes through network paths instead.
        let _ = self.queue_for(device_id)?;
        Err(AdapterError::UnsupportedOnPlatform {
            operation: "printer.print via OS queue".to_owned(),
        })
    }

    async fn read(
        &self,
        device_id: &str,
        _max_bytes: usize,
        _timeout: Duration,
    ) -> Result<ReadOutcome, AdapterError> {
        let _ = device_id;
        Err(AdapterError::UnsupportedOnPlatform {
            operation: "printer.read".to_owned(),
        })
    }

    #[cfg(not(windows))]
    async fn status(&self, device_id: &str) -> Result<StatusReport, AdapterError> {
        let queue = self.queue_for(device_id)?;
        let state = match run_tool("lpstat", &["-p", &queue], None, TOOL_TIMEOUT).await {
            Ok(output) => parse_lpstat_state(&output),
            Err(AdapterError::ToolFailed { .. }) => "unknown",
            Err(error) => return Err(error),
        };
        let mut detail = BTreeMap::new();
        detail.insert("state".to_owned(), Value::from(state));
        detail.insert("queue".to_owned(), Value::from(queue));
        Ok(StatusReport {
            device_id: device_id.to_owned(),
            is_open: false,
            detail,
        })
    }

    #[cfg(windows)]
    async fn status(&self, device_id: &str) -> Result<StatusReport, AdapterError> {
        let queue = self.queue_for(device_id)?;
        let mut detail = BTreeMap::new();
        detail.insert("queue".to_owned(), Value::from(queue));
        Ok(StatusReport {
            device_id: device_id.to_owned(),
            is_open: false,
            detail,
        })
    }

    #[cfg(not(windows))]
    async fn capabilities(&self, device_id: &str) -> Result<CapabilitiesReport, AdapterError> {
        let queue = self.queue_for(device_id)?;
        let options = match run_tool("lpoptions", &["-p", &queue, "-l"], None, TOOL_TIMEOUT).await
        {
            Ok(output) => parse_lpoptions(&output),
            Err(AdapterError::ToolFailed { .. } | AdapterError::ToolSpawn { .. }) => {
                BTreeMap::new()
            }
            Err(error) => return Err(error),
        };
        Ok(CapabilitiesReport {
            device_id: device_id.to_owned(),
            options,
        })
    }

    #[cfg(windows)]
    async fn capabilities(&self, device_id: &str) -> Result<CapabilitiesReport, AdapterError> {
        self.queue_for(device_id)?;
        Ok(CapabilitiesReport {
            device_id: device_id.to_owned(),
            options: BTreeMap::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    #[test]
    fn lpstat_devices_parse_names_and_uris() {
        let output = "device for Office_Laser: socket://192.168.1.50:9100\n\
                      device for Kitchen: ipp://printer.local:631/ipp/print\n\
                      unrelated line\n";
        let parsed = parse_lpstat_devices(output);
        assert_eq!(
            vec![
                (
                    "Office_Laser".to_owned(),
                    "socket://192.168.1.50:9100".to_owned()
                ),
                (
                    "Kitchen".to_owned(),
                    "ipp://printer.local:631/ipp/print".to_owned()
                ),
            ],
            parsed
        );
    }

    #[test]
    fn lp_request_id_is_extracted() {
        assert_eq!(
            Some("Office_Laser-42".to_owned()),
            parse_lp_request_id("request id is Office_Laser-42 (1 file(s))\n")
        );
        assert_eq!(None, parse_lp_request_id("lp: error"));
    }

    #[test]
    fn lpstat_state_is_coarse() {
        assert_eq!(
            "idle",
            parse_lpstat_state("printer Office_Laser is idle.  enabled since ...")
        );
        assert_eq!(
            "printing",
            parse_lpstat_state("printer Office_Laser now printing Office_Laser-3.")
        );
        assert_eq!("disabled", parse_lpstat_state("printer X disabled since ..."));
        assert_eq!("unknown", parse_lpstat_state(""));
    }

    #[test]
    fn lpoptions_parse_marks_no_default_star() {
        let output = "PageSize/Media Size: *A4 Letter Legal\nDuplex/2-Sided: *None DuplexNoTumble\n";
        let options = parse_lpoptions(output);
        assert_eq!(
            vec!["A4".to_owned(), "Letter".to_owned(), "Legal".to_owned()],
            options["PageSize"]
        );
        assert_eq!(
            vec!["None".to_owned(), "DuplexNoTumble".to_owned()],
            options["Duplex"]
        );
    }

    #[test]
    fn printer_device_classifies_connection_type() {
        let network = printer_device("Office", Some("socket://192.168.1.50:9100"));
        assert_eq!(Some("network"), network.text_property("connection_type"));
        let usb = printer_device("Desk", Some("usb://EPSON/TM-T20"));
        assert_eq!(Some("usb"), usb.text_property("connection_type"));
        let local = printer_device("PDF", None);
        assert_eq!(Some("local"), local.text_property("connection_type"));
    }

    #[test]
    fn print_format_round_trips() {
        let parsed: PrintFormat = "zpl".parse().expect("format should parse");
        assert_eq!(PrintFormat::Zpl, parsed);
        assert_eq!("escpos", PrintFormat::Escpos.to_string());
    }

    #[rstest]
    #[case(PrintFormat::Raw, false)]
    #[case(PrintFormat::Escpos, true)]
    #[case(PrintFormat::Zpl, true)]
    #[case(PrintFormat::Epl, true)]
    fn printer_language_formats_prefer_direct_sockets(
        #[case] format: PrintFormat,
        #[case] expected: bool,
    ) {
        assert_eq!(expected, format.prefers_direct_socket());
    }
}
