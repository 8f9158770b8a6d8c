use std::collections::{BTreeMap, HashMap};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use serialport::SerialPort;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{
    CloseOutcome, DeviceAdapter, FlowControlMode, OpenConfig, OpenOutcome, ParityMode,
    ReadOutcome, SerialPortConfig, StatusReport, WriteOutcome,
};
use crate::device::{Device, DeviceKind, serial_device_id};
use crate::error::AdapterError;

/// Poll interval the blocking reader uses so it can observe the close flag.
const READER_POLL: Duration = Duration::from_millis(100);

/// POSIX tty name prefixes considered real serial hardware.
#[cfg(unix)]
const TTY_PREFIXES: [&str; 4] = ["ttyUSB", "ttyACM", "ttyAMA", "rfcomm"];

struct OpenPort {
    port_name: String,
    config: SerialPortConfig,
    writer: Arc<Mutex<Box<dyn SerialPort>>>,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    leftover: Mutex<Vec<u8>>,
    closed: Arc<AtomicBool>,
    alive: Arc<AtomicBool>,
}

/// Serial port adapter over the `serialport` crate.
///
/// The crate's I/O is blocking, so each open port gets a dedicated OS reader
/// thread feeding a channel; writes run on the blocking pool. Enumeration on
/// POSIX is a `/dev` scan, on Windows the system port database.
pub struct SerialAdapter {
    ports: Mutex<HashMap<String, Arc<OpenPort>>>,
    known: Mutex<HashMap<String, String>>,
}

impl SerialAdapter {
    #[must_use]
    pub fn new() -> Self {
        Self {
            ports: Mutex::new(HashMap::new()),
            known: Mutex::new(HashMap::new()),
        }
    }

    fn port_name_for(&self, device_id: &str) -> Result<String, AdapterError> {
        self.known
            .lock()
            .expect("serial known lock poisoned")
            .get(device_id)
            .cloned()
            .ok_or_else(|| AdapterError::DeviceNotFound {
                device_id: device_id.to_owned(),
            })
    }

    fn open_port(&self, device_id: &str) -> Result<Arc<OpenPort>, AdapterError> {
        self.ports
            .lock()
            .expect("serial ports lock poisoned")
            .get(device_id)
            .cloned()
            .ok_or_else(|| AdapterError::DeviceNotOpen {
                device_id: device_id.to_owned(),
            })
    }

    #[cfg(unix)]
    async fn enumerate_port_names() -> Vec<String> {
        let mut names = Vec::new();
        let Ok(mut entries) = tokio::fs::read_dir("/dev").await else {
            return names;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            if TTY_PREFIXES.iter().any(|prefix| name.starts_with(prefix)) {
                names.push(format!("/dev/{name}"));
            }
        }
        names.sort();
        names
    }

    #[cfg(windows)]
    async fn enumerate_port_names() -> Vec<String> {
        let listed = tokio::task::spawn_blocking(serialport::available_ports).await;
        match listed {
            Ok(Ok(ports)) => {
                let mut names: Vec<String> =
                    ports.into_iter().map(|port| port.port_name).collect();
                names.sort();
                names
            }
            _ => Vec::new(),
        }
    }
}

impl Default for SerialAdapter {
    fn default() -> Self {
        Self::new()
    }
}

fn build_port(
    port_name: &str,
    config: SerialPortConfig,
) -> Result<Box<dyn SerialPort>, serialport::Error> {
    let data_bits = match config.data_bits {
        5 => serialport::DataBits::Five,
        6 => serialport::DataBits::Six,
        7 => serialport::DataBits::Seven,
        8 => serialport::DataBits::Eight,
        other => {
            return Err(serialport::Error::new(
                serialport::ErrorKind::InvalidInput,
                format!("unsupported data bits {other}"),
            ));
        }
    };
    let stop_bits = match config.stop_bits {
        1 => serialport::StopBits::One,
        2 => serialport::StopBits::Two,
        other => {
            return Err(serialport::Error::new(
                serialport::ErrorKind::InvalidInput,
                format!("unsupported stop bits {other}"),
            ));
        }
    };
    let parity = match config.parity {
        ParityMode::None => serialport::Parity::None,
        ParityMode::Even => serialport::Parity::Even,
        ParityMode::Odd => serialport::Parity::Odd,
    };
    let flow_control = match config.flow_control {
        FlowControlMode::None => serialport::FlowControl::None,
        FlowControlMode::Software => serialport::FlowControl::Software,
        FlowControlMode::Hardware => serialport::FlowControl::Hardware,
    };

    serialport::new(port_name, config.baud_rate)
        .data_bits(data_bits)
        .stop_bits(stop_bits)
        .parity(parity)
        .flow_control(flow_control)
        .timeout(READER_POLL)
        .open()
}

fn spawn_reader(
    port_name: String,
    mut reader: Box<dyn SerialPort>,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    closed: Arc<AtomicBool>,
    alive: Arc<AtomicBool>,
) {
    std::thread::spawn(move || {
        let mut buf = [0_u8; 1024];
        loop {
            if closed.load(Ordering::SeqCst) {
                break;
            }
            match reader.read(&mut buf) {
                Ok(0) => {
                    alive.store(false, Ordering::SeqCst);
                    break;
                }
                Ok(n) => {
                    if tx.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(error) if error.kind() == std::io::ErrorKind::TimedOut => {}
                Err(error) if error.kind() == std::io::ErrorKind::Interrupted => {}
                Err(error) => {
                    warn!(%port_name, %error, "serial reader stopped");
                    alive.store(false, Ordering::SeqCst);
                    break;
                }
            }
        }
        debug!(%port_name, "serial reader thread exited");
    });
}

#[async_trait]
impl DeviceAdapter for SerialAdapter {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Serial
    }

    async fn discover(&self) -> Result<Vec<Device>, AdapterError> {
        let names = Self::enumerate_port_names().await;
        let mut devices = Vec::with_capacity(names.len());
        {
            let mut known = self.known.lock().expect("serial known lock poisoned");
            for port_name in &names {
                let device_id = serial_device_id(port_name);
                known.insert(device_id.clone(), port_name.clone());
                let mut device = Device::builder()
                    .id(device_id)
                    .kind(DeviceKind::Serial)
                    .name(port_name.clone())
                    .build();
                device
                    .properties
                    .insert("port_name".to_owned(), port_name.as_str().into());
                device
                    .properties
                    .insert("connection_type".to_owned(), "serial".into());
                devices.push(device);
            }
        }
        Ok(devices)
    }

    async fn open(
        &self,
        device_id: &str,
        config: OpenConfig,
    ) -> Result<OpenOutcome, AdapterError> {
        let port_name = self.port_name_for(device_id)?;
        let serial_config = config.serial();

        {
            let ports = self.ports.lock().expect("serial ports lock poisoned");
            if ports.contains_key(device_id) {
                return Err(AdapterError::AlreadyOpen {
                    device_id: device_id.to_owned(),
                });
            }
        }

        let opened_name = port_name.clone();
        let port = tokio::task::spawn_blocking(move || build_port(&opened_name, serial_config))
            .await
            .map_err(|error| AdapterError::Io {
                device_id: device_id.to_owned(),
                source: std::io::Error::other(error),
            })?
            .map_err(|source| AdapterError::Serial {
                device_id: device_id.to_owned(),
                source,
            })?;

        let reader = port.try_clone().map_err(|source| AdapterError::Serial {
            device_id: device_id.to_owned(),
            source,
        })?;

        let (tx, rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        let alive = Arc::new(AtomicBool::new(true));
        spawn_reader(
            port_name.clone(),
            reader,
            tx,
            Arc::clone(&closed),
            Arc::clone(&alive),
        );

        let open_port = Arc::new(OpenPort {
            port_name: port_name.clone(),
            config: serial_config,
            writer: Arc::new(Mutex::new(port)),
            inbound: tokio::sync::Mutex::new(rx),
            leftover: Mutex::new(Vec::new()),
            closed,
            alive,
        });

        let mut ports = self.ports.lock().expect("serial ports lock poisoned");
        if ports.contains_key(device_id) {
            open_port.closed.store(true, Ordering::SeqCst);
            return Err(AdapterError::AlreadyOpen {
                device_id: device_id.to_owned(),
            });
        }
        ports.insert(device_id.to_owned(), open_port);

        Ok(OpenOutcome {
            device_id: device_id.to_owned(),
            detail: serde_json::json!({
                "port_name": port_name,
                "baud_rate": serial_config.baud_rate,
            }),
        })
    }

    async fn close(&self, device_id: &str) -> Result<CloseOutcome, AdapterError> {
        let removed = self
            .ports
            .lock()
            .expect("serial ports lock poisoned")
            .remove(device_id);
        let was_open = match removed {
            Some(port) => {
                port.closed.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        };
        Ok(CloseOutcome {
            device_id: device_id.to_owned(),
            was_open,
        })
    }

    async fn write(&self, device_id: &str, payload: &[u8]) -> Result<WriteOutcome, AdapterError> {
        let port = self.open_port(device_id)?;
        if !port.alive.load(Ordering::SeqCst) {
            return Err(AdapterError::DeviceGone {
                device_id: device_id.to_owned(),
            });
        }

        let writer = Arc::clone(&port.writer);
        let bytes = payload.to_vec();
        let written = tokio::task::spawn_blocking(move || {
            let mut writer = writer.lock().expect("serial writer lock poisoned");
            writer.write_all(&bytes)?;
            writer.flush()?;
            Ok::<usize, std::io::Error>(bytes.len())
        })
        .await
        .map_err(|error| AdapterError::Io {
            device_id: device_id.to_owned(),
            source: std::io::Error::other(error),
        })?
        .map_err(|source| AdapterError::Io {
            device_id: device_id.to_owned(),
            source,
        })?;

        Ok(WriteOutcome {
            bytes_written: written as u64,
            tool_job_id: None,
        })
    }

    async fn read(
        &self,
        device_id: &str,
        max_bytes: usize,
        timeout: Duration,
    ) -> Result<ReadOutcome, AdapterError> {
        let port = self.open_port(device_id)?;
        let mut collected = {
            let mut leftover = port.leftover.lock().expect("serial leftover lock poisoned");
            if leftover.len() >= max_bytes {
                let rest = leftover.split_off(max_bytes);
                return Ok(ReadOutcome {
                    bytes: std::mem::replace(&mut *leftover, rest),
                });
            }
            std::mem::take(&mut *leftover)
        };

        let deadline = tokio::time::Instant::now() + timeout;
        let mut inbound = port.inbound.lock().await;
        while collected.len() < max_bytes {
            let chunk = tokio::select! {
                _ = tokio::time::sleep_until(deadline) => break,
                chunk = inbound.recv() => match chunk {
                    Some(chunk) => chunk,
                    None => break,
                },
            };
            collected.extend_from_slice(&chunk);
        }
        drop(inbound);

        if collected.len() > max_bytes {
            let rest = collected.split_off(max_bytes);
            port.leftover
                .lock()
                .expect("serial leftover lock poisoned")
                .extend_from_slice(&rest);
        }

        Ok(ReadOutcome { bytes: collected })
    }

    async fn status(&self, device_id: &str) -> Result<StatusReport, AdapterError> {
        let ports = self.ports.lock().expect("serial ports lock poisoned");
        let mut detail = BTreeMap::new();
        let is_open = match ports.get(device_id) {
            Some(port) => {
                detail.insert("port_name".to_owned(), Value::from(port.port_name.clone()));
                detail.insert("baud_rate".to_owned(), Value::from(port.config.baud_rate));
                detail.insert(
                    "data_bits".to_owned(),
                    Value::from(port.config.data_bits),
                );
                detail.insert(
                    "stop_bits".to_owned(),
                    Value::from(port.config.stop_bits),
                );
                detail.insert(
                    "parity".to_owned(),
                    Value::from(port.config.parity.to_string()),
                );
                detail.insert(
                    "is_alive".to_owned(),
                    Value::from(port.alive.load(Ordering::SeqCst)),
                );
                true
            }
            None => false,
        };
        Ok(StatusReport {
            device_id: device_id.to_owned(),
            is_open,
            detail,
        })
    }

    async fn is_open(&self, device_id: &str) -> bool {
        self.ports
            .lock()
            .expect("serial ports lock poisoned")
            .contains_key(device_id)
    }
}
