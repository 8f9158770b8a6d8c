use std::time::Duration;

use async_trait::async_trait;

use super::{
    CloseOutcome, DeviceAdapter, OpenConfig, OpenOutcome, ReadOutcome, StatusReport, WriteOutcome,
};
use crate::device::{Device, DeviceKind};
use crate::error::AdapterError;

/// USB HID adapter.
///
/// Backed by `hidapi` on Windows; elsewhere enumeration is empty and every
/// handle operation refuses with a platform error, which is fatal to the
/// call but not to the process.
pub struct UsbHidAdapter {
    #[cfg(windows)]
    inner: windows_hid::HidState,
}

impl UsbHidAdapter {
    #[must_use]
    pub fn new() -> Self {
        Self {
            #[cfg(windows)]
            inner: windows_hid::HidState::new(),
        }
    }
}

impl Default for UsbHidAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(not(windows))]
fn unsupported(operation: &str) -> AdapterError {
    AdapterError::UnsupportedOnPlatform {
        operation: operation.to_owned(),
    }
}

#[cfg(not(windows))]
#[async_trait]
impl DeviceAdapter for UsbHidAdapter {
    fn kind(&self) -> DeviceKind {
        DeviceKind::UsbHid
    }

    async fn discover(&self) -> Result<Vec<Device>, AdapterError> {
        Ok(Vec::new())
    }

    async fn open(
        &self,
        _device_id: &str,
        _config: OpenConfig,
    ) -> Result<OpenOutcome, AdapterError> {
        Err(unsupported("usb.open"))
    }

    async fn close(&self, device_id: &str) -> Result<CloseOutcome, AdapterError> {
        // Idempotent: nothing can be open here.
        Ok(CloseOutcome {
            device_id: device_id.to_owned(),
            was_open: false,
        })
    }

    async fn write(&self, _device_id: &str, _payload: &[u8]) -> Result<WriteOutcome, AdapterError> {
        Err(unsupported("usb.sendReport"))
    }

    async fn read(
        &self,
        _device_id: &str,
        _max_bytes: usize,
        _timeout: Duration,
    ) -> Result<ReadOutcome, AdapterError> {
        Err(unsupported("usb.receiveReport"))
    }

    async fn status(&self, device_id: &str) -> Result<StatusReport, AdapterError> {
        Ok(StatusReport {
            device_id: device_id.to_owned(),
            is_open: false,
            detail: std::collections::BTreeMap::new(),
        })
    }
}

#[cfg(windows)]
#[async_trait]
impl DeviceAdapter for UsbHidAdapter {
    fn kind(&self) -> DeviceKind {
        DeviceKind::UsbHid
    }

    async fn discover(&self) -> Result<Vec<Device>, AdapterError> {
        self.inner.discover().await
    }

    async fn open(
        &self,
        device_id: &str,
        _config: OpenConfig,
    ) -> Result<OpenOutcome, AdapterError> {
        self.inner.open(device_id).await
    }

    async fn close(&self, device_id: &str) -> Result<CloseOutcome, AdapterError> {
        self.inner.close(device_id)
    }

    async fn write(&self, device_id: &str, payload: &[u8]) -> Result<WriteOutcome, AdapterError> {
        self.inner.write(device_id, payload.to_vec()).await
    }

    async fn read(
        &self,
        device_id: &str,
        max_bytes: usize,
        timeout: Duration,
    ) -> Result<ReadOutcome, AdapterError> {
        self.inner.read(device_id, max_bytes, timeout).await
    }

    async fn status(&self, device_id: &str) -> Result<StatusReport, AdapterError> {
        Ok(StatusReport {
            device_id: device_id.to_owned(),
            is_open: self.inner.is_open(device_id),
            detail: std::collections::BTreeMap::new(),
        })
    }

    async fn is_open(&self, device_id: &str) -> bool {
        self.inner.is_open(device_id)
    }
}

#[cfg(windows)]
mod windows_hid {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use hidapi::{HidApi, HidDevice};
    use serde_json::Value;

    use super::super::{CloseOutcome, OpenOutcome, ReadOutcome, WriteOutcome};
    use crate::device::{Device, DeviceKind, usb_device_id};
    use crate::error::AdapterError;

    struct OpenHid {
        device: Arc<Mutex<HidDevice>>,
    }

    pub(super) struct HidState {
        api: Mutex<Option<HidApi>>,
        open: Mutex<HashMap<String, Arc<OpenHid>>>,
        known: Mutex<HashMap<String, (u16, u16)>>,
    }

    impl HidState {
        pub(super) fn new() -> Self {
            Self {
                api: Mutex::new(None),
                open: Mutex::new(HashMap::new()),
                known: Mutex::new(HashMap::new()),
            }
        }

        fn with_api<T>(
            &self,
            f: impl FnOnce(&HidApi) -> Result<T, AdapterError>,
        ) -> Result<T, AdapterError> {
            let mut api = self.api.lock().expect("hid api lock poisoned");
            if api.is_none() {
                *api = Some(HidApi::new().map_err(|error| AdapterError::Hid {
                    device_id: String::new(),
                    detail: error.to_string(),
                })?);
            }
            f(api.as_ref().expect("api initialised above"))
        }

        pub(super) async fn discover(&self) -> Result<Vec<Device>, AdapterError> {
            let mut devices = Vec::new();
            let mut seen = Vec::new();
            self.with_api(|api| {
                for info in api.device_list() {
                    let id = usb_device_id(info.vendor_id(), info.product_id());
                    if seen.contains(&id) {
                        continue;
                    }
                    seen.push(id.clone());
                    let mut device = Device::builder()
                        .id(id.clone())
                        .kind(DeviceKind::UsbHid)
                        .name(info.product_string().unwrap_or("USB HID device"))
                        .maybe_manufacturer(info.manufacturer_string().map(str::to_owned))
                        .maybe_serial_number(info.serial_number().map(str::to_owned))
                        .build();
                    device.properties.insert(
                        "vendor_id".to_owned(),
                        i64::from(info.vendor_id()).into(),
                    );
                    device.properties.insert(
                        "product_id".to_owned(),
                        i64::from(info.product_id()).into(),
                    );
                    device
                        .properties
                        .insert("connection_type".to_owned(), "usb".into());
                    devices.push(device);
                    self.known
                        .lock()
                        .expect("hid known lock poisoned")
                        .insert(id, (info.vendor_id(), info.product_id()));
                }
                Ok(())
            })?;
            Ok(devices)
        }

        pub(super) async fn open(&self, device_id: &str) -> Result<OpenOutcome, AdapterError> {
            let (vendor_id, product_id) = self
                .known
                .lock()
                .expect("hid known lock poisoned")
                .get(device_id)
                .copied()
                .ok_or_else(|| AdapterError::DeviceNotFound {
                    device_id: device_id.to_owned(),
                })?;

            {
                let open = self.open.lock().expect("hid open lock poisoned");
                if open.contains_key(device_id) {
                    return Err(AdapterError::AlreadyOpen {
                        device_id: device_id.to_owned(),
                    });
                }
            }

            let device = self.with_api(|api| {
                api.open(vendor_id, product_id)
                    .map_err(|error| AdapterError::Hid {
                        device_id: device_id.to_owned(),
                        detail: error.to_string(),
                    })
            })?;

            self.open.lock().expect("hid open lock poisoned").insert(
                device_id.to_owned(),
                Arc::new(OpenHid {
                    device: Arc::new(Mutex::new(device)),
                }),
            );

            Ok(OpenOutcome {
                device_id: device_id.to_owned(),
                detail: Value::Null,
            })
        }

        pub(super) fn close(&self, device_id: &str) -> Result<CloseOutcome, AdapterError> {
            let was_open = self
                .open
                .lock()
                .expect("hid open lock poisoned")
                .remove(device_id)
                .is_some();
            Ok(CloseOutcome {
                device_id: device_id.to_owned(),
                was_open,
            })
        }

        fn handle(&self, device_id: &str) -> Result<Arc<OpenHid>, AdapterError> {
            self.open
                .lock()
                .expect("hid open lock poisoned")
                .get(device_id)
                .cloned()
                .ok_or_else(|| AdapterError::DeviceNotOpen {
                    device_id: device_id.to_owned(),
                })
        }

        pub(super) async fn write(
            &self,
            device_id: &str,
            payload: Vec<u8>,
        ) -> Result<WriteOutcome, AdapterError> {
            let handle = self.handle(device_id)?;
            let owner = device_id.to_owned();
            let device = Arc::clone(&handle.device);
            let written = tokio::task::spawn_blocking(move || {
                device
                    .lock()
                    .expect("hid device lock poisoned")
                    .write(&payload)
            })
            .await
            .map_err(|error| AdapterError::Hid {
                device_id: owner.clone(),
                detail: error.to_string(),
            })?
            .map_err(|error| AdapterError::Hid {
                device_id: owner,
                detail: error.to_string(),
            })?;
            Ok(WriteOutcome {
                bytes_written: written as u64,
                tool_job_id: None,
            })
        }

        pub(super) async fn read(
            &self,
            device_id: &str,
            max_bytes: usize,
            timeout: Duration,
        ) -> Result<ReadOutcome, AdapterError> {
            let handle = self.handle(device_id)?;
            let owner = device_id.to_owned();
            let device = Arc::clone(&handle.device);
            let timeout_ms = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
            let bytes = tokio::task::spawn_blocking(move || {
                let mut buf = vec![0_u8; max_bytes.max(1)];
                let n = device
                    .lock()
                    .expect("hid device lock poisoned")
                    .read_timeout(&mut buf, timeout_ms)?;
                buf.truncate(n);
                Ok::<Vec<u8>, hidapi::HidError>(buf)
            })
            .await
            .map_err(|error| AdapterError::Hid {
                device_id: owner.clone(),
                detail: error.to_string(),
            })?
            .map_err(|error| AdapterError::Hid {
                device_id: owner,
                detail: error.to_string(),
            })?;
            Ok(ReadOutcome { bytes })
        }

        pub(super) fn is_open(&self, device_id: &str) -> bool {
            self.open
                .lock()
                .expect("hid open lock poisoned")
                .contains_key(device_id)
        }
    }
}
