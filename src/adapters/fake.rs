use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

use super::{
    CloseOutcome, DeviceAdapter, OpenConfig, OpenOutcome, ReadOutcome, StatusReport, WriteOutcome,
};
use crate::device::{Device, DeviceKind};
use crate::error::AdapterError;

/// Scripted in-memory adapter used by tests and `--fake` runs.
///
/// Discovery returns whatever fixture devices are currently installed, so a
/// test can emulate hardware appearing and disappearing between sweeps.
/// Writes and reads are recorded and replayed from scripts.
pub struct FakeAdapter {
    kind: DeviceKind,
    devices: Mutex<Vec<Device>>,
    open: Mutex<HashSet<String>>,
    written: Mutex<HashMap<String, Vec<Vec<u8>>>>,
    read_script: Mutex<HashMap<String, VecDeque<Vec<u8>>>>,
    failing_writes: AtomicU32,
}

impl FakeAdapter {
    #[must_use]
    pub fn new(kind: DeviceKind) -> Self {
        info!(%kind, "using fake device adapter");
        Self {
            kind,
            devices: Mutex::new(Vec::new()),
            open: Mutex::new(HashSet::new()),
            written: Mutex::new(HashMap::new()),
            read_script: Mutex::new(HashMap::new()),
            failing_writes: AtomicU32::new(0),
        }
    }

    /// Replaces the fixture devices returned by the next discovery.
    pub fn set_devices(&self, devices: Vec<Device>) {
        *self.devices.lock().expect("fake devices lock poisoned") = devices;
    }

    /// Queues one payload to be returned by a future `read`.
    pub fn push_read(&self, device_id: &str, payload: Vec<u8>) {
        self.read_script
            .lock()
            .expect("fake read lock poisoned")
            .entry(device_id.to_owned())
            .or_default()
            .push_back(payload);
    }

    /// Makes the next `count` writes fail with an I/O error.
    pub fn fail_next_writes(&self, count: u32) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    /// Returns every payload written to `device_id` so far.
    #[must_use]
    pub fn written_to(&self, device_id: &str) -> Vec<Vec<u8>> {
        self.written
            .lock()
            .expect("fake written lock poisoned")
            .get(device_id)
            .cloned()
            .unwrap_or_default()
    }

    fn known(&self, device_id: &str) -> bool {
        self.devices
            .lock()
            .expect("fake devices lock poisoned")
            .iter()
            .any(|device| device.id == device_id)
    }

    fn require_open(&self, device_id: &str) -> Result<(), AdapterError> {
        // OS-queue printing needs no open handle; every other kind does.
        if self.kind == DeviceKind::Printer {
            return Ok(());
        }
        if self
            .open
            .lock()
            .expect("fake open lock poisoned")
            .contains(device_id)
        {
            Ok(())
        } else {
            Err(AdapterError::DeviceNotOpen {
                device_id: device_id.to_owned(),
            })
        }
    }
}

#[async_trait]
impl DeviceAdapter for FakeAdapter {
    fn kind(&self) -> DeviceKind {
        self.kind
    }

    async fn discover(&self) -> Result<Vec<Device>, AdapterError> {
        Ok(self.devices.lock().expect("fake devices lock poisoned").clone())
    }

    async fn open(
        &self,
        device_id: &str,
        _config: OpenConfig,
    ) -> Result<OpenOutcome, AdapterError> {
        if !self.known(device_id) {
            return Err(AdapterError::DeviceNotFound {
                device_id: device_id.to_owned(),
            });
        }
        let mut open = self.open.lock().expect("fake open lock poisoned");
        if !open.insert(device_id.to_owned()) {
            return Err(AdapterError::AlreadyOpen {
                device_id: device_id.to_owned(),
            });
        }
        Ok(OpenOutcome {
            device_id: device_id.to_owned(),
            detail: Value::Null,
        })
    }

    async fn close(&self, device_id: &str) -> Result<CloseOutcome, AdapterError> {
        let was_open = self
            .open
            .lock()
            .expect("fake open lock poisoned")
            .remove(device_id);
        Ok(CloseOutcome {
            device_id: device_id.to_owned(),
            was_open,
        })
    }

    async fn write(&self, device_id: &str, payload: &[u8]) -> Result<WriteOutcome, AdapterError> {
        if !self.known(device_id) {
            return Err(AdapterError::DeviceNotFound {
                device_id: device_id.to_owned(),
            });
        }
        self.require_open(device_id)?;
        if self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                current.checked_sub(1)
            })
            .is_ok()
        {
            return Err(AdapterError::Io {
                device_id: device_id.to_owned(),
                source: std::io::Error::other("scripted write failure"),
            });
        }
        self.written
            .lock()
            .expect("fake written lock poisoned")
            .entry(device_id.to_owned())
            .or_default()
            .push(payload.to_vec());
        Ok(WriteOutcome {
            bytes_written: payload.len() as u64,
            tool_job_id: None,
        })
    }

    async fn read(
        &self,
        device_id: &str,
        max_bytes: usize,
        _timeout: Duration,
    ) -> Result<ReadOutcome, AdapterError> {
        self.require_open(device_id)?;
        let mut scripts = self.read_script.lock().expect("fake read lock poisoned");
        let bytes = match scripts.get_mut(device_id).and_then(VecDeque::pop_front) {
            Some(mut payload) => {
                if payload.len() > max_bytes {
                    let rest = payload.split_off(max_bytes);
                    scripts
                        .entry(device_id.to_owned())
                        .or_default()
                        .push_front(rest);
                }
                payload
            }
            None => Vec::new(),
        };
        Ok(ReadOutcome { bytes })
    }

    async fn status(&self, device_id: &str) -> Result<StatusReport, AdapterError> {
        let is_open = self
            .open
            .lock()
            .expect("fake open lock poisoned")
            .contains(device_id);
        Ok(StatusReport {
            device_id: device_id.to_owned(),
            is_open,
            detail: std::collections::BTreeMap::new(),
        })
    }

    async fn is_open(&self, device_id: &str) -> bool {
        self.open
            .lock()
            .expect("fake open lock poisoned")
            .contains(device_id)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::device::serial_device_id;

    fn fixture(kind: DeviceKind, id: &str) -> Device {
        Device::builder()
            .id(id.to_owned())
            .kind(kind)
            .name(id.to_owned())
            .build()
    }

    #[tokio::test]
    async fn double_open_fails_the_loser() {
        let adapter = FakeAdapter::new(DeviceKind::Serial);
        let id = serial_device_id("COM1");
        adapter.set_devices(vec![fixture(DeviceKind::Serial, &id)]);

        adapter
            .open(&id, OpenConfig::None)
            .await
            .expect("first open succeeds");
        let second = adapter.open(&id, OpenConfig::None).await;
        assert_matches!(second, Err(AdapterError::AlreadyOpen { .. }));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let adapter = FakeAdapter::new(DeviceKind::Serial);
        let id = serial_device_id("COM1");
        adapter.set_devices(vec![fixture(DeviceKind::Serial, &id)]);
        adapter
            .open(&id, OpenConfig::None)
            .await
            .expect("open succeeds");

        let first = adapter.close(&id).await.expect("close succeeds");
        assert!(first.was_open);
        let second = adapter.close(&id).await.expect("repeat close succeeds");
        assert!(!second.was_open);
    }

    #[tokio::test]
    async fn scripted_write_failures_burn_down() {
        let adapter = FakeAdapter::new(DeviceKind::Printer);
        let id = "printer_office";
        adapter.set_devices(vec![fixture(DeviceKind::Printer, id)]);
        adapter.fail_next_writes(2);

        assert_matches!(adapter.write(id, b"x").await, Err(AdapterError::Io { .. }));
        assert_matches!(adapter.write(id, b"x").await, Err(AdapterError::Io { .. }));
        let outcome = adapter.write(id, b"xyz").await.expect("third write succeeds");
        assert_eq!(3, outcome.bytes_written);
        assert_eq!(vec![b"xyz".to_vec()], adapter.written_to(id));
    }

    #[tokio::test]
    async fn read_respects_max_bytes_and_keeps_the_rest() {
        let adapter = FakeAdapter::new(DeviceKind::Serial);
        let id = serial_device_id("COM1");
        adapter.set_devices(vec![fixture(DeviceKind::Serial, &id)]);
        adapter
            .open(&id, OpenConfig::None)
            .await
            .expect("open succeeds");
        adapter.push_read(&id, b"HELLO".to_vec());

        let first = adapter
            .read(&id, 3, Duration::from_millis(10))
            .await
            .expect("read succeeds");
        assert_eq!(b"HEL".to_vec(), first.bytes);
        let second = adapter
            .read(&id, 10, Duration::from_millis(10))
            .await
            .expect("read succeeds");
        assert_eq!(b"LO".to_vec(), second.bytes);
    }
}
