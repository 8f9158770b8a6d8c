use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use serde::Serialize;
use time::OffsetDateTime;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::scan::{ScanHit, ScanOptions, scan_subnet};
use crate::device::{Device, DeviceKind, DeviceStatus, network_device_id};
use crate::error::NetworkError;
use crate::events::{DeviceEvent, EventFabric, EventKind};
use crate::ownership::{DeviceOwnership, Owner};
use crate::registry::DeviceRegistry;

/// Inter-chunk quiet period that ends a `send_and_receive` accumulation.
const QUIET_PERIOD: Duration = Duration::from_millis(500);
/// Linger giving a transient socket's peer time to take the bytes.
const ONE_SHOT_LINGER: Duration = Duration::from_millis(200);

/// Serializable view of one live device connection.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub connection_id: Uuid,
    pub device_id: String,
    pub host: String,
    pub port: u16,
    pub protocol: &'static str,
    #[serde(with = "time::serde::rfc3339")]
    pub connected_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_activity: OffsetDateTime,
    pub bytes_written: u64,
    pub bytes_read: u64,
    pub is_alive: bool,
}

/// Result of a fire-and-forget send.
#[derive(Debug, Clone, Serialize)]
pub struct SendOutcome {
    pub bytes_written: u64,
}

/// Result of a reachability probe.
#[derive(Debug, Clone, Serialize)]
pub struct PingOutcome {
    pub ok: bool,
    pub response_time_ms: u64,
    pub is_online: bool,
}

struct Connection {
    connection_id: Uuid,
    device_id: String,
    host: String,
    port: u16,
    connected_at: OffsetDateTime,
    writer: Mutex<OwnedWriteHalf>,
    inbound: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    bytes_written: AtomicU64,
    bytes_read: AtomicU64,
    last_activity_unix: AtomicI64,
    alive: AtomicBool,
}

impl Connection {
    fn touch(&self) {
        self.last_activity_unix
            .store(OffsetDateTime::now_utc().unix_timestamp(), Ordering::Relaxed);
    }

    fn info(&self) -> ConnectionInfo {
        let last_activity =
            OffsetDateTime::from_unix_timestamp(self.last_activity_unix.load(Ordering::Relaxed))
                .unwrap_or(self.connected_at);
        ConnectionInfo {
            connection_id: self.connection_id,
            device_id: self.device_id.clone(),
            host: self.host.clone(),
            port: self.port,
            protocol: "tcp",
            connected_at: self.connected_at,
            last_activity,
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            is_alive: self.alive.load(Ordering::Relaxed),
        }
    }
}

struct Inner {
    connections: Mutex<HashMap<String, Arc<Connection>>>,
    max_connections: AtomicUsize,
    events: Arc<EventFabric>,
    registry: Arc<DeviceRegistry>,
    ownership: Arc<DeviceOwnership>,
}

impl Inner {
    /// Removes a connection if it still matches `connection_id`, releasing
    /// ownership and flipping registry state. Publishes `disconnected` when
    /// asked and the entry was actually present.
    async fn teardown(&self, device_id: &str, connection_id: Uuid, publish: bool) {
        let removed = {
            let mut connections = self.connections.lock().await;
            match connections.get(device_id) {
                Some(existing) if existing.connection_id == connection_id => {
                    connections.remove(device_id)
                }
                _ => None,
            }
        };
        let Some(connection) = removed else {
            return;
        };
        connection.alive.store(false, Ordering::Relaxed);
        self.ownership.release(device_id, Owner::Network);
        self.registry.set_connected(device_id, false);
        if publish {
            self.events.publish(DeviceEvent::new(
                EventKind::Disconnected,
                device_id,
                DeviceKind::Network,
            ));
        }
    }
}

/// Owner of every live TCP socket to hardware.
///
/// The connection map is guarded by one lock; per-socket I/O runs without
/// holding it. Each device has at most one live connection at a time.
pub struct NetworkManager {
    inner: Arc<Inner>,
}

impl NetworkManager {
    #[must_use]
    pub fn new(
        max_connections: usize,
        events: Arc<EventFabric>,
        registry: Arc<DeviceRegistry>,
        ownership: Arc<DeviceOwnership>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                connections: Mutex::new(HashMap::new()),
                max_connections: AtomicUsize::new(max_connections),
                events,
                registry,
                ownership,
            }),
        }
    }

    /// Applies a new connection cap; existing connections are unaffected.
    pub fn set_max_connections(&self, max_connections: usize) {
        self.inner
            .max_connections
            .store(max_connections, Ordering::Relaxed);
    }

    /// Opens and registers a managed connection to `host:port`.
    ///
    /// # Errors
    ///
    /// Fails when the device already has a live connection, is owned by an
    /// adapter handle, the cap is reached, or the connect itself fails.
    #[instrument(skip(self), level = "debug")]
    pub async fn connect(
        &self,
        device_id: &str,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<ConnectionInfo, NetworkError> {
        {
            let mut connections = self.inner.connections.lock().await;
            if let Some(existing) = connections.get(device_id) {
                if existing.alive.load(Ordering::Relaxed) {
                    return Err(NetworkError::AlreadyConnected {
                        device_id: device_id.to_owned(),
                    });
                }
                connections.remove(device_id);
            }
            if connections.len() >= self.inner.max_connections.load(Ordering::Relaxed) {
                return Err(NetworkError::ConnectionLimit {
                    max: self.inner.max_connections.load(Ordering::Relaxed),
                });
            }
        }

        if !self.inner.ownership.claim(device_id, Owner::Network) {
            return Err(NetworkError::AlreadyOwned {
                device_id: device_id.to_owned(),
            });
        }

        let stream = match open_stream(host, port, timeout).await {
            Ok(stream) => stream,
            Err(error) => {
                self.inner.ownership.release(device_id, Owner::Network);
                return Err(error);
            }
        };

        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = Arc::new(Connection {
            connection_id: Uuid::new_v4(),
            device_id: device_id.to_owned(),
            host: host.to_owned(),
            port,
            connected_at: OffsetDateTime::now_utc(),
            writer: Mutex::new(write_half),
            inbound: Mutex::new(rx),
            bytes_written: AtomicU64::new(0),
            bytes_read: AtomicU64::new(0),
            last_activity_unix: AtomicI64::new(OffsetDateTime::now_utc().unix_timestamp()),
            alive: AtomicBool::new(true),
        });

        {
            let mut connections = self.inner.connections.lock().await;
            if connections.contains_key(device_id) {
                // Lost a connect race; the winner keeps the device.
                self.inner.ownership.release(device_id, Owner::Network);
                return Err(NetworkError::AlreadyConnected {
                    device_id: device_id.to_owned(),
                });
            }
            connections.insert(device_id.to_owned(), Arc::clone(&connection));
        }

        spawn_reader(
            Arc::clone(&self.inner),
            Arc::clone(&connection),
            read_half,
            tx,
        );

        let mut device = Device::builder()
            .id(device_id.to_owned())
            .kind(DeviceKind::Network)
            .name(format!("{host}:{port}"))
            .status(DeviceStatus::Connected)
            .is_connected(true)
            .build();
        device.properties.insert("host".to_owned(), host.into());
        device.properties.insert("port".to_owned(), port.into());
        device
            .properties
            .insert("connection_type".to_owned(), "network".into());
        self.inner.registry.upsert(device);

        self.inner.events.publish(
            DeviceEvent::new(EventKind::Connected, device_id, DeviceKind::Network).with_data(
                serde_json::json!({"host": host, "port": port}),
            ),
        );

        Ok(connection.info())
    }

    /// Closes a managed connection. Disconnecting an absent device is not an
    /// error; the outcome reports what happened.
    pub async fn disconnect(&self, device_id: &str) -> bool {
        let existing = {
            let connections = self.inner.connections.lock().await;
            connections.get(device_id).map(|c| c.connection_id)
        };
        match existing {
            Some(connection_id) => {
                self.inner.teardown(device_id, connection_id, true).await;
                true
            }
            None => false,
        }
    }

    /// Sends bytes over the managed connection.
    ///
    /// # Errors
    ///
    /// Fails without side effect when the device is not connected; a write
    /// failure tears the connection down and publishes `disconnected`.
    pub async fn send(&self, device_id: &str, payload: &[u8]) -> Result<SendOutcome, NetworkError> {
        let connection = self.live_connection(device_id).await?;

        let write_result = {
            let mut writer = connection.writer.lock().await;
            writer.write_all(payload).await
        };

        if let Err(source) = write_result {
            warn!(device_id, %source, "device write failed; dropping connection");
            self.inner
                .teardown(device_id, connection.connection_id, true)
                .await;
            return Err(NetworkError::Io {
                device_id: device_id.to_owned(),
                source,
            });
        }

        connection
            .bytes_written
            .fetch_add(payload.len() as u64, Ordering::Relaxed);
        connection.touch();
        Ok(SendOutcome {
            bytes_written: payload.len() as u64,
        })
    }

    /// Writes `payload`, then accumulates inbound chunks until a quiet
    /// period elapses after at least one chunk, or `timeout` fires.
    ///
    /// # Errors
    ///
    /// Fails when the device is not connected or the write fails.
    pub async fn send_and_receive(
        &self,
        device_id: &str,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, NetworkError> {
        self.send(device_id, payload).await?;
        let connection = self.live_connection(device_id).await?;

        let mut response = Vec::new();
        let overall = tokio::time::sleep(timeout);
        tokio::pin!(overall);
        let mut inbound = connection.inbound.lock().await;

        loop {
            if response.is_empty() {
                tokio::select! {
                    _ = &mut overall => break,
                    chunk = inbound.recv() => match chunk {
                        Some(chunk) => response.extend_from_slice(&chunk),
                        None => break,
                    },
                }
            } else {
                tokio::select! {
                    _ = &mut overall => break,
                    _ = tokio::time::sleep(QUIET_PERIOD) => break,
                    chunk = inbound.recv() => match chunk {
                        Some(chunk) => response.extend_from_slice(&chunk),
                        None => break,
                    },
                }
            }
        }

        Ok(response)
    }

    /// Opens a transient socket, writes, lingers briefly and closes.
    /// The connection map is never touched.
    ///
    /// # Errors
    ///
    /// Fails when the connect or the write fails.
    pub async fn one_shot_send(
        &self,
        host: &str,
        port: u16,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<SendOutcome, NetworkError> {
        let mut stream = open_stream(host, port, timeout).await?;
        stream
            .write_all(payload)
            .await
            .map_err(|source| NetworkError::Io {
                device_id: network_device_id(host, port),
                source,
            })?;
        tokio::time::sleep(ONE_SHOT_LINGER).await;
        let _ = stream.shutdown().await;
        debug!(host, port, bytes = payload.len(), "one-shot send finished");
        Ok(SendOutcome {
            bytes_written: payload.len() as u64,
        })
    }

    /// Open-and-close reachability probe.
    pub async fn ping(&self, host: &str, port: u16, timeout: Duration) -> PingOutcome {
        let started = tokio::time::Instant::now();
        match open_stream(host, port, timeout).await {
            Ok(_stream) => PingOutcome {
                ok: true,
                response_time_ms: started.elapsed().as_millis() as u64,
                is_online: true,
            },
            Err(_) => PingOutcome {
                ok: false,
                response_time_ms: started.elapsed().as_millis() as u64,
                is_online: false,
            },
        }
    }

    /// Delegates an on-demand subnet sweep.
    ///
    /// # Errors
    ///
    /// See [`scan_subnet`].
    pub async fn scan(&self, options: ScanOptions) -> Result<Vec<ScanHit>, NetworkError> {
        scan_subnet(options).await
    }

    /// Whether `device_id` has a live managed connection.
    pub async fn is_connected(&self, device_id: &str) -> bool {
        let connections = self.inner.connections.lock().await;
        connections
            .get(device_id)
            .is_some_and(|connection| connection.alive.load(Ordering::Relaxed))
    }

    /// Snapshot of one connection's counters.
    pub async fn connection_info(&self, device_id: &str) -> Option<ConnectionInfo> {
        let connections = self.inner.connections.lock().await;
        connections.get(device_id).map(|connection| connection.info())
    }

    /// Snapshot of every live connection.
    pub async fn list_connections(&self) -> Vec<ConnectionInfo> {
        let connections = self.inner.connections.lock().await;
        let mut infos: Vec<ConnectionInfo> =
            connections.values().map(|connection| connection.info()).collect();
        infos.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        infos
    }

    /// Live connection count.
    pub async fn connection_count(&self) -> usize {
        self.inner.connections.lock().await.len()
    }

    /// Destroys every socket without emitting events; shutdown path.
    pub async fn dispose_all(&self) {
        let drained: Vec<(String, Arc<Connection>)> = {
            let mut connections = self.inner.connections.lock().await;
            connections.drain().collect()
        };
        for (device_id, connection) in drained {
            connection.alive.store(false, Ordering::Relaxed);
            self.inner.ownership.release(&device_id, Owner::Network);
        }
    }

    async fn live_connection(&self, device_id: &str) -> Result<Arc<Connection>, NetworkError> {
        let connection = {
            let connections = self.inner.connections.lock().await;
            connections.get(device_id).cloned()
        };
        let Some(connection) = connection else {
            return Err(NetworkError::NotConnected {
                device_id: device_id.to_owned(),
            });
        };
        if !connection.alive.load(Ordering::Relaxed) {
            self.inner
                .teardown(device_id, connection.connection_id, true)
                .await;
            return Err(NetworkError::ConnectionDead {
                device_id: device_id.to_owned(),
            });
        }
        Ok(connection)
    }
}

async fn open_stream(host: &str, port: u16, timeout: Duration) -> Result<TcpStream, NetworkError> {
    let connect = TcpStream::connect((host, port));
    match tokio::time::timeout(timeout, connect).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(source)) => Err(NetworkError::Connect {
            host: host.to_owned(),
            port,
            source,
        }),
        Err(_) => Err(NetworkError::ConnectTimeout {
            host: host.to_owned(),
            port,
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}

fn spawn_reader(
    inner: Arc<Inner>,
    connection: Arc<Connection>,
    mut read_half: tokio::net::tcp::OwnedReadHalf,
    tx: mpsc::UnboundedSender<Vec<u8>>,
) {
    tokio::spawn(async move {
        let mut buf = vec![0_u8; 4096];
        loop {
            match read_half.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    connection
                        .bytes_read
                        .fetch_add(n as u64, Ordering::Relaxed);
                    connection.touch();
                    if tx.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(error) => {
                    debug!(device_id = %connection.device_id, %error, "device socket read failed");
                    break;
                }
            }
        }
        connection.alive.store(false, Ordering::Relaxed);
        inner
            .teardown(&connection.device_id, connection.connection_id, true)
            .await;
    });
}
