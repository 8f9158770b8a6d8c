use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::{DeserializeFromStr, SerializeDisplay};
use strum_macros::{Display, EnumString};
use time::OffsetDateTime;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use crate::adapters::{AdapterSet, DeviceAdapter, PrintFormat};
use crate::config::BrokerConfig;
use crate::device::{Device, DeviceKind};
use crate::discovery::DiscoveryEngine;
use crate::error::{AdapterError, BrokerError, ConfigError};
use crate::events::{DeviceEvent, EventFabric, spawn_fanout};
use crate::net::NetworkManager;
use crate::ownership::DeviceOwnership;
use crate::queue::{JobRunner, JobStore, OperationJob, OperationQueue};
use crate::registry::DeviceRegistry;
use crate::transport::SessionRegistry;

/// Which transport a print payload actually travelled over.
#[derive(
    Debug, Clone, Copy, Eq, PartialEq, Display, EnumString, SerializeDisplay, DeserializeFromStr,
)]
pub enum PrintTransport {
    #[strum(to_string = "one_shot_socket")]
    OneShotSocket,
    #[strum(to_string = "network_connection")]
    NetworkConnection,
    #[strum(to_string = "os_queue")]
    OsQueue,
}

/// Result of one executed print.
#[derive(Debug, Clone, Serialize)]
pub struct PrintOutcome {
    pub bytes_written: u64,
    pub transport: PrintTransport,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_job_id: Option<String>,
}

/// Parameters a queued `printer.print` job carries in its row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrintJobParams {
    pub data_base64: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default)]
    pub format: PrintFormat,
}

/// Outcome of applying new settings.
#[derive(Debug, Clone, Serialize)]
pub struct SettingsOutcome {
    pub success: bool,
    /// The transport listener is being rebound to a new endpoint.
    pub restart_required: bool,
}

/// The whole broker: registry, managers, queue, adapters and sessions,
/// passed explicitly into every handler so tests can assemble fakes.
pub struct Broker {
    config: RwLock<BrokerConfig>,
    config_path: Option<PathBuf>,
    registry: Arc<DeviceRegistry>,
    events: Arc<EventFabric>,
    network: Arc<NetworkManager>,
    queue: Arc<OperationQueue>,
    adapters: Arc<AdapterSet>,
    sessions: Arc<SessionRegistry>,
    ownership: Arc<DeviceOwnership>,
    discovery: Arc<DiscoveryEngine>,
    started_at: OffsetDateTime,
    started_instant: Instant,
    transport_reload: watch::Sender<u64>,
}

impl Broker {
    /// Wires the full component graph. The returned receiver feeds the event
    /// fan-out task started by [`Broker::spawn_background`].
    #[must_use]
    pub fn new(
        config: BrokerConfig,
        config_path: Option<PathBuf>,
        adapters: Arc<AdapterSet>,
        store: Arc<JobStore>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<DeviceEvent>) {
        let (events, events_rx) = EventFabric::new();
        let registry = Arc::new(DeviceRegistry::new(Arc::clone(&events)));
        let ownership = Arc::new(DeviceOwnership::new());
        let network = Arc::new(NetworkManager::new(
            config.network.max_connections,
            Arc::clone(&events),
            Arc::clone(&registry),
            Arc::clone(&ownership),
        ));
        let queue = OperationQueue::new(
            store,
            config.queue.retry_interval(),
            config.queue.max_retry_attempts,
            Arc::clone(&events),
        );
        let discovery = DiscoveryEngine::new(
            Arc::clone(&adapters),
            Arc::clone(&registry),
            Arc::clone(&network),
            Arc::clone(&ownership),
            config.discovery.clone(),
        );
        let sessions = Arc::new(SessionRegistry::new(config.transport.max_connections));
        let (transport_reload, _) = watch::channel(0);

        let broker = Arc::new(Self {
            config: RwLock::new(config),
            config_path,
            registry,
            events,
            network,
            queue,
            adapters,
            sessions,
            ownership,
            discovery,
            started_at: OffsetDateTime::now_utc(),
            started_instant: Instant::now(),
            transport_reload,
        });
        (broker, events_rx)
    }

    /// Starts the event fan-out, the rediscovery loop and the queue worker.
    pub fn spawn_background(
        self: &Arc<Self>,
        events_rx: mpsc::UnboundedReceiver<DeviceEvent>,
        cancel: &CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        vec![
            spawn_fanout(events_rx, Arc::clone(&self.sessions), cancel.clone()),
            self.discovery.spawn(cancel.clone()),
            self.queue
                .spawn_worker(Arc::clone(self) as Arc<dyn JobRunner>, cancel.clone()),
        ]
    }

    /// Snapshot of the live configuration.
    #[must_use]
    pub fn config(&self) -> BrokerConfig {
        self.config.read().expect("config lock poisoned").clone()
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn events(&self) -> &Arc<EventFabric> {
        &self.events
    }

    #[must_use]
    pub fn network(&self) -> &Arc<NetworkManager> {
        &self.network
    }

    #[must_use]
    pub fn queue(&self) -> &Arc<OperationQueue> {
        &self.queue
    }

    #[must_use]
    pub fn adapters(&self) -> &Arc<AdapterSet> {
        &self.adapters
    }

    #[must_use]
    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    #[must_use]
    pub fn ownership(&self) -> &Arc<DeviceOwnership> {
        &self.ownership
    }

    #[must_use]
    pub fn discovery(&self) -> &Arc<DiscoveryEngine> {
        &self.discovery
    }

    #[must_use]
    pub fn started_at(&self) -> OffsetDateTime {
        self.started_at
    }

    #[must_use]
    pub fn uptime(&self) -> Duration {
        self.started_instant.elapsed()
    }

    /// Receiver signalled whenever the transport must rebind.
    #[must_use]
    pub fn transport_reload(&self) -> watch::Receiver<u64> {
        self.transport_reload.subscribe()
    }

    /// Routes a print payload. The rule is deterministic: an explicit
    /// `host`+`port` wins and uses a transient socket; otherwise a live
    /// managed connection for the device is reused; otherwise the format
    /// hint picks the transport — printer-language streams (escpos, zpl,
    /// epl) go one-shot to the endpoint discovery resolved for the device
    /// when one is known, everything else falls back to the OS print queue.
    #[instrument(skip(self, payload), level = "debug", fields(bytes = payload.len()))]
    pub async fn execute_print(
        &self,
        device_id: &str,
        payload: &[u8],
        host: Option<&str>,
        port: Option<u16>,
        format: PrintFormat,
    ) -> Result<PrintOutcome, BrokerError> {
        let timeout = self.config().network.default_timeout();

        if let (Some(host), Some(port)) = (host, port) {
            let sent = self
                .network
                .one_shot_send(host, port, payload, timeout)
                .await?;
            return Ok(PrintOutcome {
                bytes_written: sent.bytes_written,
                transport: PrintTransport::OneShotSocket,
                tool_job_id: None,
            });
        }

        if self.network.is_connected(device_id).await {
            let sent = self.network.send(device_id, payload).await?;
            return Ok(PrintOutcome {
                bytes_written: sent.bytes_written,
                transport: PrintTransport::NetworkConnection,
                tool_job_id: None,
            });
        }

        if format.prefers_direct_socket() {
            let endpoint = self
                .registry
                .get(device_id)
                .as_ref()
                .and_then(Device::network_endpoint);
            if let Some((host, port)) = endpoint {
                let sent = self
                    .network
                    .one_shot_send(&host, port, payload, timeout)
                    .await?;
                return Ok(PrintOutcome {
                    bytes_written: sent.bytes_written,
                    transport: PrintTransport::OneShotSocket,
                    tool_job_id: None,
                });
            }
        }

        let adapter = self
            .adapters
            .for_kind(DeviceKind::Printer)
            .ok_or_else(|| {
                BrokerError::Adapter(AdapterError::DeviceNotFound {
                    device_id: device_id.to_owned(),
                })
            })?;
        let written = adapter.write(device_id, payload).await?;
        Ok(PrintOutcome {
            bytes_written: written.bytes_written,
            transport: PrintTransport::OsQueue,
            tool_job_id: written.tool_job_id,
        })
    }

    /// Applies and persists a new configuration. Hot-swappable settings take
    /// effect immediately; an endpoint change rebinds the listener.
    ///
    /// # Errors
    ///
    /// Returns an error when persisting the file fails.
    pub fn apply_settings(&self, new_config: BrokerConfig) -> Result<SettingsOutcome, ConfigError> {
        let restart_required = {
            let current = self.config.read().expect("config lock poisoned");
            current.transport.host != new_config.transport.host
                || current.transport.port != new_config.transport.port
                || current.transport.use_tls != new_config.transport.use_tls
                || current.transport.certificate_path != new_config.transport.certificate_path
        };

        if let Some(path) = &self.config_path {
            new_config.save(path)?;
        }

        self.sessions
            .set_max_connections(new_config.transport.max_connections);
        self.network
            .set_max_connections(new_config.network.max_connections);
        self.discovery.update_config(new_config.discovery.clone());
        *self.config.write().expect("config lock poisoned") = new_config;

        if restart_required {
            info!("transport endpoint changed; scheduling listener rebind");
            self.transport_reload.send_modify(|generation| *generation += 1);
        }

        Ok(SettingsOutcome {
            success: true,
            restart_required,
        })
    }
}

#[async_trait]
impl JobRunner for Broker {
    async fn run(&self, job: &OperationJob) -> Result<Value, String> {
        match job.operation.as_str() {
            "printer.print" => {
                let params: PrintJobParams = serde_json::from_value(job.params.clone())
                    .map_err(|error| format!("malformed job params: {error}"))?;
                let payload = crate::rpc::decode_base64(&params.data_base64)
                    .map_err(|error| format!("malformed job payload: {error}"))?;
                let outcome = self
                    .execute_print(
                        &job.device_id,
                        &payload,
                        params.host.as_deref(),
                        params.port,
                        params.format,
                    )
                    .await
                    .map_err(|error| error.to_string())?;
                serde_json::to_value(&outcome).map_err(|error| error.to_string())
            }
            other => Err(format!("operation `{other}` cannot run from the queue")),
        }
    }
}
