use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde::Serialize;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::adapters::{AdapterSet, DeviceAdapter};
use crate::config::DiscoveryConfig;
use crate::device::{Device, DeviceKind};
use crate::net::NetworkManager;
use crate::ownership::DeviceOwnership;
use crate::registry::DeviceRegistry;

/// How long a sweep result stays fresh for `devices.enumerate`.
const CACHE_TTL: Duration = Duration::from_secs(10);
/// Per-enumerator budget.
const ENUMERATOR_TIMEOUT: Duration = Duration::from_secs(10);
/// Budget for mDNS name resolution shell-outs.
#[cfg(any(target_os = "linux", target_os = "macos"))]
const MDNS_TIMEOUT: Duration = Duration::from_secs(3);
/// Consecutive missed sweeps before a device is dropped. One flaky empty
/// enumeration must not delete real hardware.
const REMOVAL_MISS_THRESHOLD: u32 = 2;

/// Printer URI schemes that indicate a network queue worth resolving.
const NETWORK_QUEUE_SCHEMES: [&str; 6] = ["dnssd", "ipp", "ipps", "socket", "http", "https"];

/// Result of one enumeration pass.
#[derive(Debug, Clone, Serialize)]
pub struct EnumerationSnapshot {
    pub platform: &'static str,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub devices: Vec<Device>,
}

struct CachedSnapshot {
    taken_at: tokio::time::Instant,
    snapshot: EnumerationSnapshot,
}

/// Periodic and on-demand population of the registry from OS enumerators.
pub struct DiscoveryEngine {
    adapters: Arc<AdapterSet>,
    registry: Arc<DeviceRegistry>,
    network: Arc<NetworkManager>,
    ownership: Arc<DeviceOwnership>,
    config: RwLock<DiscoveryConfig>,
    cache: tokio::sync::Mutex<Option<CachedSnapshot>>,
    miss_counts: Mutex<HashMap<String, u32>>,
}

impl DiscoveryEngine {
    #[must_use]
    pub fn new(
        adapters: Arc<AdapterSet>,
        registry: Arc<DeviceRegistry>,
        network: Arc<NetworkManager>,
        ownership: Arc<DeviceOwnership>,
        config: DiscoveryConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            adapters,
            registry,
            network,
            ownership,
            config: RwLock::new(config),
            cache: tokio::sync::Mutex::new(None),
            miss_counts: Mutex::new(HashMap::new()),
        })
    }

    /// Applies updated discovery settings; takes effect on the next cycle.
    pub fn update_config(&self, config: DiscoveryConfig) {
        *self.config.write().expect("discovery config lock poisoned") = config;
    }

    /// Runs one enumeration pass, reusing a fresh cached snapshot unless
    /// `force_refresh` is set.
    #[instrument(skip(self), level = "debug")]
    pub async fn sweep(&self, force_refresh: bool) -> EnumerationSnapshot {
        let mut cache = self.cache.lock().await;
        if !force_refresh {
            if let Some(cached) = cache.as_ref() {
                if cached.taken_at.elapsed() < CACHE_TTL {
                    return cached.snapshot.clone();
                }
            }
        }

        let swept_kinds = self.enabled_kinds();
        let mut seen: HashSet<String> = HashSet::new();

        for kind in &swept_kinds {
            let Some(adapter) = self.adapters.for_kind(*kind) else {
                continue;
            };
            let discovered =
                match tokio::time::timeout(ENUMERATOR_TIMEOUT, adapter.discover()).await {
                    Ok(Ok(devices)) => devices,
                    Ok(Err(error)) => {
                        warn!(kind = %kind, %error, "enumerator failed; keeping previous view");
                        // A failing enumerator must not count as a miss.
                        seen.extend(
                            self.registry
                                .list()
                                .into_iter()
                                .filter(|device| device.kind == *kind)
                                .map(|device| device.id),
                        );
                        continue;
                    }
                    Err(_) => {
                        warn!(kind = %kind, "enumerator timed out; keeping previous view");
                        seen.extend(
                            self.registry
                                .list()
                                .into_iter()
                                .filter(|device| device.kind == *kind)
                                .map(|device| device.id),
                        );
                        continue;
                    }
                };

            for mut device in discovered {
                if device.kind == DeviceKind::Printer {
                    resolve_network_queue(&mut device).await;
                }
                seen.insert(device.id.clone());
                self.registry.upsert(device);
            }
        }

        self.apply_removals(&swept_kinds, &seen).await;

        let snapshot = EnumerationSnapshot {
            platform: std::env::consts::OS,
            timestamp: OffsetDateTime::now_utc(),
            devices: self.registry.list(),
        };
        *cache = Some(CachedSnapshot {
            taken_at: tokio::time::Instant::now(),
            snapshot: snapshot.clone(),
        });
        snapshot
    }

    /// Spawns the periodic rediscovery loop.
    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let interval = engine
                    .config
                    .read()
                    .expect("discovery config lock poisoned")
                    .interval();
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                let snapshot = engine.sweep(true).await;
                debug!(devices = snapshot.devices.len(), "periodic rediscovery finished");
            }
        })
    }

    fn enabled_kinds(&self) -> Vec<DeviceKind> {
        let config = self.config.read().expect("discovery config lock poisoned");
        let mut kinds = Vec::new();
        if config.enable_printer {
            kinds.push(DeviceKind::Printer);
        }
        if config.enable_serial {
            kinds.push(DeviceKind::Serial);
        }
        if config.enable_usb_hid {
            kinds.push(DeviceKind::UsbHid);
        }
        if config.enable_biometric {
            kinds.push(DeviceKind::Biometric);
        }
        kinds
    }

    /// Drops devices missing from two consecutive sweeps, unless an open
    /// handle or live connection still refers to them.
    async fn apply_removals(&self, swept_kinds: &[DeviceKind], seen: &HashSet<String>) {
        let candidates: Vec<Device> = self
            .registry
            .list()
            .into_iter()
            .filter(|device| swept_kinds.contains(&device.kind))
            .collect();

        for device in candidates {
            if seen.contains(&device.id) {
                self.miss_counts
                    .lock()
                    .expect("miss counts lock poisoned")
                    .remove(&device.id);
                continue;
            }

            let misses = {
                let mut miss_counts =
                    self.miss_counts.lock().expect("miss counts lock poisoned");
                let entry = miss_counts.entry(device.id.clone()).or_insert(0);
                *entry += 1;
                *entry
            };

            if misses < REMOVAL_MISS_THRESHOLD {
                continue;
            }
            if self.ownership.is_claimed(&device.id) || self.network.is_connected(&device.id).await
            {
                debug!(device_id = %device.id, "device missing but held open; keeping");
                continue;
            }

            self.registry.remove(&device.id);
            self.miss_counts
                .lock()
                .expect("miss counts lock poisoned")
                .remove(&device.id);
        }
    }
}

/// Fills `host`/`port` properties for OS printer queues whose URI points at
/// a network print service. Best-effort: failures leave the record as-is.
async fn resolve_network_queue(device: &mut Device) {
    let Some(uri) = device.text_property("uri").map(str::to_owned) else {
        return;
    };
    let Some((scheme, host, port)) = parse_queue_uri(&uri) else {
        return;
    };
    if !NETWORK_QUEUE_SCHEMES.contains(&scheme.as_str()) {
        return;
    }

    let port = port.or_else(|| default_port_for_scheme(&scheme));
    if let Some(port) = port {
        device.properties.insert("port".to_owned(), port.into());
    }
    device
        .properties
        .insert("host".to_owned(), host.as_str().into());

    if host.trim_end_matches('.').ends_with(".local") {
        if let Some(resolved) = resolve_mdns_host(&host).await {
            device
                .properties
                .insert("resolved_host".to_owned(), resolved.into());
        }
    }
}

/// Splits `scheme://host[:port]/...` into parts. Returns `None` for URIs
/// without an authority.
fn parse_queue_uri(uri: &str) -> Option<(String, String, Option<u16>)> {
    let (scheme, rest) = uri.split_once("://")?;
    let authority = rest.split(['/', '?']).next()?;
    if authority.is_empty() {
        return None;
    }
    match authority.rsplit_once(':') {
        Some((host, port)) => match port.parse::<u16>() {
            Ok(port) => Some((scheme.to_ascii_lowercase(), host.to_owned(), Some(port))),
            Err(_) => Some((scheme.to_ascii_lowercase(), authority.to_owned(), None)),
        },
        None => Some((scheme.to_ascii_lowercase(), authority.to_owned(), None)),
    }
}

fn default_port_for_scheme(scheme: &str) -> Option<u16> {
    match scheme {
        "socket" => Some(9100),
        "ipp" | "ipps" | "dnssd" => Some(631),
        "http" => Some(80),
        "https" => Some(443),
        _ => None,
    }
}

/// Resolves a `.local` hostname through the platform's mDNS tooling.
#[cfg(target_os = "linux")]
async fn resolve_mdns_host(host: &str) -> Option<String> {
    let output = crate::adapters::run_tool("avahi-resolve-host-name", &["-4", host], None, MDNS_TIMEOUT)
        .await
        .ok()?;
    // Output is `hostname<TAB>address`.
    output.split_whitespace().nth(1).map(str::to_owned)
}

#[cfg(target_os = "macos")]
async fn resolve_mdns_host(host: &str) -> Option<String> {
    let output = crate::adapters::run_tool(
        "dscacheutil",
        &["-q", "host", "-a", "name", host],
        None,
        MDNS_TIMEOUT,
    )
    .await
    .ok()?;
    output
        .lines()
        .find_map(|line| line.strip_prefix("ip_address:"))
        .map(|address| address.trim().to_owned())
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
async fn resolve_mdns_host(_host: &str) -> Option<String> {
    None
}
