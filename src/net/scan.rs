use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::time::Duration;

use bon::Builder;
use futures_util::StreamExt;
use serde::Serialize;
use tokio::net::TcpStream;
use tracing::{debug, instrument};

use crate::device::DeviceKind;
use crate::error::NetworkError;

/// Default per-target connect budget.
const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(2);
/// Default bound on concurrent outstanding probes.
const DEFAULT_MAX_CONCURRENT: usize = 20;

/// Options for one on-demand subnet sweep.
#[derive(Debug, Clone, Builder)]
pub struct ScanOptions {
    /// Subnet to sweep (`192.168.1`, `192.168.1.0` or `192.168.1.0/24`).
    /// Defaults to the /24 of the first non-loopback IPv4 interface.
    pub subnet: Option<String>,
    /// Ports probed on every host.
    #[builder(default = vec![9100])]
    pub ports: Vec<u16>,
    /// Per-target connect timeout.
    #[builder(default = DEFAULT_PROBE_TIMEOUT)]
    pub timeout: Duration,
    /// Maximum outstanding probes.
    #[builder(default = DEFAULT_MAX_CONCURRENT)]
    pub max_concurrent: usize,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// One open port found by a sweep.
#[derive(Debug, Clone, Serialize)]
pub struct ScanHit {
    pub host: String,
    pub port: u16,
    pub response_time_ms: u64,
    pub inferred_kind: DeviceKind,
    pub inferred_protocol: &'static str,
}

/// Maps well-known device ports to a kind and protocol guess.
#[must_use]
pub fn classify_port(port: u16) -> (DeviceKind, &'static str) {
    match port {
        9100 => (DeviceKind::Printer, "socket"),
        631 => (DeviceKind::Printer, "ipp"),
        515 => (DeviceKind::Printer, "lpd"),
        4370 => (DeviceKind::Biometric, "tcp"),
        _ => (DeviceKind::Network, "tcp"),
    }
}

/// Sweeps a /24 against the option's port list with bounded concurrency.
///
/// An open port is evidence of a reachable service, not an owned device, so
/// hits are returned to the caller rather than written into the registry.
///
/// # Errors
///
/// Returns an error when the subnet cannot be parsed or, with no subnet
/// given, no usable local interface exists.
#[instrument(skip(options), level = "debug", fields(ports = options.ports.len()))]
pub async fn scan_subnet(options: ScanOptions) -> Result<Vec<ScanHit>, NetworkError> {
    let base = match &options.subnet {
        Some(subnet) => parse_subnet_base(subnet)?,
        None => {
            let local = local_ipv4()?;
            let octets = local.octets();
            [octets[0], octets[1], octets[2]]
        }
    };

    let timeout = options.timeout;
    let targets = (1_u8..=254).flat_map(|last| {
        let ports = options.ports.clone();
        ports.into_iter().map(move |port| {
            (
                Ipv4Addr::new(base[0], base[1], base[2], last).to_string(),
                port,
            )
        })
    });

    let mut hits: Vec<ScanHit> = futures_util::stream::iter(targets)
        .map(|(host, port)| async move { probe(host, port, timeout).await })
        .buffer_unordered(options.max_concurrent.max(1))
        .filter_map(|hit| async move { hit })
        .collect()
        .await;

    hits.sort_by(|a, b| a.host.cmp(&b.host).then(a.port.cmp(&b.port)));
    debug!(hits = hits.len(), "subnet sweep finished");
    Ok(hits)
}

async fn probe(host: String, port: u16, timeout: Duration) -> Option<ScanHit> {
    let started = tokio::time::Instant::now();
    let connect = TcpStream::connect((host.as_str(), port));
    match tokio::time::timeout(timeout, connect).await {
        Ok(Ok(_stream)) => {
            let (inferred_kind, inferred_protocol) = classify_port(port);
            Some(ScanHit {
                host,
                port,
                response_time_ms: started.elapsed().as_millis() as u64,
                inferred_kind,
                inferred_protocol,
            })
        }
        _ => None,
    }
}

fn parse_subnet_base(subnet: &str) -> Result<[u8; 3], NetworkError> {
    let without_prefix = subnet.split('/').next().unwrap_or(subnet);
    let octets: Vec<&str> = without_prefix.split('.').collect();
    if octets.len() < 3 {
        return Err(NetworkError::InvalidSubnet {
            subnet: subnet.to_owned(),
        });
    }
    let mut base = [0_u8; 3];
    for (slot, octet) in base.iter_mut().zip(octets.iter()) {
        *slot = octet
            .parse()
            .map_err(|_| NetworkError::InvalidSubnet {
                subnet: subnet.to_owned(),
            })?;
    }
    Ok(base)
}

/// Finds the first non-loopback IPv4 address by asking the OS to route a
/// datagram; nothing is actually sent.
fn local_ipv4() -> Result<Ipv4Addr, NetworkError> {
    let socket = UdpSocket::bind("0.0.0.0:0").map_err(|_| NetworkError::NoLocalSubnet)?;
    socket
        .connect("198.51.100.1:9")
        .map_err(|_| NetworkError::NoLocalSubnet)?;
    match socket.local_addr() {
        Ok(SocketAddr::V4(addr)) if !addr.ip().is_loopback() => Ok(*addr.ip()),
        _ => Err(NetworkError::NoLocalSubnet),
    }
}
