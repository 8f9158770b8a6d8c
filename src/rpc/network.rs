use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Value, json};

use super::{Dispatcher, HandlerResult, PayloadEncoding, decode_payload, parse_params};
use crate::broker::Broker;
use crate::device::{Device, DeviceKind, DeviceStatus, network_device_id};
use crate::net::ScanOptions;
use crate::protocol::RpcError;
use crate::transport::SessionHandle;

pub(crate) fn register(dispatcher: &mut Dispatcher) {
    dispatcher.register("network.connect", connect);
    dispatcher.register("network.disconnect", disconnect);
    dispatcher.register("network.ping", ping);
    dispatcher.register("network.discover", discover);
    dispatcher.register("network.send", send);
    dispatcher.register("network.getStatus", get_status);
}

#[derive(Debug, Deserialize)]
struct ConnectTarget {
    host: String,
    port: u16,
    #[serde(default, alias = "timeout")]
    timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ConnectParams {
    #[serde(default)]
    device_id: Option<String>,
    config: ConnectTarget,
}

async fn connect(broker: Arc<Broker>, _session: Arc<SessionHandle>, params: Value) -> HandlerResult {
    let params: ConnectParams = parse_params(params)?;
    let device_id = params
        .device_id
        .unwrap_or_else(|| network_device_id(&params.config.host, params.config.port));
    let timeout = params
        .config
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or_else(|| broker.config().network.default_timeout());

    let info = broker
        .network()
        .connect(&device_id, &params.config.host, params.config.port, timeout)
        .await?;

    Ok(json!({
        "success": true,
        "status": "connected",
        "connection": info,
    }))
}

#[derive(Debug, Deserialize)]
struct DeviceParams {
    device_id: String,
}

async fn disconnect(
    broker: Arc<Broker>,
    _session: Arc<SessionHandle>,
    params: Value,
) -> HandlerResult {
    let params: DeviceParams = parse_params(params)?;
    let was_connected = broker.network().disconnect(&params.device_id).await;
    Ok(json!({
        "success": true,
        "status": if was_connected { "disconnected" } else { "not_connected" },
    }))
}

#[derive(Debug, Deserialize)]
struct PingParams {
    host: String,
    port: u16,
    #[serde(default, alias = "timeout")]
    timeout_ms: Option<u64>,
}

async fn ping(broker: Arc<Broker>, _session: Arc<SessionHandle>, params: Value) -> HandlerResult {
    let params: PingParams = parse_params(params)?;
    let timeout = params
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or_else(|| broker.config().network.default_timeout());
    let outcome = broker.network().ping(&params.host, params.port, timeout).await;
    serde_json::to_value(&outcome).map_err(|error| RpcError::internal(error.to_string()))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DiscoverParams {
    subnet: Option<String>,
    ports: Option<Vec<u16>>,
    #[serde(alias = "timeout")]
    timeout_ms: Option<u64>,
    max_concurrent: Option<usize>,
    /// Discovered services stay out of the registry unless opted in: an
    /// open port is not yet an owned device.
    register: bool,
}

async fn discover(
    broker: Arc<Broker>,
    _session: Arc<SessionHandle>,
    params: Value,
) -> HandlerResult {
    if !broker.config().discovery.enable_network {
        return Err(RpcError::internal(
            "network discovery is disabled by configuration",
        ));
    }
    let params: DiscoverParams = parse_params(params)?;
    let options = ScanOptions::builder()
        .maybe_subnet(params.subnet)
        .maybe_ports(params.ports)
        .maybe_timeout(params.timeout_ms.map(Duration::from_millis))
        .maybe_max_concurrent(params.max_concurrent)
        .build();

    let hits = broker.network().scan(options).await?;

    if params.register {
        for hit in &hits {
            let id = network_device_id(&hit.host, hit.port);
            let mut device = Device::builder()
                .id(id)
                .kind(hit.inferred_kind)
                .name(format!("{}:{}", hit.host, hit.port))
                .status(DeviceStatus::Available)
                .build();
            device.properties.insert("host".to_owned(), hit.host.as_str().into());
            device.properties.insert("port".to_owned(), hit.port.into());
            device
                .properties
                .insert("protocol".to_owned(), hit.inferred_protocol.into());
            device
                .properties
                .insert("connection_type".to_owned(), "network".into());
            broker.registry().upsert(device);
        }
    }

    Ok(json!({
        "devices": hits,
        "total": hits.len(),
        "registered": params.register,
    }))
}

#[derive(Debug, Deserialize)]
struct SendParams {
    device_id: String,
    data: String,
    #[serde(default)]
    encoding: PayloadEncoding,
    /// When set, wait for a device response for up to this long.
    #[serde(default)]
    expect_response_timeout_ms: Option<u64>,
}

async fn send(broker: Arc<Broker>, _session: Arc<SessionHandle>, params: Value) -> HandlerResult {
    let params: SendParams = parse_params(params)?;
    let payload = decode_payload(&params.data, params.encoding)?;

    match params.expect_response_timeout_ms {
        Some(timeout_ms) => {
            let response = broker
                .network()
                .send_and_receive(
                    &params.device_id,
                    &payload,
                    Duration::from_millis(timeout_ms),
                )
                .await?;
            Ok(json!({
                "success": true,
                "bytes_written": payload.len(),
                "response": super::encode_payload(&response, params.encoding),
                "response_bytes": response.len(),
            }))
        }
        None => {
            let outcome = broker.network().send(&params.device_id, &payload).await?;
            Ok(json!({
                "success": true,
                "bytes_written": outcome.bytes_written,
            }))
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct StatusParams {
    device_id: Option<String>,
}

async fn get_status(
    broker: Arc<Broker>,
    _session: Arc<SessionHandle>,
    params: Value,
) -> HandlerResult {
    let params: StatusParams = parse_params(params)?;
    match params.device_id {
        Some(device_id) => {
            let connection = broker.network().connection_info(&device_id).await;
            Ok(json!({
                "device_id": device_id,
                "is_connected": connection.as_ref().is_some_and(|info| info.is_alive),
                "connection": connection,
            }))
        }
        None => {
            let connections = broker.network().list_connections().await;
            Ok(json!({
                "total": connections.len(),
                "connections": connections,
            }))
        }
    }
}
