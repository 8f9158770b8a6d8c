use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Value, json};

use super::{Dispatcher, HandlerResult, PayloadEncoding, decode_payload, encode_payload, parse_params};
use crate::adapters::{DeviceAdapter, OpenConfig, SerialPortConfig};
use crate::broker::Broker;
use crate::device::DeviceKind;
use crate::ownership::Owner;
use crate::protocol::RpcError;
use crate::transport::SessionHandle;

const DEFAULT_RECEIVE_MAX: usize = 1024;
const DEFAULT_RECEIVE_TIMEOUT_MS: u64 = 1_000;

pub(crate) fn register(dispatcher: &mut Dispatcher) {
    dispatcher.register("serial.open", open);
    dispatcher.register("serial.close", close);
    dispatcher.register("serial.send", send);
    dispatcher.register("serial.receive", receive);
    dispatcher.register("serial.getStatus", get_status);
}

fn serial_adapter(broker: &Broker) -> Result<Arc<dyn DeviceAdapter>, RpcError> {
    broker
        .adapters()
        .for_kind(DeviceKind::Serial)
        .ok_or_else(|| RpcError::internal("serial adapter is not configured"))
}

#[derive(Debug, Deserialize)]
struct OpenParams {
    device_id: String,
    #[serde(default)]
    config: SerialPortConfig,
}

async fn open(broker: Arc<Broker>, _session: Arc<SessionHandle>, params: Value) -> HandlerResult {
    let params: OpenParams = parse_params(params)?;
    let adapter = serial_adapter(&broker)?;

    if !broker.ownership().claim(&params.device_id, Owner::Adapter) {
        return Err(RpcError::internal(format!(
            "device `{}` is already open",
            params.device_id
        )));
    }
    let outcome = match adapter
        .open(&params.device_id, OpenConfig::Serial(params.config))
        .await
    {
        Ok(outcome) => outcome,
        Err(error) => {
            broker.ownership().release(&params.device_id, Owner::Adapter);
            return Err(error.into());
        }
    };

    Ok(json!({
        "success": true,
        "open": outcome,
    }))
}

#[derive(Debug, Deserialize)]
struct DeviceParams {
    device_id: String,
}

async fn close(broker: Arc<Broker>, _session: Arc<SessionHandle>, params: Value) -> HandlerResult {
    let params: DeviceParams = parse_params(params)?;
    let adapter = serial_adapter(&broker)?;
    let outcome = adapter.close(&params.device_id).await?;
    broker.ownership().release(&params.device_id, Owner::Adapter);
    Ok(json!({
        "success": true,
        "was_open": outcome.was_open,
    }))
}

#[derive(Debug, Deserialize)]
struct SendParams {
    device_id: String,
    data: String,
    #[serde(default)]
    encoding: PayloadEncoding,
}

async fn send(broker: Arc<Broker>, _session: Arc<SessionHandle>, params: Value) -> HandlerResult {
    let params: SendParams = parse_params(params)?;
    let payload = decode_payload(&params.data, params.encoding)?;
    let adapter = serial_adapter(&broker)?;
    let outcome = adapter.write(&params.device_id, &payload).await?;
    Ok(json!({
        "success": true,
        "bytes_transferred": outcome.bytes_written,
    }))
}

#[derive(Debug, Deserialize)]
struct ReceiveParams {
    device_id: String,
    #[serde(default = "default_receive_max")]
    max_bytes: usize,
    #[serde(default = "default_receive_timeout", alias = "timeout")]
    timeout_ms: u64,
    #[serde(default)]
    encoding: PayloadEncoding,
}

fn default_receive_max() -> usize {
    DEFAULT_RECEIVE_MAX
}

fn default_receive_timeout() -> u64 {
    DEFAULT_RECEIVE_TIMEOUT_MS
}

async fn receive(
    broker: Arc<Broker>,
    _session: Arc<SessionHandle>,
    params: Value,
) -> HandlerResult {
    let params: ReceiveParams = parse_params(params)?;
    let adapter = serial_adapter(&broker)?;
    let outcome = adapter
        .read(
            &params.device_id,
            params.max_bytes,
            Duration::from_millis(params.timeout_ms),
        )
        .await?;
    Ok(json!({
        "success": true,
        "bytes_transferred": outcome.bytes.len(),
        "data": encode_payload(&outcome.bytes, params.encoding),
        "encoding": params.encoding,
    }))
}

async fn get_status(
    broker: Arc<Broker>,
    _session: Arc<SessionHandle>,
    params: Value,
) -> HandlerResult {
    let params: DeviceParams = parse_params(params)?;
    let adapter = serial_adapter(&broker)?;
    let report = adapter.status(&params.device_id).await?;
    Ok(serde_json::to_value(&report)
        .map_err(|error| RpcError::internal(error.to_string()))?)
}
