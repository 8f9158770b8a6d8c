use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Value, json};

use super::{Dispatcher, HandlerResult, parse_params};
use crate::adapters::{DeviceAdapter, OpenConfig};
use crate::broker::Broker;
use crate::device::DeviceKind;
use crate::ownership::Owner;
use crate::protocol::RpcError;
use crate::transport::SessionHandle;

/// HID input reports are small; this bounds one `receiveReport` read.
const DEFAULT_REPORT_BYTES: usize = 64;
const DEFAULT_RECEIVE_TIMEOUT_MS: u64 = 1_000;

pub(crate) fn register(dispatcher: &mut Dispatcher) {
    dispatcher.register("usb.open", open);
    dispatcher.register("usb.close", close);
    dispatcher.register("usb.sendReport", send_report);
    dispatcher.register("usb.receiveReport", receive_report);
    dispatcher.register("usb.getStatus", get_status);
}

fn usb_adapter(broker: &Broker) -> Result<Arc<dyn DeviceAdapter>, RpcError> {
    broker
        .adapters()
        .for_kind(DeviceKind::UsbHid)
        .ok_or_else(|| RpcError::internal("USB HID adapter is not configured"))
}

#[derive(Debug, Deserialize)]
struct DeviceParams {
    device_id: String,
}

async fn open(broker: Arc<Broker>, _session: Arc<SessionHandle>, params: Value) -> HandlerResult {
    let params: DeviceParams = parse_params(params)?;
    let adapter = usb_adapter(&broker)?;

    if !broker.ownership().claim(&params.device_id, Owner::Adapter) {
        return Err(RpcError::internal(format!(
            "device `{}` is already open",
            params.device_id
        )));
    }
    let outcome = match adapter.open(&params.device_id, OpenConfig::None).await {
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

async fn close(broker: Arc<Broker>, _session: Arc<SessionHandle>, params: Value) -> HandlerResult {
    let params: DeviceParams = parse_params(params)?;
    let adapter = usb_adapter(&broker)?;
    let outcome = adapter.close(&params.device_id).await?;
    broker.ownership().release(&params.device_id, Owner::Adapter);
    Ok(json!({
        "success": true,
        "was_open": outcome.was_open,
    }))
}

#[derive(Debug, Deserialize)]
struct SendReportParams {
    device_id: String,
    #[serde(default)]
    report_id: u8,
    /// Report payload, hex-encoded.
    data: String,
}

async fn send_report(
    broker: Arc<Broker>,
    _session: Arc<SessionHandle>,
    params: Value,
) -> HandlerResult {
    let params: SendReportParams = parse_params(params)?;
    let payload = hex::decode(&params.data)
        .map_err(|error| RpcError::invalid_params(format!("invalid hex data: {error}")))?;
    let adapter = usb_adapter(&broker)?;

    let mut report = Vec::with_capacity(payload.len() + 1);
    report.push(params.report_id);
    report.extend_from_slice(&payload);

    let outcome = adapter.write(&params.device_id, &report).await?;
    Ok(json!({
        "success": true,
        "bytes_transferred": outcome.bytes_written,
        "report_id": params.report_id,
    }))
}

#[derive(Debug, Deserialize)]
struct ReceiveReportParams {
    device_id: String,
    #[serde(default = "default_report_bytes")]
    max_bytes: usize,
    #[serde(default = "default_receive_timeout", alias = "timeout")]
    timeout_ms: u64,
}

fn default_report_bytes() -> usize {
    DEFAULT_REPORT_BYTES
}

fn default_receive_timeout() -> u64 {
    DEFAULT_RECEIVE_TIMEOUT_MS
}

async fn receive_report(
    broker: Arc<Broker>,
    _session: Arc<SessionHandle>,
    params: Value,
) -> HandlerResult {
    let params: ReceiveReportParams = parse_params(params)?;
    let adapter = usb_adapter(&broker)?;
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
        "data": hex::encode(&outcome.bytes),
    }))
}

async fn get_status(
    broker: Arc<Broker>,
    _session: Arc<SessionHandle>,
    params: Value,
) -> HandlerResult {
    let params: DeviceParams = parse_params(params)?;
    let adapter = usb_adapter(&broker)?;
    let report = adapter.status(&params.device_id).await?;
    serde_json::to_value(&report).map_err(|error| RpcError::internal(error.to_string()))
}
