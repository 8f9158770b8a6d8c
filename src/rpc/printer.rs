use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Value, json};

use super::{Dispatcher, HandlerResult, PayloadEncoding, decode_payload, encode_base64, parse_params};
use crate::adapters::{DeviceAdapter, PrintFormat};
use crate::broker::{Broker, PrintJobParams};
use crate::device::DeviceKind;
use crate::queue::JobStatus;
use crate::transport::SessionHandle;

/// How long a print request waits for its first queue attempt before
/// reporting the job as still queued. Covers the OS tool budget.
const PRINT_WAIT: Duration = Duration::from_secs(15);

pub(crate) fn register(dispatcher: &mut Dispatcher) {
    dispatcher.register("printer.print", print);
    dispatcher.register("printer.getStatus", get_status);
    dispatcher.register("printer.getCapabilities", get_capabilities);
}

#[derive(Debug, Deserialize)]
struct PrintParams {
    device_id: String,
    data: String,
    #[serde(default)]
    encoding: PayloadEncoding,
    #[serde(default)]
    format: PrintFormat,
    #[serde(default)]
    host: Option<String>,
    #[serde(default)]
    port: Option<u16>,
}

/// Every print is recorded as a durable queue job; the handler wakes the
/// worker and reports the first attempt. A failed attempt stays queued for
/// timed retries, which is why the job id always comes back.
async fn print(broker: Arc<Broker>, _session: Arc<SessionHandle>, params: Value) -> HandlerResult {
    let params: PrintParams = parse_params(params)?;
    let payload = decode_payload(&params.data, params.encoding)?;

    let job_params = PrintJobParams {
        data_base64: encode_base64(&payload),
        host: params.host,
        port: params.port,
        format: params.format,
    };
    let job_params =
        serde_json::to_value(&job_params).map_err(|error| {
            crate::protocol::RpcError::internal(format!("failed to encode job params: {error}"))
        })?;

    let outcome = broker
        .queue()
        .submit_and_wait(
            &params.device_id,
            DeviceKind::Printer,
            "printer.print",
            job_params,
            PRINT_WAIT,
        )
        .await?;

    match (outcome.job.status, outcome.result) {
        (JobStatus::Completed, Some(result)) => {
            let bytes_printed = result
                .get("bytes_written")
                .and_then(Value::as_u64)
                .unwrap_or(payload.len() as u64);
            Ok(json!({
                "success": true,
                "bytes_printed": bytes_printed,
                "job_id": outcome.job.job_id,
                "transport": result.get("transport"),
                "tool_job_id": result.get("tool_job_id"),
            }))
        }
        (status, _) => Ok(json!({
            "success": false,
            "job_id": outcome.job.job_id,
            "status": status,
            "error": outcome.job.error,
        })),
    }
}

#[derive(Debug, Deserialize)]
struct StatusParams {
    device_id: String,
}

async fn get_status(
    broker: Arc<Broker>,
    _session: Arc<SessionHandle>,
    params: Value,
) -> HandlerResult {
    let params: StatusParams = parse_params(params)?;
    let adapter = printer_adapter(&broker)?;
    let report = adapter.status(&params.device_id).await?;
    let registry_status = broker
        .registry()
        .get(&params.device_id)
        .map(|device| device.status);
    let is_connected = broker.network().is_connected(&params.device_id).await;
    Ok(json!({
        "report": report,
        "status": registry_status,
        "is_connected": is_connected,
    }))
}

async fn get_capabilities(
    broker: Arc<Broker>,
    _session: Arc<SessionHandle>,
    params: Value,
) -> HandlerResult {
    let params: StatusParams = parse_params(params)?;
    let adapter = printer_adapter(&broker)?;
    let capabilities = adapter.capabilities(&params.device_id).await?;
    Ok(json!({ "capabilities": capabilities }))
}

fn printer_adapter(
    broker: &Broker,
) -> Result<Arc<dyn crate::adapters::DeviceAdapter>, crate::protocol::RpcError> {
    broker
        .adapters()
        .for_kind(DeviceKind::Printer)
        .ok_or_else(|| crate::protocol::RpcError::internal("printer adapter is not configured"))
}
