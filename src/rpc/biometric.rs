use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Value, json};

use super::{Dispatcher, HandlerResult, PayloadEncoding, decode_payload, parse_params};
use crate::broker::Broker;
use crate::transport::SessionHandle;

/// Default acceptance threshold; the adapter only reports confidence, the
/// cut-off is policy applied here.
const DEFAULT_THRESHOLD: f64 = 0.7;

pub(crate) fn register(dispatcher: &mut Dispatcher) {
    dispatcher.register("biometric.enroll", enroll);
    dispatcher.register("biometric.authenticate", authenticate);
    dispatcher.register("biometric.identify", identify);
    dispatcher.register("biometric.getStatus", get_status);
    dispatcher.register("biometric.getUsers", get_users);
    dispatcher.register("biometric.deleteUser", delete_user);
}

#[derive(Debug, Deserialize)]
struct EnrollParams {
    device_id: String,
    user_id: String,
    user_name: String,
    /// Template bytes; base64 unless `encoding` says otherwise.
    template: String,
    #[serde(default = "default_encoding")]
    encoding: PayloadEncoding,
}

fn default_encoding() -> PayloadEncoding {
    PayloadEncoding::Base64
}

async fn enroll(broker: Arc<Broker>, _session: Arc<SessionHandle>, params: Value) -> HandlerResult {
    let params: EnrollParams = parse_params(params)?;
    let template = decode_payload(&params.template, params.encoding)?;
    let user = broker.adapters().biometric().enroll(
        &params.device_id,
        &params.user_id,
        &params.user_name,
        template,
    );
    Ok(json!({
        "success": true,
        "user": user,
    }))
}

#[derive(Debug, Deserialize)]
struct AuthenticateParams {
    device_id: String,
    user_id: String,
    template: String,
    #[serde(default = "default_encoding")]
    encoding: PayloadEncoding,
    #[serde(default = "default_threshold")]
    threshold: f64,
}

fn default_threshold() -> f64 {
    DEFAULT_THRESHOLD
}

async fn authenticate(
    broker: Arc<Broker>,
    _session: Arc<SessionHandle>,
    params: Value,
) -> HandlerResult {
    let params: AuthenticateParams = parse_params(params)?;
    let template = decode_payload(&params.template, params.encoding)?;
    let outcome = broker.adapters().biometric().authenticate(
        &params.device_id,
        &params.user_id,
        &template,
        params.threshold,
    )?;
    Ok(json!({
        "success": true,
        "verified": outcome.verified,
        "confidence": outcome.confidence,
    }))
}

#[derive(Debug, Deserialize)]
struct IdentifyParams {
    device_id: String,
    template: String,
    #[serde(default = "default_encoding")]
    encoding: PayloadEncoding,
    #[serde(default = "default_threshold")]
    threshold: f64,
}

async fn identify(
    broker: Arc<Broker>,
    _session: Arc<SessionHandle>,
    params: Value,
) -> HandlerResult {
    let params: IdentifyParams = parse_params(params)?;
    let template = decode_payload(&params.template, params.encoding)?;
    let outcome =
        broker
            .adapters()
            .biometric()
            .identify(&params.device_id, &template, params.threshold);
    Ok(json!({
        "success": true,
        "identified": outcome.identified,
        "user_id": outcome.user_id,
        "confidence": outcome.confidence,
    }))
}

#[derive(Debug, Deserialize)]
struct DeviceParams {
    device_id: String,
}

async fn get_status(
    broker: Arc<Broker>,
    _session: Arc<SessionHandle>,
    params: Value,
) -> HandlerResult {
    let params: DeviceParams = parse_params(params)?;
    use crate::adapters::DeviceAdapter;
    let report = broker
        .adapters()
        .biometric()
        .status(&params.device_id)
        .await?;
    serde_json::to_value(&report)
        .map_err(|error| crate::protocol::RpcError::internal(error.to_string()))
}

async fn get_users(
    broker: Arc<Broker>,
    _session: Arc<SessionHandle>,
    params: Value,
) -> HandlerResult {
    let params: DeviceParams = parse_params(params)?;
    let users = broker.adapters().biometric().list_users(&params.device_id);
    Ok(json!({
        "total": users.len(),
        "users": users,
    }))
}

#[derive(Debug, Deserialize)]
struct DeleteUserParams {
    device_id: String,
    user_id: String,
}

async fn delete_user(
    broker: Arc<Broker>,
    _session: Arc<SessionHandle>,
    params: Value,
) -> HandlerResult {
    let params: DeleteUserParams = parse_params(params)?;
    let deleted = broker
        .adapters()
        .biometric()
        .delete_user(&params.device_id, &params.user_id);
    Ok(json!({ "success": deleted }))
}
