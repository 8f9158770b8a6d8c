use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Value, json};

use super::{Dispatcher, HandlerResult, parse_params};
use crate::broker::Broker;
use crate::events::STREAM_ALL;
use crate::protocol::RpcError;
use crate::transport::SessionHandle;

pub(crate) fn register(dispatcher: &mut Dispatcher) {
    dispatcher.register("devices.enumerate", enumerate);
    dispatcher.register("devices.get", get);
    dispatcher.register("devices.watch", watch);
    dispatcher.register("devices.unwatch", unwatch);
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct EnumerateParams {
    force_refresh: bool,
}

async fn enumerate(
    broker: Arc<Broker>,
    _session: Arc<SessionHandle>,
    params: Value,
) -> HandlerResult {
    let params: EnumerateParams = parse_params(params)?;
    let snapshot = broker.discovery().sweep(params.force_refresh).await;
    Ok(json!({
        "devices": snapshot.devices,
        "total": snapshot.devices.len(),
        "platform": snapshot.platform,
        "timestamp": snapshot.timestamp.to_string(),
    }))
}

#[derive(Debug, Deserialize)]
struct GetParams {
    device_id: String,
}

async fn get(broker: Arc<Broker>, _session: Arc<SessionHandle>, params: Value) -> HandlerResult {
    let params: GetParams = parse_params(params)?;
    let device = broker
        .registry()
        .get(&params.device_id)
        .ok_or_else(|| RpcError::internal(format!("device `{}` is not known", params.device_id)))?;
    Ok(json!({ "device": device }))
}

#[derive(Debug, Deserialize)]
struct WatchParams {
    #[serde(default = "default_stream")]
    stream: String,
}

fn default_stream() -> String {
    STREAM_ALL.to_owned()
}

async fn watch(_broker: Arc<Broker>, session: Arc<SessionHandle>, params: Value) -> HandlerResult {
    let params: WatchParams = parse_params(params)?;
    let added = session.subscribe(&params.stream);
    Ok(json!({
        "success": true,
        "stream": params.stream,
        "already_watching": !added,
        "session_id": session.id(),
    }))
}

async fn unwatch(
    _broker: Arc<Broker>,
    session: Arc<SessionHandle>,
    params: Value,
) -> HandlerResult {
    let params: WatchParams = parse_params(params)?;
    let removed = session.unsubscribe(&params.stream);
    Ok(json!({
        "success": true,
        "stream": params.stream,
        "was_watching": removed,
    }))
}
