use std::sync::Arc;

use serde_json::{Value, json};

use super::{Dispatcher, HandlerResult};
use crate::broker::Broker;
use crate::protocol::RpcError;
use crate::transport::SessionHandle;

pub(crate) fn register(dispatcher: &mut Dispatcher) {
    dispatcher.register("system.getInfo", get_info);
    dispatcher.register("system.getHealth", get_health);
}

async fn get_info(
    broker: Arc<Broker>,
    _session: Arc<SessionHandle>,
    _params: Value,
) -> HandlerResult {
    Ok(json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "platform": std::env::consts::OS,
        "arch": std::env::consts::ARCH,
        "started_at": broker.started_at().to_string(),
    }))
}

async fn get_health(
    broker: Arc<Broker>,
    _session: Arc<SessionHandle>,
    _params: Value,
) -> HandlerResult {
    let queue = broker.queue().summary().await?;
    let uptime = broker.uptime();
    let queue_value =
        serde_json::to_value(&queue).map_err(|error| RpcError::internal(error.to_string()))?;
    let network_connections = broker.network().connection_count().await;
    Ok(json!({
        "status": "ok",
        "uptime": humantime::format_duration(std::time::Duration::from_secs(uptime.as_secs()))
            .to_string(),
        "uptime_ms": uptime.as_millis() as u64,
        "activeConnections": broker.sessions().count(),
        "devices": broker.registry().len(),
        "networkConnections": network_connections,
        "droppedNotifications": broker.sessions().dropped_notifications(),
        "queue": queue_value,
    }))
}
