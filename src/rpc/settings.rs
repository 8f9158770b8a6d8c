use std::sync::Arc;

use serde_json::{Value, json};

use super::{Dispatcher, HandlerResult, parse_params};
use crate::broker::Broker;
use crate::config::BrokerConfig;
use crate::protocol::RpcError;
use crate::transport::SessionHandle;

pub(crate) fn register(dispatcher: &mut Dispatcher) {
    dispatcher.register("settings.get", get);
    dispatcher.register("settings.save", save);
}

async fn get(broker: Arc<Broker>, _session: Arc<SessionHandle>, _params: Value) -> HandlerResult {
    serde_json::to_value(broker.config()).map_err(|error| RpcError::internal(error.to_string()))
}

/// Params are the full configuration object; omitted fields fall back to
/// their defaults, so `settings.get` → edit → `settings.save` round-trips.
async fn save(broker: Arc<Broker>, _session: Arc<SessionHandle>, params: Value) -> HandlerResult {
    let config: BrokerConfig = parse_params(params)?;
    let outcome = broker
        .apply_settings(config)
        .map_err(|error| RpcError::internal(error.to_string()))?;
    serde_json::to_value(&outcome).map_err(|error| RpcError::internal(error.to_string()))
}
