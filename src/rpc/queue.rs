use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Value, json};

use super::{Dispatcher, HandlerResult, parse_params};
use crate::broker::Broker;
use crate::protocol::RpcError;
use crate::queue::JobStatus;
use crate::transport::SessionHandle;

const DEFAULT_LIST_LIMIT: usize = 50;

pub(crate) fn register(dispatcher: &mut Dispatcher) {
    dispatcher.register("queue.getStatus", get_status);
    dispatcher.register("queue.getJobs", get_jobs);
    dispatcher.register("queue.cancelJob", cancel_job);
    dispatcher.register("queue.retryJob", retry_job);
}

async fn get_status(
    broker: Arc<Broker>,
    _session: Arc<SessionHandle>,
    _params: Value,
) -> HandlerResult {
    let summary = broker.queue().summary().await?;
    serde_json::to_value(&summary).map_err(|error| RpcError::internal(error.to_string()))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct GetJobsParams {
    device_id: Option<String>,
    status: Option<JobStatus>,
    limit: Option<usize>,
}

async fn get_jobs(
    broker: Arc<Broker>,
    _session: Arc<SessionHandle>,
    params: Value,
) -> HandlerResult {
    let params: GetJobsParams = parse_params(params)?;
    let jobs = broker
        .queue()
        .list(
            params.device_id,
            params.status,
            params.limit.unwrap_or(DEFAULT_LIST_LIMIT),
        )
        .await?;
    Ok(json!({
        "total": jobs.len(),
        "jobs": jobs,
    }))
}

#[derive(Debug, Deserialize)]
struct JobParams {
    job_id: String,
}

async fn cancel_job(
    broker: Arc<Broker>,
    _session: Arc<SessionHandle>,
    params: Value,
) -> HandlerResult {
    let params: JobParams = parse_params(params)?;
    let applied = broker.queue().cancel(&params.job_id).await?;
    Ok(json!({ "success": applied }))
}

async fn retry_job(
    broker: Arc<Broker>,
    _session: Arc<SessionHandle>,
    params: Value,
) -> HandlerResult {
    let params: JobParams = parse_params(params)?;
    let applied = broker.queue().retry(&params.job_id).await?;
    Ok(json!({ "success": applied }))
}
