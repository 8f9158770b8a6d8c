use std::io::{self, IsTerminal};
use std::sync::OnceLock;

use opentelemetry::global;
use opentelemetry::trace::TracerProvider as _;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::error::TelemetryError;

static TRACING_INITIALISED: OnceLock<Result<(), TelemetryError>> = OnceLock::new();

/// Initialises structured logging and OpenTelemetry tracing support.
///
/// Interactive terminals get pretty human-readable output; everything else
/// (service managers, log collectors) gets JSON lines.
pub(crate) fn initialise_tracing(
    service_name: &str,
    default_filter: &str,
) -> Result<(), &'static TelemetryError> {
    let filter = default_filter.to_owned();
    TRACING_INITIALISED
        .get_or_init(|| initialise_tracing_once(service_name, &filter))
        .as_ref()
        .copied()
}

fn initialise_tracing_once(
    service_name: &str,
    default_filter: &str,
) -> Result<(), TelemetryError> {
    let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder().build();
    let tracer = tracer_provider.tracer(service_name.to_owned());
    global::set_tracer_provider(tracer_provider);

    let log_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    if io::stderr().is_terminal() {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .pretty()
                    .with_target(false)
                    .with_filter(log_filter),
            )
            .with(OpenTelemetryLayer::new(tracer))
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .json()
                    .with_target(false)
                    .with_filter(log_filter),
            )
            .with(OpenTelemetryLayer::new(tracer))
            .try_init()?;
    }

    Ok(())
}
