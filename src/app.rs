use std::sync::Arc;

use anyhow::{Context, anyhow};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::adapters::{AdapterSet, BiometricAdapter, FakeAdapter};
use crate::broker::Broker;
use crate::cli::Args;
use crate::config::BrokerConfig;
use crate::device::{Device, DeviceKind, printer_device_id, serial_device_id};
use crate::queue::JobStore;
use crate::rpc::Dispatcher;
use crate::telemetry;
use crate::transport;

/// Runs the broker until Ctrl+C.
///
/// # Errors
///
/// Returns an error if tracing initialisation fails, configuration cannot be
/// loaded, the queue store cannot be opened, or the listener cannot bind.
pub async fn run(args: Args) -> anyhow::Result<()> {
    telemetry::initialise_tracing("hwbridge", args.log_level.as_filter())
        .map_err(|error| anyhow!("{error}"))?;

    let config_path = match &args.config {
        Some(path) => path.clone(),
        None => BrokerConfig::default_path().context("resolving configuration path")?,
    };
    let mut config = BrokerConfig::load(&config_path)
        .with_context(|| format!("loading configuration from {}", config_path.display()))?;
    if let Some(host) = args.host {
        config.transport.host = host;
    }
    if let Some(port) = args.port {
        config.transport.port = port;
    }
    if let Some(database) = args.database {
        config.queue.database_path = Some(database);
    }

    let adapters = if args.fake {
        Arc::new(fixture_adapters())
    } else {
        Arc::new(AdapterSet::platform())
    };

    let database_path = config.database_path().context("resolving database path")?;
    let store = Arc::new(
        JobStore::open(&database_path)
            .with_context(|| format!("opening queue store at {}", database_path.display()))?,
    );

    let (broker, events_rx) = Broker::new(config, Some(config_path), adapters, store);
    let cancel = CancellationToken::new();
    let background = broker.spawn_background(events_rx, &cancel);

    // Populate the registry before the first client asks.
    let warmup_broker = Arc::clone(&broker);
    tokio::spawn(async move {
        warmup_broker.discovery().sweep(true).await;
    });

    let dispatcher = Arc::new(Dispatcher::new());
    let mut server = tokio::spawn(transport::serve(
        Arc::clone(&broker),
        dispatcher,
        cancel.clone(),
    ));

    tokio::select! {
        result = &mut server => {
            cancel.cancel();
            result.context("transport task panicked")??;
        }
        signal = tokio::signal::ctrl_c() => {
            signal.context("waiting for Ctrl+C")?;
            info!("shutdown requested");
            cancel.cancel();
            broker.network().dispose_all().await;
            let _ = server.await;
        }
    }

    for task in background {
        let _ = task.await;
    }
    info!("broker stopped");
    Ok(())
}

/// Scripted adapters for `--fake` runs: one printer queue and one serial
/// port, enough to exercise every client flow without hardware.
fn fixture_adapters() -> AdapterSet {
    let printer = FakeAdapter::new(DeviceKind::Printer);
    let printer_id = printer_device_id("Fixture_Laser");
    printer.set_devices(vec![
        Device::builder()
            .id(printer_id)
            .kind(DeviceKind::Printer)
            .name("Fixture_Laser".to_owned())
            .build(),
    ]);

    let serial = FakeAdapter::new(DeviceKind::Serial);
    let serial_id = serial_device_id("/dev/ttyFIXTURE0");
    serial.set_devices(vec![
        Device::builder()
            .id(serial_id)
            .kind(DeviceKind::Serial)
            .name("/dev/ttyFIXTURE0".to_owned())
            .build(),
    ]);

    AdapterSet::new(
        Arc::new(printer),
        Arc::new(serial),
        Arc::new(FakeAdapter::new(DeviceKind::UsbHid)),
        Arc::new(BiometricAdapter::new()),
    )
}
