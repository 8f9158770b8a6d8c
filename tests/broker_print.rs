use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use hwbridge::{
    AdapterSet, BiometricAdapter, Broker, BrokerConfig, Device, DeviceKind, Dispatcher,
    FakeAdapter, JobStatus, JobStore, SessionHandle, network_device_id, printer_device_id,
};

struct Harness {
    broker: Arc<Broker>,
    dispatcher: Dispatcher,
    session: Arc<SessionHandle>,
    printer: Arc<FakeAdapter>,
    cancel: CancellationToken,
}

fn harness() -> Harness {
    let mut config = BrokerConfig::default();
    config.queue.retry_interval_ms = 50;

    let printer = Arc::new(FakeAdapter::new(DeviceKind::Printer));
    printer.set_devices(vec![
        Device::builder()
            .id(printer_device_id("Office_Laser"))
            .kind(DeviceKind::Printer)
            .name("Office_Laser".to_owned())
            .build(),
    ]);
    let adapters = Arc::new(AdapterSet::new(
        Arc::clone(&printer) as _,
        Arc::new(FakeAdapter::new(DeviceKind::Serial)),
        Arc::new(FakeAdapter::new(DeviceKind::UsbHid)),
        Arc::new(BiometricAdapter::new()),
    ));
    let store = Arc::new(JobStore::open_in_memory().expect("store opens"));
    let (broker, events_rx) = Broker::new(config, None, adapters, store);
    let cancel = CancellationToken::new();
    broker.spawn_background(events_rx, &cancel);

    Harness {
        broker,
        dispatcher: Dispatcher::new(),
        session: Arc::new(SessionHandle::new(None)),
        printer,
        cancel,
    }
}

impl Harness {
    async fn call(&self, method: &str, params: Value, id: u64) -> Value {
        let frame =
            json!({"jsonrpc": "2.0", "method": method, "params": params, "id": id}).to_string();
        let response = self
            .dispatcher
            .dispatch(Arc::clone(&self.broker), Arc::clone(&self.session), &frame)
            .await
            .expect("request with id gets a response");
        serde_json::from_str(&response).expect("response is JSON")
    }
}

/// Accepts one connection and captures everything it receives.
async fn capture_server() -> (std::net::SocketAddr, tokio::task::JoinHandle<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind capture");
    let addr = listener.local_addr().expect("local addr");
    let task = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.expect("accept");
        let mut received = Vec::new();
        let mut buf = [0_u8; 1024];
        loop {
            match socket.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => received.extend_from_slice(&buf[..n]),
            }
        }
        received
    });
    (addr, task)
}

#[tokio::test]
async fn explicit_host_and_port_take_the_one_shot_path() {
    let (addr, capture) = capture_server().await;
    let harness = harness();
    let device_id = network_device_id(&addr.ip().to_string(), addr.port());

    let response = harness
        .call(
            "printer.print",
            json!({
                "device_id": device_id,
                "data": "TEST\n",
                "format": "raw",
                "host": addr.ip().to_string(),
                "port": addr.port(),
            }),
            1,
        )
        .await;

    assert_eq!(true, response["result"]["success"]);
    assert_eq!(5, response["result"]["bytes_printed"]);
    assert_eq!("one_shot_socket", response["result"]["transport"]);
    assert!(
        response["result"]["job_id"]
            .as_str()
            .expect("job id present")
            .starts_with("job_")
    );

    // Transient sockets never enter the connection map.
    assert_eq!(0, harness.broker.network().connection_count().await);
    let received = capture.await.expect("capture task");
    assert_eq!(b"TEST\n".to_vec(), received);
    harness.cancel.cancel();
}

#[tokio::test]
async fn live_connection_is_reused_when_no_endpoint_is_given() {
    let (addr, capture) = capture_server().await;
    let harness = harness();
    let device_id = network_device_id(&addr.ip().to_string(), addr.port());

    let connected = harness
        .call(
            "network.connect",
            json!({
                "device_id": device_id,
                "config": {"host": addr.ip().to_string(), "port": addr.port()},
            }),
            1,
        )
        .await;
    assert_eq!("connected", connected["result"]["status"]);

    let response = harness
        .call(
            "printer.print",
            json!({"device_id": device_id, "data": "TEST\n", "format": "raw"}),
            2,
        )
        .await;
    assert_eq!(true, response["result"]["success"]);
    assert_eq!("network_connection", response["result"]["transport"]);

    let disconnect = harness
        .call("network.disconnect", json!({"device_id": device_id}), 3)
        .await;
    assert_eq!("disconnected", disconnect["result"]["status"]);
    let again = harness
        .call("network.disconnect", json!({"device_id": device_id}), 4)
        .await;
    assert_eq!("not_connected", again["result"]["status"]);

    let received = capture.await.expect("capture task");
    assert_eq!(b"TEST\n".to_vec(), received);
    harness.cancel.cancel();
}

#[tokio::test]
async fn label_formats_go_one_shot_to_the_discovered_endpoint() {
    let (addr, capture) = capture_server().await;
    let harness = harness();
    let device_id = printer_device_id("Label_Printer");

    let mut device = Device::builder()
        .id(device_id.clone())
        .kind(DeviceKind::Printer)
        .name("Label_Printer".to_owned())
        .build();
    device
        .properties
        .insert("host".to_owned(), addr.ip().to_string().into());
    device.properties.insert("port".to_owned(), addr.port().into());
    harness.broker.registry().upsert(device);

    let response = harness
        .call(
            "printer.print",
            json!({"device_id": device_id.clone(), "data": "^XA^XZ", "format": "zpl"}),
            1,
        )
        .await;
    assert_eq!(true, response["result"]["success"]);
    assert_eq!("one_shot_socket", response["result"]["transport"]);
    assert_eq!(0, harness.broker.network().connection_count().await);

    let received = capture.await.expect("capture task");
    assert_eq!(b"^XA^XZ".to_vec(), received);
    // The OS queue never saw the payload.
    assert!(harness.printer.written_to(&device_id).is_empty());
    harness.cancel.cancel();
}

#[tokio::test]
async fn raw_payloads_prefer_the_os_queue_over_a_known_endpoint() {
    let harness = harness();
    let device_id = printer_device_id("Office_Laser");

    let mut device = Device::builder()
        .id(device_id.clone())
        .kind(DeviceKind::Printer)
        .name("Office_Laser".to_owned())
        .build();
    device
        .properties
        .insert("host".to_owned(), "192.0.2.10".into());
    device
        .properties
        .insert("port".to_owned(), 9100_u16.into());
    harness.broker.registry().upsert(device);

    let response = harness
        .call(
            "printer.print",
            json!({"device_id": device_id.clone(), "data": "TEST\n", "format": "raw"}),
            1,
        )
        .await;
    assert_eq!(true, response["result"]["success"]);
    assert_eq!("os_queue", response["result"]["transport"]);
    assert_eq!(vec![b"TEST\n".to_vec()], harness.printer.written_to(&device_id));
    harness.cancel.cancel();
}

#[tokio::test]
async fn os_queue_is_the_fallback_path() {
    let harness = harness();
    let device_id = printer_device_id("Office_Laser");

    let response = harness
        .call(
            "printer.print",
            json!({"device_id": device_id, "data": "5445535421", "encoding": "hex"}),
            1,
        )
        .await;
    assert_eq!(true, response["result"]["success"]);
    assert_eq!(5, response["result"]["bytes_printed"]);
    assert_eq!("os_queue", response["result"]["transport"]);
    assert_eq!(vec![b"TEST!".to_vec()], harness.printer.written_to(&device_id));
    harness.cancel.cancel();
}

#[tokio::test]
async fn failed_prints_stay_queued_and_retry_to_completion() {
    let harness = harness();
    let device_id = printer_device_id("Office_Laser");
    harness.printer.fail_next_writes(2);

    let response = harness
        .call(
            "printer.print",
            json!({"device_id": device_id, "data": "TEST\n"}),
            1,
        )
        .await;
    assert_eq!(false, response["result"]["success"]);
    let job_id = response["result"]["job_id"]
        .as_str()
        .expect("job id present")
        .to_owned();

    // Two retry ticks later the third attempt succeeds.
    let mut stored = None;
    for _ in 0..100 {
        let job = harness
            .broker
            .queue()
            .get(&job_id)
            .await
            .expect("get succeeds")
            .expect("job exists");
        if job.status == JobStatus::Completed {
            stored = Some(job);
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let stored = stored.expect("job completed after retries");
    assert_eq!(2, stored.retry_count);
    assert_eq!(vec![b"TEST\n".to_vec()], harness.printer.written_to(&device_id));

    let status = harness.call("queue.getStatus", json!({}), 2).await;
    assert_eq!(1, status["result"]["counts"]["completed"]);
    harness.cancel.cancel();
}

#[tokio::test]
async fn unknown_printer_reports_a_failed_job() {
    let harness = harness();

    let response = harness
        .call(
            "printer.print",
            json!({"device_id": "printer_ghost", "data": "TEST\n"}),
            1,
        )
        .await;
    assert_eq!(false, response["result"]["success"]);
    assert!(
        response["result"]["error"]
            .as_str()
            .expect("error recorded")
            .contains("printer_ghost")
    );
    harness.cancel.cancel();
}
