use std::sync::Arc;

use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use hwbridge::{
    AdapterSet, BiometricAdapter, Broker, BrokerConfig, Device, DeviceKind, Dispatcher,
    FakeAdapter, JobStore, SessionHandle, network_device_id, serial_device_id, usb_device_id,
};

struct Harness {
    broker: Arc<Broker>,
    dispatcher: Dispatcher,
    session: Arc<SessionHandle>,
    serial: Arc<FakeAdapter>,
    usb: Arc<FakeAdapter>,
    cancel: CancellationToken,
}

fn harness() -> Harness {
    let mut config = BrokerConfig::default();
    config.queue.retry_interval_ms = 50;

    let serial = Arc::new(FakeAdapter::new(DeviceKind::Serial));
    serial.set_devices(vec![
        Device::builder()
            .id(serial_device_id("COM1"))
            .kind(DeviceKind::Serial)
            .name("COM1".to_owned())
            .build(),
    ]);
    let usb = Arc::new(FakeAdapter::new(DeviceKind::UsbHid));
    usb.set_devices(vec![
        Device::builder()
            .id(usb_device_id(0x04b8, 0x0e15))
            .kind(DeviceKind::UsbHid)
            .name("Receipt printer".to_owned())
            .build(),
    ]);
    let adapters = Arc::new(AdapterSet::new(
        Arc::new(FakeAdapter::new(DeviceKind::Printer)),
        Arc::clone(&serial) as _,
        Arc::clone(&usb) as _,
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
        serial,
        usb,
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

#[tokio::test]
async fn notifications_without_id_get_no_response() {
    let harness = harness();
    let frame = json!({"jsonrpc": "2.0", "method": "devices.enumerate"}).to_string();
    let response = harness
        .dispatcher
        .dispatch(Arc::clone(&harness.broker), Arc::clone(&harness.session), &frame)
        .await;
    assert_eq!(None, response);
    harness.cancel.cancel();
}

#[tokio::test]
async fn invalid_params_answer_32602() {
    let harness = harness();
    let response = harness.call("devices.get", json!({}), 1).await;
    assert_eq!(-32602, response["error"]["code"]);
    harness.cancel.cancel();
}

#[tokio::test]
async fn serial_echo_flow() {
    let harness = harness();
    let device_id = serial_device_id("COM1");

    let open = harness
        .call(
            "serial.open",
            json!({"device_id": device_id, "config": {"baud_rate": 9600}}),
            1,
        )
        .await;
    assert_eq!(true, open["result"]["success"]);

    let send = harness
        .call(
            "serial.send",
            json!({"device_id": device_id, "data": "AT\r\n"}),
            2,
        )
        .await;
    assert_eq!(4, send["result"]["bytes_transferred"]);

    harness.serial.push_read(&device_id, b"OK\r\n".to_vec());
    let receive = harness
        .call(
            "serial.receive",
            json!({"device_id": device_id, "timeout": 2000}),
            3,
        )
        .await;
    assert_eq!(4, receive["result"]["bytes_transferred"]);
    assert_eq!("OK\r\n", receive["result"]["data"]);

    let status = harness
        .call("serial.getStatus", json!({"device_id": device_id}), 4)
        .await;
    assert_eq!(true, status["result"]["is_open"]);

    let close = harness
        .call("serial.close", json!({"device_id": device_id}), 5)
        .await;
    assert_eq!(true, close["result"]["was_open"]);
    harness.cancel.cancel();
}

#[tokio::test]
async fn concurrent_open_fails_the_second_caller() {
    let harness = harness();
    let device_id = serial_device_id("COM1");

    let first = harness
        .call("serial.open", json!({"device_id": device_id}), 1)
        .await;
    assert_eq!(true, first["result"]["success"]);

    let second = harness
        .call("serial.open", json!({"device_id": device_id}), 2)
        .await;
    assert_eq!(-32603, second["error"]["code"]);
    assert!(
        second["error"]["message"]
            .as_str()
            .expect("message present")
            .contains("already open")
    );

    // After close the device can be reopened.
    harness
        .call("serial.close", json!({"device_id": device_id}), 3)
        .await;
    let reopened = harness
        .call("serial.open", json!({"device_id": device_id}), 4)
        .await;
    assert_eq!(true, reopened["result"]["success"]);
    harness.cancel.cancel();
}

#[tokio::test]
async fn usb_report_round_trip_is_hex_encoded() {
    let harness = harness();
    let device_id = usb_device_id(0x04b8, 0x0e15);

    harness
        .call("usb.open", json!({"device_id": device_id}), 1)
        .await;
    let sent = harness
        .call(
            "usb.sendReport",
            json!({"device_id": device_id, "report_id": 1, "data": "1b40"}),
            2,
        )
        .await;
    assert_eq!(3, sent["result"]["bytes_transferred"]);
    assert_eq!(vec![vec![0x01_u8, 0x1b, 0x40]], harness.usb.written_to(&device_id));

    harness.usb.push_read(&device_id, vec![0x01, 0xaa, 0x55]);
    let received = harness
        .call(
            "usb.receiveReport",
            json!({"device_id": device_id, "timeout": 500}),
            3,
        )
        .await;
    assert_eq!("01aa55", received["result"]["data"]);
    harness.cancel.cancel();
}

#[tokio::test]
async fn biometric_flow_applies_threshold_and_strips_templates() {
    let harness = harness();
    let template = hwbridge::encode_payload(b"finger-template-0001", hwbridge::PayloadEncoding::Base64);

    let enrolled = harness
        .call(
            "biometric.enroll",
            json!({
                "device_id": "bio_terminal",
                "user_id": "u1",
                "user_name": "Dana",
                "template": template,
            }),
            1,
        )
        .await;
    assert_eq!(true, enrolled["result"]["success"]);

    let verified = harness
        .call(
            "biometric.authenticate",
            json!({
                "device_id": "bio_terminal",
                "user_id": "u1",
                "template": template,
            }),
            2,
        )
        .await;
    assert_eq!(true, verified["result"]["verified"]);
    assert_eq!(1.0, verified["result"]["confidence"]);

    let identified = harness
        .call(
            "biometric.identify",
            json!({"device_id": "bio_terminal", "template": template}),
            3,
        )
        .await;
    assert_eq!("u1", identified["result"]["user_id"]);

    let users = harness
        .call("biometric.getUsers", json!({"device_id": "bio_terminal"}), 4)
        .await;
    assert_eq!(1, users["result"]["total"]);
    let rendered = users["result"].to_string();
    assert!(!rendered.contains("finger-template"), "templates never leave the adapter");

    let deleted = harness
        .call(
            "biometric.deleteUser",
            json!({"device_id": "bio_terminal", "user_id": "u1"}),
            5,
        )
        .await;
    assert_eq!(true, deleted["result"]["success"]);
    harness.cancel.cancel();
}

#[tokio::test]
async fn cancel_job_is_a_no_op_on_terminal_jobs() {
    let harness = harness();

    // Unknown job ids do not apply either.
    let missing = harness
        .call("queue.cancelJob", json!({"job_id": "job_missing"}), 1)
        .await;
    assert_eq!(false, missing["result"]["success"]);

    let job = harness
        .broker
        .queue()
        .enqueue("printer_x", DeviceKind::Printer, "printer.print", json!({}))
        .await
        .expect("enqueue succeeds");
    let cancelled = harness
        .call("queue.cancelJob", json!({"job_id": job.job_id}), 2)
        .await;
    assert_eq!(true, cancelled["result"]["success"]);

    let again = harness
        .call("queue.cancelJob", json!({"job_id": job.job_id}), 3)
        .await;
    assert_eq!(false, again["result"]["success"]);

    let retried = harness
        .call("queue.retryJob", json!({"job_id": job.job_id}), 4)
        .await;
    assert_eq!(true, retried["result"]["success"]);
    harness.cancel.cancel();
}

#[tokio::test]
async fn get_jobs_filters_by_device() {
    let harness = harness();
    harness
        .broker
        .queue()
        .enqueue("printer_a", DeviceKind::Printer, "printer.print", json!({}))
        .await
        .expect("enqueue a");
    harness
        .broker
        .queue()
        .enqueue("printer_b", DeviceKind::Printer, "printer.print", json!({}))
        .await
        .expect("enqueue b");

    let all = harness.call("queue.getJobs", json!({}), 1).await;
    assert_eq!(2, all["result"]["total"]);

    let filtered = harness
        .call("queue.getJobs", json!({"device_id": "printer_b"}), 2)
        .await;
    assert_eq!(1, filtered["result"]["total"]);
    assert_eq!(
        "printer_b",
        filtered["result"]["jobs"][0]["device_id"]
    );
    harness.cancel.cancel();
}

#[tokio::test]
async fn network_discover_scans_loopback_and_registers_hits() {
    let harness = harness();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind scan target");
    let addr = listener.local_addr().expect("local addr");
    let accept = tokio::spawn(async move {
        loop {
            let _ = listener.accept().await;
        }
    });

    let response = harness
        .call(
            "network.discover",
            json!({
                "subnet": "127.0.0",
                "ports": [addr.port()],
                "timeout": 1000,
                "max_concurrent": 64,
                "register": true,
            }),
            1,
        )
        .await;

    let hits = response["result"]["devices"].as_array().expect("hit list");
    assert!(
        hits.iter()
            .any(|hit| hit["host"] == "127.0.0.1" && hit["port"] == addr.port()),
        "the listening loopback port is found"
    );

    // `register: true` opts the hits into the registry.
    let device_id = network_device_id("127.0.0.1", addr.port());
    assert!(harness.broker.registry().get(&device_id).is_some());

    accept.abort();
    harness.cancel.cancel();
}

#[tokio::test]
async fn network_discover_honours_the_kind_toggle() {
    let harness = harness();
    let mut config =
        serde_json::to_value(harness.broker.config()).expect("configuration serialises");
    config["discovery"]["enable_network"] = json!(false);
    let saved = harness.call("settings.save", config, 1).await;
    assert_eq!(true, saved["result"]["success"]);

    let response = harness
        .call("network.discover", json!({"ports": [9100]}), 2)
        .await;
    assert_eq!(-32603, response["error"]["code"]);
    assert!(
        response["error"]["message"]
            .as_str()
            .expect("message present")
            .contains("disabled")
    );
    harness.cancel.cancel();
}

#[tokio::test]
async fn health_reports_subsystem_gauges() {
    let harness = harness();
    let health = harness.call("system.getHealth", json!({}), 1).await;
    assert_eq!("ok", health["result"]["status"]);
    assert_eq!(0, health["result"]["activeConnections"]);
    assert_eq!(0, health["result"]["networkConnections"]);
    assert!(health["result"]["queue"]["total"].is_number());
    harness.cancel.cancel();
}
