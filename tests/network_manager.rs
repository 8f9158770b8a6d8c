use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use pretty_assertions::assert_eq;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use hwbridge::{
    DeviceEvent, DeviceOwnership, DeviceRegistry, EventFabric, EventKind, NetworkError,
    NetworkManager, Owner, network_device_id,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

struct Harness {
    manager: NetworkManager,
    registry: Arc<DeviceRegistry>,
    ownership: Arc<DeviceOwnership>,
    events: tokio::sync::mpsc::UnboundedReceiver<DeviceEvent>,
}

fn harness(max_connections: usize) -> Harness {
    let (fabric, events) = EventFabric::new();
    let registry = Arc::new(DeviceRegistry::new(Arc::clone(&fabric)));
    let ownership = Arc::new(DeviceOwnership::new());
    let manager = NetworkManager::new(
        max_connections,
        fabric,
        Arc::clone(&registry),
        Arc::clone(&ownership),
    );
    Harness {
        manager,
        registry,
        ownership,
        events,
    }
}

/// Loopback echo server; echoes every received chunk back.
async fn echo_server() -> (std::net::SocketAddr, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind echo server");
    let addr = listener.local_addr().expect("local addr");
    let task = tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0_u8; 1024];
                while let Ok(n) = socket.read(&mut buf).await {
                    if n == 0 {
                        break;
                    }
                    if socket.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    (addr, task)
}

async fn next_event_of(
    events: &mut tokio::sync::mpsc::UnboundedReceiver<DeviceEvent>,
    kind: EventKind,
) -> DeviceEvent {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("event within deadline")
            .expect("event stream open");
        if event.event_type == kind {
            return event;
        }
    }
}

#[tokio::test]
async fn connect_registers_device_and_publishes_connected() {
    let (addr, _server) = echo_server().await;
    let mut harness = harness(4);
    let device_id = network_device_id(&addr.ip().to_string(), addr.port());

    let info = harness
        .manager
        .connect(&device_id, &addr.ip().to_string(), addr.port(), CONNECT_TIMEOUT)
        .await
        .expect("connect succeeds");
    assert!(info.is_alive);
    assert_eq!(device_id, info.device_id);

    let discovered = next_event_of(&mut harness.events, EventKind::Discovered).await;
    assert_eq!(device_id, discovered.device_id);
    let connected = next_event_of(&mut harness.events, EventKind::Connected).await;
    assert_eq!(device_id, connected.device_id);

    let device = harness.registry.get(&device_id).expect("device stored");
    assert!(device.is_connected);
    assert!(harness.ownership.is_claimed(&device_id));
}

#[tokio::test]
async fn second_connect_fails_the_loser() {
    let (addr, _server) = echo_server().await;
    let harness = harness(4);
    let device_id = network_device_id(&addr.ip().to_string(), addr.port());

    harness
        .manager
        .connect(&device_id, &addr.ip().to_string(), addr.port(), CONNECT_TIMEOUT)
        .await
        .expect("first connect succeeds");
    let second = harness
        .manager
        .connect(&device_id, &addr.ip().to_string(), addr.port(), CONNECT_TIMEOUT)
        .await;
    assert_matches!(second, Err(NetworkError::AlreadyConnected { .. }));
}

#[tokio::test]
async fn adapter_owned_device_cannot_be_connected() {
    let (addr, _server) = echo_server().await;
    let harness = harness(4);
    let device_id = network_device_id(&addr.ip().to_string(), addr.port());
    harness.ownership.claim(&device_id, Owner::Adapter);

    let result = harness
        .manager
        .connect(&device_id, &addr.ip().to_string(), addr.port(), CONNECT_TIMEOUT)
        .await;
    assert_matches!(result, Err(NetworkError::AlreadyOwned { .. }));
}

#[tokio::test]
async fn connection_limit_is_enforced() {
    let (addr, _server) = echo_server().await;
    let harness = harness(1);
    let host = addr.ip().to_string();

    harness
        .manager
        .connect("net_first", &host, addr.port(), CONNECT_TIMEOUT)
        .await
        .expect("first connect succeeds");
    let second = harness
        .manager
        .connect("net_second", &host, addr.port(), CONNECT_TIMEOUT)
        .await;
    assert_matches!(second, Err(NetworkError::ConnectionLimit { max: 1 }));
}

#[tokio::test]
async fn send_updates_byte_counters() {
    let (addr, _server) = echo_server().await;
    let harness = harness(4);
    let device_id = network_device_id(&addr.ip().to_string(), addr.port());
    harness
        .manager
        .connect(&device_id, &addr.ip().to_string(), addr.port(), CONNECT_TIMEOUT)
        .await
        .expect("connect succeeds");

    let outcome = harness
        .manager
        .send(&device_id, b"TEST\n")
        .await
        .expect("send succeeds");
    assert_eq!(5, outcome.bytes_written);

    let info = harness
        .manager
        .connection_info(&device_id)
        .await
        .expect("connection listed");
    assert_eq!(5, info.bytes_written);
}

#[tokio::test]
async fn send_to_unknown_device_fails_without_side_effect() {
    let harness = harness(4);
    let result = harness.manager.send("net_ghost", b"x").await;
    assert_matches!(result, Err(NetworkError::NotConnected { .. }));
    assert_eq!(0, harness.manager.connection_count().await);
}

#[tokio::test]
async fn send_and_receive_returns_echo_after_quiet_period() {
    let (addr, _server) = echo_server().await;
    let harness = harness(4);
    let device_id = network_device_id(&addr.ip().to_string(), addr.port());
    harness
        .manager
        .connect(&device_id, &addr.ip().to_string(), addr.port(), CONNECT_TIMEOUT)
        .await
        .expect("connect succeeds");

    let response = harness
        .manager
        .send_and_receive(&device_id, b"STATUS?", Duration::from_secs(3))
        .await
        .expect("request/response succeeds");
    assert_eq!(b"STATUS?".to_vec(), response);

    let info = harness
        .manager
        .connection_info(&device_id)
        .await
        .expect("connection listed");
    assert_eq!(7, info.bytes_read);
}

#[tokio::test]
async fn disconnect_is_idempotent() {
    let (addr, _server) = echo_server().await;
    let mut harness = harness(4);
    let device_id = network_device_id(&addr.ip().to_string(), addr.port());
    harness
        .manager
        .connect(&device_id, &addr.ip().to_string(), addr.port(), CONNECT_TIMEOUT)
        .await
        .expect("connect succeeds");

    assert!(harness.manager.disconnect(&device_id).await);
    let disconnected = next_event_of(&mut harness.events, EventKind::Disconnected).await;
    assert_eq!(device_id, disconnected.device_id);
    assert!(!harness.ownership.is_claimed(&device_id));

    assert!(!harness.manager.disconnect(&device_id).await);
}

#[tokio::test]
async fn peer_close_publishes_disconnected_and_frees_the_device() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let accept = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.expect("accept");
        drop(socket);
    });

    let mut harness = harness(4);
    let device_id = network_device_id(&addr.ip().to_string(), addr.port());
    harness
        .manager
        .connect(&device_id, &addr.ip().to_string(), addr.port(), CONNECT_TIMEOUT)
        .await
        .expect("connect succeeds");
    accept.await.expect("server task");

    let disconnected = next_event_of(&mut harness.events, EventKind::Disconnected).await;
    assert_eq!(device_id, disconnected.device_id);
    assert!(!harness.manager.is_connected(&device_id).await);
    assert!(!harness.ownership.is_claimed(&device_id));
    let device = harness.registry.get(&device_id).expect("device kept");
    assert!(!device.is_connected);
}

#[tokio::test]
async fn one_shot_send_does_not_register_a_connection() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let capture = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.expect("accept");
        let mut received = Vec::new();
        let mut buf = [0_u8; 256];
        loop {
            match socket.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => received.extend_from_slice(&buf[..n]),
            }
        }
        received
    });

    let harness = harness(4);
    let outcome = harness
        .manager
        .one_shot_send(&addr.ip().to_string(), addr.port(), b"\x1b@one-shot", CONNECT_TIMEOUT)
        .await
        .expect("one-shot send succeeds");
    assert_eq!(10, outcome.bytes_written);
    assert_eq!(0, harness.manager.connection_count().await);

    let received = capture.await.expect("capture task");
    assert_eq!(b"\x1b@one-shot".to_vec(), received);
}

#[tokio::test]
async fn ping_reports_reachability() {
    let (addr, _server) = echo_server().await;
    let harness = harness(4);

    let online = harness
        .manager
        .ping(&addr.ip().to_string(), addr.port(), CONNECT_TIMEOUT)
        .await;
    assert!(online.ok);
    assert!(online.is_online);

    let unused = TcpListener::bind("127.0.0.1:0").await.expect("bind probe");
    let dead_addr = unused.local_addr().expect("local addr");
    drop(unused);
    let offline = harness
        .manager
        .ping(&dead_addr.ip().to_string(), dead_addr.port(), Duration::from_millis(500))
        .await;
    assert!(!offline.ok);
    assert!(!offline.is_online);
}

#[tokio::test]
async fn dispose_all_clears_connections_silently() {
    let (addr, _server) = echo_server().await;
    let mut harness = harness(4);
    let host = addr.ip().to_string();
    harness
        .manager
        .connect("net_a", &host, addr.port(), CONNECT_TIMEOUT)
        .await
        .expect("connect a");
    harness
        .manager
        .connect("net_b", &host, addr.port(), CONNECT_TIMEOUT)
        .await
        .expect("connect b");
    while harness.events.try_recv().is_ok() {}

    harness.manager.dispose_all().await;
    assert_eq!(0, harness.manager.connection_count().await);
    // Mass shutdown emits nothing.
    assert!(harness.events.try_recv().is_err());
}
