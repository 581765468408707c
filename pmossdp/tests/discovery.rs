use std::net::UdpSocket;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use pmossdp::{
    DeviceDescriptionLoader, Discovery, DiscoveryListener, DiscoveryOptions, SearchResponse,
    SsdpError, SsdpSettings,
};

const FAKE_TARGET: &str = "urn:pmossdp-test:device:Fake:1";

/// Chargeur qui ne fait aucun accès réseau
struct StubLoader;

impl DeviceDescriptionLoader for StubLoader {
    type Device = (String, String);

    fn load(&self, response: &SearchResponse) -> pmossdp::Result<Self::Device> {
        if response.usn.contains("broken") {
            return Err(SsdpError::Description("cannot load".to_string()));
        }
        Ok((response.udn.clone(), response.location.to_string()))
    }
}

fn test_listener() -> Arc<DiscoveryListener> {
    Arc::new(DiscoveryListener::new(SsdpSettings {
        port: 0,
        search_port: 0,
        receive_timeout_ms: 50,
        match_ip: true,
        ..SsdpSettings::default()
    }))
}

fn options(timeout_ms: u64) -> DiscoveryOptions {
    DiscoveryOptions {
        timeout: Duration::from_millis(timeout_ms),
        ttl: 1,
        mx: 0,
        search_target: FAKE_TARGET.to_string(),
        interface: None,
    }
}

fn response(usn: &str, location: &str) -> String {
    format!(
        "HTTP/1.1 200 OK\r\n\
         CACHE-CONTROL: max-age=120\r\n\
         EXT:\r\n\
         LOCATION: {}\r\n\
         SERVER: Linux UPnP/1.0 FakeDevice/1.0\r\n\
         ST: {}\r\n\
         USN: {}\r\n\
         \r\n",
        location, FAKE_TARGET, usn
    )
}

/// Simule les devices : attend que le démon écoute puis répond en unicast
fn spawn_devices(listener: Arc<DiscoveryListener>, payloads: Vec<String>) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let deadline = Instant::now() + Duration::from_secs(5);
        let port = loop {
            if let Some(addr) = listener.local_addr() {
                break addr.port();
            }
            assert!(Instant::now() < deadline, "discovery daemon never started");
            thread::sleep(Duration::from_millis(10));
        };
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        for payload in payloads {
            socket.send_to(payload.as_bytes(), ("127.0.0.1", port)).unwrap();
        }
    })
}

#[test]
fn test_discover_collects_each_usn_once() {
    let listener = test_listener();
    let discovery = Discovery::new(Arc::clone(&listener), StubLoader);

    let devices = spawn_devices(
        Arc::clone(&listener),
        vec![
            response("uuid:one::urn:pmossdp-test:device:Fake:1", "http://127.0.0.1:5000/one.xml"),
            response("uuid:one::urn:pmossdp-test:device:Fake:1", "http://127.0.0.1:5000/again.xml"),
            response("uuid:two::urn:pmossdp-test:device:Fake:1", "http://127.0.0.1:5001/two.xml"),
        ],
    );

    let found = discovery.discover_with(&options(1500)).unwrap().unwrap();
    devices.join().unwrap();

    assert_eq!(found.len(), 2);
    assert!(found.contains(&("uuid:one".to_string(), "http://127.0.0.1:5000/one.xml".to_string())));
    assert!(found.iter().any(|(udn, _)| udn == "uuid:two"));

    // le démon s'arrête quand la découverte se désinscrit
    assert_eq!(listener.registrations(), 0);
    assert!(listener.local_addr().is_none());
}

#[test]
fn test_failed_loads_are_not_returned() {
    let listener = test_listener();
    let discovery = Discovery::new(Arc::clone(&listener), StubLoader);

    let devices = spawn_devices(
        Arc::clone(&listener),
        vec![response(
            "uuid:broken::urn:pmossdp-test:device:Fake:1",
            "http://127.0.0.1:5002/broken.xml",
        )],
    );

    let found = discovery.discover_with(&options(1000)).unwrap();
    devices.join().unwrap();

    assert!(found.is_none());
}

#[test]
fn test_discover_waits_at_least_the_timeout() {
    let listener = test_listener();
    let discovery = Discovery::new(listener, StubLoader);

    let start = Instant::now();
    let found = discovery.discover_with(&options(1200)).unwrap();

    assert!(found.is_none());
    assert!(start.elapsed() >= Duration::from_millis(1200));
}

#[test]
fn test_blank_search_target_is_rejected() {
    let listener = test_listener();
    let discovery = Discovery::new(Arc::clone(&listener), StubLoader);

    let err = discovery
        .discover(Duration::from_millis(100), 1, 0, "  ", None)
        .unwrap_err();

    assert!(matches!(err, SsdpError::InvalidArgument(_)));
    assert_eq!(listener.registrations(), 0);
}
