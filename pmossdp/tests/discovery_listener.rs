use std::net::UdpSocket;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Sender, unbounded};
use pmossdp::{
    DaemonPhase, DiscoveryListener, DiscoveryResultsHandler, SearchResponse, SsdpSettings,
};

/// Réglages de test : ports éphémères et timeout court
fn test_settings(match_ip: bool) -> SsdpSettings {
    SsdpSettings {
        port: 0,
        search_port: 0,
        receive_timeout_ms: 50,
        match_ip,
        ..SsdpSettings::default()
    }
}

fn channel_handler(tx: Sender<SearchResponse>) -> Arc<dyn DiscoveryResultsHandler> {
    Arc::new(move |response: &SearchResponse| {
        let _ = tx.send(response.clone());
    })
}

fn search_response(location: &str, st: &str, usn: &str) -> String {
    format!(
        "HTTP/1.1 200 OK\r\n\
         CACHE-CONTROL: max-age = 1800\r\n\
         EXT:\r\n\
         LOCATION: {}\r\n\
         SERVER: Linux/5.10 UPnP/1.0 FakeDevice/1.0\r\n\
         ST: {}\r\n\
         USN: {}\r\n\
         \r\n",
        location, st, usn
    )
}

fn send_to_listener(listener: &DiscoveryListener, payload: &str) {
    let port = listener.local_addr().expect("listener is running").port();
    let device = UdpSocket::bind("127.0.0.1:0").unwrap();
    device.send_to(payload.as_bytes(), ("127.0.0.1", port)).unwrap();
}

#[test]
fn test_register_then_unregister_stops_daemon() {
    let listener = DiscoveryListener::new(test_settings(true));
    let (tx, _rx) = unbounded();
    let handler = channel_handler(tx);

    assert_eq!(listener.phase(), DaemonPhase::Stopped);
    listener
        .register_results_handler(Arc::clone(&handler), "upnp:rootdevice")
        .unwrap();
    assert_eq!(listener.phase(), DaemonPhase::Running);
    assert_eq!(listener.registrations(), 1);

    listener.unregister_results_handler(&handler, "upnp:rootdevice");

    assert_eq!(listener.phase(), DaemonPhase::Stopped);
    assert_eq!(listener.registrations(), 0);
    assert!(listener.local_addr().is_none());
}

#[test]
fn test_daemon_keeps_running_while_a_target_remains() {
    let listener = DiscoveryListener::new(test_settings(true));
    let (tx, _rx) = unbounded();
    let handler = channel_handler(tx);

    listener
        .register_results_handler(Arc::clone(&handler), "upnp:rootdevice")
        .unwrap();
    listener
        .register_results_handler(Arc::clone(&handler), "ssdp:all")
        .unwrap();
    listener.unregister_results_handler(&handler, "upnp:rootdevice");
    assert_eq!(listener.phase(), DaemonPhase::Running);

    listener.unregister_results_handler(&handler, "ssdp:all");
    assert_eq!(listener.phase(), DaemonPhase::Stopped);
}

#[test]
fn test_search_response_reaches_handler() {
    let listener = DiscoveryListener::new(test_settings(true));
    let (tx, rx) = unbounded();
    let handler = channel_handler(tx);
    listener
        .register_results_handler(Arc::clone(&handler), "upnp:rootdevice")
        .unwrap();

    send_to_listener(
        &listener,
        &search_response(
            "http://127.0.0.1:49152/desc.xml",
            "upnp:rootdevice",
            "uuid:fake-1::upnp:rootdevice",
        ),
    );

    let response = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(response.udn, "uuid:fake-1");
    assert_eq!(response.max_age, 1800);
    assert_eq!(response.location.as_str(), "http://127.0.0.1:49152/desc.xml");

    listener.unregister_results_handler(&handler, "upnp:rootdevice");
}

#[test]
fn test_ip_match_drops_foreign_location() {
    let strict = DiscoveryListener::new(test_settings(true));
    let lenient = DiscoveryListener::new(test_settings(false));
    let (strict_tx, strict_rx) = unbounded();
    let (lenient_tx, lenient_rx) = unbounded();
    let strict_handler = channel_handler(strict_tx);
    let lenient_handler = channel_handler(lenient_tx);
    strict
        .register_results_handler(Arc::clone(&strict_handler), "ssdp:all")
        .unwrap();
    lenient
        .register_results_handler(Arc::clone(&lenient_handler), "ssdp:all")
        .unwrap();

    // LOCATION annonce une autre machine que l'émetteur (127.0.0.1)
    let spoofed = search_response("http://192.0.2.10/desc.xml", "ssdp:all", "uuid:spoof");
    send_to_listener(&strict, &spoofed);
    send_to_listener(&lenient, &spoofed);

    assert_eq!(
        lenient_rx.recv_timeout(Duration::from_secs(5)).unwrap().usn,
        "uuid:spoof"
    );
    assert!(strict_rx.recv_timeout(Duration::from_millis(300)).is_err());

    strict.unregister_results_handler(&strict_handler, "ssdp:all");
    lenient.unregister_results_handler(&lenient_handler, "ssdp:all");
}

#[test]
fn test_panicking_handler_crashes_daemon_until_reset() {
    let listener = DiscoveryListener::new(test_settings(false));
    let faulty: Arc<dyn DiscoveryResultsHandler> = Arc::new(|response: &SearchResponse| {
        if response.usn == "uuid:boom" {
            panic!("faulty handler");
        }
    });
    listener
        .register_results_handler(Arc::clone(&faulty), "ssdp:all")
        .unwrap();

    send_to_listener(
        &listener,
        &search_response("http://127.0.0.1/desc.xml", "ssdp:all", "uuid:boom"),
    );

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while listener.phase() != DaemonPhase::Crashed && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(listener.phase(), DaemonPhase::Crashed);

    let err = listener
        .register_results_handler(Arc::clone(&faulty), "ssdp:all")
        .unwrap_err();
    assert!(matches!(err, pmossdp::SsdpError::DaemonCrashed(_)));

    assert!(listener.reset());
    listener
        .register_results_handler(Arc::clone(&faulty), "upnp:rootdevice")
        .unwrap();
    assert_eq!(listener.phase(), DaemonPhase::Running);
    listener.unregister_results_handler(&faulty, "upnp:rootdevice");
    assert_eq!(listener.phase(), DaemonPhase::Stopped);
}

fn wait_for_phase(listener: &DiscoveryListener, phase: DaemonPhase) -> bool {
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while std::time::Instant::now() < deadline {
        if listener.phase() == phase {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    false
}

/// Handler à usage unique : se désinscrit dès la première réponse
struct OneShot {
    listener: Arc<DiscoveryListener>,
    me: std::sync::Mutex<Option<Arc<dyn DiscoveryResultsHandler>>>,
    tx: Sender<String>,
}

impl DiscoveryResultsHandler for OneShot {
    fn discovered_device(&self, response: &SearchResponse) {
        let _ = self.tx.send(response.usn.clone());
        if let Some(me) = self.me.lock().unwrap().take() {
            self.listener
                .unregister_results_handler(&me, "upnp:rootdevice");
        }
    }
}

#[test]
fn test_handler_can_unregister_itself() {
    let listener = Arc::new(DiscoveryListener::new(test_settings(false)));
    let (tx, rx) = unbounded();
    let one_shot = Arc::new(OneShot {
        listener: Arc::clone(&listener),
        me: std::sync::Mutex::new(None),
        tx,
    });
    let handler: Arc<dyn DiscoveryResultsHandler> = one_shot.clone();
    *one_shot.me.lock().unwrap() = Some(Arc::clone(&handler));

    listener
        .register_results_handler(Arc::clone(&handler), "upnp:rootdevice")
        .unwrap();
    send_to_listener(
        &listener,
        &search_response("http://127.0.0.1/desc.xml", "upnp:rootdevice", "uuid:once"),
    );

    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "uuid:once");
    // le démon s'arrête de lui-même une fois le handler revenu
    assert!(wait_for_phase(&listener, DaemonPhase::Stopped));
    assert_eq!(listener.registrations(), 0);
    assert!(listener.local_addr().is_none());

    // le listener reste utilisable
    listener
        .register_results_handler(Arc::clone(&handler), "ssdp:all")
        .unwrap();
    assert_eq!(listener.phase(), DaemonPhase::Running);
    assert_eq!(listener.registrations(), 1);
    listener.unregister_results_handler(&handler, "ssdp:all");
    assert_eq!(listener.phase(), DaemonPhase::Stopped);
}

#[test]
fn test_handler_can_register_on_its_own_listener() {
    let listener = Arc::new(DiscoveryListener::new(test_settings(false)));
    let (tx, rx) = unbounded();
    let follower = channel_handler(tx);

    let registrar = {
        let listener = Arc::clone(&listener);
        let follower = Arc::clone(&follower);
        Arc::new(move |_: &SearchResponse| {
            listener
                .register_results_handler(Arc::clone(&follower), "ssdp:all")
                .unwrap();
        }) as Arc<dyn DiscoveryResultsHandler>
    };
    listener
        .register_results_handler(Arc::clone(&registrar), "upnp:rootdevice")
        .unwrap();

    send_to_listener(
        &listener,
        &search_response("http://127.0.0.1/desc.xml", "upnp:rootdevice", "uuid:first"),
    );
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while listener.registrations() < 2 && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(listener.registrations(), 2);

    send_to_listener(
        &listener,
        &search_response("http://127.0.0.1/desc.xml", "ssdp:all", "uuid:second"),
    );
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap().usn, "uuid:second");

    listener.unregister_results_handler(&registrar, "upnp:rootdevice");
    listener.unregister_results_handler(&follower, "ssdp:all");
    assert_eq!(listener.phase(), DaemonPhase::Stopped);
}
