//! Orchestrator handshake against a scripted fake device over loopback TCP

use parking_lot::Mutex;
use sarathi::config::{PairingTransport, SarathiConfig};
use sarathi::orchestrator::{Collaborators, ConnectionOrchestrator, ConnectionState};
use sarathi::pairing::{PairedDevice, StaticPairing};
use sarathi::settings::MemorySettings;
use sarathi::translate::Passthrough;
use sarathi::transport::LinkEndpointAddress;
use setu_proto::{Framer, Framing};
use std::collections::VecDeque;
use std::io::ErrorKind;
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Network side of the fake device: one frame per connection, every frame
/// recorded in arrival order
struct FakeServer {
    port: u16,
    frames: Arc<Mutex<Vec<String>>>,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl FakeServer {
    /// `register_bits` are the replies to successive `register_ip`; `1` after
    fn start(register_bits: &[&'static str]) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let port = listener.local_addr().unwrap().port();
        let frames = Arc::new(Mutex::new(Vec::new()));
        let running = Arc::new(AtomicBool::new(true));

        let mut bits: VecDeque<&'static str> = register_bits.iter().copied().collect();
        let (f, r) = (Arc::clone(&frames), Arc::clone(&running));
        let handle = thread::spawn(move || {
            while r.load(Ordering::Relaxed) {
                let mut stream = match listener.accept() {
                    Ok((stream, _)) => stream,
                    Err(e) if e.kind() == ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(5));
                        continue;
                    }
                    Err(e) => panic!("accept failed: {}", e),
                };
                stream.set_nonblocking(false).unwrap();
                stream
                    .set_read_timeout(Some(Duration::from_millis(500)))
                    .unwrap();
                let mut framer = Framer::new(Framing::Line);
                let Ok(Some(text)) = framer.read_frame(&mut stream) else {
                    continue;
                };
                f.lock().push(text.clone());

                let reply = match text.as_str() {
                    "CMD|register_ip" => {
                        Some(format!("REGISTER|{}", bits.pop_front().unwrap_or("1")))
                    }
                    "CMD|get_sensor_data" => Some("GEODATA|12.5|3|48.1|11.5".to_string()),
                    "CMD|get_conn_data" => Some("CONDATA|5".to_string()),
                    "CMD|reset" => Some("RESET|1".to_string()),
                    _ => None,
                };
                if let Some(reply) = reply {
                    let _ = framer.write_frame(&mut stream, &reply);
                }
            }
        });

        Self {
            port,
            frames,
            running,
            handle: Some(handle),
        }
    }

    fn frames(&self) -> Vec<String> {
        self.frames.lock().clone()
    }

    fn wait_for_frame(&self, frame: &str, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.frames.lock().iter().any(|f| f == frame) {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }
}

impl Drop for FakeServer {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Pairing side of the fake device: answers one credential handoff and
/// returns the frames the controller sent
fn spawn_pairing(
    listener: TcpListener,
    network_port: u16,
    join_ok: bool,
) -> JoinHandle<(Vec<String>, TcpStream)> {
    thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut framer = Framer::new(Framing::Line);
        let mut received = Vec::new();

        received.push(framer.read_frame(&mut stream).unwrap().unwrap());
        if !join_ok {
            framer.write_frame(&mut stream, "WC0").unwrap();
            return (received, stream);
        }
        framer.write_frame(&mut stream, "WC1").unwrap();
        framer
            .write_frame(&mut stream, &format!("STAINFO|127.0.0.1|{}", network_port))
            .unwrap();
        received.push(framer.read_frame(&mut stream).unwrap().unwrap());
        framer.write_frame(&mut stream, "WS1").unwrap();
        (received, stream)
    })
}

fn controller_config() -> SarathiConfig {
    let mut config = SarathiConfig::default();
    config.pairing.transport = PairingTransport::Tcp;
    config.network.controller_address = Some("127.0.0.1".parse().unwrap());
    config.network.connect_timeout_ms = 500;
    config.network.receive_timeout_ms = 1000;
    config.polling.pairing_check_secs = 0.02;
    config.polling.registration_secs = 0.05;
    config.polling.ack_secs = 0.02;
    config.polling.animation_secs = 0.05;
    config.polling.tick_secs = 0.05;
    config.polling.telemetry_secs = 0.05;
    config.polling.link_quality_secs = 0.05;
    config
}

fn orchestrator_for(pairing_port: u16, settings: Arc<MemorySettings>) -> ConnectionOrchestrator {
    orchestrator_with(controller_config(), pairing_port, settings)
}

fn orchestrator_with(
    config: SarathiConfig,
    pairing_port: u16,
    settings: Arc<MemorySettings>,
) -> ConnectionOrchestrator {
    let pairing = Arc::new(StaticPairing::new(vec![PairedDevice::new(
        "mpy-uart",
        LinkEndpointAddress::new("127.0.0.1", pairing_port),
    )]));
    ConnectionOrchestrator::new(
        config,
        Collaborators {
            pairing,
            settings,
            translator: Arc::new(Passthrough),
        },
    )
}

#[test]
fn test_handshake_reaches_ready_and_registers_first() {
    let server = FakeServer::start(&[]);
    let pairing = TcpListener::bind("127.0.0.1:0").unwrap();
    let pairing_port = pairing.local_addr().unwrap().port();
    let device = spawn_pairing(pairing, server.port, true);

    let orchestrator = orchestrator_for(pairing_port, Arc::new(MemorySettings::new()));
    orchestrator.submit_credentials("field", "hunter2").unwrap();
    orchestrator.start().unwrap();

    assert!(orchestrator.wait_for_state(ConnectionState::Ready, Duration::from_secs(10)));
    assert!(orchestrator.session().is_some());
    assert_eq!(orchestrator.status(), "Connected");
    let info = orchestrator.device().unwrap();
    assert_eq!(info.port, server.port);

    let (received, _stream) = device.join().unwrap();
    assert_eq!(received, vec!["WLAN|field|hunter2", "WLANDATA|127.0.0.1"]);

    assert!(server.wait_for_frame("CMD|get_sensor_data", Duration::from_secs(3)));
    assert!(server.wait_for_frame("CMD|get_conn_data", Duration::from_secs(3)));
    orchestrator.input().right.set(0.5, -0.25);
    assert!(server.wait_for_frame("RJ|0.5|-0.25", Duration::from_secs(3)));

    let session = orchestrator.session().unwrap();
    let deadline = Instant::now() + Duration::from_secs(3);
    while session.telemetry().is_none() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(session.telemetry().unwrap().altitude, 12.5);

    orchestrator.stop();
    assert_eq!(orchestrator.state(), ConnectionState::Idle);
    assert!(server.wait_for_frame("CMD|reset", Duration::from_secs(3)));

    let frames = server.frames();
    assert_eq!(frames[0], "CMD|register_ip");
    assert_eq!(frames.iter().filter(|f| *f == "CMD|register_ip").count(), 1);
}

#[test]
fn test_rejected_registration_is_retried() {
    let server = FakeServer::start(&["0"]);
    let pairing = TcpListener::bind("127.0.0.1:0").unwrap();
    let pairing_port = pairing.local_addr().unwrap().port();
    let device = spawn_pairing(pairing, server.port, true);

    let orchestrator = orchestrator_for(pairing_port, Arc::new(MemorySettings::new()));
    orchestrator.submit_credentials("field", "hunter2").unwrap();
    orchestrator.start().unwrap();

    assert!(orchestrator.wait_for_state(ConnectionState::Ready, Duration::from_secs(10)));
    assert!(orchestrator.session().is_some());
    let _ = device.join().unwrap();

    let frames = server.frames();
    assert_eq!(&frames[..2], &["CMD|register_ip", "CMD|register_ip"]);
    orchestrator.stop();
}

#[test]
fn test_failed_join_asks_for_new_credentials() {
    let pairing = TcpListener::bind("127.0.0.1:0").unwrap();
    let pairing_port = pairing.local_addr().unwrap().port();
    let device = spawn_pairing(pairing, 1, false);

    let orchestrator = orchestrator_for(pairing_port, Arc::new(MemorySettings::new()));
    orchestrator.submit_credentials("field", "wrong").unwrap();
    orchestrator.start().unwrap();

    let (received, _stream) = device.join().unwrap();
    assert_eq!(received, vec!["WLAN|field|wrong"]);

    let deadline = Instant::now() + Duration::from_secs(5);
    while orchestrator.has_credentials() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert!(!orchestrator.has_credentials());
    assert!(
        orchestrator.wait_for_state(ConnectionState::CredentialHandoff, Duration::from_secs(5))
    );
    assert!(orchestrator.device().is_none());
    orchestrator.stop();
}

#[test]
fn test_server_start_failure_restarts_handoff() {
    let pairing = TcpListener::bind("127.0.0.1:0").unwrap();
    let pairing_port = pairing.local_addr().unwrap().port();
    let device = thread::spawn(move || {
        let (mut stream, _) = pairing.accept().unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut framer = Framer::new(Framing::Line);
        let mut received = Vec::new();

        received.push(framer.read_frame(&mut stream).unwrap().unwrap());
        framer.write_frame(&mut stream, "WC1").unwrap();
        framer
            .write_frame(&mut stream, "STAINFO|127.0.0.1|4000")
            .unwrap();
        received.push(framer.read_frame(&mut stream).unwrap().unwrap());
        framer.write_frame(&mut stream, "WS0").unwrap();
        // the controller comes back with the same credentials
        received.push(framer.read_frame(&mut stream).unwrap().unwrap());
        (received, stream)
    });

    let orchestrator = orchestrator_for(pairing_port, Arc::new(MemorySettings::new()));
    orchestrator.submit_credentials("field", "hunter2").unwrap();
    orchestrator.start().unwrap();

    let (received, _stream) = device.join().unwrap();
    assert_eq!(
        received,
        vec!["WLAN|field|hunter2", "WLANDATA|127.0.0.1", "WLAN|field|hunter2"]
    );
    assert!(orchestrator.has_credentials());
    assert_eq!(orchestrator.device().unwrap().port, 4000);
    assert_ne!(orchestrator.state(), ConnectionState::Registering);
    orchestrator.stop();
}

#[test]
fn test_unreachable_device_backs_off_and_reports_failure() {
    let closed_port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let pairing = TcpListener::bind("127.0.0.1:0").unwrap();
    let pairing_port = pairing.local_addr().unwrap().port();
    let device = spawn_pairing(pairing, closed_port, true);

    let mut config = controller_config();
    config.polling.max_registration_attempts = 3;
    config.polling.registration_secs = 0.02;
    let orchestrator = orchestrator_with(config, pairing_port, Arc::new(MemorySettings::new()));
    orchestrator.submit_credentials("field", "hunter2").unwrap();
    orchestrator.start().unwrap();

    assert!(orchestrator.wait_for_state(ConnectionState::Registering, Duration::from_secs(10)));
    let registering = Instant::now();
    let _ = device.join().unwrap();

    let deadline = registering + Duration::from_secs(5);
    while orchestrator.status() != "Connection failed" && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(orchestrator.status(), "Connection failed");
    // 20ms, then 40ms and 80ms between the three attempts
    assert!(registering.elapsed() >= Duration::from_millis(100));
    assert!(orchestrator.registration_failures() >= 3);
    assert_eq!(orchestrator.state(), ConnectionState::Registering);
    assert!(orchestrator.session().is_none());
    orchestrator.stop();
}

#[test]
fn test_offline_mode_sends_nothing() {
    let server = FakeServer::start(&[]);
    let mut config = controller_config();
    config.app.offline_mode = true;
    config.app.offline_delay_ms = 100;

    let orchestrator = ConnectionOrchestrator::new(
        config,
        Collaborators {
            pairing: Arc::new(StaticPairing::new(Vec::new())),
            settings: Arc::new(MemorySettings::new()),
            translator: Arc::new(Passthrough),
        },
    );
    orchestrator.start().unwrap();
    assert!(orchestrator.wait_for_state(ConnectionState::Ready, Duration::from_secs(2)));
    assert!(orchestrator.session().unwrap().is_offline());
    assert_eq!(orchestrator.status(), "Connected");
    thread::sleep(Duration::from_millis(200));
    orchestrator.stop();

    assert!(server.frames().is_empty());
}
