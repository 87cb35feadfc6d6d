#[path = "common/mod.rs"]
mod common;

use std::{
    fs,
    io::{self, Read, Write},
    net::{TcpListener, TcpStream},
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
        mpsc,
    },
    thread,
    time::Duration,
};

use common::wait_until;
use tandem::{
    constants::METRICS_EVERY_HEARTBEATS,
    daemon::PidFile,
    sync::{
        DeviceCredentials, MessageOutcome, Publisher, SyncAgent, SyncDaemon, SyncError,
        SyncPayload, Topics,
    },
};
use tempfile::tempdir;

/// Collects everything a device would have put on the broker.
#[derive(Clone, Default)]
struct Broker {
    sent: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
}

impl Broker {
    fn drain(&self) -> Vec<(String, Vec<u8>)> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }
}

impl Publisher for Broker {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), SyncError> {
        self.sent.lock().unwrap().push((topic.to_string(), payload));
        Ok(())
    }
}

fn device(broker: &Broker, address: &str, config: &Path) -> SyncAgent<Broker> {
    let credentials = DeviceCredentials {
        identifier: format!("device-{address}"),
        channel_id: "fleet-1".into(),
        ..DeviceCredentials::default()
    };
    SyncAgent::new(
        broker.clone(),
        SyncPayload::template(&credentials, address),
        Topics::new("fleet-1"),
        config.to_path_buf(),
    )
}

#[test]
fn configuration_settles_across_three_devices() {
    let dir = tempdir().unwrap();
    let broker = Broker::default();
    let paths: Vec<_> = ["a", "b", "c"]
        .iter()
        .map(|name| dir.path().join(format!("{name}.yml")))
        .collect();
    fs::write(&paths[0], "services:\n  web:\n    command: serve --v2\n").unwrap();
    fs::write(&paths[1], "services:\n  web:\n    command: serve\n").unwrap();
    fs::write(&paths[2], "services:\n  web:\n    command: serve\n").unwrap();

    let devices = [
        device(&broker, "10.0.0.1", &paths[0]),
        device(&broker, "10.0.0.2", &paths[1]),
        device(&broker, "10.0.0.3", &paths[2]),
    ];

    devices[0].publish_config().unwrap();

    // Deliver every message to every device until the broker goes quiet.
    let mut rounds = 0;
    loop {
        let pending = broker.drain();
        if pending.is_empty() {
            break;
        }
        rounds += 1;
        assert!(rounds < 10, "configuration kept bouncing between devices");
        for (topic, payload) in pending {
            for device in &devices {
                device.handle_message(&topic, &payload).unwrap();
            }
        }
    }

    for path in &paths[1..] {
        assert_eq!(
            fs::read_to_string(path).unwrap(),
            "services:\n  web:\n    command: serve --v2\n"
        );
    }
}

#[test]
fn echo_and_identical_snapshots_are_left_alone() {
    let dir = tempdir().unwrap();
    let broker = Broker::default();
    let path = dir.path().join("tandem.yml");
    fs::write(&path, "version: '1'\n").unwrap();
    let local = device(&broker, "10.0.0.9", &path);

    local.publish_config().unwrap();
    let (topic, own) = broker.drain().pop().unwrap();
    assert_eq!(
        local.handle_message(&topic, &own).unwrap(),
        MessageOutcome::OwnEcho
    );

    let peer = device(&broker, "10.0.0.5", &path);
    peer.publish_config().unwrap();
    let (topic, same) = broker.drain().pop().unwrap();
    assert_eq!(
        local.handle_message(&topic, &same).unwrap(),
        MessageOutcome::Unchanged
    );
    assert!(broker.drain().is_empty());
}

#[test]
fn daemon_refuses_to_start_without_registration() {
    let dir = tempdir().unwrap();
    let config = dir.path().join("tandem.yml");
    fs::write(&config, "version: '1'\n").unwrap();
    let pid_path = dir.path().join("sync.pid");
    let credentials = dir.path().join("tandem.conf");

    let daemon = SyncDaemon::with_paths(
        PidFile::new(pid_path.clone()),
        config.clone(),
        credentials.clone(),
        "fleet",
    );
    assert!(matches!(
        daemon.start(),
        Err(SyncError::CredentialFileMissing(_))
    ));

    fs::write(&credentials, "[fleet]\n").unwrap();
    assert!(matches!(daemon.start(), Err(SyncError::NotRegistered)));

    fs::write(&credentials, "[lab]\nIdentifier = x\n").unwrap();
    let err = daemon.start().unwrap_err();
    assert_eq!(
        err.to_string(),
        "Unable to find the context fleet inside credential file"
    );

    assert!(!pid_path.exists());
    assert!(daemon.stop().unwrap());
}

/// What the device sent to the MQTT broker.
#[derive(Debug, Clone, PartialEq)]
enum Packet {
    Subscribe(String),
    Publish(String, serde_json::Value),
    Disconnect,
}

/// A bare MQTT 3.1.1 broker on localhost: acknowledges connects, subscriptions and
/// QoS 1 publishes, answers pings and records every packet from the device. Right
/// after CONNACK it pushes `requests` snapshot requests on `{channel}/sync`.
struct MqttBroker {
    port: u16,
    seen: Arc<Mutex<Vec<Packet>>>,
}

impl MqttBroker {
    fn start(sync_topic: &str, requests: usize) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sync_topic = sync_topic.to_string();
        {
            let seen = Arc::clone(&seen);
            thread::spawn(move || {
                for stream in listener.incoming().flatten() {
                    let seen = Arc::clone(&seen);
                    let sync_topic = sync_topic.clone();
                    thread::spawn(move || {
                        let _ = serve_session(stream, &seen, &sync_topic, requests);
                    });
                }
            });
        }
        Self { port, seen }
    }

    fn url(&self) -> String {
        format!("tcp://127.0.0.1:{}", self.port)
    }

    fn seen(&self) -> Vec<Packet> {
        self.seen.lock().unwrap().clone()
    }

    fn published_on(&self, topic: &str) -> Vec<serde_json::Value> {
        self.seen()
            .into_iter()
            .filter_map(|packet| match packet {
                Packet::Publish(t, json) if t == topic => Some(json),
                _ => None,
            })
            .collect()
    }

    fn presence(&self, status: &str) -> usize {
        self.published_on("unit/presence")
            .iter()
            .filter(|json| json["status"] == status)
            .count()
    }
}

fn serve_session(
    mut stream: TcpStream,
    seen: &Mutex<Vec<Packet>>,
    sync_topic: &str,
    requests: usize,
) -> io::Result<()> {
    loop {
        let (header, body) = read_packet(&mut stream)?;
        match header >> 4 {
            1 => {
                stream.write_all(&[0x20, 2, 0, 0])?;
                for _ in 0..requests {
                    let mut publish = (sync_topic.len() as u16).to_be_bytes().to_vec();
                    publish.extend_from_slice(sync_topic.as_bytes());
                    publish.extend_from_slice(b"{}");
                    stream.write_all(&encode(0x30, &publish))?;
                }
            }
            3 => {
                let qos = (header >> 1) & 3;
                let topic_len = u16::from_be_bytes([body[0], body[1]]) as usize;
                let topic = String::from_utf8_lossy(&body[2..2 + topic_len]).into_owned();
                let mut at = 2 + topic_len;
                if qos > 0 {
                    stream.write_all(&[0x40, 2, body[at], body[at + 1]])?;
                    at += 2;
                }
                let json = serde_json::from_slice(&body[at..]).unwrap_or_default();
                seen.lock().unwrap().push(Packet::Publish(topic, json));
            }
            8 => {
                let mut at = 2;
                let mut granted = Vec::new();
                while at < body.len() {
                    let len = u16::from_be_bytes([body[at], body[at + 1]]) as usize;
                    let topic = String::from_utf8_lossy(&body[at + 2..at + 2 + len]).into_owned();
                    seen.lock().unwrap().push(Packet::Subscribe(topic));
                    granted.push(1);
                    at += 3 + len;
                }
                let mut suback = vec![body[0], body[1]];
                suback.extend(granted);
                stream.write_all(&encode(0x90, &suback))?;
            }
            12 => stream.write_all(&[0xD0, 0])?,
            14 => {
                seen.lock().unwrap().push(Packet::Disconnect);
                return Ok(());
            }
            _ => {}
        }
    }
}

fn read_packet(stream: &mut TcpStream) -> io::Result<(u8, Vec<u8>)> {
    let mut byte = [0u8; 1];
    stream.read_exact(&mut byte)?;
    let header = byte[0];

    let mut len = 0usize;
    let mut shift = 0;
    loop {
        stream.read_exact(&mut byte)?;
        len |= ((byte[0] & 0x7F) as usize) << shift;
        if byte[0] & 0x80 == 0 {
            break;
        }
        shift += 7;
    }

    let mut body = vec![0u8; len];
    stream.read_exact(&mut body)?;
    Ok((header, body))
}

fn encode(header: u8, body: &[u8]) -> Vec<u8> {
    let mut packet = vec![header];
    let mut len = body.len();
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        packet.push(byte);
        if len == 0 {
            break;
        }
    }
    packet.extend_from_slice(body);
    packet
}

/// A sync daemon running `SyncDaemon::run` on a thread, as the detached process would.
struct RunningDaemon {
    shutdown: Arc<AtomicBool>,
    done: mpsc::Receiver<Result<(), SyncError>>,
    pid_path: PathBuf,
    _dir: tempfile::TempDir,
}

impl RunningDaemon {
    fn start(broker_url: &str, heartbeat: Duration) -> Self {
        let dir = tempdir().unwrap();
        let config = dir.path().join("tandem.yml");
        fs::write(&config, "services:\n  web:\n    command: serve\n").unwrap();
        let pid_path = dir.path().join("sync.pid");
        let pidfile = PidFile::new(pid_path.clone());
        pidfile.write(std::process::id() as i32).unwrap();

        let daemon = SyncDaemon::with_paths(
            pidfile,
            config,
            dir.path().join("tandem.conf"),
            "fleet",
        )
        .with_heartbeat(heartbeat);
        let credentials = DeviceCredentials {
            identifier: "device-7".into(),
            channel_id: "unit".into(),
            broker_url: broker_url.to_string(),
            ..DeviceCredentials::default()
        };
        let template = SyncPayload::template(&credentials, "10.0.0.7");

        let shutdown = Arc::new(AtomicBool::new(false));
        let (tx, done) = mpsc::channel();
        {
            let shutdown = Arc::clone(&shutdown);
            thread::spawn(move || {
                let _ = tx.send(daemon.run(&credentials, template, &shutdown));
            });
        }

        Self {
            shutdown,
            done,
            pid_path,
            _dir: dir,
        }
    }

    /// Raises the shutdown flag and waits for `run` to return.
    fn stop(&self) -> Result<(), SyncError> {
        self.shutdown.store(true, Ordering::SeqCst);
        self.done
            .recv_timeout(Duration::from_secs(5))
            .expect("sync daemon did not honour shutdown")
    }
}

#[test]
fn daemon_announces_itself_and_says_goodbye() {
    let broker = MqttBroker::start("unit/sync", 0);
    let daemon = RunningDaemon::start(&broker.url(), Duration::from_millis(50));

    assert!(wait_until(Duration::from_secs(5), || {
        let seen = broker.seen();
        seen.contains(&Packet::Subscribe("unit/config".into()))
            && seen.contains(&Packet::Subscribe("unit/sync".into()))
            && broker.presence("connected") == 1
            && !broker.published_on("unit/config").is_empty()
    }));

    // Metrics ride along with the heartbeat; presence keeps beating.
    assert!(wait_until(Duration::from_secs(10), || {
        !broker.published_on("unit/metrics").is_empty()
    }));
    assert!(broker.presence("alive") >= METRICS_EVERY_HEARTBEATS as usize);

    daemon.stop().unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        broker.seen().contains(&Packet::Disconnect)
    }));
    assert_eq!(broker.presence("disconnected"), 1);
    assert!(!daemon.pid_path.exists());
}

#[test]
fn burst_of_snapshot_requests_does_not_wedge_the_daemon() {
    let broker = MqttBroker::start("unit/sync", 40);
    let daemon = RunningDaemon::start(&broker.url(), Duration::from_millis(50));

    assert!(wait_until(Duration::from_secs(5), || {
        broker.published_on("unit/config").len() > 1
    }));
    assert!(wait_until(Duration::from_secs(5), || {
        broker.presence("alive") > 0
    }));

    daemon.stop().unwrap();
    assert!(!daemon.pid_path.exists());
}

#[test]
fn daemon_without_a_broker_still_stops() {
    let closed = TcpListener::bind("127.0.0.1:0").unwrap();
    let url = format!("tcp://127.0.0.1:{}", closed.local_addr().unwrap().port());
    drop(closed);

    let daemon = RunningDaemon::start(&url, Duration::from_millis(50));
    // Long enough for the heartbeats to overrun the client's request queue.
    thread::sleep(Duration::from_secs(2));

    daemon.stop().unwrap();
    assert!(!daemon.pid_path.exists());
}
