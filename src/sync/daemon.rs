//! The background process that mirrors the configuration file across the fleet.
use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use local_ip_address::local_ip;
use rumqttc::{Event, Packet};
use tracing::{debug, error, info, warn};

use crate::{
    constants::{
        HEARTBEAT_INTERVAL, METRICS_EVERY_HEARTBEATS, SYNC_STOP_TIMEOUT, SYNC_TICK,
    },
    daemon::{Fork, PidFile, daemonize},
    metrics::{HostSampler, HostSnapshot},
    runtime,
};

use super::{
    DeviceCredentials, Presence, Publisher, SyncError, SyncPayload, Topics, broker,
};

/// What an inbound message led to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    /// A peer asked for our copy and it was published.
    SnapshotSent,
    /// A foreign snapshot replaced the local file and was passed on once.
    Applied,
    /// A foreign snapshot matched the local file byte for byte.
    Unchanged,
    /// Our own snapshot came back from the broker.
    OwnEcho,
    /// Not a topic or message this daemon reacts to.
    Ignored,
}

/// Publishing and message handling for one device, independent of the transport.
pub struct SyncAgent<P> {
    publisher: P,
    template: SyncPayload,
    topics: Topics,
    config_path: PathBuf,
}

impl<P: Publisher> SyncAgent<P> {
    pub fn new(publisher: P, template: SyncPayload, topics: Topics, config_path: PathBuf) -> Self {
        Self {
            publisher,
            template,
            topics,
            config_path,
        }
    }

    /// Network address this device publishes as.
    pub fn address(&self) -> &str {
        &self.template.source
    }

    pub fn topics(&self) -> &Topics {
        &self.topics
    }

    /// Reacts to one message from the broker.
    pub fn handle_message(&self, topic: &str, payload: &[u8]) -> Result<MessageOutcome, SyncError> {
        if topic == self.topics.sync {
            debug!("Peer requested the configuration snapshot");
            self.publish_config()?;
            return Ok(MessageOutcome::SnapshotSent);
        }
        if topic != self.topics.config {
            return Ok(MessageOutcome::Ignored);
        }

        let message = SyncPayload::from_bytes(payload)?;
        if message.is_from(self.address()) {
            debug!("Ignoring our own configuration snapshot");
            return Ok(MessageOutcome::OwnEcho);
        }
        let Some(contents) = message.decode_context()? else {
            return Ok(MessageOutcome::Ignored);
        };

        match fs::read(&self.config_path) {
            Ok(current) if current == contents => return Ok(MessageOutcome::Unchanged),
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        info!(
            "Applying configuration from {} ({} bytes) to {}",
            message.source,
            contents.len(),
            self.config_path.display()
        );
        overwrite(&self.config_path, &contents)?;
        self.publisher.publish(&self.topics.config, payload.to_vec())?;
        Ok(MessageOutcome::Applied)
    }

    /// Publishes the local configuration file on `{channel}/config`.
    pub fn publish_config(&self) -> Result<(), SyncError> {
        let contents = fs::read(&self.config_path)?;
        self.send(&self.topics.config, self.template.config(&contents))
    }

    pub fn publish_presence(&self, presence: Presence) -> Result<(), SyncError> {
        self.send(&self.topics.presence, self.template.presence(presence))
    }

    pub fn publish_live(&self, live: bool) -> Result<(), SyncError> {
        self.send(&self.topics.live, self.template.live(live))
    }

    pub fn publish_event(&self, kind: &str, data: serde_json::Value) -> Result<(), SyncError> {
        self.send(&self.topics.events, self.template.event(kind, data))
    }

    pub fn publish_metrics(&self, snapshot: HostSnapshot) -> Result<(), SyncError> {
        self.send(&self.topics.metrics, self.template.metrics(snapshot))
    }

    fn send(&self, topic: &str, payload: SyncPayload) -> Result<(), SyncError> {
        self.publisher.publish(topic, payload.to_bytes()?)
    }
}

/// Replaces the file in one step so readers never see a partial write.
fn overwrite(path: &Path, contents: &[u8]) -> io::Result<()> {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let staging = path.with_file_name(format!(".{file_name}.sync"));
    fs::write(&staging, contents)?;
    fs::rename(&staging, path)
}

/// Handle on the sync daemon of this device, addressed through its PID file.
pub struct SyncDaemon {
    pidfile: PidFile,
    config_path: PathBuf,
    credential_path: PathBuf,
    context: String,
    heartbeat: Duration,
}

impl SyncDaemon {
    /// Daemon for the configuration file at `config_path`, using the runtime paths.
    pub fn new(config_path: &Path, context: &str) -> Result<Self, SyncError> {
        Ok(Self::with_paths(
            PidFile::new(runtime::sync_pid_path()),
            std::path::absolute(config_path)?,
            runtime::credential_path(),
            context,
        ))
    }

    pub fn with_paths(
        pidfile: PidFile,
        config_path: PathBuf,
        credential_path: PathBuf,
        context: &str,
    ) -> Self {
        Self {
            pidfile,
            config_path,
            credential_path,
            context: context.to_string(),
            heartbeat: HEARTBEAT_INTERVAL,
        }
    }

    /// Time between presence heartbeats, also the pause before retrying a lost broker.
    pub fn with_heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat = interval;
        self
    }

    pub fn is_running(&self) -> Result<bool, SyncError> {
        Ok(self.pidfile.is_running()?)
    }

    pub fn credentials(&self) -> Result<DeviceCredentials, SyncError> {
        DeviceCredentials::load(&self.credential_path, &self.context)
    }

    /// Detaches the daemon. Returns `false` when one is already running.
    ///
    /// The credential file is checked before forking so a missing registration is
    /// reported to the caller.
    pub fn start(&self) -> Result<bool, SyncError> {
        if self.is_running()? {
            debug!("Sync daemon already running");
            return Ok(false);
        }
        self.credentials()?;

        match daemonize(&runtime::log_dir().join("sync.log"))? {
            Fork::Parent => Ok(true),
            Fork::Daemon => {
                let code = match self.run_daemon() {
                    Ok(()) => 0,
                    Err(err) => {
                        error!("Sync daemon exited: {err}");
                        let _ = self.pidfile.remove();
                        1
                    }
                };
                std::process::exit(code);
            }
        }
    }

    /// Asks the daemon to stop. Returns `true` once it is gone.
    pub fn stop(&self) -> Result<bool, SyncError> {
        Ok(self.pidfile.terminate(SYNC_STOP_TIMEOUT)?)
    }

    fn run_daemon(&self) -> Result<(), SyncError> {
        self.pidfile.claim()?;

        let shutdown = Arc::new(AtomicBool::new(false));
        {
            let shutdown = Arc::clone(&shutdown);
            ctrlc::set_handler(move || shutdown.store(true, Ordering::SeqCst))
                .map_err(io::Error::other)?;
        }

        let (credentials, template) = self.initialize_client()?;
        self.run(&credentials, template, &shutdown)
    }

    /// Loads the device credentials and builds the payload template, with this
    /// device's network address as `source`.
    pub fn initialize_client(&self) -> Result<(DeviceCredentials, SyncPayload), SyncError> {
        let credentials = self.credentials()?;
        let source = local_ip()
            .map_err(|err| SyncError::Address(err.to_string()))?
            .to_string();
        info!("Sync daemon for '{}' publishing as {source}", credentials.identifier);
        let template = SyncPayload::template(&credentials, &source);
        Ok((credentials, template))
    }

    /// Connects, announces the device and loops until `shutdown` is set.
    pub fn run(
        &self,
        credentials: &DeviceCredentials,
        template: SyncPayload,
        shutdown: &AtomicBool,
    ) -> Result<(), SyncError> {
        let topics = Topics::new(&credentials.channel_id);
        let last_will = template.presence(Presence::Disconnected).to_bytes()?;
        let (client, mut connection) = broker::connect(credentials, &topics, last_will)?;
        let agent = Arc::new(SyncAgent::new(
            client.clone(),
            template,
            topics.clone(),
            self.config_path.clone(),
        ));

        let stopping = Arc::new(AtomicBool::new(false));
        {
            let agent = Arc::clone(&agent);
            let stopping = Arc::clone(&stopping);
            let client = client.clone();
            let topics = topics.clone();
            let retry = self.heartbeat;
            thread::spawn(move || {
                for notification in connection.iter() {
                    match notification {
                        Ok(Event::Incoming(Packet::ConnAck(_))) => {
                            debug!("Connected to broker");
                            broker::subscribe(&client, &topics);
                        }
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            match agent.handle_message(&publish.topic, &publish.payload) {
                                Ok(outcome) => debug!("{}: {outcome:?}", publish.topic),
                                Err(err) => warn!("Failed to handle {}: {err}", publish.topic),
                            }
                        }
                        Ok(_) => {}
                        Err(err) => {
                            if stopping.load(Ordering::SeqCst) {
                                break;
                            }
                            warn!("Broker connection error: {err}");
                            thread::sleep(retry);
                        }
                    }
                }
            });
        }

        agent.publish_presence(Presence::Connected)?;
        agent.publish_config()?;

        let mut sampler = HostSampler::new();
        let mut heartbeats: u64 = 0;
        let mut last_heartbeat = Instant::now();
        while !shutdown.load(Ordering::SeqCst) {
            thread::sleep(SYNC_TICK);
            if last_heartbeat.elapsed() < self.heartbeat {
                continue;
            }
            last_heartbeat = Instant::now();
            heartbeats += 1;
            agent.publish_presence(Presence::Alive)?;
            if heartbeats % METRICS_EVERY_HEARTBEATS == 0 {
                agent.publish_metrics(sampler.sample())?;
            }
        }

        info!("Sync daemon stopping");
        stopping.store(true, Ordering::SeqCst);
        if let Err(err) = agent.publish_presence(Presence::Disconnected) {
            warn!("Failed to announce disconnect: {err}");
        }
        if let Err(err) = client.try_disconnect() {
            warn!("Failed to disconnect from broker: {err}");
        }
        thread::sleep(SYNC_TICK * 5);
        self.pidfile.remove()?;
        Ok(())
    }
}
