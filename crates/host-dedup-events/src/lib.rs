use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use host_dedup_core::{DedupError, EventEmitter, HostDeleteEvent, HostId};
use rumqttc::{Client, Connection, Event, MqttOptions, Outgoing, Packet, QoS};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// One keyed message as written by [`NdjsonEventSink`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventEnvelope {
    pub key: HostId,
    pub value: HostDeleteEvent,
}

#[derive(Serialize)]
struct EnvelopeRef<'a> {
    key: &'a HostId,
    value: &'a HostDeleteEvent,
}

fn emission_error(host_id: HostId, message: impl Into<String>) -> DedupError {
    DedupError::EventEmission { host_id, message: message.into() }
}

/// Writes each event as one `{"key": .., "value": ..}` JSON line.
pub struct NdjsonEventSink<W: Write> {
    writer: W,
    written: usize,
}

impl NdjsonEventSink<BufWriter<File>> {
    /// Create (or truncate) `path` and write events to it.
    ///
    /// # Errors
    /// Returns [`DedupError::Config`] when the file cannot be created.
    pub fn create(path: &Path) -> Result<Self, DedupError> {
        let file = File::create(path).map_err(|err| {
            DedupError::Config(format!("failed to create event file {}: {err}", path.display()))
        })?;
        Ok(Self::new(BufWriter::new(file)))
    }
}

impl<W: Write> NdjsonEventSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer, written: 0 }
    }

    #[must_use]
    pub fn written(&self) -> usize {
        self.written
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> EventEmitter for NdjsonEventSink<W> {
    fn emit(&mut self, key: &HostId, event: &HostDeleteEvent) -> Result<(), DedupError> {
        let line = serde_json::to_string(&EnvelopeRef { key, value: event })
            .map_err(|err| emission_error(*key, format!("failed to serialize event: {err}")))?;
        self.writer
            .write_all(line.as_bytes())
            .and_then(|()| self.writer.write_all(b"\n"))
            .map_err(|err| emission_error(*key, format!("failed to write event: {err}")))?;
        self.written += 1;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), DedupError> {
        self.writer
            .flush()
            .map_err(|err| DedupError::EventFlush(format!("failed to flush event file: {err}")))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MqttSinkConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub topic_prefix: String,
    pub keep_alive_secs: u64,
    pub ack_timeout_secs: u64,
    pub capacity: usize,
}

impl Default for MqttSinkConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: "hostdedup".to_string(),
            topic_prefix: "inventory/events/host".to_string(),
            keep_alive_secs: 15,
            ack_timeout_secs: 30,
            capacity: 64,
        }
    }
}

impl MqttSinkConfig {
    /// Topic a host's delete event is published on; the host id is the message key.
    #[must_use]
    pub fn topic_for(&self, key: &HostId) -> String {
        format!("{}/{key}", self.topic_prefix.trim_end_matches('/'))
    }

    /// # Errors
    /// Returns [`DedupError::Config`] when a required field is empty or zero.
    pub fn validate(&self) -> Result<(), DedupError> {
        if self.host.trim().is_empty() {
            return Err(DedupError::Config("mqtt.host MUST NOT be empty".to_string()));
        }
        if self.client_id.trim().is_empty() {
            return Err(DedupError::Config("mqtt.client_id MUST NOT be empty".to_string()));
        }
        if self.topic_prefix.trim_matches('/').is_empty() {
            return Err(DedupError::Config("mqtt.topic_prefix MUST NOT be empty".to_string()));
        }
        if self.capacity == 0 || self.ack_timeout_secs == 0 {
            return Err(DedupError::Config(
                "mqtt.capacity and mqtt.ack_timeout_secs MUST be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct AckState {
    acked: u64,
    failure: Option<String>,
}

/// Publish acknowledgements observed by the connection thread.
#[derive(Debug, Default)]
pub struct AckTracker {
    state: Mutex<AckState>,
    changed: Condvar,
}

impl AckTracker {
    fn lock(&self) -> MutexGuard<'_, AckState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record_ack(&self) {
        self.lock().acked += 1;
        self.changed.notify_all();
    }

    /// Keep the first connection failure; later ones are usually consequences of it.
    pub fn record_failure(&self, message: String) {
        let mut state = self.lock();
        if state.failure.is_none() {
            state.failure = Some(message);
        }
        drop(state);
        self.changed.notify_all();
    }

    #[must_use]
    pub fn acked(&self) -> u64 {
        self.lock().acked
    }

    #[must_use]
    pub fn failure(&self) -> Option<String> {
        self.lock().failure.clone()
    }

    /// Wait until `target` acknowledgements arrived, a failure was recorded, or `timeout` passed.
    ///
    /// # Errors
    /// Returns a description of the failure or timeout when fewer than `target` acks arrived.
    pub fn wait_for(&self, target: u64, timeout: Duration) -> Result<u64, String> {
        let guard = self.lock();
        let (state, _) = self
            .changed
            .wait_timeout_while(guard, timeout, |state| {
                state.acked < target && state.failure.is_none()
            })
            .unwrap_or_else(PoisonError::into_inner);

        if state.acked >= target {
            return Ok(state.acked);
        }
        if let Some(failure) = &state.failure {
            return Err(failure.clone());
        }
        Err(format!(
            "timed out after {}s with {}/{target} acknowledgements",
            timeout.as_secs(),
            state.acked
        ))
    }
}

/// Publishes delete events at-least-once to an MQTT broker.
///
/// `flush` blocks until the broker acknowledged every publish or the ack timeout elapses.
pub struct MqttEventSink {
    client: Client,
    config: MqttSinkConfig,
    acks: Arc<AckTracker>,
    published: u64,
    worker: Option<JoinHandle<()>>,
}

impl MqttEventSink {
    /// Start the client and its connection thread. The broker is contacted lazily.
    ///
    /// # Errors
    /// Returns [`DedupError::Config`] when the configuration is invalid or the thread cannot start.
    pub fn connect(config: MqttSinkConfig) -> Result<Self, DedupError> {
        config.validate()?;
        let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(5)));
        let (client, connection) = Client::new(options, config.capacity);

        let acks = Arc::new(AckTracker::default());
        let worker_acks = Arc::clone(&acks);
        let worker = thread::Builder::new()
            .name("hostdedup-mqtt".to_string())
            .spawn(move || drive_connection(connection, &worker_acks))
            .map_err(|err| DedupError::Config(format!("failed to start mqtt thread: {err}")))?;

        info!(host = %config.host, port = config.port, "mqtt event sink started");
        Ok(Self { client, config, acks, published: 0, worker: Some(worker) })
    }

    #[must_use]
    pub fn published(&self) -> u64 {
        self.published
    }

    /// Flush, disconnect and wait for the connection thread to exit.
    ///
    /// # Errors
    /// Returns [`DedupError::EventFlush`] when outstanding publishes were not acknowledged.
    pub fn close(mut self) -> Result<(), DedupError> {
        let flushed = self.flush();
        if let Err(err) = self.client.disconnect() {
            debug!(error = %err, "mqtt disconnect request failed");
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("mqtt connection thread panicked");
            }
        }
        flushed
    }
}

fn drive_connection(mut connection: Connection, acks: &AckTracker) {
    for notification in connection.iter() {
        match notification {
            Ok(Event::Incoming(Packet::PubAck(_))) => acks.record_ack(),
            Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
            Ok(event) => debug!(?event, "mqtt event"),
            Err(err) => {
                warn!(error = %err, "mqtt connection failed");
                acks.record_failure(format!("mqtt connection failed: {err}"));
                break;
            }
        }
    }
}

impl EventEmitter for MqttEventSink {
    fn emit(&mut self, key: &HostId, event: &HostDeleteEvent) -> Result<(), DedupError> {
        if let Some(failure) = self.acks.failure() {
            return Err(emission_error(*key, failure));
        }

        let payload = serde_json::to_vec(event)
            .map_err(|err| emission_error(*key, format!("failed to serialize event: {err}")))?;
        self.client
            .publish(self.config.topic_for(key), QoS::AtLeastOnce, false, payload)
            .map_err(|err| emission_error(*key, format!("failed to queue publish: {err}")))?;
        self.published += 1;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), DedupError> {
        if self.published == 0 {
            return Ok(());
        }
        let timeout = Duration::from_secs(self.config.ack_timeout_secs);
        let acked = self.acks.wait_for(self.published, timeout).map_err(DedupError::EventFlush)?;
        debug!(acked, published = self.published, "mqtt publishes acknowledged");
        Ok(())
    }
}

impl Drop for MqttEventSink {
    fn drop(&mut self) {
        if self.worker.is_some() {
            if let Err(err) = self.client.disconnect() {
                debug!(error = %err, "mqtt disconnect on drop failed");
            }
        }
    }
}
