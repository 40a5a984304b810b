#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use postoffice::events::{CloseReason, RelayEvent};
use postoffice::metadata::ConnectRequest;
use postoffice::relay::{RelayConfig, RelayState};
use postoffice::transport::{FrameSink, FrameSource, TransportError};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SinkBehaviour {
    Healthy,
    ProbeFails,
    WriteFails,
    /// Payload writes never complete.
    WriteStalls,
}

/// What a connection's write half has seen.
#[derive(Clone, Default)]
pub struct SinkLog {
    frames: Arc<Mutex<Vec<String>>>,
    probes: Arc<AtomicUsize>,
    closes: Arc<AtomicUsize>,
    close_codes: Arc<Mutex<Vec<Option<u16>>>>,
}

impl SinkLog {
    pub fn frames(&self) -> Vec<String> {
        self.frames.lock().unwrap().clone()
    }

    pub fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn close_codes(&self) -> Vec<Option<u16>> {
        self.close_codes.lock().unwrap().clone()
    }
}

pub struct MemorySink {
    log: SinkLog,
    behaviour: SinkBehaviour,
}

impl MemorySink {
    pub fn new(behaviour: SinkBehaviour) -> (Self, SinkLog) {
        let log = SinkLog::default();
        (
            Self {
                log: log.clone(),
                behaviour,
            },
            log,
        )
    }
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send_frame(&mut self, payload: &str) -> Result<(), TransportError> {
        match self.behaviour {
            SinkBehaviour::WriteFails => Err(TransportError::Io("broken pipe".to_string())),
            SinkBehaviour::WriteStalls => std::future::pending().await,
            _ => {
                self.log.frames.lock().unwrap().push(payload.to_string());
                Ok(())
            }
        }
    }

    async fn send_probe(&mut self) -> Result<(), TransportError> {
        self.log.probes.fetch_add(1, Ordering::SeqCst);
        match self.behaviour {
            SinkBehaviour::ProbeFails => Err(TransportError::Io("connection reset".to_string())),
            _ => Ok(()),
        }
    }

    async fn close(&mut self, reason: Option<(u16, &str)>) -> Result<(), TransportError> {
        self.log.closes.fetch_add(1, Ordering::SeqCst);
        self.log
            .close_codes
            .lock()
            .unwrap()
            .push(reason.map(|(code, _)| code));
        Ok(())
    }
}

/// Read half fed by the test. Dropping the sender is an orderly close.
pub struct ChannelSource {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

pub fn channel_source() -> (ChannelSource, mpsc::UnboundedSender<Vec<u8>>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ChannelSource { rx }, tx)
}

#[async_trait]
impl FrameSource for ChannelSource {
    async fn next_frame(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        Ok(self.rx.recv().await)
    }
}

/// Yields every queued frame immediately, then blocks forever.
pub struct BurstSource {
    frames: VecDeque<Vec<u8>>,
}

impl BurstSource {
    pub fn new(frames: impl IntoIterator<Item = Vec<u8>>) -> Self {
        Self {
            frames: frames.into_iter().collect(),
        }
    }
}

#[async_trait]
impl FrameSource for BurstSource {
    async fn next_frame(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        match self.frames.pop_front() {
            Some(frame) => Ok(Some(frame)),
            None => std::future::pending().await,
        }
    }
}

/// Read half whose first read fails.
#[derive(Clone, Copy, Debug)]
pub enum BrokenSource {
    Errors,
    Panics,
}

#[async_trait]
impl FrameSource for BrokenSource {
    async fn next_frame(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        match self {
            BrokenSource::Errors => Err(TransportError::Io("connection reset".to_string())),
            BrokenSource::Panics => panic!("reader exploded"),
        }
    }
}

/// A connection attached to a relay through in-memory transports.
pub struct Peer {
    pub id: String,
    pub log: SinkLog,
    pub tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    pub handle: JoinHandle<CloseReason>,
}

impl Peer {
    pub fn send(&self, frame: &str) {
        self.tx
            .as_ref()
            .expect("peer still open")
            .send(frame.as_bytes().to_vec())
            .expect("pipeline reading");
    }

    /// Close the client side and wait for the relay to tear down.
    pub async fn hang_up(mut self) -> CloseReason {
        self.tx.take();
        tokio::time::timeout(Duration::from_secs(5), self.handle)
            .await
            .expect("teardown in time")
            .expect("pipeline task")
    }
}

pub async fn connect_peer(
    state: &RelayState,
    id: &str,
    session_timestamp: u64,
    behaviour: SinkBehaviour,
) -> Peer {
    let (sink, log) = MemorySink::new(behaviour);
    let (source, tx) = channel_source();
    let request = ConnectRequest::new(id).with_timestamp(session_timestamp);
    let connection = state
        .connect(&request, Box::new(sink), Box::new(source))
        .await
        .expect("connection accepted");
    Peer {
        id: id.to_string(),
        log,
        tx: Some(tx),
        handle: tokio::spawn(connection.run()),
    }
}

pub type EventLog = Arc<Mutex<Vec<RelayEvent>>>;

/// Relay config whose diagnostics are captured instead of logged.
pub fn recording_config() -> (RelayConfig, EventLog) {
    let events: EventLog = Arc::new(Mutex::new(Vec::new()));
    let sink_events = Arc::clone(&events);
    let config = RelayConfig {
        event_sink: Some(Arc::new(move |event: &RelayEvent| {
            sink_events.lock().unwrap().push(event.clone());
        })),
        ..RelayConfig::default()
    };
    (config, events)
}

/// Poll `check` until it holds or two seconds pass.
pub async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}

pub fn envelope(from: &str, to: &str, kind: &str, payload: &str) -> String {
    serde_json::json!({ "from": from, "to": to, "type": kind, "payload": payload }).to_string()
}
