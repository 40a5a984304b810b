//! Identity-keyed connection registry.
//!
//! At most one live [`ConnectionEntry`] exists per id. Reconnection
//! arbitration happens inside a single map-entry operation: a newcomer
//! replaces the current holder only when its session timestamp is strictly
//! greater, otherwise the map is left untouched.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::metadata::ConnectionMetadata;
use crate::transport::{FrameSink, TransportError};

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

/// Write side of a connection, only reachable through the entry's lock.
pub struct WriteHalf {
    sink: Box<dyn FrameSink>,
    deadline: Option<Instant>,
    closed: bool,
}

impl WriteHalf {
    pub fn set_write_deadline(&mut self, deadline: Option<Instant>) {
        self.deadline = deadline;
    }

    pub fn write_deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    async fn bounded<F>(deadline: Option<Instant>, op: F) -> Result<(), TransportError>
    where
        F: std::future::Future<Output = Result<(), TransportError>>,
    {
        match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, op)
                .await
                .unwrap_or(Err(TransportError::TimedOut)),
            None => op.await,
        }
    }

    pub async fn probe(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        Self::bounded(self.deadline, self.sink.send_probe()).await
    }

    pub async fn write(&mut self, payload: &str) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        Self::bounded(self.deadline, self.sink.send_frame(payload)).await
    }

    /// Close the transport. Only the first call reaches the sink.
    pub async fn close(&mut self, reason: Option<(u16, &str)>) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        Self::bounded(self.deadline, self.sink.close(reason)).await
    }
}

pub struct ConnectionEntry {
    id: String,
    serial: u64,
    session_timestamp: u64,
    metadata: ConnectionMetadata,
    writer: Mutex<WriteHalf>,
    shutdown_requested: AtomicBool,
    shutdown: Notify,
}

impl ConnectionEntry {
    pub fn new(
        id: impl Into<String>,
        session_timestamp: u64,
        metadata: ConnectionMetadata,
        sink: Box<dyn FrameSink>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
            session_timestamp,
            metadata,
            writer: Mutex::new(WriteHalf {
                sink,
                deadline: None,
                closed: false,
            }),
            shutdown_requested: AtomicBool::new(false),
            shutdown: Notify::new(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Process-unique number telling apart two entries with the same id.
    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn session_timestamp(&self) -> u64 {
        self.session_timestamp
    }

    pub fn metadata(&self) -> &ConnectionMetadata {
        &self.metadata
    }

    pub fn writer(&self) -> &Mutex<WriteHalf> {
        &self.writer
    }

    /// Ask the owning pipeline to tear this connection down. Idempotent.
    pub fn request_shutdown(&self) {
        if !self.shutdown_requested.swap(true, Ordering::AcqRel) {
            // notify_one stores a permit if the reader is not parked yet.
            self.shutdown.notify_one();
        }
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::Acquire)
    }

    /// Resolves once [`request_shutdown`](Self::request_shutdown) was called.
    /// Meant for the single pipeline that owns this entry.
    pub async fn shutdown_signalled(&self) {
        if self.shutdown_requested() {
            return;
        }
        self.shutdown.notified().await;
    }
}

impl std::fmt::Debug for ConnectionEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionEntry")
            .field("id", &self.id)
            .field("serial", &self.serial)
            .field("session_timestamp", &self.session_timestamp)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub enum Registration {
    /// Installed. `preempted` is the older session that was replaced, if any;
    /// it has already been asked to shut down.
    Admitted {
        preempted: Option<Arc<ConnectionEntry>>,
    },
    /// An entry with an equal or newer session holds the id. Nothing changed.
    RejectedConflict { existing_timestamp: u64 },
}

#[derive(Default)]
pub struct ConnectionRegistry {
    entries: DashMap<String, Arc<ConnectionEntry>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, id: &str) -> Option<Arc<ConnectionEntry>> {
        self.entries.get(id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Would an attempt with `session_timestamp` lose arbitration right now?
    /// Advisory only; [`register_or_preempt`](Self::register_or_preempt) decides.
    pub fn would_conflict(&self, id: &str, session_timestamp: u64) -> bool {
        self.entries
            .get(id)
            .is_some_and(|existing| session_timestamp <= existing.session_timestamp())
    }

    pub fn register_or_preempt(&self, entry: Arc<ConnectionEntry>) -> Registration {
        let preempted = match self.entries.entry(entry.id().to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(entry);
                None
            }
            Entry::Occupied(mut slot) => {
                let existing_timestamp = slot.get().session_timestamp();
                if entry.session_timestamp() <= existing_timestamp {
                    return Registration::RejectedConflict { existing_timestamp };
                }
                Some(slot.insert(entry))
            }
        };
        // Signal outside the shard lock.
        if let Some(old) = &preempted {
            old.request_shutdown();
        }
        Registration::Admitted { preempted }
    }

    /// Remove the mapping for `id`. With `expected`, only if the map still
    /// points at that very entry. Idempotent. Closing the transport is left
    /// to the caller.
    pub fn evict(
        &self,
        id: &str,
        expected: Option<&Arc<ConnectionEntry>>,
    ) -> Option<Arc<ConnectionEntry>> {
        match expected {
            Some(expected) => self
                .entries
                .remove_if(id, |_, current| Arc::ptr_eq(current, expected))
                .map(|(_, entry)| entry),
            None => self.entries.remove(id).map(|(_, entry)| entry),
        }
    }

    /// Ask every registered connection to shut down and return the entries
    /// signalled. Entries remove themselves as their pipelines finish.
    pub fn shutdown_all(&self) -> Vec<Arc<ConnectionEntry>> {
        let entries: Vec<_> = self.entries.iter().map(|e| Arc::clone(e.value())).collect();
        for entry in &entries {
            entry.request_shutdown();
        }
        entries
    }
}
