//! Per-connection inbound pipeline.
//!
//! Each admitted connection runs two tasks: a reader that pulls frames off
//! the transport one at a time and offers them to a bounded queue, and a
//! dispatcher that drains the queue into the router. A full queue drops the
//! incoming frame; the reader never waits on downstream delivery.
//!
//! Faults are contained where they happen. A panic while routing one frame
//! loses that frame only. A panic in the read loop ends this connection
//! through the normal teardown path.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt as _;
use tokio::sync::mpsc;

use crate::admission::AdmissionPermit;
use crate::events::{CloseReason, DropReason, RelayEvent};
use crate::registry::ConnectionEntry;
use crate::relay::RelayState;
use crate::router::route;
use crate::transport::FrameSource;

/// A registered connection, ready to run.
pub struct Connection {
    state: RelayState,
    entry: Arc<ConnectionEntry>,
    source: Box<dyn FrameSource>,
    permit: AdmissionPermit,
}

impl Connection {
    pub(crate) fn new(
        state: RelayState,
        entry: Arc<ConnectionEntry>,
        source: Box<dyn FrameSource>,
        permit: AdmissionPermit,
    ) -> Self {
        Self {
            state,
            entry,
            source,
            permit,
        }
    }

    pub fn entry(&self) -> &Arc<ConnectionEntry> {
        &self.entry
    }

    /// Run until the transport closes, fails, or the entry is told to shut
    /// down; then tear the connection down. Returns how the read side ended.
    pub async fn run(self) -> CloseReason {
        let Connection {
            state,
            entry,
            source,
            permit,
        } = self;

        let (tx, rx) = mpsc::channel(state.config().queue_capacity);
        tokio::spawn(dispatch(state.clone(), entry.id().to_string(), rx));

        let reader = tokio::spawn(read_loop(state.clone(), Arc::clone(&entry), source, tx));
        let reason = match reader.await {
            Ok(reason) => reason,
            Err(e) => {
                state.emit(RelayEvent::Fault {
                    connection: entry.id().to_string(),
                    detail: format!("read loop: {e}"),
                });
                CloseReason::Fault
            }
        };

        teardown(&state, &entry, reason).await;
        drop(permit);
        reason
    }
}

async fn read_loop(
    state: RelayState,
    entry: Arc<ConnectionEntry>,
    mut source: Box<dyn FrameSource>,
    queue: mpsc::Sender<Vec<u8>>,
) -> CloseReason {
    loop {
        let frame = tokio::select! {
            biased;
            _ = entry.shutdown_signalled() => return CloseReason::Signalled,
            frame = source.next_frame() => frame,
        };

        let frame = match frame {
            Ok(Some(frame)) => frame,
            Ok(None) => return CloseReason::ClientClosed,
            Err(e) => {
                state.emit(RelayEvent::Fault {
                    connection: entry.id().to_string(),
                    detail: e.to_string(),
                });
                return CloseReason::ReadError;
            }
        };

        match queue.try_send(frame) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => state.emit(RelayEvent::Dropped {
                connection: entry.id().to_string(),
                target: None,
                reason: DropReason::QueueFull,
                detail: None,
            }),
            // Dispatcher gone; nothing left to route with.
            Err(mpsc::error::TrySendError::Closed(_)) => return CloseReason::Fault,
        }
    }
}

async fn dispatch(state: RelayState, sender: String, mut queue: mpsc::Receiver<Vec<u8>>) {
    while let Some(frame) = queue.recv().await {
        let routed = AssertUnwindSafe(route(&state, &sender, frame))
            .catch_unwind()
            .await;
        if let Err(panic) = routed {
            state.emit(RelayEvent::Fault {
                connection: sender.clone(),
                detail: format!("frame abandoned: {}", panic_message(&*panic)),
            });
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}

/// Remove this connection from the registry (if it still owns its id) and
/// close its transport. The queue sender was dropped with the reader, so the
/// dispatcher drains what is left and stops on its own.
async fn teardown(state: &RelayState, entry: &Arc<ConnectionEntry>, reason: CloseReason) {
    state.registry().evict(entry.id(), Some(entry));
    entry.request_shutdown();

    let config = state.config();
    match tokio::time::timeout(config.close_timeout, entry.writer().lock()).await {
        Ok(mut writer) => {
            writer.set_write_deadline(Some(tokio::time::Instant::now() + config.close_timeout));
            if let Err(e) = writer.close(None).await {
                crate::tlog!("close {}: {e}", crate::logging::conn_id(entry.id()));
            }
            writer.set_write_deadline(None);
        }
        Err(_) => crate::tlog!(
            "close {}: write lock busy, leaving transport to drop",
            crate::logging::conn_id(entry.id())
        ),
    }

    state.emit(RelayEvent::Disconnected {
        id: entry.id().to_string(),
        reason,
    });
}
