//! Delivery of one payload to one target connection.
//!
//! Writes to a target are serialized by the target entry's write lock. The
//! lock is taken with a bounded wait, the transport is probed under a write
//! deadline, and the payload is written once. A target that fails the probe
//! or the write is evicted; a target whose lock is merely busy is left alone.

use std::sync::Arc;

use tokio::time::Instant;

use crate::events::{DropReason, EvictReason, RelayEvent};
use crate::registry::ConnectionEntry;
use crate::relay::RelayState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    NoTarget,
    LockTimeout,
    Evicted(EvictReason),
}

/// Deliver `payload` to `target`. Best effort: the outcome is reported to
/// diagnostics and returned, never sent back to the sender.
///
/// `sender` is the id of the connection the frame arrived on. `quiet`
/// suppresses the success event (heartbeats); drops are always reported.
pub async fn deliver(
    state: &RelayState,
    sender: &str,
    target: &str,
    payload: &str,
    quiet: bool,
) -> DeliveryOutcome {
    let Some(entry) = state.registry().lookup(target) else {
        state.emit(RelayEvent::Dropped {
            connection: sender.to_string(),
            target: Some(target.to_string()),
            reason: DropReason::NoTarget,
            detail: None,
        });
        return DeliveryOutcome::NoTarget;
    };

    let config = state.config();
    let mut writer = match tokio::time::timeout(config.lock_timeout, entry.writer().lock()).await {
        Ok(writer) => writer,
        Err(_) => {
            state.emit(RelayEvent::Dropped {
                connection: sender.to_string(),
                target: Some(target.to_string()),
                reason: DropReason::LockTimeout,
                detail: Some(format!("waited {:?}", config.lock_timeout)),
            });
            return DeliveryOutcome::LockTimeout;
        }
    };

    writer.set_write_deadline(Some(Instant::now() + config.write_timeout));

    let result = match writer.probe().await {
        Err(e) => Err((EvictReason::ProbeFailed, e)),
        Ok(()) => writer
            .write(payload)
            .await
            .map_err(|e| (EvictReason::WriteFailed, e)),
    };

    let outcome = match result {
        Ok(()) => DeliveryOutcome::Delivered,
        Err((reason, error)) => {
            // Best effort: the transport is already failing.
            let _ = writer.close(None).await;
            evict_target(state, &entry, reason, &error.to_string());
            DeliveryOutcome::Evicted(reason)
        }
    };

    writer.set_write_deadline(None);
    drop(writer);

    if outcome == DeliveryOutcome::Delivered && !quiet {
        state.emit(RelayEvent::Delivered {
            to: target.to_string(),
            bytes: payload.len(),
        });
    }
    outcome
}

fn evict_target(state: &RelayState, entry: &Arc<ConnectionEntry>, reason: EvictReason, detail: &str) {
    // Only remove the mapping if it still points at the entry we failed on;
    // a fresh reconnection under the same id must survive.
    if state.registry().evict(entry.id(), Some(entry)).is_some() {
        state.emit(RelayEvent::Evicted {
            id: entry.id().to_string(),
            reason,
            detail: Some(detail.to_string()),
        });
    }
    entry.request_shutdown();
}
