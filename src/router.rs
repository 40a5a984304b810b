//! Turns one inbound frame into deliveries.

use crate::delivery::{deliver, DeliveryOutcome};
use crate::envelope::{Envelope, Targets};
use crate::events::{DropReason, RelayEvent};
use crate::relay::RelayState;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Failed validation or could not be parsed; nothing was sent.
    Rejected(DropReason),
    /// Parsed, one outcome per resolved target in `to` order.
    Routed(Vec<(String, DeliveryOutcome)>),
}

/// Route a frame received on connection `sender`.
///
/// Fire-and-forget: the sender never learns what happened. Every target is
/// attempted even when an earlier one fails.
pub async fn route(state: &RelayState, sender: &str, frame: Vec<u8>) -> RouteOutcome {
    if let Some(validator) = state.validator() {
        if let Err(reasons) = validator.validate(&frame) {
            state.emit(RelayEvent::Dropped {
                connection: sender.to_string(),
                target: None,
                reason: DropReason::Invalid,
                detail: Some(reasons.join("; ")),
            });
            return RouteOutcome::Rejected(DropReason::Invalid);
        }
    }

    let envelope = match Envelope::parse(&frame) {
        Ok(envelope) => envelope,
        Err(e) => {
            state.emit(RelayEvent::Dropped {
                connection: sender.to_string(),
                target: None,
                reason: DropReason::Malformed,
                detail: Some(e.0),
            });
            return RouteOutcome::Rejected(DropReason::Malformed);
        }
    };

    if envelope.to == Targets::None {
        return RouteOutcome::Routed(Vec::new());
    }

    // Frames are forwarded as text; a frame that parsed as JSON is UTF-8.
    let payload = match String::from_utf8(frame) {
        Ok(payload) => payload,
        Err(e) => {
            state.emit(RelayEvent::Dropped {
                connection: sender.to_string(),
                target: None,
                reason: DropReason::Malformed,
                detail: Some(e.to_string()),
            });
            return RouteOutcome::Rejected(DropReason::Malformed);
        }
    };

    let quiet = envelope.is_heartbeat();
    if !quiet {
        state.emit(RelayEvent::Routed {
            from: envelope.from.clone(),
            kind: envelope.kind.clone(),
            targets: envelope.to.len(),
        });
    }

    let mut outcomes = Vec::with_capacity(envelope.to.len());
    for target in envelope.to.iter() {
        let outcome = deliver(state, sender, target, &payload, quiet).await;
        outcomes.push((target.to_string(), outcome));
    }
    RouteOutcome::Routed(outcomes)
}
