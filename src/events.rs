//! Diagnostics events emitted at each admission, routing, and delivery step.

use std::fmt;

use crate::logging::conn_id;
use crate::metadata::ConnectionMetadata;

/// Why an admission attempt was turned away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    LimitReached,
    Unauthorized,
    MissingId,
    Conflict,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::LimitReached => write!(f, "connection limit reached"),
            Rejection::Unauthorized => write!(f, "unauthorized"),
            Rejection::MissingId => write!(f, "client id is required"),
            Rejection::Conflict => write!(f, "session conflict"),
        }
    }
}

/// Why a registered connection was removed by someone other than itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictReason {
    ProbeFailed,
    WriteFailed,
    Preempted,
    Shutdown,
}

impl fmt::Display for EvictReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvictReason::ProbeFailed => write!(f, "liveness probe failed"),
            EvictReason::WriteFailed => write!(f, "write failed"),
            EvictReason::Preempted => write!(f, "preempted by newer session"),
            EvictReason::Shutdown => write!(f, "relay shutting down"),
        }
    }
}

/// Why a frame, or a single delivery of it, was discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    QueueFull,
    Malformed,
    Invalid,
    NoTarget,
    LockTimeout,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropReason::QueueFull => write!(f, "queue full"),
            DropReason::Malformed => write!(f, "malformed frame"),
            DropReason::Invalid => write!(f, "payload failed validation"),
            DropReason::NoTarget => write!(f, "target not connected"),
            DropReason::LockTimeout => write!(f, "write lock timeout"),
        }
    }
}

/// How a connection's read side ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    ClientClosed,
    ReadError,
    Signalled,
    Fault,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::ClientClosed => write!(f, "closed by client"),
            CloseReason::ReadError => write!(f, "read error"),
            CloseReason::Signalled => write!(f, "closed by relay"),
            CloseReason::Fault => write!(f, "read loop fault"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum RelayEvent {
    Connected {
        id: String,
        session_timestamp: u64,
        metadata: ConnectionMetadata,
    },
    Disconnected {
        id: String,
        reason: CloseReason,
    },
    Rejected {
        id: Option<String>,
        reason: Rejection,
    },
    Preempted {
        id: String,
        old_timestamp: u64,
        new_timestamp: u64,
    },
    Evicted {
        id: String,
        reason: EvictReason,
        detail: Option<String>,
    },
    Routed {
        from: String,
        kind: String,
        targets: usize,
    },
    Delivered {
        to: String,
        bytes: usize,
    },
    Dropped {
        connection: String,
        target: Option<String>,
        reason: DropReason,
        detail: Option<String>,
    },
    Fault {
        connection: String,
        detail: String,
    },
}

impl fmt::Display for RelayEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayEvent::Connected {
                id,
                session_timestamp,
                metadata,
            } => write!(
                f,
                "connected {} (session {}, {})",
                conn_id(id),
                session_timestamp,
                metadata
            ),
            RelayEvent::Disconnected { id, reason } => {
                write!(f, "disconnected {} ({reason})", conn_id(id))
            }
            RelayEvent::Rejected { id: Some(id), reason } => {
                write!(f, "rejected {} ({reason})", conn_id(id))
            }
            RelayEvent::Rejected { id: None, reason } => write!(f, "rejected connection ({reason})"),
            RelayEvent::Preempted {
                id,
                old_timestamp,
                new_timestamp,
            } => write!(
                f,
                "preempted {} (session {old_timestamp} replaced by {new_timestamp})",
                conn_id(id)
            ),
            RelayEvent::Evicted { id, reason, detail } => {
                write!(f, "evicted {} ({reason})", conn_id(id))?;
                match detail {
                    Some(detail) => write!(f, ": {detail}"),
                    None => Ok(()),
                }
            }
            RelayEvent::Routed {
                from,
                kind,
                targets,
            } => write!(
                f,
                "routing {kind} from {} to {targets} target(s)",
                conn_id(from)
            ),
            RelayEvent::Delivered { to, bytes } => {
                write!(f, "delivered {bytes} bytes to {}", conn_id(to))
            }
            RelayEvent::Dropped {
                connection,
                target,
                reason,
                detail,
            } => {
                write!(f, "dropped frame from {} ({reason})", conn_id(connection))?;
                if let Some(target) = target {
                    write!(f, " for {}", conn_id(target))?;
                }
                if let Some(detail) = detail {
                    write!(f, ": {detail}")?;
                }
                Ok(())
            }
            RelayEvent::Fault { connection, detail } => {
                write!(f, "fault on {}: {detail}", conn_id(connection))
            }
        }
    }
}
