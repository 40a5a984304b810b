use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{ws::WebSocketUpgrade, ConnectInfo, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;

use crate::admission::{AdmissionController, AdmissionPermit};
use crate::envelope::PayloadValidator;
use crate::events::{EvictReason, Rejection, RelayEvent};
use crate::metadata::{ConnectRequest, ConnectionMetadata};
use crate::pipeline::Connection;
use crate::registry::{ConnectionEntry, ConnectionRegistry, Registration};
use crate::transport::{split_websocket, FrameSink, FrameSource, CLOSE_CODE_CONFLICT};

pub const DEFAULT_MAX_CONNECTIONS: usize = 20_000;
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

pub type EventSink = Arc<dyn Fn(&RelayEvent) + Send + Sync>;

#[derive(Clone)]
pub struct RelayConfig {
    pub max_connections: usize,
    /// Frames buffered per connection between reader and dispatcher.
    pub queue_capacity: usize,
    /// Longest wait for a target's write lock before giving up on it.
    pub lock_timeout: Duration,
    /// Write deadline covering the liveness probe and the payload write.
    pub write_timeout: Duration,
    /// Bound on closing a transport during teardown.
    pub close_timeout: Duration,
    /// Replaces the default `tlog!` rendering of diagnostics events.
    pub event_sink: Option<EventSink>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            close_timeout: DEFAULT_WRITE_TIMEOUT,
            event_sink: None,
        }
    }
}

/// Decides whether a connection attempt may proceed. Runs before the id is
/// looked at.
pub trait ConnectionAuthorizer: Send + Sync {
    fn authorize(&self, request: &ConnectRequest) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl ConnectionAuthorizer for AllowAll {
    fn authorize(&self, _request: &ConnectRequest) -> bool {
        true
    }
}

/// A connection attempt that passed admission and may be registered.
#[derive(Debug)]
pub struct Admission {
    permit: AdmissionPermit,
    id: String,
    session_timestamp: u64,
    metadata: ConnectionMetadata,
}

impl Admission {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn session_timestamp(&self) -> u64 {
        self.session_timestamp
    }
}

/// The relay: admission, the connection registry, and routing state shared
/// by every connection task.
#[derive(Clone)]
pub struct RelayState {
    config: Arc<RelayConfig>,
    admission: Arc<AdmissionController>,
    registry: Arc<ConnectionRegistry>,
    validator: Option<Arc<dyn PayloadValidator>>,
    authorizer: Arc<dyn ConnectionAuthorizer>,
    start_time: Instant,
}

impl RelayState {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            admission: AdmissionController::new(config.max_connections),
            config: Arc::new(config),
            registry: Arc::new(ConnectionRegistry::new()),
            validator: None,
            authorizer: Arc::new(AllowAll),
            start_time: Instant::now(),
        }
    }

    pub fn with_validator(mut self, validator: Arc<dyn PayloadValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn with_authorizer(mut self, authorizer: Arc<dyn ConnectionAuthorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn validator(&self) -> Option<&dyn PayloadValidator> {
        self.validator.as_deref()
    }

    pub fn current_connection_count(&self) -> usize {
        self.admission.current()
    }

    pub fn max_connection_count(&self) -> usize {
        self.admission.max()
    }

    pub fn emit(&self, event: RelayEvent) {
        match &self.config.event_sink {
            Some(sink) => sink(&event),
            None => crate::tlog!("relay: {event}"),
        }
    }

    /// Admission checks in order: connection limit, authorization, client
    /// id, then an advisory session-conflict check. Nothing is registered
    /// yet; the returned [`Admission`] holds a connection slot until it is
    /// registered or dropped.
    pub fn admit(&self, request: &ConnectRequest) -> Result<Admission, Rejection> {
        let result = self.check_admission(request);
        if let Err(reason) = result {
            self.emit(RelayEvent::Rejected {
                id: request.client_id.clone(),
                reason,
            });
        }
        result
    }

    fn check_admission(&self, request: &ConnectRequest) -> Result<Admission, Rejection> {
        let permit = self.admission.try_admit().ok_or(Rejection::LimitReached)?;
        if !self.authorizer.authorize(request) {
            return Err(Rejection::Unauthorized);
        }
        let id = request.client_id.clone().ok_or(Rejection::MissingId)?;
        let session_timestamp = request.session_timestamp_or_now();
        if self.registry.would_conflict(&id, session_timestamp) {
            return Err(Rejection::Conflict);
        }
        Ok(Admission {
            permit,
            id,
            session_timestamp,
            metadata: request.metadata.clone(),
        })
    }

    /// Register an admitted connection with its transport. On a lost
    /// session race the sink is closed and `Conflict` returned; the
    /// connection already holding the id is untouched.
    pub async fn register(
        &self,
        admission: Admission,
        sink: Box<dyn FrameSink>,
        source: Box<dyn FrameSource>,
    ) -> Result<Connection, Rejection> {
        let Admission {
            permit,
            id,
            session_timestamp,
            metadata,
        } = admission;
        let entry = ConnectionEntry::new(id, session_timestamp, metadata, sink);

        match self.registry.register_or_preempt(Arc::clone(&entry)) {
            Registration::Admitted { preempted } => {
                if let Some(old) = preempted {
                    self.emit(RelayEvent::Preempted {
                        id: old.id().to_string(),
                        old_timestamp: old.session_timestamp(),
                        new_timestamp: session_timestamp,
                    });
                    self.emit(RelayEvent::Evicted {
                        id: old.id().to_string(),
                        reason: EvictReason::Preempted,
                        detail: None,
                    });
                }
                self.emit(RelayEvent::Connected {
                    id: entry.id().to_string(),
                    session_timestamp,
                    metadata: entry.metadata().clone(),
                });
                Ok(Connection::new(self.clone(), entry, source, permit))
            }
            Registration::RejectedConflict { .. } => {
                self.emit(RelayEvent::Rejected {
                    id: Some(entry.id().to_string()),
                    reason: Rejection::Conflict,
                });
                let mut writer = entry.writer().lock().await;
                writer.set_write_deadline(Some(
                    tokio::time::Instant::now() + self.config.close_timeout,
                ));
                let _ = writer
                    .close(Some((CLOSE_CODE_CONFLICT, "session conflict")))
                    .await;
                Err(Rejection::Conflict)
            }
        }
    }

    /// Admit and register in one step.
    pub async fn connect(
        &self,
        request: &ConnectRequest,
        sink: Box<dyn FrameSink>,
        source: Box<dyn FrameSource>,
    ) -> Result<Connection, Rejection> {
        let admission = self.admit(request)?;
        self.register(admission, sink, source).await
    }

    /// Ask every registered connection to close. Each one tears itself down.
    pub fn shutdown_all(&self) -> usize {
        let entries = self.registry.shutdown_all();
        for entry in &entries {
            self.emit(RelayEvent::Evicted {
                id: entry.id().to_string(),
                reason: EvictReason::Shutdown,
                detail: None,
            });
        }
        entries.len()
    }

    /// Wait until every admitted connection has released its slot, or until
    /// `limit` passes. Returns whether the relay drained.
    pub async fn drain(&self, limit: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + limit;
        while self.current_connection_count() > 0 {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }
        true
    }
}

pub fn app(state: RelayState) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .route("/ws", get(ws_handler))
        .route("/health", get(healthcheck))
        .route("/stats", get(stats))
        .with_state(state)
}

async fn healthcheck() -> impl IntoResponse {
    StatusCode::OK
}

#[derive(Serialize)]
struct StatsResponse {
    connections: usize,
    max_connections: usize,
    registered: usize,
    uptime_secs: u64,
}

async fn stats(State(state): State<RelayState>) -> impl IntoResponse {
    Json(StatsResponse {
        connections: state.current_connection_count(),
        max_connections: state.max_connection_count(),
        registered: state.registry().len(),
        uptime_secs: state.start_time.elapsed().as_secs(),
    })
}

fn rejection_response(reason: Rejection) -> Response {
    let (status, body) = match reason {
        Rejection::LimitReached => (StatusCode::SERVICE_UNAVAILABLE, "Connection limit reached"),
        Rejection::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized"),
        Rejection::MissingId => (StatusCode::BAD_REQUEST, "Client ID is required"),
        Rejection::Conflict => (StatusCode::CONFLICT, "A newer session holds this client ID"),
    };
    (status, body).into_response()
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    peer: Option<ConnectInfo<SocketAddr>>,
    State(state): State<RelayState>,
) -> Response {
    let request = ConnectRequest::from_parts(&query, &headers, peer.map(|ConnectInfo(addr)| addr));
    let admission = match state.admit(&request) {
        Ok(admission) => admission,
        Err(reason) => return rejection_response(reason),
    };

    ws.on_upgrade(move |socket| async move {
        let (sink, source) = split_websocket(socket);
        if let Ok(connection) = state
            .register(admission, Box::new(sink), Box::new(source))
            .await
        {
            connection.run().await;
        }
    })
}
