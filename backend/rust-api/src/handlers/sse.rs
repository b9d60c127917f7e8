use axum::{
    extract::{Path, State},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
};
use chrono::Utc;
use futures::stream::{self, Stream};
use std::collections::VecDeque;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::{interval, Interval, MissedTickBehavior};

use crate::{
    error::SessionError,
    metrics::SSE_CONNECTIONS_ACTIVE,
    models::{
        events::{SessionEvent, TimeExpired, TimerTick},
        SessionStatus,
    },
    services::{
        clock::{elapsed_seconds, read_timer},
        session_service::SessionService,
        AppState,
    },
};

/// SSE endpoint for session changes and timer ticks
/// GET /api/v1/exam-sessions/{id}/stream
pub async fn session_stream(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, SessionError> {
    // Subscribe before reading so nothing between the snapshot and the first
    // feed event is missed.
    let receiver = state.sessions.subscribe(&session_id);
    let session = state.sessions.observe(&session_id).await?;

    tracing::info!(
        session_id = %session_id,
        status = %session.status,
        "Client connected to SSE stream"
    );

    let closed = session.status == SessionStatus::Cancelled || session.results_locked;
    let snapshot = state.sessions.snapshot_event(&session);
    let stream = create_session_stream(
        state.sessions.clone(),
        session_id,
        snapshot,
        receiver,
        state.config.tick_interval(),
        closed,
    );

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

struct StreamState {
    service: Arc<SessionService>,
    session_id: String,
    receiver: broadcast::Receiver<SessionEvent>,
    ticker: Interval,
    pending: VecDeque<SessionEvent>,
    expired_sent: bool,
    done: bool,
    _guard: ConnectionGuard,
}

struct ConnectionGuard;

impl ConnectionGuard {
    fn new() -> Self {
        SSE_CONNECTIONS_ACTIVE.inc();
        ConnectionGuard
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        SSE_CONNECTIONS_ACTIVE.dec();
    }
}

/// Snapshot first, then feed events interleaved with timer ticks. The
/// stream ends once the session can no longer change.
fn create_session_stream(
    service: Arc<SessionService>,
    session_id: String,
    snapshot: SessionEvent,
    receiver: broadcast::Receiver<SessionEvent>,
    tick_interval: Duration,
    closed: bool,
) -> impl Stream<Item = Result<Event, Infallible>> {
    let mut ticker = interval(tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let state = StreamState {
        service,
        session_id,
        receiver,
        ticker,
        pending: VecDeque::from([snapshot]),
        expired_sent: false,
        done: closed,
        _guard: ConnectionGuard::new(),
    };

    stream::unfold(state, |mut st| async move {
        loop {
            if let Some(event) = st.pending.pop_front() {
                if ends_stream(&event) {
                    st.done = true;
                }
                let sse = Event::default()
                    .event(event.event_name())
                    .data(event.to_sse_data());
                return Some((Ok(sse), st));
            }
            if st.done {
                tracing::info!(session_id = %st.session_id, "SSE stream closed");
                return None;
            }

            tokio::select! {
                received = st.receiver.recv() => match received {
                    Ok(event) => st.pending.push_back(event),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(
                            session_id = %st.session_id,
                            skipped,
                            "SSE subscriber lagged; resending snapshot"
                        );
                        match st.service.snapshot(&st.session_id).await {
                            Ok(snapshot) => st.pending.push_back(snapshot),
                            Err(err) => {
                                tracing::warn!(session_id = %st.session_id, error = %err, "Snapshot failed");
                                st.done = true;
                            }
                        }
                    }
                    Err(RecvError::Closed) => st.done = true,
                },
                _ = st.ticker.tick() => on_tick(&mut st).await,
            }
        }
    })
}

/// A tick doubles as an observation: if the clock ran out, reading the
/// session finishes it and the resulting events arrive through the feed.
async fn on_tick(st: &mut StreamState) {
    let session = match st.service.observe(&st.session_id).await {
        Ok(session) => session,
        Err(err) => {
            tracing::warn!(session_id = %st.session_id, error = %err, "Timer tick failed");
            if matches!(err, SessionError::SessionNotFound(_)) {
                st.done = true;
            }
            return;
        }
    };

    let now = st.service.clock().now();
    match session.status {
        SessionStatus::Ongoing => {
            let reading = read_timer(session.status, session.start_time, session.duration, now);
            st.pending.push_back(SessionEvent::TimerTick(TimerTick {
                session_id: st.session_id.clone(),
                remaining_seconds: reading.remaining_seconds,
                elapsed_seconds: reading.elapsed_seconds,
                total_seconds: session.duration,
                timestamp: Utc::now(),
            }));
        }
        SessionStatus::Finished if !st.expired_sent => {
            let ran_out = session
                .start_time
                .is_some_and(|start| elapsed_seconds(start, now) >= session.duration);
            if ran_out {
                st.expired_sent = true;
                st.pending.push_back(SessionEvent::TimeExpired(TimeExpired {
                    session_id: st.session_id.clone(),
                    timestamp: Utc::now(),
                    message: "Time limit exceeded".to_string(),
                }));
            }
        }
        _ => {}
    }
}

fn ends_stream(event: &SessionEvent) -> bool {
    match event {
        SessionEvent::ResultsLocked(_) => true,
        SessionEvent::StatusChanged(change) => change.status == SessionStatus::Cancelled,
        _ => false,
    }
}
