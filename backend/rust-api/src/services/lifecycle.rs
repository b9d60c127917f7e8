use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::AbortHandle;

use crate::error::SessionError;
use crate::models::{ExamSession, SessionStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleAction {
    Start,
    Promote,
    Finish,
    Cancel,
}

impl LifecycleAction {
    pub fn verb(&self) -> &'static str {
        match self {
            LifecycleAction::Start => "start the session",
            LifecycleAction::Promote => "begin the exam",
            LifecycleAction::Finish => "finish the session",
            LifecycleAction::Cancel => "cancel the session",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartTimeWrite {
    Keep,
    Set(DateTime<Utc>),
    /// Fallback anchor for a promotion that finds no stored start time.
    SetIfMissing(DateTime<Utc>),
}

/// Top-level fields written by one transition, in a single conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionPatch {
    pub status: SessionStatus,
    pub start_time: StartTimeWrite,
    pub end_time: Option<DateTime<Utc>>,
}

impl SessionPatch {
    pub fn apply(&self, session: &mut ExamSession) {
        session.status = self.status;
        match self.start_time {
            StartTimeWrite::Keep => {}
            StartTimeWrite::Set(at) => session.start_time = Some(at),
            StartTimeWrite::SetIfMissing(at) => {
                session.start_time.get_or_insert(at);
            }
        }
        if let Some(end) = self.end_time {
            session.end_time = Some(end);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: SessionStatus,
    pub to: SessionStatus,
    pub patch: SessionPatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plan {
    Apply(Transition),
    /// The session is already where this action would take it, or the action
    /// no longer applies. Nothing to write.
    AlreadyDone,
}

/// Decides what `action` means for the session as currently observed.
/// Statuses only ever move forward; terminal states accept nothing new.
pub fn plan(
    action: LifecycleAction,
    current: SessionStatus,
    now: DateTime<Utc>,
) -> Result<Plan, SessionError> {
    let apply = |to: SessionStatus,
                 start_time: StartTimeWrite,
                 end_time: Option<DateTime<Utc>>|
     -> Result<Plan, SessionError> {
        Ok(Plan::Apply(Transition {
            from: current,
            to,
            patch: SessionPatch {
                status: to,
                start_time,
                end_time,
            },
        }))
    };
    let reject = || -> Result<Plan, SessionError> {
        Err(SessionError::InvalidTransition {
            status: current,
            action: action.verb(),
        })
    };

    use SessionStatus as S;
    match (action, current) {
        (LifecycleAction::Start, S::Waiting) => {
            apply(S::Starting, StartTimeWrite::Set(now), None)
        }
        (LifecycleAction::Start, S::Starting | S::Ongoing) => Ok(Plan::AlreadyDone),
        (LifecycleAction::Start, _) => reject(),

        (LifecycleAction::Promote, S::Starting) => {
            apply(S::Ongoing, StartTimeWrite::SetIfMissing(now), None)
        }
        (LifecycleAction::Promote, S::Waiting) => reject(),
        (LifecycleAction::Promote, _) => Ok(Plan::AlreadyDone),

        (LifecycleAction::Finish, S::Ongoing) => {
            apply(S::Finished, StartTimeWrite::Keep, Some(now))
        }
        (LifecycleAction::Finish, S::Finished) => Ok(Plan::AlreadyDone),
        (LifecycleAction::Finish, _) => reject(),

        (LifecycleAction::Cancel, S::Waiting | S::Starting | S::Ongoing) => {
            apply(S::Cancelled, StartTimeWrite::Keep, Some(now))
        }
        (LifecycleAction::Cancel, S::Cancelled) => Ok(Plan::AlreadyDone),
        (LifecycleAction::Cancel, S::Finished) => reject(),
    }
}

/// Returns a description of the first broken invariant, if any.
pub fn check_invariants(session: &ExamSession) -> Result<(), String> {
    let status = session.status;
    if status.has_start_time() != session.start_time.is_some() {
        return Err(format!(
            "start_time presence {} does not match status {}",
            session.start_time.is_some(),
            status
        ));
    }
    if status.is_terminal() != session.end_time.is_some() {
        return Err(format!(
            "end_time presence {} does not match status {}",
            session.end_time.is_some(),
            status
        ));
    }
    for (student_id, participant) in &session.participants {
        if participant.score != participant.scored_points() {
            return Err(format!(
                "score {} of {} differs from answer points {}",
                participant.score,
                student_id,
                participant.scored_points()
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for answer in participant.answers.iter().filter(|a| !a.is_draft) {
            if !seen.insert(answer.question_index) {
                return Err(format!(
                    "{} has two final answers for question {}",
                    student_id, answer.question_index
                ));
            }
        }
    }
    Ok(())
}

/// Delayed, cancellable transitions keyed by session id. A newer schedule
/// for the same session replaces the older one.
#[derive(Default, Clone)]
pub struct GraceScheduler {
    pending: Arc<Mutex<HashMap<String, (u64, AbortHandle)>>>,
    generation: Arc<AtomicU64>,
}

impl GraceScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule<F>(&self, session_id: &str, delay: Duration, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst);
        let pending = self.pending.clone();
        let key = session_id.to_string();

        // Held across the spawn so a zero delay cannot fire before registration.
        let mut map = match self.pending.lock() {
            Ok(map) => map,
            Err(poisoned) => poisoned.into_inner(),
        };

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Ok(mut map) = pending.lock() {
                if matches!(map.get(&key), Some((g, _)) if *g == generation) {
                    map.remove(&key);
                }
            }
            task.await;
        });

        if let Some((_, previous)) =
            map.insert(session_id.to_string(), (generation, handle.abort_handle()))
        {
            previous.abort();
        }
    }

    /// Drops a pending transition. Returns whether one was pending.
    pub fn cancel(&self, session_id: &str) -> bool {
        let removed = self
            .pending
            .lock()
            .ok()
            .and_then(|mut map| map.remove(session_id));
        match removed {
            Some((_, handle)) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_pending(&self, session_id: &str) -> bool {
        self.pending
            .lock()
            .map(|map| map.contains_key(session_id))
            .unwrap_or(false)
    }
}
