use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use uuid::Uuid;
use validator::Validate;

use crate::error::SessionError;
use crate::metrics::{
    record_transition, ANSWERS_SUBMITTED_TOTAL, DRAFT_AUTOSAVES_TOTAL,
    DUPLICATE_SUBMISSIONS_TOTAL, EXAM_SESSIONS_ACTIVE, EXAM_SESSIONS_TOTAL,
};
use crate::models::answer::{
    AnswerResult, CompleteRequest, DraftAnswerRequest, DraftOutcome, SubmitAnswerRequest,
};
use crate::models::events::{
    ParticipantChanged, ResultsLocked, SessionEvent, SessionSnapshot, StatusChanged,
};
use crate::models::exam::{ExamQuestion, ExamRecord};
use crate::models::leaderboard::RankedRow;
use crate::models::{
    AnswerValue, CreateSessionRequest, ExamSession, JoinSessionRequest, Participant,
    SessionStatus, SessionView,
};
use crate::services::clock::{elapsed_seconds, read_timer, Clock};
use crate::services::leaderboard;
use crate::services::lifecycle::{plan, GraceScheduler, LifecycleAction, Plan, Transition};
use crate::services::notifier::ChangeFeed;
use crate::services::participants;
use crate::services::scoring::ScoringEngine;
use crate::services::store::{ParticipantWrite, SessionStore, WriteOutcome};
use crate::utils::retry::{retry_async_with_config, RetryConfig};

const JOINABLE: &[SessionStatus] = &[
    SessionStatus::Waiting,
    SessionStatus::Starting,
    SessionStatus::Ongoing,
];
const ANSWERABLE: &[SessionStatus] = &[SessionStatus::Ongoing];

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub duration_seconds: u32,
    pub grace_delay: Duration,
    pub autosave_interval: Duration,
    pub max_write_attempts: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            duration_seconds: 420,
            grace_delay: Duration::from_millis(3000),
            autosave_interval: Duration::from_secs(3),
            max_write_attempts: 5,
        }
    }
}

/// Entry point for every session operation. Store I/O is retried with
/// backoff; conditional-write conflicts re-read the session and re-plan.
pub struct SessionService {
    store: Arc<dyn SessionStore>,
    clock: Arc<dyn Clock>,
    settings: SessionSettings,
    feed: ChangeFeed,
    scheduler: GraceScheduler,
    retry: RetryConfig,
}

impl SessionService {
    pub fn new(store: Arc<dyn SessionStore>, clock: Arc<dyn Clock>, settings: SessionSettings) -> Self {
        let retry = RetryConfig::with_attempts(settings.max_write_attempts);
        Self {
            store,
            clock,
            settings,
            feed: ChangeFeed::default(),
            scheduler: GraceScheduler::new(),
            retry,
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn promotion_pending(&self, session_id: &str) -> bool {
        self.scheduler.is_pending(session_id)
    }

    pub fn subscribe(&self, session_id: &str) -> broadcast::Receiver<SessionEvent> {
        self.feed.subscribe(session_id)
    }

    pub fn subscriber_count(&self, session_id: &str) -> usize {
        self.feed.subscriber_count(session_id)
    }

    pub async fn create_session(&self, req: CreateSessionRequest) -> Result<ExamSession, SessionError> {
        req.validate()?;

        let exam = self.exam(&req.exam_id).await?;
        let total_questions = match req.total_questions {
            Some(count) => count,
            None => u32::try_from(exam.questions.len()).unwrap_or(u32::MAX),
        };
        if total_questions == 0 {
            return Err(SessionError::Validation(format!(
                "exam {} has no questions",
                exam.id
            )));
        }

        let session = ExamSession {
            id: Uuid::new_v4().to_string(),
            exam_id: req.exam_id,
            facultator_id: req.teacher_id,
            class_id: req.class_id,
            status: SessionStatus::Waiting,
            start_time: None,
            end_time: None,
            duration: self.settings.duration_seconds,
            total_questions,
            participants: Default::default(),
            leaderboard: Vec::new(),
            results_locked: false,
            created_at: self.clock.now(),
        };

        self.with_store(|| self.store.insert_session(&session)).await?;

        EXAM_SESSIONS_TOTAL.with_label_values(&["created"]).inc();
        tracing::info!(
            session_id = %session.id,
            exam_id = %session.exam_id,
            total_questions,
            "Exam session created"
        );
        Ok(session)
    }

    /// waiting -> starting, then ongoing after the grace delay.
    pub async fn start_session(self: &Arc<Self>, session_id: &str) -> Result<ExamSession, SessionError> {
        let (session, transition) = self.apply_action(session_id, LifecycleAction::Start).await?;

        if transition.is_some() {
            EXAM_SESSIONS_ACTIVE.inc();
            EXAM_SESSIONS_TOTAL.with_label_values(&["started"]).inc();

            let service = Arc::clone(self);
            let id = session_id.to_string();
            self.scheduler
                .schedule(session_id, self.settings.grace_delay, async move {
                    if let Err(err) = service.promote(&id).await {
                        tracing::warn!(session_id = %id, error = %err, "Scheduled promotion failed");
                    }
                });
        }
        Ok(session)
    }

    /// starting -> ongoing. Re-checks the stored status, so a promotion that
    /// fires after a cancel or finish does nothing.
    pub async fn promote(&self, session_id: &str) -> Result<ExamSession, SessionError> {
        let (session, _) = self.apply_action(session_id, LifecycleAction::Promote).await?;
        Ok(session)
    }

    /// Explicit teacher finish. Safe to race with the automatic one: only one
    /// caller moves the status and only one frozen leaderboard is written.
    pub async fn finish_session(&self, session_id: &str) -> Result<ExamSession, SessionError> {
        let (session, transition) = self.apply_action(session_id, LifecycleAction::Finish).await?;

        if transition.is_some() {
            self.scheduler.cancel(session_id);
            EXAM_SESSIONS_ACTIVE.dec();
            EXAM_SESSIONS_TOTAL.with_label_values(&["finished"]).inc();
        }

        if session.status == SessionStatus::Finished && !session.results_locked {
            return self.lock_results(session_id).await;
        }
        Ok(session)
    }

    pub async fn cancel_session(&self, session_id: &str) -> Result<ExamSession, SessionError> {
        let (session, transition) = self.apply_action(session_id, LifecycleAction::Cancel).await?;

        if let Some(transition) = transition {
            self.scheduler.cancel(session_id);
            if transition.from != SessionStatus::Waiting {
                EXAM_SESSIONS_ACTIVE.dec();
            }
            EXAM_SESSIONS_TOTAL.with_label_values(&["cancelled"]).inc();
        }
        Ok(session)
    }

    /// Reads the session and acts on what the clock says: an expired
    /// `ongoing` session is finished on the spot, and a finished session
    /// whose results never got locked is locked now.
    pub async fn observe(&self, session_id: &str) -> Result<ExamSession, SessionError> {
        let session = self.load(session_id).await?;

        match session.status {
            SessionStatus::Ongoing => {
                let reading = read_timer(
                    session.status,
                    session.start_time,
                    session.duration,
                    self.clock.now(),
                );
                if !reading.is_expired() {
                    return Ok(session);
                }
                tracing::info!(session_id, "Session time expired; finishing");
                match self.finish_session(session_id).await {
                    Ok(finished) => Ok(finished),
                    // Cancelled in between: report what is stored.
                    Err(SessionError::InvalidTransition { .. }) => self.load(session_id).await,
                    Err(err) => Err(err),
                }
            }
            SessionStatus::Finished if !session.results_locked => self.lock_results(session_id).await,
            _ => Ok(session),
        }
    }

    pub async fn get_session(&self, session_id: &str) -> Result<SessionView, SessionError> {
        let session = self.observe(session_id).await?;
        Ok(self.view(session))
    }

    pub async fn leaderboard(&self, session_id: &str) -> Result<Vec<RankedRow>, SessionError> {
        let session = self.observe(session_id).await?;
        Ok(ranking(&session))
    }

    pub async fn snapshot(&self, session_id: &str) -> Result<SessionEvent, SessionError> {
        let session = self.observe(session_id).await?;
        Ok(self.snapshot_event(&session))
    }

    pub fn view(&self, session: ExamSession) -> SessionView {
        let now = self.clock.now();
        let reading = read_timer(session.status, session.start_time, session.duration, now);
        SessionView {
            session_id: session.id.clone(),
            elapsed_seconds: reading.elapsed_seconds,
            remaining_seconds: reading.remaining_seconds,
            ranking: ranking(&session),
            autosave_interval_seconds: self.settings.autosave_interval.as_secs(),
            server_time: now,
            session,
        }
    }

    pub async fn join_session(
        &self,
        session_id: &str,
        req: JoinSessionRequest,
    ) -> Result<Participant, SessionError> {
        req.validate()?;
        participants::validate_student_id(&req.student_id)?;
        let student_id = req.student_id.as_str();

        for _ in 0..self.settings.max_write_attempts.max(1) {
            let session = self.load(session_id).await?;
            if session.status.is_terminal() {
                return Err(SessionError::InvalidTransition {
                    status: session.status,
                    action: "join the session",
                });
            }

            let existing = session.participant(student_id);
            let next = participants::register(existing, &req.name, self.clock.now());
            let write = ParticipantWrite {
                student_id,
                participant: &next,
                expected_revision: existing.map(|p| p.revision),
                allowed_statuses: JOINABLE,
            };

            if self.put_participant(session_id, write).await? == WriteOutcome::Applied {
                tracing::info!(session_id, student_id, rejoin = existing.is_some(), "Student joined");
                self.feed.publish(SessionEvent::ParticipantJoined(participant_event(
                    session_id, student_id, &next, None,
                )));
                return Ok(next);
            }
        }

        Err(self.contention(session_id, student_id))
    }

    /// Final answer for one question. Correctness and `time_used` are decided
    /// here from the exam and the authoritative clock.
    pub async fn submit_answer(
        &self,
        session_id: &str,
        student_id: &str,
        req: SubmitAnswerRequest,
    ) -> Result<AnswerResult, SessionError> {
        req.validate()?;
        participants::validate_student_id(student_id)?;

        let mut session = self.observe(session_id).await?;
        let exam = self.exam(&session.exam_id).await?;
        let engine = ScoringEngine::for_exam(exam.scoring_tiers.as_deref());
        let question = question_for(&session, &exam, req.question_index)?;

        for attempt in 0..self.settings.max_write_attempts.max(1) {
            if attempt > 0 {
                session = self.observe(session_id).await?;
            }
            if session.status != SessionStatus::Ongoing {
                return Err(SessionError::InvalidTransition {
                    status: session.status,
                    action: "submit an answer",
                });
            }
            let current = session
                .participant(student_id)
                .ok_or_else(|| SessionError::ParticipantNotFound(student_id.to_string()))?;

            let now = self.clock.now();
            let time_used = self.time_used(&session, now);
            let answer = participants::grade_answer(
                question,
                req.question_index,
                req.answer.clone(),
                &engine,
                time_used,
                now,
            )?;
            let next = match participants::record_answer(current, student_id, answer, now) {
                Ok(next) => next,
                Err(err) => {
                    if let SessionError::DuplicateSubmission { .. } = err {
                        DUPLICATE_SUBMISSIONS_TOTAL
                            .with_label_values(&["already_answered"])
                            .inc();
                    }
                    return Err(err);
                }
            };

            let write = ParticipantWrite {
                student_id,
                participant: &next,
                expected_revision: Some(current.revision),
                allowed_statuses: ANSWERABLE,
            };
            if self.put_participant(session_id, write).await? == WriteOutcome::Conflict {
                tracing::debug!(session_id, student_id, attempt, "Answer write conflicted; retrying");
                continue;
            }

            let recorded = next.final_answer(req.question_index).cloned();
            let Some(recorded) = recorded else {
                return Err(SessionError::TransientStoreFailure(
                    "recorded answer missing after write".into(),
                ));
            };

            ANSWERS_SUBMITTED_TOTAL
                .with_label_values(&[if recorded.is_correct { "true" } else { "false" }])
                .inc();
            tracing::info!(
                session_id,
                student_id,
                question_index = req.question_index,
                is_correct = recorded.is_correct,
                points = recorded.points,
                "Answer recorded"
            );
            self.feed.publish(SessionEvent::AnswerRecorded(participant_event(
                session_id,
                student_id,
                &next,
                Some(req.question_index),
            )));

            return Ok(AnswerResult {
                question_index: recorded.question_index,
                is_correct: recorded.is_correct,
                points: recorded.points,
                base_points: recorded.base_points,
                bonus_points: recorded.bonus_points,
                time_used: recorded.time_used,
                total_score: next.score,
                current_question: next.current_question,
            });
        }

        Err(self.contention(session_id, student_id))
    }

    /// Best effort: never fails the caller. The outcome says whether the
    /// draft landed.
    pub async fn autosave_draft(
        &self,
        session_id: &str,
        student_id: &str,
        req: DraftAnswerRequest,
    ) -> DraftOutcome {
        let outcome = match self.try_autosave(session_id, student_id, req).await {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::warn!(session_id, student_id, error = %err, "Draft autosave dropped");
                DraftOutcome::Failed
            }
        };

        let label = match outcome {
            DraftOutcome::Saved => "saved",
            DraftOutcome::Skipped => "skipped",
            DraftOutcome::Failed => "failed",
        };
        DRAFT_AUTOSAVES_TOTAL.with_label_values(&[label]).inc();
        outcome
    }

    async fn try_autosave(
        &self,
        session_id: &str,
        student_id: &str,
        req: DraftAnswerRequest,
    ) -> Result<DraftOutcome, SessionError> {
        req.validate()?;
        participants::validate_student_id(student_id)?;

        let session = self
            .store
            .load_session(session_id)
            .await
            .map_err(SessionError::store)?
            .ok_or_else(|| SessionError::SessionNotFound(session_id.to_string()))?;
        if session.status != SessionStatus::Ongoing {
            return Ok(DraftOutcome::Skipped);
        }
        let current = session
            .participant(student_id)
            .ok_or_else(|| SessionError::ParticipantNotFound(student_id.to_string()))?;
        if current.submitted {
            return Ok(DraftOutcome::Skipped);
        }

        let exam = self
            .store
            .load_exam(&session.exam_id)
            .await
            .map_err(SessionError::store)?
            .ok_or_else(|| SessionError::ExamNotFound(session.exam_id.clone()))?;
        let question = question_for(&session, &exam, req.question_index)?;

        let now = self.clock.now();
        let next = participants::record_draft(
            current,
            student_id,
            question,
            req.question_index,
            AnswerValue::Multiple(req.selected),
            self.time_used(&session, now),
            now,
        )?;
        let Some(next) = next else {
            return Ok(DraftOutcome::Skipped);
        };

        let write = ParticipantWrite {
            student_id,
            participant: &next,
            expected_revision: Some(current.revision),
            allowed_statuses: ANSWERABLE,
        };
        // One attempt only; the client autosaves again shortly anyway.
        let outcome = self
            .store
            .put_participant(session_id, write)
            .await
            .map_err(SessionError::store)?;
        if outcome == WriteOutcome::Conflict {
            return Err(SessionError::BestEffortFailure(
                "participant changed during autosave".into(),
            ));
        }

        self.feed.publish(SessionEvent::DraftSaved(participant_event(
            session_id,
            student_id,
            &next,
            Some(req.question_index),
        )));
        Ok(DraftOutcome::Saved)
    }

    /// Marks the student done. A second call returns the stored state
    /// unchanged.
    pub async fn complete_for_student(
        &self,
        session_id: &str,
        student_id: &str,
        summary: CompleteRequest,
    ) -> Result<Participant, SessionError> {
        participants::validate_student_id(student_id)?;

        for _ in 0..self.settings.max_write_attempts.max(1) {
            let session = self.observe(session_id).await?;
            let current = session
                .participant(student_id)
                .ok_or_else(|| SessionError::ParticipantNotFound(student_id.to_string()))?;
            if current.submitted {
                return Ok(current.clone());
            }
            if session.status != SessionStatus::Ongoing {
                return Err(SessionError::InvalidTransition {
                    status: session.status,
                    action: "complete the exam",
                });
            }

            let Some(next) = participants::complete(
                current,
                &summary,
                session.total_questions,
                self.clock.now(),
            ) else {
                return Ok(current.clone());
            };

            let write = ParticipantWrite {
                student_id,
                participant: &next,
                expected_revision: Some(current.revision),
                allowed_statuses: ANSWERABLE,
            };
            if self.put_participant(session_id, write).await? == WriteOutcome::Applied {
                tracing::info!(session_id, student_id, score = next.score, "Student completed");
                self.feed.publish(SessionEvent::StudentCompleted(participant_event(
                    session_id, student_id, &next, None,
                )));
                return Ok(next);
            }
        }

        Err(self.contention(session_id, student_id))
    }

    pub fn snapshot_event(&self, session: &ExamSession) -> SessionEvent {
        let now = self.clock.now();
        let reading = read_timer(session.status, session.start_time, session.duration, now);
        SessionEvent::Snapshot(SessionSnapshot {
            session_id: session.id.clone(),
            status: session.status,
            start_time: session.start_time,
            end_time: session.end_time,
            duration: session.duration,
            remaining_seconds: reading.remaining_seconds,
            ranking: ranking(session),
            timestamp: now,
        })
    }

    /// Plans `action` against the stored status and applies it with a
    /// compare-and-swap. Returns the resulting session and the transition
    /// this caller applied, if any.
    async fn apply_action(
        &self,
        session_id: &str,
        action: LifecycleAction,
    ) -> Result<(ExamSession, Option<Transition>), SessionError> {
        for _ in 0..self.settings.max_write_attempts.max(1) {
            let mut session = self.load(session_id).await?;
            let now = self.clock.now();

            let transition = match plan(action, session.status, now) {
                Ok(Plan::Apply(transition)) => transition,
                Ok(Plan::AlreadyDone) => return Ok((session, None)),
                Err(err) => {
                    tracing::info!(session_id, status = %session.status, ?action, "Transition rejected");
                    return Err(err);
                }
            };

            let outcome = self
                .with_store(|| self.store.transition(session_id, transition.from, &transition.patch))
                .await?;
            match outcome {
                WriteOutcome::Applied => {
                    record_transition(transition.from.as_str(), transition.to.as_str(), "applied");
                    transition.patch.apply(&mut session);
                    tracing::info!(
                        session_id,
                        from = %transition.from,
                        to = %transition.to,
                        "Session status changed"
                    );
                    self.feed.publish(SessionEvent::StatusChanged(StatusChanged {
                        session_id: session_id.to_string(),
                        status: session.status,
                        start_time: session.start_time,
                        end_time: session.end_time,
                        timestamp: now,
                    }));
                    return Ok((session, Some(transition)));
                }
                WriteOutcome::Conflict => {
                    record_transition(transition.from.as_str(), transition.to.as_str(), "conflict");
                    tracing::debug!(session_id, ?action, "Status moved underneath us; re-planning");
                }
            }
        }

        Err(SessionError::TransientStoreFailure(format!(
            "session {} kept changing during {:?}",
            session_id, action
        )))
    }

    /// Freezes participants and writes the final leaderboard, to the exam
    /// record first and then, exactly once, to the session. Reads the
    /// participants fresh: once the status is `finished` no participant write
    /// can land, so this snapshot includes every accepted answer.
    async fn lock_results(&self, session_id: &str) -> Result<ExamSession, SessionError> {
        let mut session = self.load(session_id).await?;
        if session.status != SessionStatus::Finished || session.results_locked {
            return Ok(session);
        }

        let now = self.clock.now();
        for participant in session.participants.values_mut() {
            participants::freeze(participant, now);
        }
        let board = leaderboard::calculate(&session.participants);

        let exam_found = self
            .with_store(|| self.store.load_exam(&session.exam_id))
            .await?
            .is_some();
        if exam_found {
            self.with_store(|| {
                self.store
                    .lock_exam(&session.exam_id, &session.id, &board, now)
            })
            .await?;
        } else {
            tracing::warn!(
                session_id = %session.id,
                exam_id = %session.exam_id,
                "Exam record missing; results locked on the session only"
            );
        }

        let outcome = self
            .with_store(|| {
                self.store
                    .lock_results(&session.id, &session.participants, &board)
            })
            .await?;
        if outcome == WriteOutcome::Conflict {
            // Another finisher got there first.
            return self.load(&session.id).await;
        }

        tracing::info!(
            session_id = %session.id,
            participants = board.len(),
            "Session results locked"
        );
        self.feed.publish(SessionEvent::ResultsLocked(ResultsLocked {
            session_id: session.id.clone(),
            leaderboard: board.clone(),
            timestamp: now,
        }));
        session.leaderboard = board;
        session.results_locked = true;
        Ok(session)
    }

    async fn load(&self, session_id: &str) -> Result<ExamSession, SessionError> {
        self.with_store(|| self.store.load_session(session_id))
            .await?
            .ok_or_else(|| SessionError::SessionNotFound(session_id.to_string()))
    }

    async fn exam(&self, exam_id: &str) -> Result<ExamRecord, SessionError> {
        self.with_store(|| self.store.load_exam(exam_id))
            .await?
            .ok_or_else(|| SessionError::ExamNotFound(exam_id.to_string()))
    }

    async fn put_participant(
        &self,
        session_id: &str,
        write: ParticipantWrite<'_>,
    ) -> Result<WriteOutcome, SessionError> {
        self.with_store(|| self.store.put_participant(session_id, write))
            .await
    }

    async fn with_store<T, F, Fut>(&self, op: F) -> Result<T, SessionError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        retry_async_with_config(self.retry.clone(), op)
            .await
            .map_err(|err| {
                tracing::warn!(error = %err, "Store operation failed after retries");
                SessionError::store(err)
            })
    }

    fn time_used(&self, session: &ExamSession, now: chrono::DateTime<Utc>) -> u32 {
        session
            .start_time
            .map(|start| elapsed_seconds(start, now).min(session.duration))
            .unwrap_or(0)
    }

    fn contention(&self, session_id: &str, student_id: &str) -> SessionError {
        tracing::warn!(session_id, student_id, "Participant write kept conflicting");
        SessionError::TransientStoreFailure(format!(
            "participant {} in session {} is being updated concurrently",
            student_id, session_id
        ))
    }
}

fn question_for<'a>(
    session: &ExamSession,
    exam: &'a ExamRecord,
    question_index: u32,
) -> Result<&'a ExamQuestion, SessionError> {
    if question_index >= session.total_questions {
        return Err(SessionError::UnknownQuestion(question_index));
    }
    exam.question(question_index)
        .ok_or(SessionError::UnknownQuestion(question_index))
}

/// Locked sessions show the frozen board; live ones are ranked on read.
fn ranking(session: &ExamSession) -> Vec<RankedRow> {
    if session.results_locked {
        session
            .leaderboard
            .iter()
            .cloned()
            .map(RankedRow::from)
            .collect()
    } else {
        leaderboard::ranked_rows(&session.participants)
    }
}

fn participant_event(
    session_id: &str,
    student_id: &str,
    participant: &Participant,
    question_index: Option<u32>,
) -> ParticipantChanged {
    ParticipantChanged {
        session_id: session_id.to_string(),
        student_id: student_id.to_string(),
        name: participant.name.clone(),
        score: participant.score,
        current_question: participant.current_question,
        submitted: participant.submitted,
        question_index,
        timestamp: participant.last_updated,
    }
}
