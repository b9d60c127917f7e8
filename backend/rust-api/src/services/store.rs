use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::exam::ExamRecord;
use crate::models::{ExamSession, LeaderboardEntry, Participant, SessionStatus};
use crate::services::lifecycle::SessionPatch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Applied,
    /// A precondition no longer held (status moved on, or someone else wrote
    /// the subtree first). Nothing was written.
    Conflict,
}

/// Scoped write of one `participants.<student_id>` subtree.
#[derive(Debug, Clone, Copy)]
pub struct ParticipantWrite<'a> {
    pub student_id: &'a str,
    pub participant: &'a Participant,
    /// Revision last observed; `None` means the participant must not exist.
    pub expected_revision: Option<u64>,
    pub allowed_statuses: &'a [SessionStatus],
}

/// Persistence for session documents and the exam records they reference.
/// Every mutating call is conditional so concurrent writers never clobber
/// one another.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn insert_session(&self, session: &ExamSession) -> Result<()>;

    async fn load_session(&self, session_id: &str) -> Result<Option<ExamSession>>;

    async fn list_session_ids(&self, status: SessionStatus) -> Result<Vec<String>>;

    async fn put_participant(
        &self,
        session_id: &str,
        write: ParticipantWrite<'_>,
    ) -> Result<WriteOutcome>;

    /// Applies `patch` only if the stored status still equals `expected`.
    async fn transition(
        &self,
        session_id: &str,
        expected: SessionStatus,
        patch: &SessionPatch,
    ) -> Result<WriteOutcome>;

    /// Writes the frozen participants and leaderboard of a finished session,
    /// once.
    async fn lock_results(
        &self,
        session_id: &str,
        participants: &BTreeMap<String, Participant>,
        leaderboard: &[LeaderboardEntry],
    ) -> Result<WriteOutcome>;

    async fn load_exam(&self, exam_id: &str) -> Result<Option<ExamRecord>>;

    async fn lock_exam(
        &self,
        exam_id: &str,
        session_id: &str,
        leaderboard: &[LeaderboardEntry],
        locked_at: DateTime<Utc>,
    ) -> Result<()>;

    async fn ping(&self) -> Result<()>;
}

/// Process-local store with the same conditional-write contract as the
/// MongoDB one.
#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: Mutex<HashMap<String, ExamSession>>,
    exams: Mutex<HashMap<String, ExamRecord>>,
    injected_failures: AtomicUsize,
    results_writes: AtomicUsize,
    exam_locks: AtomicUsize,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_exam(&self, exam: ExamRecord) {
        if let Ok(mut exams) = self.exams.lock() {
            exams.insert(exam.id.clone(), exam);
        }
    }

    /// The next `count` mutating calls fail as if the backend were down.
    pub fn fail_next_writes(&self, count: usize) {
        self.injected_failures.store(count, Ordering::SeqCst);
    }

    pub fn results_writes(&self) -> usize {
        self.results_writes.load(Ordering::SeqCst)
    }

    pub fn exam_locks(&self) -> usize {
        self.exam_locks.load(Ordering::SeqCst)
    }

    /// Direct access for tests that need to corrupt or inspect a document.
    pub fn update_raw<F>(&self, session_id: &str, mutate: F) -> bool
    where
        F: FnOnce(&mut ExamSession),
    {
        match self.sessions.lock() {
            Ok(mut sessions) => match sessions.get_mut(session_id) {
                Some(session) => {
                    mutate(session);
                    true
                }
                None => false,
            },
            Err(_) => false,
        }
    }

    fn check_injected_failure(&self) -> Result<()> {
        let injected = self
            .injected_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| {
                left.checked_sub(1)
            })
            .is_ok();
        if injected {
            bail!("injected store failure");
        }
        Ok(())
    }

    fn sessions(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, ExamSession>>> {
        self.sessions
            .lock()
            .map_err(|_| anyhow!("session map poisoned"))
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn insert_session(&self, session: &ExamSession) -> Result<()> {
        self.check_injected_failure()?;
        let mut sessions = self.sessions()?;
        if sessions.contains_key(&session.id) {
            bail!("session {} already exists", session.id);
        }
        sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn load_session(&self, session_id: &str) -> Result<Option<ExamSession>> {
        Ok(self.sessions()?.get(session_id).cloned())
    }

    async fn list_session_ids(&self, status: SessionStatus) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self
            .sessions()?
            .values()
            .filter(|s| s.status == status)
            .map(|s| s.id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn put_participant(
        &self,
        session_id: &str,
        write: ParticipantWrite<'_>,
    ) -> Result<WriteOutcome> {
        self.check_injected_failure()?;
        let mut sessions = self.sessions()?;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| anyhow!("session {} not found", session_id))?;

        if !write.allowed_statuses.contains(&session.status) {
            return Ok(WriteOutcome::Conflict);
        }
        let current = session.participants.get(write.student_id).map(|p| p.revision);
        if current != write.expected_revision {
            return Ok(WriteOutcome::Conflict);
        }

        session
            .participants
            .insert(write.student_id.to_string(), write.participant.clone());
        Ok(WriteOutcome::Applied)
    }

    async fn transition(
        &self,
        session_id: &str,
        expected: SessionStatus,
        patch: &SessionPatch,
    ) -> Result<WriteOutcome> {
        self.check_injected_failure()?;
        let mut sessions = self.sessions()?;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| anyhow!("session {} not found", session_id))?;

        if session.status != expected {
            return Ok(WriteOutcome::Conflict);
        }
        patch.apply(session);
        Ok(WriteOutcome::Applied)
    }

    async fn lock_results(
        &self,
        session_id: &str,
        participants: &BTreeMap<String, Participant>,
        leaderboard: &[LeaderboardEntry],
    ) -> Result<WriteOutcome> {
        self.check_injected_failure()?;
        let mut sessions = self.sessions()?;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| anyhow!("session {} not found", session_id))?;

        if session.status != SessionStatus::Finished || session.results_locked {
            return Ok(WriteOutcome::Conflict);
        }
        session.participants = participants.clone();
        session.leaderboard = leaderboard.to_vec();
        session.results_locked = true;
        self.results_writes.fetch_add(1, Ordering::SeqCst);
        Ok(WriteOutcome::Applied)
    }

    async fn load_exam(&self, exam_id: &str) -> Result<Option<ExamRecord>> {
        let exams = self.exams.lock().map_err(|_| anyhow!("exam map poisoned"))?;
        Ok(exams.get(exam_id).cloned())
    }

    async fn lock_exam(
        &self,
        exam_id: &str,
        session_id: &str,
        leaderboard: &[LeaderboardEntry],
        locked_at: DateTime<Utc>,
    ) -> Result<()> {
        self.check_injected_failure()?;
        let mut exams = self.exams.lock().map_err(|_| anyhow!("exam map poisoned"))?;
        let exam = exams
            .get_mut(exam_id)
            .ok_or_else(|| anyhow!("exam {} not found", exam_id))?;
        exam.locked = true;
        exam.leaderboard = leaderboard.to_vec();
        exam.session_id = Some(session_id.to_string());
        exam.locked_at = Some(locked_at);
        self.exam_locks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        self.sessions().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::lifecycle::StartTimeWrite;
    use chrono::TimeZone;

    fn session(id: &str) -> ExamSession {
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap();
        ExamSession {
            id: id.to_string(),
            exam_id: "exam-1".to_string(),
            facultator_id: "teacher-1".to_string(),
            class_id: "class-1".to_string(),
            status: SessionStatus::Waiting,
            start_time: None,
            end_time: None,
            duration: 420,
            total_questions: 3,
            participants: BTreeMap::new(),
            leaderboard: Vec::new(),
            results_locked: false,
            created_at: now,
        }
    }

    #[tokio::test]
    async fn transition_is_compare_and_swap() {
        let store = InMemorySessionStore::new();
        store.insert_session(&session("s1")).await.unwrap();
        let now = Utc::now();
        let patch = SessionPatch {
            status: SessionStatus::Starting,
            start_time: StartTimeWrite::Set(now),
            end_time: None,
        };

        let first = store
            .transition("s1", SessionStatus::Waiting, &patch)
            .await
            .unwrap();
        let second = store
            .transition("s1", SessionStatus::Waiting, &patch)
            .await
            .unwrap();
        assert_eq!(first, WriteOutcome::Applied);
        assert_eq!(second, WriteOutcome::Conflict);

        let stored = store.load_session("s1").await.unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::Starting);
        assert_eq!(stored.start_time, Some(now));
    }

    #[tokio::test]
    async fn participant_write_checks_revision_and_status() {
        let store = InMemorySessionStore::new();
        store.insert_session(&session("s1")).await.unwrap();
        let p = Participant::new("Ann", Utc::now());

        let write = ParticipantWrite {
            student_id: "ann",
            participant: &p,
            expected_revision: None,
            allowed_statuses: &[SessionStatus::Waiting],
        };
        assert_eq!(
            store.put_participant("s1", write).await.unwrap(),
            WriteOutcome::Applied
        );
        // Stale "must not exist" precondition.
        assert_eq!(
            store.put_participant("s1", write).await.unwrap(),
            WriteOutcome::Conflict
        );

        let mut next = p.clone();
        next.revision = 1;
        let wrong_status = ParticipantWrite {
            student_id: "ann",
            participant: &next,
            expected_revision: Some(0),
            allowed_statuses: &[SessionStatus::Ongoing],
        };
        assert_eq!(
            store.put_participant("s1", wrong_status).await.unwrap(),
            WriteOutcome::Conflict
        );
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let store = InMemorySessionStore::new();
        store.fail_next_writes(1);
        assert!(store.insert_session(&session("s1")).await.is_err());
        assert!(store.insert_session(&session("s1")).await.is_ok());
    }

    #[tokio::test]
    async fn results_lock_only_once() {
        let store = InMemorySessionStore::new();
        let mut finished = session("s1");
        finished.status = SessionStatus::Finished;
        store.insert_session(&finished).await.unwrap();

        let participants = BTreeMap::new();
        let first = store.lock_results("s1", &participants, &[]).await.unwrap();
        let second = store.lock_results("s1", &participants, &[]).await.unwrap();
        assert_eq!(first, WriteOutcome::Applied);
        assert_eq!(second, WriteOutcome::Conflict);
        assert_eq!(store.results_writes(), 1);
    }
}
