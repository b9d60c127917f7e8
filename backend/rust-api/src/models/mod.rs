use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::services::clock::lenient_instant;

pub mod answer;
pub mod events;
pub mod exam;
pub mod leaderboard;

pub use answer::{Answer, AnswerValue};
pub use leaderboard::LeaderboardEntry;

/// One live quiz room. Stored as a single document; each student only ever
/// writes its own `participants.<uid>` subtree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExamSession {
    #[serde(rename = "_id")]
    pub id: String,
    pub exam_id: String,
    pub facultator_id: String,
    pub class_id: String,
    pub status: SessionStatus,
    #[serde(default, deserialize_with = "lenient_instant")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "lenient_instant")]
    pub end_time: Option<DateTime<Utc>>,
    pub duration: u32,
    pub total_questions: u32,
    #[serde(default)]
    pub participants: BTreeMap<String, Participant>,
    #[serde(default)]
    pub leaderboard: Vec<LeaderboardEntry>,
    #[serde(default)]
    pub results_locked: bool,
    pub created_at: DateTime<Utc>,
}

impl ExamSession {
    pub fn participant(&self, student_id: &str) -> Option<&Participant> {
        self.participants.get(student_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Waiting,
    Starting,
    Ongoing,
    Finished,
    Cancelled,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Waiting => "waiting",
            SessionStatus::Starting => "starting",
            SessionStatus::Ongoing => "ongoing",
            SessionStatus::Finished => "finished",
            SessionStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Finished | SessionStatus::Cancelled)
    }

    /// Whether the authoritative clock has been anchored for this status.
    pub fn has_start_time(&self) -> bool {
        matches!(
            self,
            SessionStatus::Starting | SessionStatus::Ongoing | SessionStatus::Finished
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One student's in-session state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub name: String,
    pub score: u32,
    pub current_question: u32,
    #[serde(default)]
    pub answers: Vec<Answer>,
    #[serde(default)]
    pub submitted: bool,
    pub joined_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub submitted_at: Option<DateTime<Utc>>,
    /// Compare-and-swap token for writes to this subtree.
    #[serde(default)]
    pub revision: u64,
}

impl Participant {
    pub fn new(name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            score: 0,
            current_question: 0,
            answers: Vec::new(),
            submitted: false,
            joined_at: now,
            last_updated: now,
            completed_at: None,
            submitted_at: None,
            revision: 0,
        }
    }

    pub fn final_answer(&self, question_index: u32) -> Option<&Answer> {
        self.answers
            .iter()
            .find(|a| a.question_index == question_index && !a.is_draft)
    }

    pub fn draft(&self, question_index: u32) -> Option<&Answer> {
        self.answers
            .iter()
            .find(|a| a.question_index == question_index && a.is_draft)
    }

    /// Sum of points over finalized answers; the only source of `score`.
    pub fn scored_points(&self) -> u32 {
        self.answers
            .iter()
            .filter(|a| !a.is_draft)
            .fold(0u32, |total, a| total.saturating_add(a.points))
    }

    pub fn correct_count(&self) -> u32 {
        self.answers
            .iter()
            .filter(|a| !a.is_draft && a.is_correct)
            .count() as u32
    }

    pub fn answered_count(&self) -> u32 {
        self.answers.iter().filter(|a| !a.is_draft).count() as u32
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateSessionRequest {
    #[validate(length(min = 1, max = 128))]
    pub exam_id: String,
    #[validate(length(min = 1, max = 128))]
    pub teacher_id: String,
    #[validate(length(min = 1, max = 128))]
    pub class_id: String,
    #[validate(range(min = 1, max = 500))]
    pub total_questions: Option<u32>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct JoinSessionRequest {
    #[validate(length(min = 1, max = 128))]
    pub student_id: String,
    #[validate(length(min = 1, max = 100))]
    pub name: String,
}

/// Read model returned to clients: the stored session plus values derived
/// from the authoritative clock at read time.
#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    pub session_id: String,
    #[serde(flatten)]
    pub session: ExamSession,
    pub elapsed_seconds: u32,
    pub remaining_seconds: u32,
    pub ranking: Vec<leaderboard::RankedRow>,
    /// How often clients should autosave multi-select drafts.
    pub autosave_interval_seconds: u64,
    pub server_time: DateTime<Utc>,
}
