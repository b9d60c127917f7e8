use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::answer::AnswerValue;
use super::leaderboard::LeaderboardEntry;
use crate::services::clock::lenient_instant;

/// The exam document a session is run against. Owned by the content side of
/// the platform; sessions only read questions from it and write back the
/// frozen results when they finish.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExamRecord {
    #[serde(rename = "_id")]
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub questions: Vec<ExamQuestion>,
    /// Overrides the default scoring table when present.
    #[serde(default)]
    pub scoring_tiers: Option<Vec<ScoringTier>>,
    #[serde(default)]
    pub locked: bool,
    #[serde(default)]
    pub leaderboard: Vec<LeaderboardEntry>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default, deserialize_with = "lenient_instant")]
    pub locked_at: Option<DateTime<Utc>>,
}

impl ExamRecord {
    pub fn question(&self, index: u32) -> Option<&ExamQuestion> {
        self.questions.get(index as usize)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExamQuestion {
    pub id: String,
    pub exercise_index: u32,
    pub kind: QuestionKind,
    pub correct: AnswerValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionKind {
    SingleChoice,
    MultiSelect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoringTier {
    pub correct: u32,
    pub incorrect: u32,
    pub bonus_threshold_seconds: u32,
    pub bonus: u32,
}
