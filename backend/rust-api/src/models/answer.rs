use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

/// A chosen option index, or a set of them for multi-select questions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AnswerValue {
    Single(u32),
    Multiple(BTreeSet<u32>),
}

impl AnswerValue {
    /// Exact match only: a multi-select answer must equal the correct set,
    /// a subset or superset earns nothing.
    pub fn matches(&self, correct: &AnswerValue) -> bool {
        match (self, correct) {
            (AnswerValue::Single(a), AnswerValue::Single(b)) => a == b,
            (AnswerValue::Multiple(a), AnswerValue::Multiple(b)) => a == b,
            (AnswerValue::Single(a), AnswerValue::Multiple(b))
            | (AnswerValue::Multiple(b), AnswerValue::Single(a)) => {
                b.len() == 1 && b.contains(a)
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, AnswerValue::Multiple(set) if set.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Answer {
    pub question_id: String,
    pub question_index: u32,
    pub exercise_index: u32,
    pub answer: AnswerValue,
    pub is_correct: bool,
    pub points: u32,
    pub base_points: u32,
    pub bonus_points: u32,
    pub time_used: u32,
    #[serde(default)]
    pub is_draft: bool,
    pub answered_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct SubmitAnswerRequest {
    #[validate(range(max = 500))]
    pub question_index: u32,
    pub answer: AnswerValue,
}

#[derive(Debug, Deserialize, Validate)]
pub struct DraftAnswerRequest {
    #[validate(range(max = 500))]
    pub question_index: u32,
    pub selected: BTreeSet<u32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CompleteRequest {
    /// Progress reached on the client when time ran out or the student
    /// pressed submit. Never lowers the stored value.
    pub current_question: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswerResult {
    pub question_index: u32,
    pub is_correct: bool,
    pub points: u32,
    pub base_points: u32,
    pub bonus_points: u32,
    pub time_used: u32,
    pub total_score: u32,
    pub current_question: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DraftOutcome {
    Saved,
    Skipped,
    Failed,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(values: &[u32]) -> AnswerValue {
        AnswerValue::Multiple(values.iter().copied().collect())
    }

    #[test]
    fn multi_select_requires_exact_set() {
        let correct = set(&[1, 3]);
        assert!(set(&[3, 1]).matches(&correct));
        assert!(!set(&[1]).matches(&correct));
        assert!(!set(&[1, 2, 3]).matches(&correct));
    }

    #[test]
    fn single_option_against_singleton_set() {
        assert!(AnswerValue::Single(2).matches(&set(&[2])));
        assert!(!AnswerValue::Single(2).matches(&set(&[2, 4])));
        assert!(AnswerValue::Single(0).matches(&AnswerValue::Single(0)));
    }

    #[test]
    fn answer_value_accepts_number_or_array() {
        let single: AnswerValue = serde_json::from_str("2").unwrap();
        assert_eq!(single, AnswerValue::Single(2));
        let multi: AnswerValue = serde_json::from_str("[4, 1]").unwrap();
        assert_eq!(multi, set(&[1, 4]));
    }
}
