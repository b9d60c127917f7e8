use serde::Serialize;

use crate::models::exam::ScoringTier;

/// Points for one finalized answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QuestionScore {
    pub base: u32,
    pub bonus: u32,
    pub total: u32,
}

/// Tier table keyed by exercise index. Pure: no clock, no I/O.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScoringEngine {
    tiers: Vec<ScoringTier>,
}

impl Default for ScoringEngine {
    fn default() -> Self {
        Self {
            tiers: vec![
                ScoringTier {
                    correct: 30,
                    incorrect: 5,
                    bonus_threshold_seconds: 30,
                    bonus: 10,
                },
                ScoringTier {
                    correct: 12,
                    incorrect: 2,
                    bonus_threshold_seconds: 60,
                    bonus: 4,
                },
                ScoringTier {
                    correct: 12,
                    incorrect: 2,
                    bonus_threshold_seconds: 90,
                    bonus: 4,
                },
            ],
        }
    }
}

impl ScoringEngine {
    /// Falls back to the default table when `tiers` is empty.
    pub fn with_tiers(tiers: Vec<ScoringTier>) -> Self {
        if tiers.is_empty() {
            return Self::default();
        }
        Self { tiers }
    }

    pub fn for_exam(tiers: Option<&[ScoringTier]>) -> Self {
        match tiers {
            Some(tiers) => Self::with_tiers(tiers.to_vec()),
            None => Self::default(),
        }
    }

    /// Exercise indices past the end of the table use the last tier.
    pub fn tier(&self, exercise_index: u32) -> &ScoringTier {
        let last = self.tiers.len() - 1;
        &self.tiers[(exercise_index as usize).min(last)]
    }

    pub fn calculate_question_score(
        &self,
        exercise_index: u32,
        is_correct: bool,
        time_used_seconds: u32,
    ) -> QuestionScore {
        let tier = self.tier(exercise_index);
        let base = if is_correct {
            tier.correct
        } else {
            tier.incorrect
        };
        let bonus = if is_correct
            && time_used_seconds > 0
            && time_used_seconds < tier.bonus_threshold_seconds
        {
            tier.bonus
        } else {
            0
        };

        QuestionScore {
            base,
            bonus,
            total: base.saturating_add(bonus),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fast_correct_answer_in_first_tier_earns_bonus() {
        let score = ScoringEngine::default().calculate_question_score(0, true, 20);
        assert_eq!(
            score,
            QuestionScore {
                base: 30,
                bonus: 10,
                total: 40
            }
        );
    }

    #[test]
    fn oversized_exam_tiers_saturate_instead_of_overflowing() {
        let engine = ScoringEngine::with_tiers(vec![ScoringTier {
            correct: u32::MAX,
            incorrect: 0,
            bonus_threshold_seconds: 60,
            bonus: 10,
        }]);
        let score = engine.calculate_question_score(0, true, 5);
        assert_eq!(score.total, u32::MAX);
        assert_eq!(score.bonus, 10);
    }

    #[test]
    fn slow_incorrect_answer_in_second_tier() {
        let score = ScoringEngine::default().calculate_question_score(1, false, 70);
        assert_eq!(
            score,
            QuestionScore {
                base: 2,
                bonus: 0,
                total: 2
            }
        );
    }

    #[test]
    fn bonus_window_is_exclusive_on_both_ends() {
        let engine = ScoringEngine::default();
        assert_eq!(engine.calculate_question_score(0, true, 0).bonus, 0);
        assert_eq!(engine.calculate_question_score(0, true, 29).bonus, 10);
        assert_eq!(engine.calculate_question_score(0, true, 30).bonus, 0);
        assert_eq!(engine.calculate_question_score(2, true, 89).total, 16);
        assert_eq!(engine.calculate_question_score(2, true, 90).total, 12);
    }

    #[test]
    fn incorrect_answers_never_get_bonus() {
        let engine = ScoringEngine::default();
        assert_eq!(engine.calculate_question_score(0, false, 5).total, 5);
    }

    #[test]
    fn out_of_range_exercise_uses_last_tier() {
        let engine = ScoringEngine::default();
        assert_eq!(
            engine.calculate_question_score(7, true, 100),
            engine.calculate_question_score(2, true, 100)
        );
    }

    #[test]
    fn custom_tiers_override_defaults() {
        let engine = ScoringEngine::for_exam(Some(&[ScoringTier {
            correct: 1,
            incorrect: 0,
            bonus_threshold_seconds: 10,
            bonus: 1,
        }]));
        assert_eq!(engine.calculate_question_score(0, true, 5).total, 2);
        assert_eq!(engine.calculate_question_score(0, false, 5).total, 0);
        assert_eq!(ScoringEngine::with_tiers(vec![]), ScoringEngine::default());
    }
}
