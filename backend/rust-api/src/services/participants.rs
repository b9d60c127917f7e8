//! Per-student state transitions. Every function here takes the participant
//! subtree as last observed and returns the subtree to write back; the store
//! only accepts it if nobody else wrote that subtree in between.

use chrono::{DateTime, Utc};

use crate::error::SessionError;
use crate::models::answer::CompleteRequest;
use crate::models::exam::{ExamQuestion, QuestionKind};
use crate::models::{Answer, AnswerValue, Participant};
use crate::services::scoring::ScoringEngine;

/// Student ids become document field names, so they must be usable as a
/// single path segment.
pub fn validate_student_id(student_id: &str) -> Result<(), SessionError> {
    if student_id.trim().is_empty() {
        return Err(SessionError::Validation("student_id must not be empty".into()));
    }
    if student_id.contains('.') || student_id.starts_with('$') || student_id.contains('\0') {
        return Err(SessionError::Validation(format!(
            "student_id {:?} contains reserved characters",
            student_id
        )));
    }
    Ok(())
}

/// Join or re-join. Reconnects refresh the display name but never reset
/// score, answers or submission state.
pub fn register(existing: Option<&Participant>, name: &str, now: DateTime<Utc>) -> Participant {
    match existing {
        Some(current) => {
            let mut next = current.clone();
            next.name = name.to_string();
            next.revision += 1;
            next
        }
        None => Participant::new(name, now),
    }
}

/// Evaluates a final answer against the exam question. Correctness is fixed
/// here and never recomputed.
pub fn grade_answer(
    question: &ExamQuestion,
    question_index: u32,
    value: AnswerValue,
    engine: &ScoringEngine,
    time_used: u32,
    now: DateTime<Utc>,
) -> Result<Answer, SessionError> {
    if value.is_empty() {
        return Err(SessionError::Validation(
            "a final answer must select at least one option".into(),
        ));
    }
    if question.kind == QuestionKind::SingleChoice {
        if let AnswerValue::Multiple(set) = &value {
            if set.len() > 1 {
                return Err(SessionError::Validation(format!(
                    "question {} accepts a single option",
                    question_index
                )));
            }
        }
    }

    let is_correct = value.matches(&question.correct);
    let score = engine.calculate_question_score(question.exercise_index, is_correct, time_used);

    Ok(Answer {
        question_id: question.id.clone(),
        question_index,
        exercise_index: question.exercise_index,
        answer: value,
        is_correct,
        points: score.total,
        base_points: score.base,
        bonus_points: score.bonus,
        time_used,
        is_draft: false,
        answered_at: now,
    })
}

/// Appends a final answer. Write-once per question: a second final answer
/// for the same index is rejected and the first one stands.
pub fn record_answer(
    participant: &Participant,
    student_id: &str,
    answer: Answer,
    now: DateTime<Utc>,
) -> Result<Participant, SessionError> {
    if participant.submitted {
        return Err(SessionError::AlreadySubmitted(student_id.to_string()));
    }
    if participant.final_answer(answer.question_index).is_some() {
        return Err(SessionError::DuplicateSubmission {
            question_index: answer.question_index,
        });
    }

    let mut next = participant.clone();
    next.answers
        .retain(|a| !(a.is_draft && a.question_index == answer.question_index));
    next.current_question = next.current_question.max(answer.question_index + 1);
    next.answers.push(answer);
    next.score = next.scored_points();
    next.last_updated = now;
    next.revision += 1;
    Ok(next)
}

/// Replaces the draft for one multi-select question. Returns `None` when the
/// question already has a final answer, in which case there is nothing to
/// save.
pub fn record_draft(
    participant: &Participant,
    student_id: &str,
    question: &ExamQuestion,
    question_index: u32,
    selected: AnswerValue,
    time_used: u32,
    now: DateTime<Utc>,
) -> Result<Option<Participant>, SessionError> {
    if participant.submitted {
        return Err(SessionError::AlreadySubmitted(student_id.to_string()));
    }
    if question.kind != QuestionKind::MultiSelect {
        return Err(SessionError::Validation(format!(
            "question {} is not multi-select",
            question_index
        )));
    }
    if participant.final_answer(question_index).is_some() {
        return Ok(None);
    }

    let draft = Answer {
        question_id: question.id.clone(),
        question_index,
        exercise_index: question.exercise_index,
        answer: selected,
        is_correct: false,
        points: 0,
        base_points: 0,
        bonus_points: 0,
        time_used,
        is_draft: true,
        answered_at: now,
    };

    let mut next = participant.clone();
    next.answers
        .retain(|a| !(a.is_draft && a.question_index == question_index));
    next.answers.push(draft);
    next.revision += 1;
    Ok(Some(next))
}

/// Marks the student as done. `None` if they already were; completing
/// twice changes nothing.
pub fn complete(
    participant: &Participant,
    summary: &CompleteRequest,
    total_questions: u32,
    now: DateTime<Utc>,
) -> Option<Participant> {
    if participant.submitted {
        return None;
    }

    let mut next = participant.clone();
    if let Some(reached) = summary.current_question {
        next.current_question = next.current_question.max(reached.min(total_questions));
    }
    next.score = next.scored_points();
    next.submitted = true;
    next.completed_at = Some(now);
    next.submitted_at = Some(now);
    next.last_updated = now;
    next.revision += 1;
    Some(next)
}

/// Finishing the session closes every participant.
pub fn freeze(participant: &mut Participant, now: DateTime<Utc>) {
    participant.submitted = true;
    if participant.submitted_at.is_none() {
        participant.submitted_at = Some(now);
    }
    participant.score = participant.scored_points();
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::BTreeSet;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap()
    }

    fn single_question(correct: u32) -> ExamQuestion {
        ExamQuestion {
            id: "q-single".to_string(),
            exercise_index: 0,
            kind: QuestionKind::SingleChoice,
            correct: AnswerValue::Single(correct),
        }
    }

    fn multi_question(correct: &[u32]) -> ExamQuestion {
        ExamQuestion {
            id: "q-multi".to_string(),
            exercise_index: 1,
            kind: QuestionKind::MultiSelect,
            correct: AnswerValue::Multiple(correct.iter().copied().collect()),
        }
    }

    fn graded(index: u32, value: u32, time_used: u32) -> Answer {
        grade_answer(
            &single_question(1),
            index,
            AnswerValue::Single(value),
            &ScoringEngine::default(),
            time_used,
            now(),
        )
        .unwrap()
    }

    #[test]
    fn rejoin_keeps_progress() {
        let first = register(None, "Ann", now());
        let scored = record_answer(&first, "ann", graded(0, 1, 10), now()).unwrap();
        let rejoined = register(Some(&scored), "Ann B.", now());
        assert_eq!(rejoined.name, "Ann B.");
        assert_eq!(rejoined.score, 40);
        assert_eq!(rejoined.answers.len(), 1);
        assert!(rejoined.revision > scored.revision);
    }

    #[test]
    fn second_final_answer_is_rejected() {
        let p = Participant::new("Ann", now());
        let p = record_answer(&p, "ann", graded(0, 1, 10), now()).unwrap();
        let err = record_answer(&p, "ann", graded(0, 2, 12), now()).unwrap_err();
        assert!(matches!(
            err,
            SessionError::DuplicateSubmission { question_index: 0 }
        ));
        assert_eq!(p.score, 40);
    }

    #[test]
    fn huge_answer_points_saturate_the_score() {
        let p = Participant::new("Ann", now());
        let mut big = graded(0, 1, 10);
        big.points = u32::MAX;
        let p = record_answer(&p, "ann", big, now()).unwrap();
        let p = record_answer(&p, "ann", graded(1, 1, 10), now()).unwrap();
        assert_eq!(p.scored_points(), u32::MAX);
        assert_eq!(p.score, u32::MAX);
    }

    #[test]
    fn score_tracks_final_answers_only() {
        let p = Participant::new("Ann", now());
        let question = multi_question(&[0, 2]);
        let p = record_draft(
            &p,
            "ann",
            &question,
            1,
            AnswerValue::Multiple(BTreeSet::from([0])),
            5,
            now(),
        )
        .unwrap()
        .unwrap();
        assert_eq!(p.score, 0);
        assert_eq!(p.draft(1).map(|d| d.points), Some(0));

        let p = record_answer(&p, "ann", graded(0, 1, 10), now()).unwrap();
        let p = record_answer(&p, "ann", graded(2, 0, 100), now()).unwrap();
        assert_eq!(p.score, p.scored_points());
        assert_eq!(p.score, 40 + 5);
        assert_eq!(p.current_question, 3);
    }

    #[test]
    fn final_answer_supersedes_draft() {
        let question = multi_question(&[0, 2]);
        let p = Participant::new("Ann", now());
        let p = record_draft(
            &p,
            "ann",
            &question,
            0,
            AnswerValue::Multiple(BTreeSet::from([0])),
            3,
            now(),
        )
        .unwrap()
        .unwrap();
        let answer = grade_answer(
            &question,
            0,
            AnswerValue::Multiple(BTreeSet::from([0, 2])),
            &ScoringEngine::default(),
            20,
            now(),
        )
        .unwrap();
        let p = record_answer(&p, "ann", answer, now()).unwrap();
        assert_eq!(p.answers.len(), 1);
        assert!(!p.answers[0].is_draft);
        assert_eq!(p.score, 16);

        let skipped = record_draft(
            &p,
            "ann",
            &question,
            0,
            AnswerValue::Multiple(BTreeSet::from([1])),
            30,
            now(),
        )
        .unwrap();
        assert!(skipped.is_none());
    }

    #[test]
    fn newer_draft_replaces_older() {
        let question = multi_question(&[1]);
        let p = Participant::new("Ann", now());
        let p = record_draft(&p, "ann", &question, 4, AnswerValue::Multiple(BTreeSet::from([0])), 3, now())
            .unwrap()
            .unwrap();
        let p = record_draft(&p, "ann", &question, 4, AnswerValue::Multiple(BTreeSet::from([0, 1])), 6, now())
            .unwrap()
            .unwrap();
        let drafts: Vec<_> = p.answers.iter().filter(|a| a.is_draft).collect();
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].time_used, 6);
    }

    #[test]
    fn partial_multi_select_scores_as_incorrect() {
        let answer = grade_answer(
            &multi_question(&[0, 2]),
            0,
            AnswerValue::Multiple(BTreeSet::from([0])),
            &ScoringEngine::default(),
            20,
            now(),
        )
        .unwrap();
        assert!(!answer.is_correct);
        assert_eq!(answer.points, 2);
    }

    #[test]
    fn empty_selection_is_not_a_final_answer() {
        let err = grade_answer(
            &multi_question(&[0]),
            0,
            AnswerValue::Multiple(BTreeSet::new()),
            &ScoringEngine::default(),
            20,
            now(),
        )
        .unwrap_err();
        assert!(matches!(err, SessionError::Validation(_)));
    }

    #[test]
    fn complete_is_one_shot() {
        let p = Participant::new("Ann", now());
        let summary = CompleteRequest {
            current_question: Some(99),
        };
        let done = complete(&p, &summary, 12, now()).unwrap();
        assert!(done.submitted);
        assert_eq!(done.current_question, 12);
        assert!(done.completed_at.is_some());
        assert!(complete(&done, &summary, 12, now()).is_none());

        let err = record_answer(&done, "ann", graded(0, 1, 10), now()).unwrap_err();
        assert!(matches!(err, SessionError::AlreadySubmitted(_)));
    }

    #[test]
    fn freeze_keeps_earlier_submission_time() {
        let p = Participant::new("Ann", now());
        let mut done = complete(&p, &CompleteRequest::default(), 5, now()).unwrap();
        let later = now() + chrono::Duration::seconds(60);
        freeze(&mut done, later);
        assert_eq!(done.submitted_at, Some(now()));

        let mut open = Participant::new("Bob", now());
        freeze(&mut open, later);
        assert!(open.submitted);
        assert_eq!(open.submitted_at, Some(later));
    }

    #[test]
    fn student_ids_must_be_path_safe() {
        assert!(validate_student_id("u-123").is_ok());
        assert!(validate_student_id("").is_err());
        assert!(validate_student_id("a.b").is_err());
        assert!(validate_student_id("$where").is_err());
    }
}
