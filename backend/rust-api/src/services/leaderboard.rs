use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::models::leaderboard::RankedRow;
use crate::models::{LeaderboardEntry, Participant};

/// Ranks participants: score descending, then progress descending, then the
/// earliest `last_updated` first. Student id breaks any remaining tie so the
/// ordering is a total function of the map.
pub fn calculate(participants: &BTreeMap<String, Participant>) -> Vec<LeaderboardEntry> {
    let mut ordered: Vec<(&String, &Participant)> = participants.iter().collect();
    ordered.sort_by(|(a_id, a), (b_id, b)| compare(a_id, a, b_id, b));

    ordered
        .into_iter()
        .enumerate()
        .map(|(position, (student_id, participant))| LeaderboardEntry {
            rank: position as u32 + 1,
            student_id: student_id.clone(),
            name: participant.name.clone(),
            score: participant.score,
            progress: participant.current_question,
            correct_answers: participant.correct_count(),
            answered: participant.answered_count(),
            submitted: participant.submitted,
            last_updated: participant.last_updated,
        })
        .collect()
}

pub fn ranked_rows(participants: &BTreeMap<String, Participant>) -> Vec<RankedRow> {
    calculate(participants).into_iter().map(RankedRow::from).collect()
}

fn compare(a_id: &str, a: &Participant, b_id: &str, b: &Participant) -> Ordering {
    b.score
        .cmp(&a.score)
        .then_with(|| b.current_question.cmp(&a.current_question))
        .then_with(|| a.last_updated.cmp(&b.last_updated))
        .then_with(|| a_id.cmp(b_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::leaderboard::Medal;
    use chrono::{Duration, TimeZone, Utc};

    fn participant(name: &str, score: u32, progress: u32, offset_secs: i64) -> Participant {
        let base = Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap();
        let mut p = Participant::new(name, base);
        p.score = score;
        p.current_question = progress;
        p.last_updated = base + Duration::seconds(offset_secs);
        p
    }

    #[test]
    fn progress_breaks_score_ties() {
        let mut map = BTreeMap::new();
        map.insert("a".to_string(), participant("A", 50, 4, 0));
        map.insert("b".to_string(), participant("B", 50, 6, 10));

        let board = calculate(&map);
        assert_eq!(board[0].student_id, "b");
        assert_eq!(board[0].rank, 1);
        assert_eq!(board[1].student_id, "a");
        assert_eq!(board[1].rank, 2);
    }

    #[test]
    fn earliest_update_wins_full_tie() {
        let mut map = BTreeMap::new();
        map.insert("late".to_string(), participant("Late", 40, 3, 30));
        map.insert("early".to_string(), participant("Early", 40, 3, 5));

        let board = calculate(&map);
        assert_eq!(board[0].student_id, "early");
    }

    #[test]
    fn higher_score_ranks_first() {
        let mut map = BTreeMap::new();
        map.insert("x".to_string(), participant("X", 10, 9, 0));
        map.insert("y".to_string(), participant("Y", 90, 1, 50));
        map.insert("z".to_string(), participant("Z", 45, 5, 20));

        let ids: Vec<_> = calculate(&map).into_iter().map(|e| e.student_id).collect();
        assert_eq!(ids, vec!["y", "z", "x"]);
    }

    #[test]
    fn recalculation_is_deterministic() {
        let mut map = BTreeMap::new();
        for i in 0..20 {
            map.insert(
                format!("s{i}"),
                participant(&format!("S{i}"), (i % 3) * 10, i % 2, 0),
            );
        }
        assert_eq!(calculate(&map), calculate(&map));
    }

    #[test]
    fn medals_only_for_podium() {
        let mut map = BTreeMap::new();
        for (i, score) in [40, 30, 20, 10].into_iter().enumerate() {
            map.insert(format!("s{i}"), participant("S", score, 0, 0));
        }
        let medals: Vec<_> = ranked_rows(&map).into_iter().map(|r| r.medal).collect();
        assert_eq!(
            medals,
            vec![
                Some(Medal::Gold),
                Some(Medal::Silver),
                Some(Medal::Bronze),
                None
            ]
        );
    }

    #[test]
    fn empty_map_gives_empty_board() {
        assert!(calculate(&BTreeMap::new()).is_empty());
    }
}
