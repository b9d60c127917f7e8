use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::leaderboard::{LeaderboardEntry, RankedRow};
use super::SessionStatus;

/// Everything pushed to realtime subscribers of a session. Delivery is
/// at-least-once; clients treat every event as "state may have changed".
#[derive(Debug, Serialize, Clone)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SessionEvent {
    Snapshot(SessionSnapshot),
    StatusChanged(StatusChanged),
    ParticipantJoined(ParticipantChanged),
    AnswerRecorded(ParticipantChanged),
    DraftSaved(ParticipantChanged),
    StudentCompleted(ParticipantChanged),
    ResultsLocked(ResultsLocked),
    TimerTick(TimerTick),
    TimeExpired(TimeExpired),
}

#[derive(Debug, Serialize, Clone)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub status: SessionStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration: u32,
    pub remaining_seconds: u32,
    pub ranking: Vec<RankedRow>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StatusChanged {
    pub session_id: String,
    pub status: SessionStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ParticipantChanged {
    pub session_id: String,
    pub student_id: String,
    pub name: String,
    pub score: u32,
    pub current_question: u32,
    pub submitted: bool,
    pub question_index: Option<u32>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ResultsLocked {
    pub session_id: String,
    pub leaderboard: Vec<LeaderboardEntry>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TimerTick {
    pub session_id: String,
    pub remaining_seconds: u32,
    pub elapsed_seconds: u32,
    pub total_seconds: u32,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TimeExpired {
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

impl SessionEvent {
    pub fn to_sse_data(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    pub fn event_name(&self) -> &'static str {
        match self {
            SessionEvent::Snapshot(_) => "snapshot",
            SessionEvent::StatusChanged(_) => "status-changed",
            SessionEvent::ParticipantJoined(_) => "participant-joined",
            SessionEvent::AnswerRecorded(_) => "answer-recorded",
            SessionEvent::DraftSaved(_) => "draft-saved",
            SessionEvent::StudentCompleted(_) => "student-completed",
            SessionEvent::ResultsLocked(_) => "results-locked",
            SessionEvent::TimerTick(_) => "timer-tick",
            SessionEvent::TimeExpired(_) => "time-expired",
        }
    }

    pub fn session_id(&self) -> &str {
        match self {
            SessionEvent::Snapshot(e) => &e.session_id,
            SessionEvent::StatusChanged(e) => &e.session_id,
            SessionEvent::ParticipantJoined(e)
            | SessionEvent::AnswerRecorded(e)
            | SessionEvent::DraftSaved(e)
            | SessionEvent::StudentCompleted(e) => &e.session_id,
            SessionEvent::ResultsLocked(e) => &e.session_id,
            SessionEvent::TimerTick(e) => &e.session_id,
            SessionEvent::TimeExpired(e) => &e.session_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_payload_is_tagged_with_type() {
        let event = SessionEvent::TimeExpired(TimeExpired {
            session_id: "s1".to_string(),
            timestamp: Utc::now(),
            message: "Time limit exceeded".to_string(),
        });
        let json: serde_json::Value = serde_json::from_str(&event.to_sse_data()).unwrap();
        assert_eq!(json["type"], "time-expired");
        assert_eq!(json["session_id"], "s1");
        assert_eq!(event.event_name(), "time-expired");
    }
}
