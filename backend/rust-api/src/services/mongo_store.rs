use std::collections::BTreeMap;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use mongodb::bson::{doc, to_bson, Bson, Document};
use mongodb::options::IndexOptions;
use mongodb::{Collection, Database, IndexModel};

use crate::metrics::track_store_operation;
use crate::models::exam::ExamRecord;
use crate::models::{ExamSession, LeaderboardEntry, Participant, SessionStatus};
use crate::services::lifecycle::{SessionPatch, StartTimeWrite};
use crate::services::store::{ParticipantWrite, SessionStore, WriteOutcome};
use crate::utils::time::chrono_to_bson;

const SESSIONS: &str = "exam_sessions";
const EXAMS: &str = "exams";

/// One document per session in `exam_sessions`; participants live under
/// `participants.<student_id>` so each student's writes touch only their own
/// path. Top-level instants are written as BSON dates.
pub struct MongoSessionStore {
    mongo: Database,
}

impl MongoSessionStore {
    pub fn new(mongo: Database) -> Self {
        Self { mongo }
    }

    fn sessions(&self) -> Collection<ExamSession> {
        self.mongo.collection(SESSIONS)
    }

    fn raw_sessions(&self) -> Collection<Document> {
        self.mongo.collection(SESSIONS)
    }

    fn exams(&self) -> Collection<ExamRecord> {
        self.mongo.collection(EXAMS)
    }

    pub async fn ensure_indexes(&self) -> Result<()> {
        let index = IndexModel::builder()
            .keys(doc! { "status": 1 })
            .options(
                IndexOptions::builder()
                    .name("exam_sessions_status".to_string())
                    .build(),
            )
            .build();
        self.raw_sessions()
            .create_index(index)
            .await
            .context("Failed to create exam_sessions status index")?;
        Ok(())
    }
}

#[async_trait]
impl SessionStore for MongoSessionStore {
    async fn insert_session(&self, session: &ExamSession) -> Result<()> {
        track_store_operation("insert", SESSIONS, async {
            self.sessions()
                .insert_one(session)
                .await
                .context("Failed to insert exam session")?;
            Ok(())
        })
        .await
    }

    async fn load_session(&self, session_id: &str) -> Result<Option<ExamSession>> {
        track_store_operation("find_one", SESSIONS, async {
            self.sessions()
                .find_one(doc! { "_id": session_id })
                .await
                .context("Failed to query exam session")
        })
        .await
    }

    async fn list_session_ids(&self, status: SessionStatus) -> Result<Vec<String>> {
        track_store_operation("find", SESSIONS, async {
            let mut cursor = self
                .raw_sessions()
                .find(doc! { "status": status.as_str() })
                .projection(doc! { "_id": 1 })
                .await
                .context("Failed to list exam sessions")?;

            let mut ids = Vec::new();
            while let Some(document) = cursor.try_next().await? {
                match document.get("_id") {
                    Some(Bson::String(id)) => ids.push(id.clone()),
                    other => tracing::warn!(id = ?other, "Skipping session with non-string _id"),
                }
            }
            Ok(ids)
        })
        .await
    }

    async fn put_participant(
        &self,
        session_id: &str,
        write: ParticipantWrite<'_>,
    ) -> Result<WriteOutcome> {
        let path = format!("participants.{}", write.student_id);
        let statuses: Vec<&str> = write.allowed_statuses.iter().map(|s| s.as_str()).collect();

        let mut filter = doc! {
            "_id": session_id,
            "status": { "$in": statuses },
        };
        match write.expected_revision {
            Some(revision) => {
                let revision = i64::try_from(revision)
                    .map_err(|_| anyhow!("participant revision overflow"))?;
                filter.insert(format!("{}.revision", path), revision);
            }
            None => {
                filter.insert(path.clone(), doc! { "$exists": false });
            }
        }

        let participant =
            to_bson(write.participant).context("Failed to serialize participant")?;
        let mut set = Document::new();
        set.insert(path, participant);
        set.insert("updated_at", chrono_to_bson(Utc::now()));

        track_store_operation("update_participant", SESSIONS, async {
            let result = self
                .raw_sessions()
                .update_one(filter, doc! { "$set": set })
                .await
                .context("Failed to write participant")?;
            Ok(if result.matched_count == 1 {
                WriteOutcome::Applied
            } else {
                WriteOutcome::Conflict
            })
        })
        .await
    }

    async fn transition(
        &self,
        session_id: &str,
        expected: SessionStatus,
        patch: &SessionPatch,
    ) -> Result<WriteOutcome> {
        let filter = doc! { "_id": session_id, "status": expected.as_str() };

        let mut set = doc! {
            "status": patch.status.as_str(),
            "updated_at": chrono_to_bson(Utc::now()),
        };
        match patch.start_time {
            StartTimeWrite::Keep => {}
            StartTimeWrite::Set(at) => {
                set.insert("start_time", chrono_to_bson(at));
            }
            StartTimeWrite::SetIfMissing(at) => {
                set.insert(
                    "start_time",
                    doc! { "$ifNull": ["$start_time", chrono_to_bson(at)] },
                );
            }
        }
        if let Some(end) = patch.end_time {
            set.insert("end_time", chrono_to_bson(end));
        }

        // Pipeline form so the fallback start time can read the stored value.
        let pipeline = vec![doc! { "$set": set }];

        track_store_operation("transition", SESSIONS, async {
            let result = self
                .raw_sessions()
                .update_one(filter, pipeline)
                .await
                .context("Failed to transition exam session")?;
            Ok(if result.matched_count == 1 {
                WriteOutcome::Applied
            } else {
                WriteOutcome::Conflict
            })
        })
        .await
    }

    async fn lock_results(
        &self,
        session_id: &str,
        participants: &BTreeMap<String, Participant>,
        leaderboard: &[LeaderboardEntry],
    ) -> Result<WriteOutcome> {
        let filter = doc! {
            "_id": session_id,
            "status": SessionStatus::Finished.as_str(),
            "results_locked": { "$ne": true },
        };
        let update = doc! {
            "$set": {
                "participants": to_bson(participants).context("Failed to serialize participants")?,
                "leaderboard": to_bson(leaderboard).context("Failed to serialize leaderboard")?,
                "results_locked": true,
                "updated_at": chrono_to_bson(Utc::now()),
            }
        };

        track_store_operation("lock_results", SESSIONS, async {
            let result = self
                .raw_sessions()
                .update_one(filter, update)
                .await
                .context("Failed to lock session results")?;
            Ok(if result.matched_count == 1 {
                WriteOutcome::Applied
            } else {
                WriteOutcome::Conflict
            })
        })
        .await
    }

    async fn load_exam(&self, exam_id: &str) -> Result<Option<ExamRecord>> {
        track_store_operation("find_one", EXAMS, async {
            self.exams()
                .find_one(doc! { "_id": exam_id })
                .await
                .context("Failed to query exam")
        })
        .await
    }

    async fn lock_exam(
        &self,
        exam_id: &str,
        session_id: &str,
        leaderboard: &[LeaderboardEntry],
        locked_at: DateTime<Utc>,
    ) -> Result<()> {
        let update = doc! {
            "$set": {
                "locked": true,
                "leaderboard": to_bson(leaderboard).context("Failed to serialize leaderboard")?,
                "session_id": session_id,
                "locked_at": chrono_to_bson(locked_at),
            }
        };

        track_store_operation("lock_exam", EXAMS, async {
            let result = self
                .exams()
                .update_one(doc! { "_id": exam_id }, update)
                .await
                .context("Failed to lock exam")?;
            if result.matched_count == 0 {
                return Err(anyhow!("Exam {} not found", exam_id));
            }
            Ok(())
        })
        .await
    }

    async fn ping(&self) -> Result<()> {
        self.mongo
            .run_command(doc! { "ping": 1 })
            .await
            .context("MongoDB ping failed")?;
        Ok(())
    }
}
