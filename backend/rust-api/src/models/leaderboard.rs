use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    pub rank: u32,
    pub student_id: String,
    pub name: String,
    pub score: u32,
    pub progress: u32,
    pub correct_answers: u32,
    pub answered: u32,
    pub submitted: bool,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Medal {
    Gold,
    Silver,
    Bronze,
}

impl Medal {
    pub fn for_rank(rank: u32) -> Option<Self> {
        match rank {
            1 => Some(Medal::Gold),
            2 => Some(Medal::Silver),
            3 => Some(Medal::Bronze),
            _ => None,
        }
    }
}

/// Display row; the medal is derived from the rank and never stored.
#[derive(Debug, Clone, Serialize)]
pub struct RankedRow {
    #[serde(flatten)]
    pub entry: LeaderboardEntry,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub medal: Option<Medal>,
}

impl From<LeaderboardEntry> for RankedRow {
    fn from(entry: LeaderboardEntry) -> Self {
        let medal = Medal::for_rank(entry.rank);
        Self { entry, medal }
    }
}
