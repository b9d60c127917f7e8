#![allow(dead_code)]

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use chrono::{TimeZone, Utc};
use examroom_api::{
    config::{Config, StoreBackend},
    create_router,
    models::{
        exam::{ExamQuestion, ExamRecord, QuestionKind},
        AnswerValue,
    },
    services::{clock::ManualClock, store::InMemorySessionStore, AppState},
};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use tower::ServiceExt;

pub const EXAM_ID: &str = "exam-fractions";

pub struct TestApp {
    pub router: Router,
    pub store: Arc<InMemorySessionStore>,
    pub clock: Arc<ManualClock>,
}

pub fn create_test_app() -> TestApp {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();

    let store = Arc::new(InMemorySessionStore::new());
    store.insert_exam(seed_exam());

    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap(),
    ));

    let config = Config {
        store_backend: StoreBackend::Memory,
        grace_delay_ms: 10,
        max_write_attempts: 2,
        ..Config::default()
    };

    let app_state = Arc::new(AppState::with_store(config, store.clone(), clock.clone()));

    TestApp {
        router: create_router(app_state),
        store,
        clock,
    }
}

fn seed_exam() -> ExamRecord {
    let question = |i: u32, kind: QuestionKind, correct: AnswerValue| ExamQuestion {
        id: format!("q{i}"),
        exercise_index: i / 2,
        kind,
        correct,
    };
    ExamRecord {
        id: EXAM_ID.to_string(),
        title: "Fractions".to_string(),
        questions: vec![
            question(0, QuestionKind::SingleChoice, AnswerValue::Single(1)),
            question(1, QuestionKind::SingleChoice, AnswerValue::Single(0)),
            question(
                2,
                QuestionKind::MultiSelect,
                AnswerValue::Multiple(BTreeSet::from([0, 2])),
            ),
            question(3, QuestionKind::SingleChoice, AnswerValue::Single(3)),
        ],
        scoring_tiers: None,
        locked: false,
        leaderboard: Vec::new(),
        session_id: None,
        locked_at: None,
    }
}

/// Sends a request and returns the status with the parsed JSON body
/// (`Value::Null` when the body is empty or not JSON).
pub async fn send(app: &TestApp, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(json) => {
            builder = builder.header("content-type", "application/json");
            Body::from(json.to_string())
        }
        None => Body::empty(),
    };

    let response = app
        .router
        .clone()
        .oneshot(builder.body(body).unwrap())
        .await
        .unwrap();

    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, json)
}
