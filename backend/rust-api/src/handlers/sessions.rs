use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde_json::json;
use std::sync::Arc;

use crate::{
    error::SessionError,
    models::{
        answer::{CompleteRequest, DraftAnswerRequest, SubmitAnswerRequest},
        CreateSessionRequest, JoinSessionRequest,
    },
    services::AppState,
};

pub async fn create_session(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<impl IntoResponse, SessionError> {
    tracing::info!(
        exam_id = %req.exam_id,
        teacher_id = %req.teacher_id,
        class_id = %req.class_id,
        "Creating exam session"
    );

    let session = state.sessions.create_session(req).await?;
    Ok((StatusCode::CREATED, Json(state.sessions.view(session))))
}

pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, SessionError> {
    let view = state.sessions.get_session(&session_id).await?;
    Ok(Json(view))
}

pub async fn start_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, SessionError> {
    tracing::info!(session_id = %session_id, "Starting exam session");

    let session = state.sessions.start_session(&session_id).await?;
    Ok(Json(state.sessions.view(session)))
}

pub async fn finish_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, SessionError> {
    tracing::info!(session_id = %session_id, "Finishing exam session");

    let session = state.sessions.finish_session(&session_id).await?;
    Ok(Json(state.sessions.view(session)))
}

pub async fn cancel_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, SessionError> {
    tracing::info!(session_id = %session_id, "Cancelling exam session");

    let session = state.sessions.cancel_session(&session_id).await?;
    Ok(Json(state.sessions.view(session)))
}

pub async fn get_leaderboard(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, SessionError> {
    let ranking = state.sessions.leaderboard(&session_id).await?;
    Ok(Json(json!({
        "session_id": session_id,
        "ranking": ranking,
    })))
}

pub async fn join_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Json(req): Json<JoinSessionRequest>,
) -> Result<impl IntoResponse, SessionError> {
    let student_id = req.student_id.clone();
    let participant = state.sessions.join_session(&session_id, req).await?;
    Ok(Json(json!({
        "session_id": session_id,
        "student_id": student_id,
        "participant": participant,
    })))
}

pub async fn submit_answer(
    State(state): State<Arc<AppState>>,
    Path((session_id, student_id)): Path<(String, String)>,
    Json(req): Json<SubmitAnswerRequest>,
) -> Result<impl IntoResponse, SessionError> {
    let result = state
        .sessions
        .submit_answer(&session_id, &student_id, req)
        .await?;
    Ok(Json(result))
}

/// Always 202: drafts are best effort and the body only reports the outcome.
pub async fn autosave_draft(
    State(state): State<Arc<AppState>>,
    Path((session_id, student_id)): Path<(String, String)>,
    Json(req): Json<DraftAnswerRequest>,
) -> impl IntoResponse {
    let outcome = state
        .sessions
        .autosave_draft(&session_id, &student_id, req)
        .await;
    (StatusCode::ACCEPTED, Json(json!({ "outcome": outcome })))
}

pub async fn complete_for_student(
    State(state): State<Arc<AppState>>,
    Path((session_id, student_id)): Path<(String, String)>,
    Json(summary): Json<CompleteRequest>,
) -> Result<impl IntoResponse, SessionError> {
    let participant = state
        .sessions
        .complete_for_student(&session_id, &student_id, summary)
        .await?;
    Ok(Json(json!({
        "session_id": session_id,
        "student_id": student_id,
        "participant": participant,
    })))
}
