use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use chrono::{NaiveDate, Utc};
use serde::Deserialize;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::channels::{EmailChannel, TelegramChannel};
use crate::db::Db;
use crate::dispatch::{self, Dispatcher};
use crate::error::Error;
use crate::{schedule, summary};

/// Thin HTTP surface over the four core operations. The scheduling and
/// dispatch logic lives below it and stays transport-agnostic.
#[derive(Clone)]
pub struct ApiState {
    pub db: Db,
    pub dispatcher: Arc<Dispatcher<EmailChannel, TelegramChannel>>,
}

pub fn app_router(state: ApiState) -> Router {
    Router::new()
        .route("/api/summary", get(get_summary))
        .route("/api/dispatch", post(post_dispatch))
        .route("/api/topics", post(post_topic))
        .route("/api/repetitions/:id/complete", post(post_complete))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn get_summary(State(state): State<ApiState>) -> impl IntoResponse {
    match summary::report(&state.db, schedule::today()).await {
        Ok(report) => Json(report).into_response(),
        Err(err) => error_response(&err),
    }
}

async fn post_dispatch(State(state): State<ApiState>) -> impl IntoResponse {
    match dispatch::run_daily_dispatch(&state.db, &state.dispatcher, schedule::today()).await {
        Ok(stats) => Json(stats).into_response(),
        Err(err) => error_response(&err),
    }
}

#[derive(Deserialize)]
struct CreateTopicRequest {
    user_id: i64,
    title: String,
    content: String,
    category: Option<String>,
    /// Defaults to today; the creation timestamp is derived from it.
    anchor_date: Option<NaiveDate>,
}

async fn post_topic(
    State(state): State<ApiState>,
    Json(req): Json<CreateTopicRequest>,
) -> impl IntoResponse {
    let created_at = match req.anchor_date.map(|d| d.and_hms_opt(0, 0, 0)) {
        Some(Some(midnight)) => midnight.and_utc(),
        Some(None) => return error_response(&Error::InvalidAnchorDate),
        None => Utc::now(),
    };
    let category = req.category.as_deref().unwrap_or("general");

    match state
        .db
        .create_topic(req.user_id, &req.title, &req.content, category, created_at)
        .await
    {
        Ok(topic) => (StatusCode::CREATED, Json(topic)).into_response(),
        Err(err) => error_response(&err),
    }
}

#[derive(Deserialize)]
struct CompleteRequest {
    completed_date: Option<NaiveDate>,
    difficulty_rating: Option<i64>,
}

async fn post_complete(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
    Json(req): Json<CompleteRequest>,
) -> impl IntoResponse {
    let completed = req.completed_date.unwrap_or_else(schedule::today);
    match state
        .db
        .complete_repetition(id, completed, req.difficulty_rating)
        .await
    {
        Ok(repetition) => Json(repetition).into_response(),
        Err(err) => error_response(&err),
    }
}

fn error_response(err: &Error) -> Response {
    let status = match err {
        Error::UnknownTopic(_) | Error::UnknownUser(_) | Error::UnknownRepetition(_) => {
            StatusCode::NOT_FOUND
        }
        Error::AlreadyCompleted(_) | Error::AlreadyScheduled(_) => StatusCode::CONFLICT,
        Error::InvalidAnchorDate | Error::InvalidDifficultyRating(_) => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        Error::StoreUnavailable(_) | Error::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, err.to_string()).into_response()
}
