// src/api/router.rs
// HTTP router composition.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    middleware,
    routing::{delete, get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use super::common::request_id_middleware;
use super::{cards, handlers, log, rag, retrieve, telemetry, threads, user_data, vantage, voice};
use crate::state::AppState;

pub fn build_router(app_state: Arc<AppState>) -> Router {
    Router::new()
        // Health
        .route("/healthz", get(handlers::healthz))
        .route("/readyz", get(handlers::readyz))
        // Transcript ingest
        .route("/log", post(log::log_chat))
        // Threads
        .route("/threads/new", post(threads::threads_new))
        .route("/threads/list/{user_id}", get(threads::threads_list))
        .route("/threads/{thread_id}/messages", get(threads::threads_messages))
        .route("/threads/{thread_id}/rename", post(threads::threads_rename))
        .route("/threads/{thread_id}/archive", post(threads::threads_archive))
        .route("/threads/{thread_id}", delete(threads::threads_delete))
        // Retrieval + memory feedback
        .route("/retrieve", post(retrieve::retrieve))
        .route("/retrieve_memory", post(retrieve::retrieve_memory))
        .route("/memory_feedback", post(retrieve::memory_feedback))
        // Profiles + temporal
        .route("/gravity/rebuild", post(cards::gravity_rebuild))
        .route("/vb_desire/rebuild", post(cards::vb_desire_rebuild))
        .route("/temporal/{user_id}", get(cards::temporal_info))
        // Cards
        .route("/cards/{user_id}", get(cards::cards_list).post(cards::cards_upsert))
        .route("/cards/{user_id}/{card_id}", delete(cards::cards_delete))
        // Privacy
        .route("/user/{user_id}/export", get(user_data::export_user_data))
        .route("/user/{user_id}/data", delete(user_data::delete_all_user_data))
        .route("/user/{user_id}/recent", delete(user_data::delete_recent_user_data))
        // Chat + feedback
        .route("/rag/query", post(rag::rag_query))
        .route("/rag/feedback", post(rag::rag_feedback))
        .route("/vantage/query", post(vantage::vantage_query))
        .route("/vantage/feedback", post(vantage::vantage_feedback))
        .route("/vantage/rag_policy", get(vantage::rag_policy_get).post(vantage::rag_policy_upsert))
        // Telemetry
        .route("/telemetry/event", post(telemetry::telemetry_event))
        .route("/metrics/timeseries", get(telemetry::metrics_timeseries))
        // Voice relay
        .route("/ws/voice", get(voice::ws_voice_relay))
        .layer(middleware::from_fn(request_id_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(Duration::from_secs(120)))
        .layer(CorsLayer::permissive())
        .with_state(app_state)
}
