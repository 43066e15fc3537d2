//! Route table and handlers.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::info;
use uuid::Uuid;

use super::{ApiJson, AppState};
use crate::error::ApiError;
use crate::pipeline::types::{
    ChannelInput, DeliveryQuery, EndpointInput, MessageQuery, NewMessage, RuleDestinationInput,
    RuleInput, SimEndpoint, TrafficBucket,
};

/// Default and maximum window for the traffic chart, in hours.
const DEFAULT_TRAFFIC_HOURS: u32 = 24;
const MAX_TRAFFIC_HOURS: u32 = 24 * 7;

/// Length of generated endpoint API tokens.
const API_TOKEN_LEN: usize = 32;

/// Header carrying an endpoint's API token on ingestion.
const API_KEY_HEADER: &str = "x-api-key";

type ApiResult<T> = Result<T, ApiError>;

pub fn api_routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/messages/ingest", post(ingest))
        .route("/api/messages", get(list_messages))
        .route("/api/messages/{id}", get(get_message))
        .route("/api/rules", get(list_rules).post(create_rule))
        .route(
            "/api/rules/{id}",
            get(get_rule).put(update_rule).delete(delete_rule),
        )
        .route("/api/channels", get(list_channels).post(create_channel))
        .route(
            "/api/channels/{id}",
            get(get_channel).put(update_channel).delete(delete_channel),
        )
        .route(
            "/api/rule-destinations",
            get(list_destinations).post(create_destination),
        )
        .route(
            "/api/rule-destinations/{id}",
            get(get_destination)
                .put(update_destination)
                .delete(delete_destination),
        )
        .route("/api/deliveries", get(list_deliveries))
        .route("/api/endpoints", get(list_endpoints).post(create_endpoint))
        .route(
            "/api/endpoints/{id}",
            get(get_endpoint).put(update_endpoint).delete(delete_endpoint),
        )
        .route("/api/dashboard/sms-traffic", get(sms_traffic))
        .route("/api/dashboard/summary", get(summary))
        .with_state(state)
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "sms-relay"
    }))
}

// ── Messages ────────────────────────────────────────────────────────────

/// POST /api/messages/ingest
///
/// Stores the message and answers 202; forwarding happens in the background.
/// The gateway authenticates with its endpoint token in `X-Api-Key`.
async fn ingest(
    State(state): State<AppState>,
    headers: HeaderMap,
    ApiJson(body): ApiJson<NewMessage>,
) -> ApiResult<impl IntoResponse> {
    let api_key = headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let message = state.pipeline.ingest(api_key, body).await?;
    Ok((StatusCode::ACCEPTED, Json(json!({"id": message.id}))))
}

async fn list_messages(
    State(state): State<AppState>,
    Query(query): Query<MessageQuery>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.store.list_messages(&query).await?))
}

async fn get_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let message = state
        .store
        .get_message(&id)
        .await?
        .ok_or_else(|| ApiError::not_found("message", &id))?;
    Ok(Json(message))
}

// ── Rules ───────────────────────────────────────────────────────────────

fn check_rule(input: &RuleInput) -> ApiResult<()> {
    require("name", &input.name)?;
    require_object("filters", &input.filters)
}

async fn list_rules(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.store.list_rules().await?))
}

async fn get_rule(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let rule = state
        .store
        .get_rule(&id)
        .await?
        .ok_or_else(|| ApiError::not_found("rule", &id))?;
    Ok(Json(rule))
}

async fn create_rule(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<RuleInput>,
) -> ApiResult<impl IntoResponse> {
    check_rule(&body)?;
    let rule = body.into_rule(Uuid::new_v4().to_string());
    state.store.create_rule(&rule).await?;
    state.cache.invalidate().await;
    info!(rule_id = %rule.id, name = %rule.name, "Rule created");
    Ok((StatusCode::CREATED, Json(rule)))
}

async fn update_rule(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ApiJson(body): ApiJson<RuleInput>,
) -> ApiResult<impl IntoResponse> {
    check_rule(&body)?;
    let rule = body.into_rule(id);
    if !state.store.update_rule(&rule).await? {
        return Err(ApiError::not_found("rule", rule.id));
    }
    state.cache.invalidate().await;
    Ok(Json(rule))
}

async fn delete_rule(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    if !state.store.delete_rule(&id).await? {
        return Err(ApiError::not_found("rule", id));
    }
    state.cache.invalidate().await;
    info!(rule_id = %id, "Rule deleted");
    Ok(StatusCode::NO_CONTENT)
}

// ── Channels ────────────────────────────────────────────────────────────

fn check_channel(input: &ChannelInput) -> ApiResult<()> {
    require("name", &input.name)?;
    require_object("config", &input.config)
}

async fn list_channels(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.store.list_channels().await?))
}

async fn get_channel(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let channel = state
        .store
        .get_channel(&id)
        .await?
        .ok_or_else(|| ApiError::not_found("channel", &id))?;
    Ok(Json(channel))
}

async fn create_channel(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<ChannelInput>,
) -> ApiResult<impl IntoResponse> {
    check_channel(&body)?;
    let channel = body.into_channel(Uuid::new_v4().to_string());
    state.store.create_channel(&channel).await?;
    state.cache.invalidate().await;
    info!(channel_id = %channel.id, channel_type = %channel.channel_type, "Channel created");
    Ok((StatusCode::CREATED, Json(channel)))
}

async fn update_channel(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ApiJson(body): ApiJson<ChannelInput>,
) -> ApiResult<impl IntoResponse> {
    check_channel(&body)?;
    let channel = body.into_channel(id);
    if !state.store.update_channel(&channel).await? {
        return Err(ApiError::not_found("channel", channel.id));
    }
    state.cache.invalidate().await;
    Ok(Json(channel))
}

async fn delete_channel(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    if !state.store.delete_channel(&id).await? {
        return Err(ApiError::not_found("channel", id));
    }
    state.cache.invalidate().await;
    info!(channel_id = %id, "Channel deleted");
    Ok(StatusCode::NO_CONTENT)
}

// ── Rule destinations ───────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct DestinationFilter {
    rule_id: Option<String>,
}

/// Both parents must exist (and not be deleted).
async fn check_destination(state: &AppState, input: &RuleDestinationInput) -> ApiResult<()> {
    require_object("action_config", &input.action_config)?;
    if state.store.get_rule(&input.rule_id).await?.is_none() {
        return Err(ApiError::BadRequest(format!(
            "rule {} does not exist",
            input.rule_id
        )));
    }
    if state.store.get_channel(&input.channel_id).await?.is_none() {
        return Err(ApiError::BadRequest(format!(
            "channel {} does not exist",
            input.channel_id
        )));
    }
    Ok(())
}

async fn list_destinations(
    State(state): State<AppState>,
    Query(filter): Query<DestinationFilter>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(
        state
            .store
            .list_rule_destinations(filter.rule_id.as_deref())
            .await?,
    ))
}

async fn get_destination(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let dest = state
        .store
        .get_rule_destination(&id)
        .await?
        .ok_or_else(|| ApiError::not_found("rule destination", &id))?;
    Ok(Json(dest))
}

async fn create_destination(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<RuleDestinationInput>,
) -> ApiResult<impl IntoResponse> {
    check_destination(&state, &body).await?;
    let dest = body.into_destination(Uuid::new_v4().to_string());
    state.store.create_rule_destination(&dest).await?;
    state.cache.invalidate().await;
    info!(
        destination_id = %dest.id,
        rule_id = %dest.rule_id,
        channel_id = %dest.channel_id,
        "Rule destination created"
    );
    Ok((StatusCode::CREATED, Json(dest)))
}

async fn update_destination(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ApiJson(body): ApiJson<RuleDestinationInput>,
) -> ApiResult<impl IntoResponse> {
    check_destination(&state, &body).await?;
    let dest = body.into_destination(id);
    if !state.store.update_rule_destination(&dest).await? {
        return Err(ApiError::not_found("rule destination", dest.id));
    }
    state.cache.invalidate().await;
    Ok(Json(dest))
}

async fn delete_destination(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    if !state.store.delete_rule_destination(&id).await? {
        return Err(ApiError::not_found("rule destination", id));
    }
    state.cache.invalidate().await;
    Ok(StatusCode::NO_CONTENT)
}

// ── Deliveries ──────────────────────────────────────────────────────────

async fn list_deliveries(
    State(state): State<AppState>,
    Query(query): Query<DeliveryQuery>,
) -> ApiResult<impl IntoResponse> {
    if let (Some(since), Some(until)) = (query.since, query.until) {
        if since > until {
            return Err(ApiError::BadRequest("since is after until".into()));
        }
    }
    Ok(Json(state.store.list_deliveries(&query).await?))
}

// ── Endpoints ───────────────────────────────────────────────────────────

fn check_endpoint(input: &EndpointInput) -> ApiResult<()> {
    require("name", &input.name)?;
    require("phone_number", &input.phone_number)?;
    if let Some(ref token) = input.api_token {
        require("api_token", token)?;
    }
    Ok(())
}

fn generate_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(API_TOKEN_LEN)
        .map(char::from)
        .collect()
}

async fn list_endpoints(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.store.list_endpoints().await?))
}

async fn get_endpoint(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let endpoint = state
        .store
        .get_endpoint(&id)
        .await?
        .ok_or_else(|| ApiError::not_found("endpoint", &id))?;
    Ok(Json(endpoint))
}

async fn create_endpoint(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<EndpointInput>,
) -> ApiResult<impl IntoResponse> {
    check_endpoint(&body)?;
    let endpoint = SimEndpoint {
        id: Uuid::new_v4().to_string(),
        name: body.name,
        phone_number: body.phone_number,
        imei: body.imei,
        api_token: body.api_token.unwrap_or_else(generate_token),
        is_active: body.is_active,
        last_seen_at: None,
        created_at: Utc::now(),
    };
    state.store.create_endpoint(&endpoint).await?;
    state.cache.invalidate().await;
    info!(endpoint_id = %endpoint.id, name = %endpoint.name, "Endpoint registered");
    Ok((StatusCode::CREATED, Json(endpoint)))
}

/// Keeps `created_at`, `last_seen_at` and, when none is given, the token.
async fn update_endpoint(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ApiJson(body): ApiJson<EndpointInput>,
) -> ApiResult<impl IntoResponse> {
    check_endpoint(&body)?;
    let existing = state
        .store
        .get_endpoint(&id)
        .await?
        .ok_or_else(|| ApiError::not_found("endpoint", &id))?;
    let endpoint = SimEndpoint {
        name: body.name,
        phone_number: body.phone_number,
        imei: body.imei,
        api_token: body.api_token.unwrap_or(existing.api_token.clone()),
        is_active: body.is_active,
        ..existing
    };
    if !state.store.update_endpoint(&endpoint).await? {
        return Err(ApiError::not_found("endpoint", id));
    }
    state.cache.invalidate().await;
    Ok(Json(endpoint))
}

async fn delete_endpoint(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    if !state.store.delete_endpoint(&id).await? {
        return Err(ApiError::not_found("endpoint", id));
    }
    state.cache.invalidate().await;
    Ok(StatusCode::NO_CONTENT)
}

// ── Dashboard ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct TrafficQuery {
    hours: Option<u32>,
}

/// GET /api/dashboard/sms-traffic?hours=
///
/// One bucket per hour, oldest first, ending with the current hour. Hours
/// with no messages are reported as zero.
async fn sms_traffic(
    State(state): State<AppState>,
    Query(query): Query<TrafficQuery>,
) -> ApiResult<impl IntoResponse> {
    let hours = query
        .hours
        .unwrap_or(DEFAULT_TRAFFIC_HOURS)
        .clamp(1, MAX_TRAFFIC_HOURS);
    let start = hour_start(Utc::now()) - Duration::hours(i64::from(hours) - 1);
    let counted = state.store.traffic_by_hour(start).await?;
    Ok(Json(fill_hours(start, hours, &counted)))
}

async fn summary(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.store.dashboard_summary().await?))
}

fn hour_start(t: DateTime<Utc>) -> DateTime<Utc> {
    let secs = t.timestamp();
    DateTime::from_timestamp(secs - secs.rem_euclid(3600), 0).unwrap_or(t)
}

fn fill_hours(start: DateTime<Utc>, hours: u32, counted: &[TrafficBucket]) -> Vec<TrafficBucket> {
    (0..i64::from(hours))
        .map(|i| {
            let time = start + Duration::hours(i);
            let sms_count = counted
                .iter()
                .find(|b| b.time == time)
                .map_or(0, |b| b.sms_count);
            TrafficBucket { time, sms_count }
        })
        .collect()
}

// ── Validation helpers ──────────────────────────────────────────────────

fn require(field: &str, value: &str) -> ApiResult<()> {
    if value.trim().is_empty() {
        return Err(ApiError::BadRequest(format!("{field} must not be empty")));
    }
    Ok(())
}

fn require_object(field: &str, value: &Value) -> ApiResult<()> {
    if !value.is_object() {
        return Err(ApiError::BadRequest(format!("{field} must be a JSON object")));
    }
    Ok(())
}
