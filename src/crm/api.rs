use std::str::FromStr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, Request, State},
    http::{HeaderMap, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, patch, post},
};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::actions::Crm;
use super::dashboard::DashboardMemo;
use super::dto::*;
use super::incidents::{IncidentFilter, IncidentLog};
use super::models::DealStage;
use super::pipeline::{BoardMemo, CardAction, apply_card_action, card_menu};
use super::quick_add::{QuickLead, quick_add_lead};
use super::schema::{POSTGRES_MIGRATION, Table, rls_policy_sql};
use super::store::{ChangeEvent, ChangeFeed, ChangeKind};
use super::sync::SyncStatus;
use super::views::{ActivityFilter, filter_activities, search_contacts};
use super::ws::{self, WsMessage, broadcast_message};
use crate::auth::{AuthGate, Sessions};
use crate::errors::{CrmError, StoreError};

pub const WEBHOOK_SECRET_HEADER: &str = "x-webhook-secret";

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub crm: Crm,
    pub incidents: Arc<IncidentLog>,
    pub ws_tx: broadcast::Sender<String>,
    pub gate: Arc<dyn AuthGate>,
    pub sessions: Sessions,
    pub board_memo: BoardMemo,
    pub dashboard_memo: DashboardMemo,
    pub feed: ChangeFeed,
    pub webhook_secret: Option<String>,
    /// Without a webhook secret, dev mode accepts unsigned change hooks.
    pub dev_mode: bool,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(
        crm: Crm,
        incidents: Arc<IncidentLog>,
        ws_tx: broadcast::Sender<String>,
        gate: Arc<dyn AuthGate>,
        feed: ChangeFeed,
    ) -> Self {
        Self {
            crm,
            incidents,
            ws_tx,
            gate,
            sessions: Sessions::default(),
            board_memo: BoardMemo::default(),
            dashboard_memo: DashboardMemo::default(),
            feed,
            webhook_secret: None,
            dev_mode: false,
        }
    }

    pub fn with_webhook_secret(mut self, secret: Option<String>) -> Self {
        self.webhook_secret = secret;
        self
    }

    pub fn with_dev_mode(mut self, dev_mode: bool) -> Self {
        self.dev_mode = dev_mode;
        self
    }
}

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Serialize, Deserialize)]
pub struct LoginResponse {
    pub token: String,
}

#[derive(Deserialize)]
pub struct StageRequest {
    pub stage: String,
}

#[derive(Deserialize)]
pub struct CompleteRequest {
    pub completed: bool,
}

#[derive(Deserialize, Default)]
pub struct ContactQuery {
    pub q: Option<String>,
}

#[derive(Deserialize, Default)]
pub struct ActivityQuery {
    pub filter: Option<String>,
}

#[derive(Deserialize, Default)]
pub struct IncidentQuery {
    pub status: Option<String>,
    pub severity: Option<String>,
    pub q: Option<String>,
}

/// Database webhook body. Only the table and event type are read.
#[derive(Deserialize)]
pub struct ChangeHook {
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    pub table: String,
}

#[derive(Serialize)]
pub struct StatusResponse {
    pub backend: &'static str,
    pub sync: SyncStatus,
    pub incidents: usize,
    pub incidents_error: Option<String>,
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    Unauthorized(String),
    BadRequest(String),
    Crm(CrmError),
}

impl From<CrmError> for ApiError {
    fn from(e: CrmError) -> Self {
        ApiError::Crm(e)
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        ApiError::Crm(e.into())
    }
}

/// Status, machine-readable kind and optional copyable SQL for a CRM error.
fn classify(e: &CrmError) -> (StatusCode, &'static str, Option<String>) {
    if let Some(store) = e.store_error() {
        return match store {
            StoreError::MissingRelation { .. } => (
                StatusCode::SERVICE_UNAVAILABLE,
                "missing_relation",
                Some(POSTGRES_MIGRATION.to_string()),
            ),
            StoreError::RowLevelSecurity { .. } => (
                StatusCode::FORBIDDEN,
                "row_level_security",
                Some(rls_policy_sql()),
            ),
            StoreError::Conflict { .. } => (StatusCode::CONFLICT, "conflict", None),
            StoreError::NotFound { .. } => (StatusCode::NOT_FOUND, "not_found", None),
            StoreError::Rejected { .. } => (StatusCode::BAD_REQUEST, "rejected", None),
            StoreError::Network(_) => (StatusCode::BAD_GATEWAY, "network", None),
            StoreError::Decode { .. } | StoreError::Database(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "store", None)
            }
        };
    }
    match e {
        CrmError::Validation(_)
        | CrmError::InvalidValue { .. }
        | CrmError::NoDragInProgress
        | CrmError::StageUnchanged { .. } => (StatusCode::BAD_REQUEST, "validation", None),
        CrmError::DealNotFound { .. } => (StatusCode::NOT_FOUND, "not_found", None),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal", None),
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind, message, remediation) = match self {
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "unauthorized", msg, None),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "validation", msg, None),
            ApiError::Crm(e) => {
                let (status, kind, remediation) = classify(&e);
                if status.is_server_error() {
                    tracing::warn!(error = %e, kind, "request failed");
                }
                (status, kind, e.to_string(), remediation)
            }
        };
        let mut body = serde_json::json!({"error": message, "kind": kind});
        if let Some(sql) = remediation {
            body["remediation"] = serde_json::Value::String(sql);
        }
        (status, Json(body)).into_response()
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router(state: &SharedState) -> Router<SharedState> {
    let protected = Router::new()
        .route("/api/logout", post(logout))
        .route("/api/snapshot", get(get_snapshot))
        .route("/api/status", get(get_status))
        .route("/api/refresh", post(refresh))
        .route("/api/staff", get(list_staff).post(create_staff))
        .route("/api/staff/{id}", patch(update_staff).delete(delete_staff))
        .route("/api/companies", get(list_companies).post(create_company))
        .route("/api/contacts", get(list_contacts).post(create_contact))
        .route("/api/contacts/{id}", patch(update_contact))
        .route("/api/deals", get(list_deals).post(create_deal))
        .route("/api/deals/{id}", axum::routing::delete(delete_deal))
        .route("/api/deals/{id}/stage", patch(update_deal_stage))
        .route(
            "/api/deals/{id}/actions",
            get(deal_actions).post(run_deal_action),
        )
        .route("/api/activities", get(list_activities).post(create_activity))
        .route("/api/activities/{id}/complete", patch(complete_activity))
        .route("/api/platforms", get(list_platforms).post(create_platform))
        .route(
            "/api/platforms/{id}",
            patch(update_platform).delete(delete_platform),
        )
        .route(
            "/api/interactions",
            get(list_interactions).post(create_interaction),
        )
        .route("/api/incidents", get(list_incidents).post(create_incident))
        .route("/api/incidents/{id}", patch(update_incident))
        .route("/api/incidents/{id}/toggle", post(toggle_incident))
        .route("/api/board", get(get_board))
        .route("/api/dashboard", get(get_dashboard))
        .route("/api/leads", post(create_lead))
        .route("/ws", get(ws::ws_handler))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(state),
            require_session,
        ));

    Router::new()
        .route("/health", get(health_check))
        .route("/api/login", post(login))
        .route("/api/hooks/changes", post(change_webhook))
        .merge(protected)
}

// ── Auth ──────────────────────────────────────────────────────────────

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

/// Browsers cannot set headers on a WebSocket upgrade, so `?token=` is accepted too.
fn query_token(query: Option<&str>) -> Option<&str> {
    query?
        .split('&')
        .find_map(|pair| pair.strip_prefix("token="))
}

async fn require_session(
    State(state): State<SharedState>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = bearer_token(req.headers()).or_else(|| query_token(req.uri().query()));
    match token {
        Some(token) if state.sessions.is_valid(token) => Ok(next.run(req).await),
        Some(_) => Err(ApiError::Unauthorized("Session expired or invalid".into())),
        None => Err(ApiError::Unauthorized("Login required".into())),
    }
}

async fn login(
    State(state): State<SharedState>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    if !state.gate.authorize(&req.username, &req.password) {
        tracing::warn!(username = %req.username, "login rejected");
        return Err(ApiError::Unauthorized("Invalid username or password".into()));
    }
    tracing::info!(username = %req.username, "admin logged in");
    Ok(Json(LoginResponse {
        token: state.sessions.issue(),
    }))
}

async fn logout(State(state): State<SharedState>, headers: HeaderMap) -> StatusCode {
    if let Some(token) = bearer_token(&headers) {
        state.sessions.revoke(token);
    }
    StatusCode::NO_CONTENT
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn get_snapshot(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.crm.snapshot())
}

async fn get_status(State(state): State<SharedState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        backend: state.crm.store().backend(),
        sync: state.crm.sync().status(),
        incidents: state.incidents.incidents().len(),
        incidents_error: state.incidents.error(),
    })
}

async fn refresh(State(state): State<SharedState>) -> Result<Json<StatusResponse>, ApiError> {
    state.crm.sync().refresh_data().await?;
    state.incidents.refresh().await?;
    Ok(get_status(State(state)).await)
}

async fn list_staff(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.crm.snapshot().staff)
}

async fn create_staff(
    State(state): State<SharedState>,
    Json(req): Json<NewStaff>,
) -> Result<impl IntoResponse, ApiError> {
    let staff = state.crm.add_staff(req).await?;
    Ok((StatusCode::CREATED, Json(staff)))
}

async fn update_staff(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<StaffPatch>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.crm.update_staff(&id, req).await?))
}

async fn delete_staff(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.crm.delete_staff(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_companies(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.crm.snapshot().companies)
}

async fn create_company(
    State(state): State<SharedState>,
    Json(req): Json<NewCompany>,
) -> Result<impl IntoResponse, ApiError> {
    let company = state.crm.add_company(req).await?;
    Ok((StatusCode::CREATED, Json(company)))
}

async fn list_contacts(
    State(state): State<SharedState>,
    Query(query): Query<ContactQuery>,
) -> impl IntoResponse {
    let contacts = state.crm.snapshot().contacts;
    let matches: Vec<_> = search_contacts(&contacts, query.q.as_deref().unwrap_or_default())
        .into_iter()
        .cloned()
        .collect();
    Json(matches)
}

async fn create_contact(
    State(state): State<SharedState>,
    Json(req): Json<NewContact>,
) -> Result<impl IntoResponse, ApiError> {
    let contact = state.crm.add_contact(req).await?;
    Ok((StatusCode::CREATED, Json(contact)))
}

async fn update_contact(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<ContactPatch>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.crm.update_contact(&id, req).await?))
}

async fn list_deals(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.crm.snapshot().deals)
}

async fn create_deal(
    State(state): State<SharedState>,
    Json(req): Json<NewDeal>,
) -> Result<impl IntoResponse, ApiError> {
    let deal = state.crm.add_deal(req).await?;
    Ok((StatusCode::CREATED, Json(deal)))
}

async fn delete_deal(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.crm.delete_deal(&id).await?;
    broadcast_message(&state.ws_tx, &WsMessage::DealDeleted { deal_id: id });
    Ok(StatusCode::NO_CONTENT)
}

async fn update_deal_stage(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<StageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let stage = DealStage::from_str(&req.stage).map_err(|_| CrmError::InvalidValue {
        field: "stage",
        value: req.stage.clone(),
    })?;
    let deal = state.crm.update_deal_stage(&id, stage).await?;
    broadcast_message(
        &state.ws_tx,
        &WsMessage::DealStageChanged {
            deal_id: deal.id.clone(),
            stage: deal.stage,
        },
    );
    Ok(Json(deal))
}

async fn deal_actions(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let snapshot = state.crm.snapshot();
    let deal = snapshot
        .deal(&id)
        .ok_or(CrmError::DealNotFound { id: id.clone() })?;
    Ok(Json(card_menu(deal)))
}

async fn run_deal_action(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(action): Json<CardAction>,
) -> Result<impl IntoResponse, ApiError> {
    let deal = state
        .crm
        .snapshot()
        .deal(&id)
        .cloned()
        .ok_or(CrmError::DealNotFound { id: id.clone() })?;
    let result = apply_card_action(&state.crm, &deal, action).await?;
    let msg = match &result {
        Some(updated) => WsMessage::DealStageChanged {
            deal_id: updated.id.clone(),
            stage: updated.stage,
        },
        None => WsMessage::DealDeleted { deal_id: id },
    };
    broadcast_message(&state.ws_tx, &msg);
    Ok(Json(serde_json::json!({"deal": result})))
}

async fn list_activities(
    State(state): State<SharedState>,
    Query(query): Query<ActivityQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let filter = match query.filter.as_deref() {
        Some(raw) => ActivityFilter::from_str(raw).map_err(ApiError::BadRequest)?,
        None => ActivityFilter::default(),
    };
    let activities = state.crm.snapshot().activities;
    let today = chrono::Local::now().date_naive();
    let matches: Vec<_> = filter_activities(&activities, filter, today)
        .into_iter()
        .cloned()
        .collect();
    Ok(Json(matches))
}

async fn create_activity(
    State(state): State<SharedState>,
    Json(req): Json<NewActivity>,
) -> Result<impl IntoResponse, ApiError> {
    let activity = state.crm.add_activity(req).await?;
    Ok((StatusCode::CREATED, Json(activity)))
}

async fn complete_activity(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<CompleteRequest>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.crm.complete_activity(&id, req.completed).await?))
}

async fn list_platforms(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.crm.snapshot().platforms)
}

async fn create_platform(
    State(state): State<SharedState>,
    Json(req): Json<NewPlatform>,
) -> Result<impl IntoResponse, ApiError> {
    let platform = state.crm.add_platform(&req.name).await?;
    Ok((StatusCode::CREATED, Json(platform)))
}

async fn update_platform(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<NewPlatform>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.crm.update_platform(&id, &req.name).await?))
}

async fn delete_platform(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.crm.delete_platform(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_interactions(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.crm.snapshot().interactions)
}

async fn create_interaction(
    State(state): State<SharedState>,
    Json(req): Json<NewInteraction>,
) -> Result<impl IntoResponse, ApiError> {
    let interaction = state.crm.add_interaction(req).await?;
    Ok((StatusCode::CREATED, Json(interaction)))
}

async fn list_incidents(
    State(state): State<SharedState>,
    Query(query): Query<IncidentQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let filter = IncidentFilter::from_params(
        query.status.as_deref(),
        query.severity.as_deref(),
        query.q.as_deref(),
    )?;
    let incidents = state.incidents.incidents();
    let matches: Vec<_> = filter.apply(&incidents).into_iter().cloned().collect();
    Ok(Json(matches))
}

async fn create_incident(
    State(state): State<SharedState>,
    Json(req): Json<NewIncident>,
) -> Result<impl IntoResponse, ApiError> {
    let incident = state.incidents.add(req).await?;
    Ok((StatusCode::CREATED, Json(incident)))
}

async fn update_incident(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<IncidentPatch>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.incidents.update(&id, req).await?))
}

async fn toggle_incident(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.incidents.toggle_status(&id).await?))
}

async fn get_board(State(state): State<SharedState>) -> impl IntoResponse {
    let deals = state.crm.snapshot().deals;
    Json(state.board_memo.get(&deals))
}

async fn get_dashboard(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.dashboard_memo.get(&state.crm.snapshot()))
}

async fn create_lead(
    State(state): State<SharedState>,
    Json(req): Json<QuickLead>,
) -> Result<impl IntoResponse, ApiError> {
    let outcome = quick_add_lead(&state.crm, req).await?;
    Ok((StatusCode::CREATED, Json(outcome)))
}

/// A configured secret must be presented. Without one, callers need an admin
/// session unless the server runs in dev mode.
fn authorize_webhook(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    match &state.webhook_secret {
        Some(secret) => {
            let presented = headers
                .get(WEBHOOK_SECRET_HEADER)
                .and_then(|v| v.to_str().ok());
            if presented != Some(secret.as_str()) {
                return Err(ApiError::Unauthorized("Invalid webhook secret".into()));
            }
        }
        None if state.dev_mode => {}
        None => {
            if !bearer_token(headers).is_some_and(|t| state.sessions.is_valid(t)) {
                return Err(ApiError::Unauthorized(
                    "Webhook secret not configured; an admin session is required".into(),
                ));
            }
        }
    }
    Ok(())
}

/// Row change notification from the hosted database.
async fn change_webhook(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(hook): Json<ChangeHook>,
) -> Result<StatusCode, ApiError> {
    authorize_webhook(&state, &headers)?;
    let table = Table::from_str(&hook.table).map_err(ApiError::BadRequest)?;
    tracing::debug!(table = %table, kind = ?hook.kind, "change webhook");
    state.feed.publish(ChangeEvent {
        table,
        kind: hook.kind,
    });
    if table == Table::Incidents {
        let incidents = Arc::clone(&state.incidents);
        tokio::spawn(async move {
            // Failures are already recorded on the log
            let _ = incidents.refresh().await;
        });
    }
    Ok(StatusCode::ACCEPTED)
}

// ── Tests ─────────────────────────────────────────────────────────────
