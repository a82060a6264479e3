#![deny(unsafe_code)]

pub mod auth;

use auth::{bearer_token, AuthError, IdentityResolver, JwtIdentityResolver};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use equity_core::{
    Business, BusinessId, CapTable, CapTableOrder, CascadeOutcome, CascadeReport, DealId,
    DealView, EntryId, EquityEngine, EquityError, EquitySetting, EquityStorageConfig,
    LedgerEntry, LedgerFilter, Milestone, MilestoneId, Portfolio, PostId, ProblemPost, Proposal,
    ProposalId, UserId,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub storage: EquityStorageConfig,
    /// HS256 secret shared with the identity service.
    pub jwt_secret: String,
}

#[derive(Clone)]
pub struct ServiceState {
    pub engine: Arc<EquityEngine>,
    pub identity: Arc<dyn IdentityResolver>,
}

impl ServiceState {
    pub async fn bootstrap(config: ServiceConfig) -> Result<Self, ServiceError> {
        let ServiceConfig {
            storage,
            jwt_secret,
        } = config;
        let identity = JwtIdentityResolver::new(&jwt_secret)?;
        let engine = EquityEngine::bootstrap(storage).await?;
        info!(backend = engine.backend_label(), "equity engine ready");
        Ok(Self::new(engine, Arc::new(identity)))
    }

    pub fn new(engine: EquityEngine, identity: Arc<dyn IdentityResolver>) -> Self {
        Self {
            engine: Arc::new(engine),
            identity,
        }
    }

    fn authenticate(&self, headers: &HeaderMap) -> Result<UserId, ApiError> {
        let token = bearer_token(headers)?;
        Ok(self.identity.resolve(token)?)
    }
}

pub fn build_router(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/approve-milestone", post(approve_milestone))
        .route("/v1/cap-table", get(cap_table))
        .route("/v1/portfolio", get(portfolio))
        .route("/v1/ledger/entries", get(list_ledger_entries))
        .route("/v1/businesses", post(create_business))
        .route(
            "/v1/businesses/:business_id/equity-settings",
            post(configure_equity),
        )
        .route("/v1/posts", post(create_post))
        .route(
            "/v1/posts/:post_id/proposals",
            get(list_proposals).post(submit_proposal),
        )
        .route("/v1/proposals/:proposal_id/accept", post(accept_proposal))
        .route("/v1/proposals/:proposal_id/reject", post(reject_proposal))
        .route("/v1/deals/:deal_id", get(get_deal))
        .route("/v1/deals/:deal_id/milestones", post(add_milestone))
        .route("/v1/deals/:deal_id/cascade", post(rerun_cascade))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("equity core error: {0}")]
    Core(#[from] EquityError),
    #[error("identity configuration error: {0}")]
    Auth(#[from] AuthError),
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{message}")]
    Http {
        status: StatusCode,
        code: &'static str,
        message: String,
    },
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Core(#[from] EquityError),
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self::Http {
            status: StatusCode::BAD_REQUEST,
            code: "INVALID_INPUT",
            message: message.into(),
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            ApiError::Http { status, .. } => *status,
            ApiError::Auth(_) => StatusCode::UNAUTHORIZED,
            ApiError::Core(err) => match err {
                EquityError::NotFound(_) => StatusCode::NOT_FOUND,
                EquityError::Forbidden(_) => StatusCode::FORBIDDEN,
                EquityError::Conflict(_) => StatusCode::CONFLICT,
                EquityError::InvalidInput(_) => StatusCode::BAD_REQUEST,
                EquityError::StorageFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    fn code(&self) -> &'static str {
        match self {
            ApiError::Http { code, .. } => *code,
            ApiError::Auth(_) => "UNAUTHORIZED",
            ApiError::Core(err) => err.code(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            // Storage details stay in the logs.
            ApiError::Core(EquityError::StorageFailure(detail)) => {
                error!(error = %detail, "storage failure while handling request");
                "storage unavailable; retry the request".to_string()
            }
            other => other.to_string(),
        };
        (
            status,
            Json(serde_json::json!({ "error": message, "code": self.code() })),
        )
            .into_response()
    }
}

fn parse_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    body.map(|Json(value)| value)
        .map_err(|rejection| ApiError::bad_request(rejection.body_text()))
}

fn required<'a>(field: &str, value: Option<&'a str>) -> Result<&'a str, ApiError> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ApiError::bad_request(format!("{} is required", field)))
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    storage_backend: &'static str,
}

async fn health(State(state): State<ServiceState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: "equity-service",
        storage_backend: state.engine.backend_label(),
    })
}

#[derive(Debug, Clone, Deserialize)]
struct ApproveMilestoneRequest {
    milestone_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApproveMilestoneResponse {
    pub ok: bool,
    pub milestone_id: MilestoneId,
    pub ledger_entry_id: EntryId,
    pub units: u64,
    pub cascade: CascadeReport,
}

async fn approve_milestone(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    body: Result<Json<ApproveMilestoneRequest>, JsonRejection>,
) -> Result<Json<ApproveMilestoneResponse>, ApiError> {
    let actor = state.authenticate(&headers)?;
    let request = parse_body(body)?;
    let milestone_id = MilestoneId::parse(required(
        "milestone_id",
        request.milestone_id.as_deref(),
    )?)?;

    let outcome = state.engine.approve_milestone(milestone_id, actor).await?;
    Ok(Json(ApproveMilestoneResponse {
        ok: true,
        milestone_id: outcome.milestone_id,
        ledger_entry_id: outcome.ledger_entry.id,
        units: outcome.ledger_entry.units,
        cascade: outcome.cascade,
    }))
}

#[derive(Debug, Clone, Deserialize)]
struct CapTableQuery {
    business_id: Option<String>,
    order: Option<String>,
}

async fn cap_table(
    State(state): State<ServiceState>,
    Query(query): Query<CapTableQuery>,
) -> Result<Json<CapTable>, ApiError> {
    let business_id = BusinessId::parse(required("business_id", query.business_id.as_deref())?)?;
    let order = match query.order.as_deref() {
        None => CapTableOrder::default(),
        Some(value) => CapTableOrder::parse(value).ok_or_else(|| {
            ApiError::bad_request(format!(
                "invalid order '{}'; expected units or holder",
                value
            ))
        })?,
    };
    Ok(Json(state.engine.cap_table(business_id, order).await?))
}

#[derive(Debug, Clone, Deserialize)]
struct PortfolioQuery {
    recipient_user_id: Option<String>,
}

async fn portfolio(
    State(state): State<ServiceState>,
    Query(query): Query<PortfolioQuery>,
) -> Result<Json<Portfolio>, ApiError> {
    let user = UserId::parse(required(
        "recipient_user_id",
        query.recipient_user_id.as_deref(),
    )?)?;
    Ok(Json(state.engine.portfolio(user).await?))
}

#[derive(Debug, Clone, Default, Deserialize)]
struct LedgerEntriesQuery {
    business_id: Option<String>,
    recipient_user_id: Option<String>,
    deal_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntriesResponse {
    pub backend: String,
    pub total: usize,
    pub items: Vec<LedgerEntry>,
}

async fn list_ledger_entries(
    State(state): State<ServiceState>,
    Query(query): Query<LedgerEntriesQuery>,
) -> Result<Json<LedgerEntriesResponse>, ApiError> {
    let filter = LedgerFilter {
        business_id: query
            .business_id
            .as_deref()
            .map(BusinessId::parse)
            .transpose()?,
        recipient_user_id: query
            .recipient_user_id
            .as_deref()
            .map(UserId::parse)
            .transpose()?,
        deal_id: query.deal_id.as_deref().map(DealId::parse).transpose()?,
    };
    let items = state.engine.ledger_entries(filter).await?;
    Ok(Json(LedgerEntriesResponse {
        backend: state.engine.backend_label().to_string(),
        total: items.len(),
        items,
    }))
}

#[derive(Debug, Clone, Deserialize)]
struct CreateBusinessRequest {
    name: String,
}

async fn create_business(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    body: Result<Json<CreateBusinessRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Business>), ApiError> {
    let actor = state.authenticate(&headers)?;
    let request = parse_body(body)?;
    let business = state.engine.create_business(actor, request.name).await?;
    Ok((StatusCode::CREATED, Json(business)))
}

#[derive(Debug, Clone, Deserialize)]
struct ConfigureEquityRequest {
    total_units: u64,
}

async fn configure_equity(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(business_id): Path<String>,
    body: Result<Json<ConfigureEquityRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<EquitySetting>), ApiError> {
    let actor = state.authenticate(&headers)?;
    let request = parse_body(body)?;
    let business_id = BusinessId::parse(&business_id)?;
    let setting = state
        .engine
        .configure_equity(business_id, actor, request.total_units)
        .await?;
    Ok((StatusCode::CREATED, Json(setting)))
}

#[derive(Debug, Clone, Deserialize)]
struct CreatePostRequest {
    business_id: String,
    title: String,
}

async fn create_post(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    body: Result<Json<CreatePostRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<ProblemPost>), ApiError> {
    let actor = state.authenticate(&headers)?;
    let request = parse_body(body)?;
    let business_id = BusinessId::parse(&request.business_id)?;
    let post = state
        .engine
        .create_post(business_id, actor, request.title)
        .await?;
    Ok((StatusCode::CREATED, Json(post)))
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SubmitProposalRequest {
    deliverables: Option<String>,
    timeline_days: Option<u32>,
    equity_ask: Option<u64>,
}

async fn submit_proposal(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(post_id): Path<String>,
    body: Result<Json<SubmitProposalRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Proposal>), ApiError> {
    let actor = state.authenticate(&headers)?;
    let request = parse_body(body)?;
    let post_id = PostId::parse(&post_id)?;
    let proposal = state
        .engine
        .submit_proposal(
            post_id,
            actor,
            request.deliverables,
            request.timeline_days,
            request.equity_ask,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(proposal)))
}

async fn list_proposals(
    State(state): State<ServiceState>,
    Path(post_id): Path<String>,
) -> Result<Json<Vec<Proposal>>, ApiError> {
    let post_id = PostId::parse(&post_id)?;
    Ok(Json(state.engine.proposals(post_id).await?))
}

async fn accept_proposal(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(proposal_id): Path<String>,
) -> Result<(StatusCode, Json<DealView>), ApiError> {
    let actor = state.authenticate(&headers)?;
    let proposal_id = ProposalId::parse(&proposal_id)?;
    let view = state.engine.accept_proposal(proposal_id, actor).await?;
    Ok((StatusCode::CREATED, Json(view)))
}

async fn reject_proposal(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(proposal_id): Path<String>,
) -> Result<Json<Proposal>, ApiError> {
    let actor = state.authenticate(&headers)?;
    let proposal_id = ProposalId::parse(&proposal_id)?;
    Ok(Json(state.engine.reject_proposal(proposal_id, actor).await?))
}

async fn get_deal(
    State(state): State<ServiceState>,
    Path(deal_id): Path<String>,
) -> Result<Json<DealView>, ApiError> {
    let deal_id = DealId::parse(&deal_id)?;
    Ok(Json(state.engine.deal(deal_id).await?))
}

#[derive(Debug, Clone, Deserialize)]
struct AddMilestoneRequest {
    title: String,
    acceptance_criteria: Option<String>,
    equity_grant_units: u64,
}

async fn add_milestone(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(deal_id): Path<String>,
    body: Result<Json<AddMilestoneRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Milestone>), ApiError> {
    let actor = state.authenticate(&headers)?;
    let request = parse_body(body)?;
    let deal_id = DealId::parse(&deal_id)?;
    let milestone = state
        .engine
        .add_milestone(
            deal_id,
            actor,
            request.title,
            request.acceptance_criteria,
            request.equity_grant_units,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(milestone)))
}

async fn rerun_cascade(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(deal_id): Path<String>,
) -> Result<Json<CascadeOutcome>, ApiError> {
    let actor = state.authenticate(&headers)?;
    let deal_id = DealId::parse(&deal_id)?;
    Ok(Json(state.engine.run_cascade(deal_id, actor).await?))
}
