//! Axum route handlers for the curator HTTP server.
//!
//! # Routes
//!
//! - `GET    /health`                              Aggregated health
//! - `GET    /services`                            Discover live instances
//! - `GET    /services/all`                        Every stored instance
//! - `PATCH  /services/:name`                      Update service metadata
//! - `POST   /services/:name/:instance/health`     Report instance health
//! - `POST   /services/:name/:instance/heartbeat`  Refresh liveness
//! - `DELETE /services/:name/:instance`            Deregister an instance
//! - `GET    /capabilities`                        List capabilities
//! - `GET    /capabilities/search`                 Search by text and tag
//! - `GET    /capabilities/:service/:capability`   One capability
//! - `GET    /soa-apis`, `GET /mcp-tools`          Contract bindings
//! - `GET    /routes`, `POST /routes`              Route discovery and registration
//! - `GET    /routes/:id`, `DELETE /routes/:id`    One route
//! - `GET    /agents`, `POST /agents`              Agent reports and registration
//! - `GET    /agents/analytics`                    Usage analytics
//! - `GET    /agents/:id`                          One agent report
//! - `POST   /agents/:id/usage`, `/agents/:id/health`
//! - `GET    /violations`                          Open violations or history
//! - `GET    /snapshot`                            Full registry snapshot
//!
//! Caller identity is read from the `x-principal` and `x-tenant-id`
//! headers, which an authenticating proxy in front of the server must set.
//! A request without `x-principal` acts as [`CallerContext::anonymous`]: it
//! sees global records only and holds no roles. Over HTTP there is never a
//! platform-level caller.
//!
//! Roles in `x-roles` are ignored unless
//! [`trust_forwarded_roles`](crate::config::CuratorConfig::trust_forwarded_roles)
//! is set. Otherwise the security guard resolves roles from its own
//! assignments for the principal.

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{delete, get, patch, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::Value;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::agent_registry::{AgentHealth, AgentRegistration, UsageOutcome};
use crate::capabilities::CapabilityFilter;
use crate::contracts::BindingFilter;
use crate::curator::Curator;
use crate::endpoints::{RouteFilter, RouteRecord};
use crate::errors::CuratorError;
use crate::health::HealthStatus;
use crate::security::CallerContext;
use crate::services::{ServiceStatus, ServiceUpdate};

pub const PRINCIPAL_HEADER: &str = "x-principal";
pub const TENANT_HEADER: &str = "x-tenant-id";
pub const ROLES_HEADER: &str = "x-roles";

/// Shared application state for the HTTP server.
#[derive(Clone)]
pub struct AppState {
    pub curator: Curator,
    /// Copied from the curator configuration.
    pub trust_forwarded_roles: bool,
}

impl AppState {
    pub fn new(curator: Curator) -> Self {
        let trust_forwarded_roles = curator.config().trust_forwarded_roles;
        Self {
            curator,
            trust_forwarded_roles,
        }
    }

    /// Caller of one request. See [`caller_from_headers`].
    fn caller(&self, headers: &HeaderMap) -> CallerContext {
        caller_from_headers(headers, self.trust_forwarded_roles)
    }
}

type ApiError = (StatusCode, Json<Value>);
type ApiResult<T> = Result<Json<T>, ApiError>;

/// Build the axum router with all routes.
pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/services", get(discover_services_handler))
        .route("/services/all", get(list_services_handler))
        .route("/services/:name", patch(update_service_handler))
        .route("/services/:name/:instance", delete(deregister_handler))
        .route("/services/:name/:instance/health", post(report_health_handler))
        .route("/services/:name/:instance/heartbeat", post(heartbeat_handler))
        .route("/capabilities", get(list_capabilities_handler))
        .route("/capabilities/search", get(search_capabilities_handler))
        .route("/capabilities/:service/:capability", get(get_capability_handler))
        .route("/soa-apis", get(list_soa_apis_handler))
        .route("/mcp-tools", get(list_mcp_tools_handler))
        .route("/routes", get(discover_routes_handler).post(register_route_handler))
        .route("/routes/:id", get(get_route_handler).delete(unregister_route_handler))
        .route("/agents", get(list_agents_handler).post(register_agent_handler))
        .route("/agents/analytics", get(agent_analytics_handler))
        .route("/agents/:id", get(get_agent_handler))
        .route("/agents/:id/usage", post(record_usage_handler))
        .route("/agents/:id/health", post(agent_health_handler))
        .route("/violations", get(violations_handler))
        .route("/snapshot", get(snapshot_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Map a facade error onto an HTTP status and `{error, code}` body.
fn api_error(e: CuratorError) -> ApiError {
    let status = match &e {
        CuratorError::Validation(_) | CuratorError::NullHandler { .. } => StatusCode::BAD_REQUEST,
        CuratorError::NotFound { .. } => StatusCode::NOT_FOUND,
        CuratorError::TerminalState { .. } | CuratorError::InvalidTransition { .. } | CuratorError::Conflict(_) => {
            StatusCode::CONFLICT
        }
        CuratorError::AccessDenied(_) => StatusCode::FORBIDDEN,
        CuratorError::NotReady { .. } => StatusCode::SERVICE_UNAVAILABLE,
        CuratorError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        CuratorError::Backend(_) => StatusCode::BAD_GATEWAY,
        CuratorError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(serde_json::json!({
            "error": e.to_string(),
            "code": e.code(),
        })),
    )
}

/// Caller context from request headers.
///
/// Without `x-principal` the caller is anonymous and any tenant or role
/// header is ignored. `x-roles` is honoured only when `trust_roles` is set.
pub fn caller_from_headers(headers: &HeaderMap, trust_roles: bool) -> CallerContext {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    let Some(principal) = header(PRINCIPAL_HEADER) else {
        return CallerContext::anonymous();
    };
    let mut caller = CallerContext::new(principal);
    if let Some(tenant) = header(TENANT_HEADER) {
        caller = caller.with_tenant(tenant);
    }
    match header(ROLES_HEADER) {
        Some(roles) if trust_roles => {
            caller = caller.with_roles(roles.split(',').map(str::trim).filter(|r| !r.is_empty()));
        }
        Some(_) => log::debug!("Ignoring forwarded roles of principal '{}'", caller.principal),
        None => {}
    }
    caller
}

/// GET /health: 503 while unhealthy so load balancers can act on it.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let health = state.curator.get_aggregated_health();
    let status = if health.overall_status == HealthStatus::Unhealthy {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (
        status,
        Json(serde_json::json!({
            "service": "curator",
            "version": crate::VERSION,
            "health": health,
        })),
    )
}

#[derive(Debug, Default, Deserialize)]
struct DiscoverQuery {
    realm: Option<String>,
    service_type: Option<String>,
    capability_tag: Option<String>,
}

async fn discover_services_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<DiscoverQuery>,
) -> ApiResult<Value> {
    let caller = state.caller(&headers);
    let services = state
        .curator
        .discover_services(
            query.realm.as_deref(),
            query.service_type.as_deref(),
            query.capability_tag.as_deref(),
            Some(&caller),
        )
        .await
        .map_err(api_error)?;
    Ok(Json(serde_json::json!({ "services": services })))
}

async fn list_services_handler(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<Value> {
    let caller = state.caller(&headers);
    let services = state
        .curator
        .list_services(Some(&caller))
        .await
        .map_err(api_error)?;
    Ok(Json(serde_json::json!({ "services": services })))
}

#[derive(Debug, Deserialize)]
struct HealthReport {
    status: ServiceStatus,
}

async fn report_health_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((name, instance)): Path<(String, String)>,
    Json(report): Json<HealthReport>,
) -> ApiResult<Value> {
    let caller = state.caller(&headers);
    let ack = state
        .curator
        .report_health(&name, &instance, report.status, Some(&caller))
        .await
        .map_err(api_error)?;
    Ok(Json(serde_json::to_value(ack).unwrap_or(Value::Null)))
}

async fn heartbeat_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((name, instance)): Path<(String, String)>,
) -> ApiResult<Value> {
    let caller = state.caller(&headers);
    let record = state
        .curator
        .heartbeat(&name, &instance, Some(&caller))
        .await
        .map_err(api_error)?;
    Ok(Json(serde_json::json!({ "service": record })))
}

async fn deregister_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((name, instance)): Path<(String, String)>,
) -> ApiResult<Value> {
    let caller = state.caller(&headers);
    let ack = state
        .curator
        .deregister(&name, &instance, Some(&caller))
        .await
        .map_err(api_error)?;
    Ok(Json(serde_json::to_value(ack).unwrap_or(Value::Null)))
}

async fn update_service_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(name): Path<String>,
    Json(update): Json<ServiceUpdate>,
) -> ApiResult<Value> {
    let caller = state.caller(&headers);
    let ack = state
        .curator
        .update_service(&name, update, Some(&caller))
        .await
        .map_err(api_error)?;
    Ok(Json(serde_json::to_value(ack).unwrap_or(Value::Null)))
}

async fn list_capabilities_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(filter): Query<CapabilityFilter>,
) -> ApiResult<Value> {
    let caller = state.caller(&headers);
    let capabilities = state
        .curator
        .list_capabilities(&filter, Some(&caller))
        .await
        .map_err(api_error)?;
    Ok(Json(serde_json::json!({ "capabilities": capabilities })))
}

#[derive(Debug, Default, Deserialize)]
struct SearchQuery {
    #[serde(default)]
    query: String,
    tag: Option<String>,
}

/// GET /capabilities/search: 400 without a query or a tag.
async fn search_capabilities_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(search): Query<SearchQuery>,
) -> ApiResult<Value> {
    let caller = state.caller(&headers);
    let capabilities = state
        .curator
        .search_capabilities(&search.query, search.tag.as_deref(), Some(&caller))
        .await
        .map_err(api_error)?;
    Ok(Json(serde_json::json!({ "capabilities": capabilities })))
}

async fn get_capability_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((service, capability)): Path<(String, String)>,
) -> ApiResult<Value> {
    let caller = state.caller(&headers);
    let definition = state
        .curator
        .get_capability(&service, &capability, Some(&caller))
        .await
        .map_err(api_error)?;
    Ok(Json(serde_json::to_value(definition.as_ref()).unwrap_or(Value::Null)))
}

async fn list_soa_apis_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(filter): Query<BindingFilter>,
) -> ApiResult<Value> {
    let caller = state.caller(&headers);
    let apis = state
        .curator
        .list_soa_apis(&filter, Some(&caller))
        .await
        .map_err(api_error)?;
    Ok(Json(serde_json::json!({ "soa_apis": apis })))
}

async fn list_mcp_tools_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(filter): Query<BindingFilter>,
) -> ApiResult<Value> {
    let caller = state.caller(&headers);
    let tools = state
        .curator
        .list_mcp_tools(&filter, Some(&caller))
        .await
        .map_err(api_error)?;
    Ok(Json(serde_json::json!({ "mcp_tools": tools })))
}

async fn discover_routes_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(filter): Query<RouteFilter>,
) -> ApiResult<Value> {
    let caller = state.caller(&headers);
    let routes = state
        .curator
        .discover_routes(&filter, Some(&caller))
        .await
        .map_err(api_error)?;
    Ok(Json(serde_json::json!({ "routes": routes })))
}

async fn register_route_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(route): Json<RouteRecord>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let caller = state.caller(&headers);
    let ack = state
        .curator
        .register_route(route, Some(&caller))
        .await
        .map_err(api_error)?;
    let status = if ack.replaced {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(serde_json::to_value(ack).unwrap_or(Value::Null))))
}

async fn get_route_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Value> {
    let caller = state.caller(&headers);
    let route = state
        .curator
        .get_route(&id, Some(&caller))
        .await
        .map_err(api_error)?;
    Ok(Json(serde_json::to_value(route.as_ref()).unwrap_or(Value::Null)))
}

async fn unregister_route_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Value> {
    let caller = state.caller(&headers);
    let removed = state
        .curator
        .unregister_route(&id, Some(&caller))
        .await
        .map_err(api_error)?;
    Ok(Json(serde_json::json!({ "removed": removed })))
}

#[derive(Debug, Default, Deserialize)]
struct AgentQuery {
    #[serde(default)]
    include_archived: bool,
    tag: Option<String>,
}

/// GET /agents: with `tag`, only active agents advertising it.
async fn list_agents_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<AgentQuery>,
) -> ApiResult<Value> {
    let caller = state.caller(&headers);
    let agents = match query.tag.as_deref() {
        Some(tag) => state.curator.discover_agents(tag, Some(&caller)).await,
        None => {
            state
                .curator
                .list_agent_reports(query.include_archived, Some(&caller))
                .await
        }
    }
    .map_err(api_error)?;
    Ok(Json(serde_json::json!({ "agents": agents })))
}

async fn register_agent_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(registration): Json<AgentRegistration>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let caller = state.caller(&headers);
    let ack = state
        .curator
        .register_agent(registration, Some(&caller))
        .await
        .map_err(api_error)?;
    let status = if ack.existed {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(serde_json::to_value(ack).unwrap_or(Value::Null))))
}

async fn agent_analytics_handler(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<Value> {
    let caller = state.caller(&headers);
    let analytics = state
        .curator
        .agent_analytics(Some(&caller))
        .await
        .map_err(api_error)?;
    Ok(Json(serde_json::to_value(analytics).unwrap_or(Value::Null)))
}

async fn get_agent_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Value> {
    let caller = state.caller(&headers);
    let report = state
        .curator
        .get_agent_report(&id, Some(&caller))
        .await
        .map_err(api_error)?;
    Ok(Json(serde_json::to_value(report).unwrap_or(Value::Null)))
}

#[derive(Debug, Deserialize)]
struct UsageReport {
    tag: String,
}

/// POST /agents/:id/usage: unknown and archived agents get a warning, not
/// an error.
async fn record_usage_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(report): Json<UsageReport>,
) -> ApiResult<Value> {
    let caller = state.caller(&headers);
    let outcome = state
        .curator
        .record_usage(&id, &report.tag, Some(&caller))
        .await
        .map_err(api_error)?;
    let body = match outcome {
        UsageOutcome::Recorded { usage_count } => serde_json::json!({
            "recorded": true,
            "usage_count": usage_count,
        }),
        UsageOutcome::UnknownAgent => serde_json::json!({
            "recorded": false,
            "warning": format!("agent '{}' is not registered", id),
        }),
        UsageOutcome::ArchivedAgent => serde_json::json!({
            "recorded": false,
            "warning": format!("agent '{}' is archived", id),
        }),
    };
    Ok(Json(body))
}

#[derive(Debug, Deserialize)]
struct AgentHealthReport {
    status: AgentHealth,
}

async fn agent_health_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(report): Json<AgentHealthReport>,
) -> ApiResult<Value> {
    let caller = state.caller(&headers);
    let agent = state
        .curator
        .report_agent_health(&id, report.status, Some(&caller))
        .await
        .map_err(api_error)?;
    Ok(Json(serde_json::to_value(agent).unwrap_or(Value::Null)))
}

#[derive(Debug, Default, Deserialize)]
struct ViolationQuery {
    subject: Option<String>,
    #[serde(default)]
    history: bool,
}

/// GET /violations: open violations, or every ledger entry with
/// `history=true`.
async fn violations_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ViolationQuery>,
) -> ApiResult<Value> {
    let caller = state.caller(&headers);
    let subject = query.subject.as_deref();
    let body = if query.history {
        let entries = state
            .curator
            .get_violation_history(subject, Some(&caller))
            .await
            .map_err(api_error)?;
        serde_json::json!({ "history": entries })
    } else {
        let open = state
            .curator
            .get_violations(subject, Some(&caller))
            .await
            .map_err(api_error)?;
        serde_json::json!({ "violations": open })
    };
    Ok(Json(body))
}

async fn snapshot_handler(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<Value> {
    let caller = state.caller(&headers);
    let snapshot = state
        .curator
        .snapshot(Some(&caller))
        .await
        .map_err(api_error)?;
    Ok(Json(snapshot.to_json()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use axum::response::Response;
    use tower::ServiceExt;

    use crate::capabilities::CapabilityDefinition;
    use crate::config::CuratorConfig;
    use crate::contracts::{HandlerRef, HttpMethod, SoaApiContract};
    use crate::security::{RbacGuard, ANONYMOUS_PRINCIPAL};
    use crate::services::ServiceRecord;
    use std::sync::Arc;

    async fn ready_state() -> AppState {
        let curator = Curator::new(CuratorConfig::default()).unwrap();
        curator.initialize().await.unwrap();
        curator
            .register_service(
                ServiceRecord::new("parser-1", "i-1").with_realm("content"),
                vec![CapabilityDefinition::new("parse_pdf", "parser-1", "ContentParsingProtocol")
                    .with_soa_api(SoaApiContract::new("/v1/parse", HttpMethod::Post, HandlerRef::new("parse")))],
                None,
                None,
            )
            .await
            .unwrap();
        curator
            .register_capability(
                CapabilityDefinition::new("score_risk", "parser-1", "RiskProtocol").with_tenant("A"),
                None,
            )
            .await
            .unwrap();
        AppState::new(curator)
    }

    async fn json_body(response: Response) -> Value {
        let body = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("Content-Type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let app = app_router(ready_state().await);

        let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = json_body(response).await;
        assert_eq!(json["service"], "curator");
        assert_eq!(json["version"], crate::VERSION);
        assert_eq!(json["health"]["lifecycle"], "ready");
        assert_eq!(json["health"]["discovery_backend"]["status"], "disabled");
    }

    #[tokio::test]
    async fn test_health_unavailable_before_initialize() {
        let curator = Curator::new(CuratorConfig::default()).unwrap();
        let app = app_router(AppState::new(curator));

        let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let request = Request::builder().uri("/services").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json_body(response).await["code"], "NOT_READY");
    }

    #[tokio::test]
    async fn test_service_health_and_deregistration() {
        let app = app_router(ready_state().await);

        let response = app
            .clone()
            .oneshot(post_json("/services/parser-1/i-1/health", serde_json::json!({"status": "healthy"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = json_body(response).await;
        assert_eq!(json["previous_status"], "starting");
        assert_eq!(json["service"]["status"], "healthy");

        let request = Request::builder()
            .uri("/services?realm=content")
            .body(Body::empty())
            .unwrap();
        let json = json_body(app.clone().oneshot(request).await.unwrap()).await;
        assert_eq!(json["services"].as_array().unwrap().len(), 1);

        let request = Request::builder()
            .method("DELETE")
            .uri("/services/parser-1/i-1")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = json_body(response).await;
        assert_eq!(json["noop"], false);

        let response = app
            .oneshot(post_json("/services/parser-1/i-1/health", serde_json::json!({"status": "healthy"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(json_body(response).await["code"], "TERMINAL_STATE");
    }

    #[tokio::test]
    async fn test_capabilities_respect_tenant_header() {
        let app = app_router(ready_state().await);

        let request = Request::builder()
            .uri("/capabilities?owning_service=parser-1")
            .header(PRINCIPAL_HEADER, "bob")
            .header(TENANT_HEADER, "B")
            .body(Body::empty())
            .unwrap();
        let json = json_body(app.clone().oneshot(request).await.unwrap()).await;
        let names: Vec<&str> = json["capabilities"]
            .as_array()
            .unwrap()
            .iter()
            .map(|c| c["capability_name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["parse_pdf"]);

        let request = Request::builder()
            .uri("/capabilities/parser-1/score_risk")
            .header(PRINCIPAL_HEADER, "bob")
            .header(TENANT_HEADER, "B")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let request = Request::builder()
            .uri("/capabilities/parser-1/missing")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let request = Request::builder()
            .uri("/soa-apis?owning_service=parser-1")
            .body(Body::empty())
            .unwrap();
        let json = json_body(app.oneshot(request).await.unwrap()).await;
        assert_eq!(json["soa_apis"][0]["api_name"], "/v1/parse");
    }

    #[tokio::test]
    async fn test_agent_endpoints() {
        let app = app_router(ready_state().await);

        let response = app
            .clone()
            .oneshot(post_json(
                "/agents",
                serde_json::json!({"agent_id": "agent-7", "capability_tags": ["parse", "summarize"]}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = app
            .clone()
            .oneshot(post_json("/agents/agent-7/usage", serde_json::json!({"tag": "parse"})))
            .await
            .unwrap();
        let json = json_body(response).await;
        assert_eq!(json["recorded"], true);
        assert_eq!(json["usage_count"], 1);

        let response = app
            .clone()
            .oneshot(post_json("/agents/ghost/usage", serde_json::json!({"tag": "parse"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["recorded"], false);

        let request = Request::builder().uri("/agents/agent-7").body(Body::empty()).unwrap();
        let json = json_body(app.clone().oneshot(request).await.unwrap()).await;
        assert_eq!(json["usage_by_tag"]["parse"], 1);
        assert_eq!(json["unused_tags"], serde_json::json!(["summarize"]));

        let request = Request::builder()
            .uri("/agents/analytics")
            .body(Body::empty())
            .unwrap();
        let json = json_body(app.oneshot(request).await.unwrap()).await;
        assert_eq!(json["total_agents"], 1);
    }

    #[tokio::test]
    async fn test_snapshot_and_violations() {
        let state = ready_state().await;
        state
            .curator
            .register_service(ServiceRecord::new("Legacy", "l-1"), Vec::new(), None, None)
            .await
            .unwrap();
        let app = app_router(state);

        let request = Request::builder()
            .uri("/violations?subject=Legacy")
            .body(Body::empty())
            .unwrap();
        let json = json_body(app.clone().oneshot(request).await.unwrap()).await;
        assert_eq!(json["violations"][0]["rule_id"], "service_naming");

        let request = Request::builder().uri("/snapshot").body(Body::empty()).unwrap();
        let json = json_body(app.oneshot(request).await.unwrap()).await;
        assert_eq!(json["services"].as_array().unwrap().len(), 2);
        assert_eq!(json["soa_apis"].as_array().unwrap().len(), 1);
    }

    fn get_as(uri: &str, principal: Option<&str>, tenant: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri(uri);
        if let Some(principal) = principal {
            builder = builder.header(PRINCIPAL_HEADER, principal);
        }
        if let Some(tenant) = tenant {
            builder = builder.header(TENANT_HEADER, tenant);
        }
        builder.body(Body::empty()).unwrap()
    }

    fn capability_names(json: &Value) -> Vec<String> {
        json["capabilities"]
            .as_array()
            .unwrap()
            .iter()
            .map(|c| c["capability_name"].as_str().unwrap().to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_headerless_request_sees_global_records_only() {
        let app = app_router(ready_state().await);

        let json = json_body(app.clone().oneshot(get_as("/capabilities", None, None)).await.unwrap()).await;
        assert_eq!(capability_names(&json), vec!["parse_pdf"]);

        let response = app
            .clone()
            .oneshot(get_as("/capabilities/parser-1/score_risk", None, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let json = json_body(app.oneshot(get_as("/capabilities", Some("alice"), Some("A"))).await.unwrap()).await;
        assert_eq!(capability_names(&json), vec!["parse_pdf", "score_risk"]);
    }

    async fn rbac_state(trust_forwarded_roles: bool) -> AppState {
        let guard = RbacGuard::default();
        guard.configure(|rbac| {
            rbac.grant("admin", "*");
            rbac.grant("reader", "*:read");
            rbac.assign_role("alice", "reader");
        });
        let curator = Curator::builder(CuratorConfig {
            trust_forwarded_roles,
            ..CuratorConfig::default()
        })
        .security_guard(Arc::new(guard))
        .build()
        .unwrap();
        curator.initialize().await.unwrap();
        curator
            .register_service(ServiceRecord::new("parser-1", "i-1"), Vec::new(), None, None)
            .await
            .unwrap();
        AppState::new(curator)
    }

    fn agent_post_as(principal: &str, roles: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/agents")
            .header("Content-Type", "application/json")
            .header(PRINCIPAL_HEADER, principal)
            .header(ROLES_HEADER, roles)
            .body(Body::from(serde_json::json!({"agent_id": "agent-9"}).to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_forwarded_roles_need_trust() {
        let app = app_router(rbac_state(false).await);

        let response = app.clone().oneshot(agent_post_as("mallory", "admin")).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(json_body(response).await["code"], "ACCESS_DENIED");

        // Assigned roles still apply; anonymous callers hold none.
        let json = json_body(
            app.clone()
                .oneshot(get_as("/services/all", Some("alice"), None))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(json["services"].as_array().unwrap().len(), 1);
        let json = json_body(app.oneshot(get_as("/services/all", None, None)).await.unwrap()).await;
        assert!(json["services"].as_array().unwrap().is_empty());

        let app = app_router(rbac_state(true).await);
        let response = app.oneshot(agent_post_as("mallory", "admin")).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    #[tokio::test]
    async fn test_binding_conflict_maps_to_409() {
        let state = ready_state().await;
        let err = state
            .curator
            .register_capability(
                CapabilityDefinition::new("parse_doc", "parser-1", "ContentParsingProtocol")
                    .with_soa_api(SoaApiContract::new("/v1/parse", HttpMethod::Post, HandlerRef::new("doc"))),
                None,
            )
            .await
            .unwrap_err();

        let (status, Json(body)) = api_error(err);
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "CONFLICT");
    }

    #[tokio::test]
    async fn test_capability_search_endpoint() {
        let app = app_router(ready_state().await);

        let json = json_body(
            app.clone()
                .oneshot(get_as("/capabilities/search?query=PDF", None, None))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(capability_names(&json), vec!["parse_pdf"]);

        let json = json_body(
            app.clone()
                .oneshot(get_as("/capabilities/search?query=risk", None, None))
                .await
                .unwrap(),
        )
        .await;
        assert!(capability_names(&json).is_empty());
        let json = json_body(
            app.clone()
                .oneshot(get_as("/capabilities/search?query=risk", Some("alice"), Some("A")))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(capability_names(&json), vec!["score_risk"]);

        let response = app.oneshot(get_as("/capabilities/search", None, None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["code"], "VALIDATION_ERROR");
    }

    fn route_request(method: &str, uri: &str, tenant: &str, body: Option<Value>) -> Request<Body> {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(PRINCIPAL_HEADER, format!("user-{}", tenant))
            .header(TENANT_HEADER, tenant);
        match body {
            Some(body) => builder
                .header("Content-Type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_route_endpoints() {
        let app = app_router(ready_state().await);
        let route = serde_json::json!({
            "route_id": "upload",
            "path": "/api/upload",
            "method": "POST",
            "pillar": "content",
            "realm": "business_enablement",
            "service_name": "parser-1",
            "handler": "upload_file",
            "tenant_scope": "A",
        });

        let response = app
            .clone()
            .oneshot(route_request("POST", "/routes", "A", Some(route.clone())))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(json_body(response).await["route"]["defined_by"], "business_enablement");

        let json = json_body(
            app.clone()
                .oneshot(route_request("GET", "/routes?pillar=content", "A", None))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(json["routes"].as_array().unwrap().len(), 1);

        let json = json_body(app.clone().oneshot(get_as("/routes", None, None)).await.unwrap()).await;
        assert!(json["routes"].as_array().unwrap().is_empty());
        let response = app.clone().oneshot(get_as("/routes/upload", None, None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let mut takeover = route.clone();
        takeover["tenant_scope"] = Value::Null;
        let response = app
            .clone()
            .oneshot(route_request("POST", "/routes", "B", Some(takeover)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = app
            .clone()
            .oneshot(route_request("POST", "/routes", "A", Some(route)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = json_body(
            app.clone()
                .oneshot(route_request("DELETE", "/routes/upload", "A", None))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(json["removed"], true);
        let json = json_body(
            app.oneshot(route_request("DELETE", "/routes/upload", "A", None))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(json["removed"], false);
    }

    fn patch_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("PATCH")
            .uri(uri)
            .header("Content-Type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_update_service_endpoint() {
        let app = app_router(ready_state().await);

        let response = app
            .clone()
            .oneshot(patch_json("/services/parser-1", serde_json::json!({"version": "2.0"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = json_body(response).await;
        assert_eq!(json["service_name"], "parser-1");
        assert_eq!(json["services"][0]["version"], "2.0");

        let response = app
            .clone()
            .oneshot(patch_json("/services/parser-1", serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .oneshot(patch_json("/services/ghost", serde_json::json!({"version": "2.0"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_caller_from_headers() {
        let mut headers = HeaderMap::new();
        assert_eq!(caller_from_headers(&headers, true), CallerContext::anonymous());

        // Tenant and roles without a principal are ignored.
        headers.insert(TENANT_HEADER, "A".parse().unwrap());
        headers.insert(ROLES_HEADER, "reader, registrar,".parse().unwrap());
        let caller = caller_from_headers(&headers, true);
        assert_eq!(caller.principal, ANONYMOUS_PRINCIPAL);
        assert!(caller.tenant_id.is_none());
        assert!(caller.roles.is_empty());

        headers.insert(PRINCIPAL_HEADER, "alice".parse().unwrap());
        let caller = caller_from_headers(&headers, true);
        assert_eq!(caller.principal, "alice");
        assert_eq!(caller.tenant_id.as_deref(), Some("A"));
        assert_eq!(caller.roles, vec!["reader", "registrar"]);

        let caller = caller_from_headers(&headers, false);
        assert_eq!(caller.tenant_id.as_deref(), Some("A"));
        assert!(caller.roles.is_empty());
    }
}
