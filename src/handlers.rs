use axum::{
    extract::{Query, Request, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

use crate::error::{Error, Result};
use crate::health::HealthStatus;
use crate::middleware::get_client_ip;
use crate::rate_limit_config::{Rule, RuleError};
use crate::resilient::ResilientStore;
use crate::rules::RuleStore;
use crate::throttler::Throttler;

pub const CLIENT_ID_HEADER: &str = "x-client-id";
pub const ENDPOINT_HEADER: &str = "x-endpoint";

/// Application state shared by every handler
#[derive(Clone)]
pub struct AppState {
    pub throttler: Arc<Throttler>,
    pub rules: Arc<dyn RuleStore>,
    pub limiter_store: Arc<ResilientStore>,
    pub started_at: Instant,
}

#[derive(Debug, Deserialize)]
pub struct RuleQuery {
    pub endpoint: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RuleResponse {
    pub status: String,
    pub message: String,
    pub endpoint: String,
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

/// Admission check for the request described by the `x-endpoint` and
/// `x-client-id` headers.
pub async fn check_limit(State(state): State<AppState>, request: Request) -> Result<Response> {
    let headers = request.headers();

    let endpoint = header_value(headers, ENDPOINT_HEADER)
        .ok_or_else(|| Error::InvalidRequest(format!("missing {} header", ENDPOINT_HEADER)))?
        .to_string();

    let identity = match header_value(headers, CLIENT_ID_HEADER) {
        Some(client_id) => client_id.to_string(),
        None => {
            let ip = get_client_ip(&request);
            if ip == "unknown" || ip.is_empty() {
                return Err(Error::InvalidRequest(format!(
                    "missing {} header and no client address",
                    CLIENT_ID_HEADER
                )));
            }
            ip
        }
    };

    let decision = state.throttler.check_limit(&identity, &endpoint).await;

    let status = StatusCode::from_u16(decision.status.code())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = (status, Json(decision)).into_response();

    let headers = response.headers_mut();
    headers.insert("x-ratelimit-limit", HeaderValue::from(decision.limit));
    headers.insert("x-ratelimit-remaining", HeaderValue::from(decision.remaining));

    Ok(response)
}

/// All rules, or the rule for `?endpoint=`.
pub async fn get_rules(
    State(state): State<AppState>,
    Query(query): Query<RuleQuery>,
) -> Result<Response> {
    match query.endpoint {
        Some(endpoint) => {
            let rule = state
                .rules
                .get_rule(&endpoint)
                .await?
                .ok_or(RuleError::NotFound(endpoint))?;
            Ok(Json(rule).into_response())
        }
        None => {
            let mut rules = state.rules.get_all_rules().await?;
            rules.sort_by(|a, b| a.endpoint.cmp(&b.endpoint));
            Ok(Json(rules).into_response())
        }
    }
}

/// Create or replace the rule for an endpoint
pub async fn set_rule(
    State(state): State<AppState>,
    Json(rule): Json<Rule>,
) -> Result<impl IntoResponse> {
    let endpoint = rule.endpoint.clone();
    state.rules.set_rule(rule).await?;

    Ok(Json(RuleResponse {
        status: "success".to_string(),
        message: "Rule saved".to_string(),
        endpoint,
    }))
}

/// Delete the rule for `?endpoint=`
pub async fn delete_rule(
    State(state): State<AppState>,
    Query(query): Query<RuleQuery>,
) -> Result<impl IntoResponse> {
    let endpoint = query
        .endpoint
        .filter(|endpoint| !endpoint.is_empty())
        .ok_or_else(|| Error::InvalidRequest("endpoint query parameter is required".to_string()))?;

    state.rules.delete_rule(&endpoint).await?;

    Ok(Json(RuleResponse {
        status: "success".to_string(),
        message: "Rule deleted".to_string(),
        endpoint,
    }))
}

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthStatus::collect(
        &state.limiter_store,
        state.throttler.rules(),
        state.started_at,
    ))
}
