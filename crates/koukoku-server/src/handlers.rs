use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use chrono::{DateTime, Utc};
use koukoku_core::outcome::SendReply;
use koukoku_store::{RangeQuery, StoredRecord};
use serde::Deserialize;
use serde_json::json;

use crate::server::AppState;

const TOKEN_SCHEME: &str = "TOKEN";

/// `POST /say`: relay the request body as one line of chat.
pub async fn say_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> impl IntoResponse {
    if !authorized(&headers, state.token.as_deref()) {
        tracing::warn!("rejected send with bad token");
        return (
            StatusCode::FORBIDDEN,
            Json(json!({ "message": "Forbidden" })),
        )
            .into_response();
    }

    tracing::info!(len = body.len(), text = %body, "relay send");
    let reply = if state.dry_run {
        SendReply::sent()
    } else {
        SendReply::from(&state.engine.send(body).await)
    };
    (StatusCode::OK, Json(reply)).into_response()
}

/// `Authorization: TOKEN <token>` must match the configured token exactly.
/// With no token configured every send is refused.
fn authorized(headers: &HeaderMap, token: Option<&str>) -> bool {
    let Some(expected) = token else {
        return false;
    };
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix(TOKEN_SCHEME))
        .and_then(|v| v.strip_prefix(' '))
        .is_some_and(|given| given == expected)
}

/// `GET /health`: the process is up. Says nothing about the remote link.
pub async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, [(header::CONTENT_TYPE, "text/plain")], "\n")
}

/// `GET /ping`: echo the load balancer's `X-Request-Start` header.
pub async fn ping_handler(headers: HeaderMap) -> impl IntoResponse {
    let start = headers
        .get("x-request-start")
        .and_then(|v| v.to_str().ok());
    Json(json!({ "pong": start }))
}

#[derive(Debug, Default, Deserialize)]
pub struct HistoryParams {
    /// Milliseconds since the epoch, inclusive.
    pub since: Option<i64>,
    pub until: Option<i64>,
    pub limit: Option<u32>,
}

const MAX_HISTORY_LIMIT: u32 = 1000;

/// `GET /history`: persisted records in a timestamp range, oldest first.
pub async fn history_handler(
    State(state): State<AppState>,
    Query(params): Query<HistoryParams>,
) -> impl IntoResponse {
    let query = match range_query(&params) {
        Ok(query) => query,
        Err(message) => {
            return (StatusCode::BAD_REQUEST, Json(json!({ "message": message }))).into_response();
        }
    };

    let log = state.log.clone();
    let result = tokio::task::spawn_blocking(move || log.range(&query)).await;
    match result {
        Ok(Ok(records)) => (StatusCode::OK, Json::<Vec<StoredRecord>>(records)).into_response(),
        Ok(Err(e)) => {
            tracing::error!(error = %e, "history query failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "message": "history unavailable" })),
            )
                .into_response()
        }
        Err(e) => {
            tracing::error!(error = %e, "history task failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn range_query(params: &HistoryParams) -> Result<RangeQuery, String> {
    let since = params.since.map(millis).transpose()?;
    let until = params.until.map(millis).transpose()?;
    if let (Some(since), Some(until)) = (since, until) {
        if since > until {
            return Err("since is after until".into());
        }
    }
    Ok(RangeQuery {
        since,
        until,
        limit: Some(params.limit.unwrap_or(MAX_HISTORY_LIMIT).min(MAX_HISTORY_LIMIT)),
    })
}

fn millis(ms: i64) -> Result<DateTime<Utc>, String> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| format!("timestamp out of range: {ms}"))
}

/// Every other path.
pub async fn fallback_handler() -> StatusCode {
    StatusCode::NO_CONTENT
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn with_auth(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn token_must_match_exactly() {
        assert!(authorized(&with_auth("TOKEN secret"), Some("secret")));
        assert!(!authorized(&with_auth("TOKEN wrong"), Some("secret")));
        assert!(!authorized(&with_auth("TOKENsecret"), Some("secret")));
        assert!(!authorized(&with_auth("Bearer secret"), Some("secret")));
        assert!(!authorized(&HeaderMap::new(), Some("secret")));
    }

    #[test]
    fn token_may_contain_spaces() {
        assert!(authorized(&with_auth("TOKEN two words"), Some("two words")));
    }

    #[test]
    fn no_configured_token_refuses_all() {
        assert!(!authorized(&with_auth("TOKEN "), None));
        assert!(!authorized(&with_auth("TOKEN anything"), None));
    }

    #[test]
    fn range_query_caps_limit() {
        let query = range_query(&HistoryParams {
            limit: Some(50_000),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(query.limit, Some(MAX_HISTORY_LIMIT));
        assert!(query.since.is_none());
    }

    #[test]
    fn range_query_rejects_inverted_bounds() {
        let err = range_query(&HistoryParams {
            since: Some(2_000),
            until: Some(1_000),
            limit: None,
        })
        .unwrap_err();
        assert!(err.contains("since"));
    }
}
