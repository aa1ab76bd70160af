use axum::{
    Extension, Json, Router,
    extract::{FromRequest, Query as QueryParams, Request},
    http::StatusCode,
    response::{IntoResponse, Response as HttpResponse},
    routing::{delete, get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::{
    dispatch::{DispatchError, Dispatcher, Response},
    query::{self, Query},
    raft::{
        app::{ClusterStatus, SubmitError},
        types::{NodeId, TypeConfig},
    },
};

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Dispatcher,
}

#[derive(Debug)]
pub struct ApiError {
    code: &'static str,
    message: String,
    status: StatusCode,
    details: Map<String, Value>,
}

impl ApiError {
    fn new(code: &'static str, status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            status,
            details: Map::new(),
        }
    }

    fn with_detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new("invalid_request", StatusCode::BAD_REQUEST, message)
    }

    pub fn invalid_query(message: impl Into<String>) -> Self {
        Self::new("invalid_query", StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new("not_found", StatusCode::NOT_FOUND, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new("internal", StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl From<DispatchError> for ApiError {
    fn from(value: DispatchError) -> Self {
        let message = value.to_string();
        match value {
            DispatchError::Submit(SubmitError::NotLeader {
                leader_id,
                leader_addr,
            }) => Self::new("not_leader", StatusCode::MISDIRECTED_REQUEST, message)
                .with_detail("leader_id", leader_id)
                .with_detail("leader_addr", leader_addr),
            DispatchError::Submit(SubmitError::Timeout(timeout)) => {
                Self::new("timeout", StatusCode::GATEWAY_TIMEOUT, message)
                    .with_detail("timeout_ms", timeout.as_millis() as u64)
            }
            DispatchError::Submit(SubmitError::Raft(_)) => {
                Self::new("raft", StatusCode::INTERNAL_SERVER_ERROR, message)
            }
            DispatchError::Rejected { code, .. } => {
                Self::new("rejected", StatusCode::INTERNAL_SERVER_ERROR, message)
                    .with_detail("reason", code)
            }
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    code: String,
    message: String,
    #[serde(skip_serializing_if = "Map::is_empty")]
    details: Map<String, Value>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> HttpResponse {
        let body = ErrorResponse {
            error: ErrorBody {
                code: self.code.to_string(),
                message: self.message,
                details: self.details,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

pub struct ApiJson<T>(pub T);

#[axum::async_trait]
impl<S, T> FromRequest<S> for ApiJson<T>
where
    axum::Json<T>: FromRequest<S>,
    <axum::Json<T> as FromRequest<S>>::Rejection: std::fmt::Display,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = axum::Json::<T>::from_request(req, state)
            .await
            .map_err(|e| ApiError::invalid_request(e.to_string()))?;
        Ok(Self(value))
    }
}

/// Client API plus, when `raft_rpc` is given, the peer-facing Raft RPC routes.
pub fn build_router(
    dispatcher: Dispatcher,
    raft_rpc: Option<openraft::Raft<TypeConfig>>,
) -> Router {
    let mut app = Router::new()
        .route("/query", post(post_query))
        .route("/get", get(get_key))
        .route("/set", post(set_key))
        .route("/delete", delete(delete_key))
        .route("/join", post(join))
        .route("/info", get(info))
        .fallback(fallback_not_found);

    if let Some(raft) = raft_rpc {
        app = app.merge(crate::raft::http_rpc::build_raft_rpc_router(
            crate::raft::http_rpc::RaftRpcState { raft },
        ));
    }

    app.layer(Extension(AppState { dispatcher }))
}

/// Shape of a successful dispatch. Failures and misses are rendered as [`ApiError`].
#[derive(Debug, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
enum QueryOutcome {
    Written { op: &'static str, key: String },
    Found { key: String, value: String },
    Info(ClusterStatus),
}

fn into_outcome(resp: Response) -> Result<QueryOutcome, ApiError> {
    match resp {
        Response::Written { op, key } => Ok(QueryOutcome::Written { op, key }),
        Response::Found { key, value } => Ok(QueryOutcome::Found { key, value }),
        Response::NotFound { key } => {
            Err(ApiError::not_found(format!("key not found: {key}")).with_detail("key", key))
        }
        Response::Info(status) => Ok(QueryOutcome::Info(status)),
        Response::Failed(err) => Err(err.into()),
    }
}

fn require_key(key: &str) -> Result<(), ApiError> {
    if key.is_empty() {
        return Err(ApiError::invalid_request("key is required"));
    }
    Ok(())
}

#[derive(Deserialize)]
struct QueryRequest {
    q: String,
}

async fn post_query(
    Extension(state): Extension<AppState>,
    ApiJson(req): ApiJson<QueryRequest>,
) -> Result<Json<QueryOutcome>, ApiError> {
    let query = query::parse(&req.q).map_err(|e| ApiError::invalid_query(e.reason()))?;
    let outcome = into_outcome(state.dispatcher.dispatch(query).await)?;
    Ok(Json(outcome))
}

#[derive(Deserialize)]
struct KeyParams {
    key: String,
}

#[derive(Serialize)]
struct KeyValue {
    key: String,
    value: String,
}

async fn get_key(
    Extension(state): Extension<AppState>,
    QueryParams(params): QueryParams<KeyParams>,
) -> Result<Json<KeyValue>, ApiError> {
    require_key(&params.key)?;
    match into_outcome(state.dispatcher.dispatch(Query::Get { key: params.key }).await)? {
        QueryOutcome::Found { key, value } => Ok(Json(KeyValue { key, value })),
        other => Err(ApiError::internal(format!("unexpected outcome: {other:?}"))),
    }
}

#[derive(Deserialize)]
struct SetRequest {
    key: String,
    value: String,
}

async fn set_key(
    Extension(state): Extension<AppState>,
    ApiJson(req): ApiJson<SetRequest>,
) -> Result<Json<Value>, ApiError> {
    require_key(&req.key)?;
    let query = Query::Set {
        key: req.key,
        value: req.value,
    };
    into_outcome(state.dispatcher.dispatch(query).await)?;
    Ok(Json(json!({ "ok": true })))
}

async fn delete_key(
    Extension(state): Extension<AppState>,
    QueryParams(params): QueryParams<KeyParams>,
) -> Result<Json<Value>, ApiError> {
    require_key(&params.key)?;
    into_outcome(state.dispatcher.dispatch(Query::Delete { key: params.key }).await)?;
    Ok(Json(json!({ "ok": true })))
}

#[derive(Deserialize)]
struct JoinRequest {
    id: NodeId,
    addr: String,
}

async fn join(
    Extension(state): Extension<AppState>,
    ApiJson(req): ApiJson<JoinRequest>,
) -> Result<Json<Value>, ApiError> {
    if req.addr.trim().is_empty() {
        return Err(ApiError::invalid_request("addr is required"));
    }
    state
        .dispatcher
        .raft()
        .add_member(req.id, req.addr.clone())
        .await
        .map_err(|e| ApiError::internal(format!("{e:#}")))?;
    Ok(Json(json!({ "ok": true, "id": req.id, "addr": req.addr })))
}

async fn info(Extension(state): Extension<AppState>) -> Json<ClusterStatus> {
    Json(state.dispatcher.raft().status())
}

async fn fallback_not_found() -> ApiError {
    ApiError::not_found("not found")
}

#[cfg(test)]
mod tests;
