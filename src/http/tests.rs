use std::{sync::Arc, time::Duration};

use axum::{
    body::Body,
    http::{Request, StatusCode, header},
};
use http_body_util::BodyExt;
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use tokio::sync::watch;
use tower::util::ServiceExt;

use crate::{
    dispatch::{DEFAULT_SUBMIT_TIMEOUT, Dispatcher},
    http::build_router,
    raft::{
        app::{BoxFuture, LocalRaft, Metrics, RaftFacade, SubmitError, leader_metrics},
        types::ClientResponse,
    },
    store::Store,
};

fn app() -> (axum::Router, Arc<Store>) {
    let store = Arc::new(Store::new());
    let (_tx, rx) = watch::channel(leader_metrics(1, "http://127.0.0.1:8080"));
    let raft = Arc::new(LocalRaft::new(store.clone(), rx));
    let dispatcher = Dispatcher::new(store.clone(), raft, DEFAULT_SUBMIT_TIMEOUT);
    (build_router(dispatcher, None), store)
}

fn failing_app(err: SubmitError) -> axum::Router {
    let store = Arc::new(Store::new());
    let (_tx, rx) = watch::channel(leader_metrics(2, "http://127.0.0.1:8082"));
    let raft = Arc::new(FailingRaft { metrics: rx, err });
    build_router(
        Dispatcher::new(store, raft, Duration::from_millis(50)),
        None,
    )
}

struct FailingRaft {
    metrics: watch::Receiver<Metrics>,
    err: SubmitError,
}

impl RaftFacade for FailingRaft {
    fn metrics(&self) -> watch::Receiver<Metrics> {
        self.metrics.clone()
    }

    fn submit(
        &self,
        _bytes: Vec<u8>,
        _timeout: Duration,
    ) -> BoxFuture<'_, Result<ClientResponse, SubmitError>> {
        let err = self.err.clone();
        Box::pin(async move { Err(err) })
    }

    fn add_member(&self, _node_id: u64, _addr: String) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async { anyhow::bail!("has to forward to leader") })
    }
}

fn req(method: &str, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

fn req_json(method: &str, uri: &str, value: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(serde_json::to_vec(&value).unwrap()))
        .unwrap()
}

async fn body_json(res: axum::response::Response) -> Value {
    let bytes = res.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

async fn query(app: &axum::Router, line: &str) -> axum::response::Response {
    app.clone()
        .oneshot(req_json("POST", "/query", json!({ "q": line })))
        .await
        .unwrap()
}

#[tokio::test]
async fn query_set_get_delete_round() {
    let (app, store) = app();

    let res = query(&app, "SET k1 v1").await;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(
        body_json(res).await,
        json!({ "result": "written", "op": "set", "key": "k1" })
    );

    query(&app, "set k1 v2").await;
    let res = query(&app, "GET k1").await;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(
        body_json(res).await,
        json!({ "result": "found", "key": "k1", "value": "v2" })
    );

    let res = query(&app, "DELETE k1").await;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(store.get("k1").await, None);

    let res = query(&app, "get k1").await;
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    let body = body_json(res).await;
    assert_eq!(body["error"]["code"], "not_found");
    assert_eq!(body["error"]["details"]["key"], "k1");
}

#[tokio::test]
async fn query_parse_errors_are_400_with_error_shape() {
    let (app, store) = app();

    let res = query(&app, "SET a").await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        body_json(res).await,
        json!({ "error": { "code": "invalid_query", "message": "SET requires key and value" } })
    );

    let res = query(&app, "frobnicate x").await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        body_json(res).await["error"]["message"],
        "unknown operation: frobnicate"
    );
    assert!(store.is_empty().await);
}

#[tokio::test]
async fn malformed_json_body_is_invalid_request() {
    let (app, _store) = app();
    let res = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/query")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from("{not json"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(res).await["error"]["code"], "invalid_request");
}

#[tokio::test]
async fn key_value_routes() {
    let (app, _store) = app();

    let res = app
        .clone()
        .oneshot(req_json("POST", "/set", json!({ "key": "a", "value": "1 2" })))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(body_json(res).await, json!({ "ok": true }));

    let res = app.clone().oneshot(req("GET", "/get?key=a")).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(body_json(res).await, json!({ "key": "a", "value": "1 2" }));

    let res = app
        .clone()
        .oneshot(req("DELETE", "/delete?key=a"))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let res = app.clone().oneshot(req("GET", "/get?key=a")).await.unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    let res = app.oneshot(req("GET", "/get?key=")).await.unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn info_is_single_node_leader() {
    let (app, _store) = app();
    let res = app.clone().oneshot(req("GET", "/info")).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body = body_json(res).await;
    assert_eq!(body["node_id"], 1);
    assert_eq!(body["leader_id"], 1);
    assert_eq!(body["state"], "Leader");
    assert_eq!(body["members"]["1"], "http://127.0.0.1:8080");

    let res = query(&app, "INFO").await;
    let body = body_json(res).await;
    assert_eq!(body["result"], "info");
    assert_eq!(body["node_id"], 1);
}

#[tokio::test]
async fn not_leader_is_421_with_leader_hint() {
    let app = failing_app(SubmitError::NotLeader {
        leader_id: Some(1),
        leader_addr: Some("http://127.0.0.1:8080".to_string()),
    });
    let res = query(&app, "SET k v").await;
    assert_eq!(res.status(), StatusCode::MISDIRECTED_REQUEST);
    let body = body_json(res).await;
    assert_eq!(body["error"]["code"], "not_leader");
    assert_eq!(body["error"]["details"]["leader_id"], 1);
    assert_eq!(
        body["error"]["details"]["leader_addr"],
        "http://127.0.0.1:8080"
    );
}

#[tokio::test]
async fn timeout_is_504() {
    let app = failing_app(SubmitError::Timeout(Duration::from_millis(50)));
    let res = app
        .oneshot(req_json("POST", "/set", json!({ "key": "k", "value": "v" })))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::GATEWAY_TIMEOUT);
    let body = body_json(res).await;
    assert_eq!(body["error"]["code"], "timeout");
    assert_eq!(body["error"]["details"]["timeout_ms"], 50);
}

#[tokio::test]
async fn join_failure_is_500() {
    let app = failing_app(SubmitError::Raft("no quorum".to_string()));
    let res = app
        .oneshot(req_json(
            "POST",
            "/join",
            json!({ "id": 3, "addr": "http://127.0.0.1:8083" }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body_json(res).await["error"]["code"], "internal");
}

#[tokio::test]
async fn unknown_route_is_404() {
    let (app, _store) = app();
    let res = app.oneshot(req("GET", "/nope")).await.unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}
