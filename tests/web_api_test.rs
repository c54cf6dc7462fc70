//! Contract tests for the HTTP surface.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use http_body_util::BodyExt;
use tower::ServiceExt;

use screener::compile::CompileOptions;
use screener::config::Config;
use screener::web::server::{router, AppState};

fn app() -> axum::Router {
    router(Arc::new(AppState {
        config: Config::market_data(),
        options: CompileOptions::default(),
    }))
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_health() {
    let response = app()
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-request-id"));
    let json = body_json(response).await;
    assert_eq!(json["status"], "ok");
    assert!(json["timestamp"].is_u64());
}

#[tokio::test]
async fn test_compile_success() {
    let body = r#"{
        "id": "q1", "name": "tech", "status": "active",
        "filter": { "target": { "metric": "sector" }, "op": "eq", "value": "Technology" },
        "limit": 100
    }"#;

    let response = app()
        .oneshot(
            Request::post("/compile")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["success"], true);
    assert_eq!(json["query"]["id"], "q1");
    assert_eq!(json["query"]["name"], "tech");
    assert!(json["graph"].as_str().unwrap().starts_with("graph TD;"));
    assert!(json["sql"]["query"].as_str().unwrap().contains("LIMIT 100"));
    assert_eq!(json["sql"]["parameters"]["param_1"], "Technology");
}

#[tokio::test]
async fn test_malformed_json_is_bad_request() {
    let response = app()
        .oneshot(
            Request::post("/compile")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from("{not json"))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert_eq!(json["success"], false);
    assert_eq!(json["error"], "bad_request");
}

#[tokio::test]
async fn test_schema_failure_lists_details() {
    let body = r#"{
        "id": "", "name": "tech", "status": "active",
        "filter": { "target": { "metric": "sector" }, "op": "eq", "value": "Technology" },
        "limit": 0
    }"#;

    let response = app()
        .oneshot(
            Request::post("/compile")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let json = body_json(response).await;
    assert_eq!(json["error"], "validation_failed");
    let details = json["details"].as_array().unwrap();
    let paths: Vec<&str> = details.iter().map(|d| d["path"].as_str().unwrap()).collect();
    assert!(paths.contains(&"id"));
    assert!(paths.contains(&"limit"));
}

#[tokio::test]
async fn test_unknown_metric_is_compilation_failure() {
    let body = r#"{
        "id": "q1", "name": "bad", "status": "active",
        "filter": { "target": { "metric": "pe_ratio" }, "op": "gt", "value": 10 }
    }"#;

    let response = app()
        .oneshot(
            Request::post("/compile")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let json = body_json(response).await;
    assert_eq!(json["error"], "compilation_failed");
    assert!(json["message"].as_str().unwrap().contains("pe_ratio"));
}

#[tokio::test]
async fn test_unknown_route_is_not_found() {
    let response = app()
        .oneshot(Request::get("/nope").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let json = body_json(response).await;
    assert_eq!(json["error"], "not_found");
}
