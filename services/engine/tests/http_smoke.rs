//! HTTP surface smoke tests against the in-memory engine.
mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::{json_request, json_request_as, policy, read_json, search_body, test_app};
use serde_json::json;
use tower::ServiceExt;

#[tokio::test]
async fn ping_version_healthz_are_open() {
    let app = test_app(None, Vec::new());

    for uri in ["/ping", "/version", "/healthz"] {
        let response = app
            .router
            .clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .expect(uri);
        assert_eq!(response.status(), StatusCode::OK, "{uri}");
    }
}

#[tokio::test]
async fn search_requires_credentials() {
    let app = test_app(None, Vec::new());

    let request = Request::builder()
        .method("POST")
        .uri("/api/v1/search")
        .header("content-type", "application/json")
        .body(Body::from(search_body("1", json!({}), 10).to_string()))
        .unwrap();
    let response = app.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let wrong = json_request_as(
        "POST",
        "/api/v1/search",
        "bk_cmdb",
        "wrong",
        Some(search_body("1", json!({}), 10)),
    );
    let response = app.router.clone().oneshot(wrong).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn search_returns_matching_subjects() {
    let app = test_app(None, Vec::new());
    app.index
        .bulk_upsert(vec![
            policy(1, ("user", "alice"), json!({"op": "any"})),
            policy(
                2,
                ("user", "bob"),
                json!({"op": "eq", "field": "host.id", "value": "42"}),
            ),
        ])
        .await;

    let response = app
        .router
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/v1/search",
            search_body("42", json!({}), 10),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let payload = read_json(response).await;
    assert_eq!(payload["code"], 0);

    let subjects = payload["data"]["subjects"].as_array().unwrap();
    let mut ids: Vec<&str> = subjects
        .iter()
        .map(|subject| subject["id"].as_str().unwrap())
        .collect();
    ids.sort();
    assert_eq!(ids, vec!["alice", "bob"]);
    // uid never leaks onto the wire
    assert!(subjects[0].get("uid").is_none());
}

#[tokio::test]
async fn search_with_debug_echoes_engine_steps() {
    let app = test_app(None, Vec::new());
    app.index
        .bulk_upsert(vec![policy(1, ("user", "alice"), json!({"op": "any"}))])
        .await;

    let response = app
        .router
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/v1/search?debug",
            search_body("1", json!({}), 10),
        ))
        .await
        .unwrap();
    let payload = read_json(response).await;
    assert!(payload["debug"]["steps"].as_array().unwrap().len() >= 2);
    assert_eq!(payload["debug"]["queries"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn search_validation_failures_are_bad_requests() {
    let app = test_app(None, Vec::new());

    let mut body = search_body("1", json!({}), 10);
    body["subject_type"] = json!("robot");
    let response = app
        .router
        .clone()
        .oneshot(json_request("POST", "/api/v1/search", body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(read_json(response).await["code"], 40000);

    let mut body = search_body("1", json!({}), 10);
    body["limit"] = json!(1001);
    let response = app
        .router
        .clone()
        .oneshot(json_request("POST", "/api/v1/search", body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unregistered_clients_cannot_query_a_system() {
    let app = test_app(None, Vec::new());
    // authority only registers bk_cmdb for this system
    let request = json_request_as(
        "POST",
        "/api/v1/search",
        "intruder_app",
        "s3cret",
        Some(search_body("1", json!({}), 10)),
    );
    let response = app.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn batch_search_aligns_results_with_requests() {
    let app = test_app(None, Vec::new());
    app.index
        .bulk_upsert(vec![policy(
            2,
            ("user", "bob"),
            json!({"op": "eq", "field": "host.id", "value": "42"}),
        )])
        .await;

    let body = json!([
        search_body("42", json!({}), 10),
        search_body("43", json!({}), 10),
    ]);
    let response = app
        .router
        .clone()
        .oneshot(json_request("POST", "/api/v1/batch-search", body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let payload = read_json(response).await;
    let results = payload["data"]["results"].as_array().unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].as_array().unwrap().len(), 1);
    assert!(results[1].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn per_action_stats_are_open_to_registered_clients() {
    let app = test_app(None, Vec::new());
    app.index
        .bulk_upsert(vec![policy(1, ("user", "alice"), json!({"op": "any"}))])
        .await;

    let response = app
        .router
        .clone()
        .oneshot(json_request_as(
            "GET",
            "/api/v1/stats?system=bk_cmdb&action=edit",
            "bk_cmdb",
            "s3cret",
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let payload = read_json(response).await;
    assert_eq!(payload["data"]["doc"], 1);
    assert_eq!(payload["data"]["total"], 1);
}

#[tokio::test]
async fn global_stats_require_a_super_caller() {
    let app = test_app(None, vec!["bk_iam".to_string()]);

    let denied = app
        .router
        .clone()
        .oneshot(json_request_as(
            "GET",
            "/api/v1/stats",
            "bk_cmdb",
            "s3cret",
            None,
        ))
        .await
        .unwrap();
    assert_eq!(denied.status(), StatusCode::FORBIDDEN);

    let allowed = app
        .router
        .clone()
        .oneshot(json_request_as(
            "GET",
            "/api/v1/stats",
            "bk_iam",
            "s3cret",
            None,
        ))
        .await
        .unwrap();
    assert_eq!(allowed.status(), StatusCode::OK);
    let payload = read_json(allowed).await;
    assert!(payload["data"].get("full_sync_last_time").is_some());
    assert!(payload["data"].get("incr_sync_last_time").is_some());
}

#[tokio::test]
async fn full_sync_trigger_is_super_only_and_conflicts_when_busy() {
    let mut app = test_app(None, vec!["bk_iam".to_string()]);

    let denied = app
        .router
        .clone()
        .oneshot(json_request_as(
            "POST",
            "/api/v1/full-sync",
            "bk_cmdb",
            "s3cret",
            None,
        ))
        .await
        .unwrap();
    assert_eq!(denied.status(), StatusCode::FORBIDDEN);

    // nobody consumes the single-slot channel here, so the second trigger
    // conflicts
    let first = app
        .router
        .clone()
        .oneshot(json_request_as(
            "POST",
            "/api/v1/full-sync",
            "bk_iam",
            "s3cret",
            None,
        ))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    let second = app
        .router
        .clone()
        .oneshot(json_request_as(
            "POST",
            "/api/v1/full-sync",
            "bk_iam",
            "s3cret",
            None,
        ))
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::CONFLICT);

    // the queued trigger is observable on the consumer side
    assert!(app.full_sync_rx.try_recv().is_ok());
}

#[tokio::test]
async fn expired_policies_never_match() {
    let app = test_app(None, Vec::new());
    let mut expired = policy(9, ("user", "ghost"), json!({"op": "any"}));
    expired.expired_at = 10;
    app.index.bulk_upsert(vec![expired]).await;

    let response = app
        .router
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/v1/search",
            search_body("1", json!({}), 10),
        ))
        .await
        .unwrap();
    let payload = read_json(response).await;
    assert!(payload["data"]["subjects"].as_array().unwrap().is_empty());
}
