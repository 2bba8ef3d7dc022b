//! HTTP surface driven through the router without a socket.

mod common;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode, header};
use serde_json::{Value, json};
use tower::ServiceExt;

use stemsplit::api::{ApiServerConfig, AppState, build_router};
use stemsplit::config::AppConfig;

use common::{API_KEY, Harness, STEMS, video_url};

fn router(h: &Harness) -> Router {
    build_router(
        AppState::from_container(&h.container),
        &ApiServerConfig::from_app_config(&h.container.config),
    )
}

fn submit_request(client: &str, credential: Option<&str>, body: &str) -> Request<Body> {
    let mut builder = Request::post("/separate")
        .header(header::CONTENT_TYPE, "application/json")
        .header("x-forwarded-for", client);
    if let Some(credential) = credential {
        builder = builder.header("access_token", credential);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::get(uri).body(Body::empty()).unwrap()
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, headers, body.to_vec())
}

async fn send_json(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let (status, _, body) = send(router, request).await;
    let value = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap()
    };
    (status, value)
}

fn url_body(url: &str) -> String {
    json!({ "url": url }).to_string()
}

#[tokio::test]
async fn test_submit_then_poll_then_download() {
    let h = Harness::new().await;
    let app = router(&h);

    let (status, body) = send_json(
        &app,
        submit_request("10.0.0.1", Some(API_KEY), &url_body(&video_url(1))),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "pending");
    assert_eq!(body["deduplicated"], false);
    let job_id = body["job_id"].as_str().unwrap().to_string();
    assert_eq!(body["status_url"], format!("/status/{job_id}"));

    let (status, body) = send_json(&app, get(&format!("/status/{job_id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "pending");
    assert!(body["artifacts"].is_null());
    assert!(body["estimated_completion"].is_string());

    h.drive_to_terminal(&job_id).await;

    let (status, body) = send_json(&app, get(&format!("/status/{job_id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "completed");
    assert_eq!(body["progress"], 100);
    let links = body["artifacts"].as_array().unwrap();
    assert_eq!(links.len(), STEMS.len());
    assert_eq!(links[0]["name"], "vocals");
    assert_eq!(links[0]["download_url"], format!("/download/{job_id}/vocals"));

    let (status, headers, bytes) = send(&app, get(&format!("/download/{job_id}/vocals"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[header::CONTENT_TYPE], "audio/wav");
    assert_eq!(bytes, b"vocals data");
    assert!(
        headers[header::CONTENT_DISPOSITION]
            .to_str()
            .unwrap()
            .contains("vocals.wav")
    );

    // A second client asking for the same input joins.
    let (status, body) = send_json(
        &app,
        submit_request("10.0.0.2", Some(API_KEY), &url_body(&video_url(1))),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["job_id"], job_id.as_str());
    assert_eq!(body["deduplicated"], true);
    assert_eq!(body["status"], "completed");
}

#[tokio::test]
async fn test_submit_rejections() {
    let h = Harness::new().await;
    let app = router(&h);

    let (status, body) =
        send_json(&app, submit_request("10.0.0.1", None, &url_body(&video_url(1)))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "unauthorized");
    assert_eq!(body["code"], "UNAUTHORIZED");

    let (status, _) =
        send_json(&app, submit_request("10.0.0.1", Some("nope"), &url_body(&video_url(1)))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // A malformed body without a valid credential is still a 401.
    let (status, _) = send_json(&app, submit_request("10.0.0.1", None, "{not json")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = send_json(&app, submit_request("10.0.0.1", Some(API_KEY), "{not json")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_input");
    assert_eq!(body["code"], "INVALID_INPUT");

    let (status, body) = send_json(
        &app,
        submit_request("10.0.0.1", Some(API_KEY), &url_body("https://example.com/video")),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_INPUT");

    let oversized = format!("https://www.youtube.com/watch?v=dQw4w9WgXcQ&x={}", "a".repeat(4096));
    let (status, _) =
        send_json(&app, submit_request("10.0.0.1", Some(API_KEY), &url_body(&oversized))).await;
    assert!(
        status == StatusCode::BAD_REQUEST || status == StatusCode::PAYLOAD_TOO_LARGE,
        "unexpected {status}"
    );

    assert_eq!(h.container.queue.depth().await.unwrap(), 0);
}

#[tokio::test]
async fn test_quota_and_rate_limit_responses() {
    let h = Harness::build(
        |c: &mut AppConfig| {
            c.max_concurrent_jobs = 1;
            c.rate_limit_per_minute = 3;
        },
        common::ScriptedDownloader::new(),
    )
    .await;
    let app = router(&h);

    let (status, _) = send_json(
        &app,
        submit_request("10.0.0.1", Some(API_KEY), &url_body(&video_url(1))),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let (status, body) = send_json(
        &app,
        submit_request("10.0.0.1", Some(API_KEY), &url_body(&video_url(2))),
    )
    .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["error"], "quota_exceeded");
    assert_eq!(body["code"], "QUOTA_EXCEEDED");
    assert_eq!(body["details"]["limit"], 1);

    let (status, _) = send_json(
        &app,
        submit_request("10.0.0.1", Some(API_KEY), &url_body(&video_url(3))),
    )
    .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);

    let (status, headers, body) = send(
        &app,
        submit_request("10.0.0.1", Some(API_KEY), &url_body(&video_url(4))),
    )
    .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["error"], "rate_limited");
    assert_eq!(body["code"], "RATE_LIMITED");
    assert!(headers.contains_key(header::RETRY_AFTER));
}

#[tokio::test]
async fn test_status_and_download_not_found() {
    let h = Harness::new().await;
    let app = router(&h);

    let (status, body) = send_json(&app, get("/status/not-a-uuid")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");

    let (status, _) = send_json(&app, get("/status/2d1b7c1e-8f43-4a55-9d0e-6f7a1b2c3d4e")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, body) = send_json(
        &app,
        submit_request("10.0.0.1", Some(API_KEY), &url_body(&video_url(1))),
    )
    .await;
    let job_id = body["job_id"].as_str().unwrap().to_string();

    // Not completed yet.
    let (status, _, _) = send(&app, get(&format!("/download/{job_id}/vocals"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    h.drive_to_terminal(&job_id).await;

    for uri in [
        format!("/download/{job_id}/guitar"),
        format!("/download/{job_id}/..%2F..%2Fstemsplit.db"),
        format!("/download/{job_id}/stems%2Fhtdemucs%2Faudio%2Fvocals.wav"),
        "/download/..%2F..%2Fetc/passwd".to_string(),
    ] {
        let (status, _, _) = send(&app, get(&uri)).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{uri}");
    }
}

#[tokio::test]
async fn test_job_listing_requires_credential() {
    let h = Harness::new().await;
    let app = router(&h);

    for n in 0..3 {
        let (status, _) = send_json(
            &app,
            submit_request(&format!("10.0.0.{n}"), Some(API_KEY), &url_body(&video_url(n))),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
    }

    let (status, _) = send_json(&app, get("/jobs")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let request = Request::get("/jobs?status=pending&limit=2")
        .header("access_token", API_KEY)
        .body(Body::empty())
        .unwrap();
    let (status, body) = send_json(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["limit"], 2);
    assert_eq!(body["items"].as_array().unwrap().len(), 2);
    assert!(body["items"][0]["owner_client"].as_str().unwrap().starts_with("10.0.0."));

    let request = Request::get("/jobs?status=bogus")
        .header("access_token", API_KEY)
        .body(Body::empty())
        .unwrap();
    let (status, _) = send_json(&app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_health_and_metrics() {
    let h = Harness::new().await;
    let app = router(&h);

    let (status, _, _) = send(&app, get("/health/live")).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _, _) = send(&app, get("/health/ready")).await;
    assert_eq!(status, StatusCode::OK);

    send_json(
        &app,
        submit_request("10.0.0.1", Some(API_KEY), &url_body(&video_url(1))),
    )
    .await;
    send_json(&app, submit_request("10.0.0.1", None, &url_body(&video_url(2)))).await;

    let (status, headers, body) = send(&app, get("/metrics")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(
        headers[header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("text/plain")
    );
    let text = String::from_utf8(body).unwrap();
    assert!(text.contains("stemsplit_admission_total{outcome=\"accepted\"} 1"));
    assert!(text.contains("stemsplit_admission_total{outcome=\"unauthorized\"} 1"));
    assert!(text.contains("stemsplit_queue_depth 1"));
    assert!(text.contains("stemsplit_jobs{status=\"pending\"} 1"));
    assert!(text.contains("stemsplit_jobs{status=\"completed\"} 0"));
}
