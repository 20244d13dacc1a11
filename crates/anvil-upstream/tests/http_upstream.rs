//! HTTP dispatcher tests against a wiremock upstream.

use std::sync::Arc;
use std::time::Duration;

use anvil_error::DispatchError;
use anvil_sandbox::{UpstreamDispatcher, UpstreamRequest};
use anvil_upstream::{HttpUpstream, TimeoutUpstream};
use wiremock::matchers::{body_json, header, header_exists, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn get(url: String, bearer: Option<&str>) -> UpstreamRequest {
    UpstreamRequest {
        method: "GET".into(),
        url,
        bearer: bearer.map(str::to_string),
        body: None,
    }
}

#[tokio::test]
async fn bearer_token_is_attached() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/client/v4/user/tokens/verify"))
        .and(header("authorization", "Bearer tok-123"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(r#"{"success":true,"result":{"status":"active"}}"#, "application/json"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let upstream = HttpUpstream::new(Duration::from_secs(5)).unwrap();
    let response = upstream
        .send(get(
            format!("{}/client/v4/user/tokens/verify", server.uri()),
            Some("tok-123"),
        ))
        .await
        .unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(response.content_type, "application/json");
    assert!(response.body.contains("active"));
}

#[tokio::test]
async fn missing_credential_sends_no_authorization() {
    let server = MockServer::start().await;
    Mock::given(header_exists("authorization"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_raw("{}", "application/json"))
        .mount(&server)
        .await;

    let upstream = HttpUpstream::new(Duration::from_secs(5)).unwrap();
    let response = upstream
        .send(get(format!("{}/zones", server.uri()), None))
        .await
        .unwrap();
    assert_eq!(response.status, 200);
}

#[tokio::test]
async fn json_body_and_query_are_forwarded() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/zones"))
        .and(query_param("account", "a1"))
        .and(header("content-type", "application/json"))
        .and(body_json(serde_json::json!({"name": "example.com"})))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(r#"{"success":true,"result":{"id":"z1"}}"#, "application/json"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let upstream = HttpUpstream::new(Duration::from_secs(5)).unwrap();
    let response = upstream
        .send(UpstreamRequest {
            method: "POST".into(),
            url: format!("{}/zones?account=a1", server.uri()),
            bearer: Some("t".into()),
            body: Some(r#"{"name":"example.com"}"#.into()),
        })
        .await
        .unwrap();
    assert!(response.body.contains("z1"));
}

#[tokio::test]
async fn error_statuses_are_responses_not_errors() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(403).set_body_raw(
                r#"{"success":false,"errors":[{"code":1000,"message":"bad auth"}]}"#,
                "application/json",
            ),
        )
        .mount(&server)
        .await;

    let upstream = HttpUpstream::new(Duration::from_secs(5)).unwrap();
    let response = upstream
        .send(get(format!("{}/accounts", server.uri()), Some("bad")))
        .await
        .unwrap();
    assert_eq!(response.status, 403);
    assert!(response.body.contains("bad auth"));
}

#[tokio::test]
async fn non_json_content_type_is_reported() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_raw("export default {}", "application/javascript"))
        .mount(&server)
        .await;

    let upstream = HttpUpstream::new(Duration::from_secs(5)).unwrap();
    let response = upstream
        .send(get(format!("{}/script", server.uri()), None))
        .await
        .unwrap();
    assert_eq!(response.content_type, "application/javascript");
    assert_eq!(response.body, "export default {}");
}

#[tokio::test]
async fn slow_upstream_is_a_timeout() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
        .mount(&server)
        .await;

    let upstream = HttpUpstream::new(Duration::from_millis(100)).unwrap();
    let err = upstream
        .send(get(format!("{}/slow", server.uri()), None))
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::Timeout { timeout_ms: 100 }), "{err}");
}

#[tokio::test]
async fn timeout_wrapper_bounds_http_exchange() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
        .mount(&server)
        .await;

    let http: Arc<dyn UpstreamDispatcher> =
        Arc::new(HttpUpstream::new(Duration::from_secs(30)).unwrap());
    let upstream = TimeoutUpstream::new(http, Duration::from_millis(100));
    let err = upstream
        .send(get(format!("{}/slow", server.uri()), None))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "TIMEOUT");
    assert!(err.retryable());
}

#[test]
fn requests_from_another_runtime_run_on_the_pinned_one() {
    let main = tokio::runtime::Runtime::new().unwrap();
    let (server, upstream) = main.block_on(async {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_raw("{}", "application/json"))
            .mount(&server)
            .await;
        let upstream = Arc::new(HttpUpstream::new(Duration::from_secs(5)).unwrap());
        (server, upstream)
    });

    let url = format!("{}/zones", server.uri());
    let worker = std::thread::spawn(move || {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async move { upstream.send(get(url, None)).await })
    });

    let response = worker.join().unwrap().unwrap();
    assert_eq!(response.status, 200);
    drop(server);
}

#[tokio::test]
async fn oversized_body_is_refused_not_truncated() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/big"))
        .respond_with(ResponseTemplate::new(200).set_body_raw("x".repeat(4096), "application/json"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/small"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(r#"{"ok":true}"#, "application/json"))
        .mount(&server)
        .await;

    let upstream = HttpUpstream::new(Duration::from_secs(5))
        .unwrap()
        .with_max_body_size(1024);

    let err = upstream
        .send(get(format!("{}/big", server.uri()), None))
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::Transport { .. }), "{err}");
    assert!(err.to_string().contains("response too large"), "{err}");

    let response = upstream
        .send(get(format!("{}/small", server.uri()), None))
        .await
        .unwrap();
    assert_eq!(response.body, r#"{"ok":true}"#);
}
