//! Trend Micro Email Security log collection against a mock API.

use serde_json::json;
use sp_connectors::testing::mock_params;
use sp_connectors::{build_integration, CommandArgs, CommandOutput, IntegrationKind, LastRun};
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

fn without_token(request: &Request) -> bool {
    !request.url.query_pairs().any(|(k, _)| k == "token")
}

fn params(server: &MockServer) -> serde_json::Value {
    mock_params(
        "url",
        &server.uri(),
        json!({"username": "user", "api_key": "key", "first_fetch": "2023-07-15T10:00:00Z"}),
    )
}

async fn mount_logs(server: &MockServer) {
    // accepted traffic spans two pages
    Mock::given(method("GET"))
        .and(path("/api/v1/log/mailtrackinglog"))
        .and(query_param("type", "accepted_traffic"))
        .and(query_param("token", "page-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "logs": [{"messageID": "m2", "mailID": "b", "size": 20, "genTime": "2023-07-15T10:00:18Z"}]
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/log/mailtrackinglog"))
        .and(query_param("type", "accepted_traffic"))
        .and(without_token)
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "nextToken": "page-2",
            "logs": [{
                "messageID": "m1", "mailID": "a", "size": 10,
                "genTime": "2023-07-15T10:00:05Z",
                "subject": "secret plans",
                "attachments": [{"fileName": "plans.pdf", "sha256": "ff"}]
            }]
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/log/mailtrackinglog"))
        .and(query_param("type", "blocked_traffic"))
        .respond_with(ResponseTemplate::new(204))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/log/policyeventlog"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "logs": [{"messageID": "p1", "policyName": "DLP", "action": "quarantine", "genTime": "2023-07-15T10:00:09Z"}]
        })))
        .mount(server)
        .await;
}

#[tokio::test]
async fn fetch_events_pages_and_writes_checkpoints() {
    let server = MockServer::start().await;
    mount_logs(&server).await;

    let integration = build_integration(IntegrationKind::TrendMicroEmail, params(&server)).unwrap();
    let mut last_run = LastRun::new();
    let output = integration
        .execute("fetch-events", &CommandArgs::default(), &mut last_run)
        .await
        .unwrap();

    let CommandOutput::Events { batch, .. } = output else {
        panic!("expected events");
    };
    assert_eq!(batch.vendor, "trend micro");
    assert_eq!(batch.len(), 3);

    let first = &batch.events[0];
    assert!(first.get("subject").is_none());
    assert!(first["attachments"][0].get("fileName").is_none());
    assert_eq!(first["logType"], "accepted_traffic");
    assert_eq!(first["_time"], "2023-07-15T10:00:05Z");

    assert_eq!(last_run.get_str("time_accepted_traffic_from"), Some("2023-07-15T10:00:18Z"));
    assert_eq!(
        last_run.get_str_list("fetched_event_ids_of_accepted_traffic"),
        vec!["m2b20".to_string()]
    );
    assert!(last_run.get("next_token_accepted_traffic").is_none());
    assert!(last_run.get("time_blocked_traffic_from").is_none());
    assert_eq!(
        last_run.get_str_list("fetched_event_ids_of_policy_logs"),
        vec!["p1DLPquarantine".to_string()]
    );
}

#[tokio::test]
async fn requests_carry_basic_authorization() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/log/mailtrackinglog"))
        .and(header("Authorization", "Basic dXNlcjprZXk="))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let integration = build_integration(IntegrationKind::TrendMicroEmail, params(&server)).unwrap();
    assert_eq!(integration.test_module().await.unwrap(), "ok");
    server.verify().await;
}

#[tokio::test]
async fn get_events_with_start_time_ignores_checkpoint() {
    let server = MockServer::start().await;
    mount_logs(&server).await;

    let integration = build_integration(IntegrationKind::TrendMicroEmail, params(&server)).unwrap();
    let mut last_run = LastRun::new();
    last_run.set("fetched_event_ids_of_policy_logs", json!(["p1DLPquarantine"]));
    last_run.set("time_policy_logs_from", "2023-07-15T10:00:09Z");

    let args = CommandArgs::default()
        .with("start_time", "2023-07-15T10:00:00Z")
        .with("should_push_events", "true");
    let output = integration
        .execute("trend-micro-get-events", &args, &mut last_run)
        .await
        .unwrap();

    let CommandOutput::Events { batch, preview } = output else {
        panic!("expected events");
    };
    assert_eq!(batch.len(), 3);
    assert!(preview.unwrap().readable_output.unwrap().starts_with("### Events"));
    assert_eq!(last_run.get_str("time_policy_logs_from"), Some("2023-07-15T10:00:09Z"));
}

#[tokio::test]
async fn next_token_is_url_decoded_before_reuse() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/log/mailtrackinglog"))
        .and(query_param("type", "accepted_traffic"))
        .and(query_param("token", "abc abc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "logs": [{"messageID": "m2", "mailID": "b", "size": 20, "genTime": "2023-07-15T10:00:18Z"}]
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/log/mailtrackinglog"))
        .and(query_param("type", "accepted_traffic"))
        .and(without_token)
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "nextToken": "abc%20abc",
            "logs": [{"messageID": "m1", "mailID": "a", "size": 10, "genTime": "2023-07-15T10:00:05Z"}]
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/log/mailtrackinglog"))
        .and(query_param("type", "blocked_traffic"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/log/policyeventlog"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let integration = build_integration(IntegrationKind::TrendMicroEmail, params(&server)).unwrap();
    let output = integration
        .execute("fetch-events", &CommandArgs::default(), &mut LastRun::new())
        .await
        .unwrap();

    let CommandOutput::Events { batch, .. } = output else {
        panic!("expected events");
    };
    assert_eq!(batch.len(), 2);
    server.verify().await;
}
