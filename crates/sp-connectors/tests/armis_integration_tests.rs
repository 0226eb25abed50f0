//! Armis event collection against a mock tenant.

use serde_json::json;
use sp_connectors::testing::mock_params;
use sp_connectors::{build_integration, CommandArgs, CommandOutput, IntegrationKind, LastRun};
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

fn aql_starts_with(prefix: &'static str) -> impl Fn(&Request) -> bool + Send + Sync {
    move |request: &Request| {
        request
            .url
            .query_pairs()
            .any(|(k, v)| k == "aql" && v.starts_with(prefix))
    }
}

async fn mount_token(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/api/v1/access_token/"))
        .and(query_param("secret_key", "api-secret"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"data": {"access_token": "tok-1"}})),
        )
        .mount(server)
        .await;
}

async fn mount_search(server: &MockServer, prefix: &'static str, results: serde_json::Value) {
    let count = results.as_array().map(Vec::len).unwrap_or(0);
    Mock::given(method("GET"))
        .and(path("/api/v1/search/"))
        .and(aql_starts_with(prefix))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"data": {"count": count, "results": results}})),
        )
        .mount(server)
        .await;
}

#[tokio::test]
async fn fetch_events_collects_alerts_and_threats() {
    let server = MockServer::start().await;
    mount_token(&server).await;
    mount_search(
        &server,
        "in:alerts",
        json!([
            {"alertId": 1, "time": "2023-01-01T01:00:10.000000+00:00"},
            {"alertId": 2, "time": "2023-01-01T01:00:20.000000+00:00"}
        ]),
    )
    .await;
    mount_search(
        &server,
        "in:activity",
        json!([{"activityUUID": "abc", "time": "2023-01-01T01:00:30.000000+00:00"}]),
    )
    .await;

    let integration = build_integration(
        IntegrationKind::Armis,
        mock_params("server_url", &server.uri(), json!({"api_key": "api-secret"})),
    )
    .unwrap();

    let mut last_run = LastRun::new();
    let output = integration
        .execute("fetch-events", &CommandArgs::default(), &mut last_run)
        .await
        .unwrap();

    let CommandOutput::Events { batch, .. } = output else {
        panic!("expected events");
    };
    assert_eq!(batch.len(), 3);
    assert_eq!(batch.events[0]["_time"], "2023-01-01T01:00:10Z");
    assert_eq!(last_run.get_str("access_token"), Some("tok-1"));
    assert_eq!(last_run.get_str_list("alerts_last_fetch_ids"), vec!["2".to_string()]);
    assert_eq!(last_run.get_str_list("threats_last_fetch_ids"), vec!["abc".to_string()]);
}

#[tokio::test]
async fn fetch_events_drops_boundary_duplicates() {
    let server = MockServer::start().await;
    mount_token(&server).await;
    mount_search(
        &server,
        "in:alerts",
        json!([{"alertId": 2, "time": "2023-01-01T01:00:20.000000+00:00"}]),
    )
    .await;
    mount_search(&server, "in:activity", json!([])).await;

    let integration = build_integration(
        IntegrationKind::Armis,
        mock_params("server_url", &server.uri(), json!({"api_key": "api-secret"})),
    )
    .unwrap();

    let mut last_run = LastRun::new();
    last_run.set("alerts_last_fetch_ids", json!(["2"]));
    last_run.set("alerts_last_fetch_time", "2023-01-01T01:00:20.000000Z");

    let output = integration
        .execute("fetch-events", &CommandArgs::default(), &mut last_run)
        .await
        .unwrap();
    let CommandOutput::Events { batch, .. } = output else {
        panic!("expected events");
    };
    assert!(batch.is_empty());
    assert_eq!(last_run.get_str_list("alerts_last_fetch_ids"), vec!["2".to_string()]);
}

#[tokio::test]
async fn get_events_command_renders_table_without_touching_checkpoint() {
    let server = MockServer::start().await;
    mount_token(&server).await;
    mount_search(
        &server,
        "in:alerts",
        json!([{"alertId": 7, "time": "2023-01-01T01:00:10.000000+00:00"}]),
    )
    .await;
    mount_search(&server, "in:activity", json!([])).await;

    let integration = build_integration(
        IntegrationKind::Armis,
        mock_params("server_url", &server.uri(), json!({"api_key": "api-secret"})),
    )
    .unwrap();

    let mut last_run = LastRun::new();
    let output = integration
        .execute(
            "armis-get-events",
            &CommandArgs::default().with("limit", 10),
            &mut last_run,
        )
        .await
        .unwrap();

    let entries = output.to_entries();
    let readable = entries[0]["HumanReadable"].as_str().unwrap();
    assert!(readable.starts_with("### Armis Events"));
    assert!(last_run.is_empty());
}

#[tokio::test]
async fn test_module_reports_bad_secret() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/access_token/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {}})))
        .mount(&server)
        .await;

    let integration = build_integration(
        IntegrationKind::Armis,
        mock_params("server_url", &server.uri(), json!({"api_key": "wrong"})),
    )
    .unwrap();

    let err = integration.test_module().await.unwrap_err();
    assert_eq!(err.to_string(), "Authentication failed: Could not get access token from the Armis API.");
}
