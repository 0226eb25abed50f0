//! FireEye ETP collection against a mock API.

use serde_json::{json, Value};
use sp_connectors::testing::mock_params;
use sp_connectors::{build_integration, CommandArgs, CommandOutput, IntegrationKind, LastRun};
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn alert(id: &str, modified: &str) -> Value {
    json!({
        "id": id,
        "attributes": {
            "meta": {"last_modified_on": modified},
            "email": {
                "headers": {"subject": "invoice", "to": ["victim@example.com"], "from": "bad@example.com"},
                "attachment": "invoice.exe"
            }
        }
    })
}

fn params(server: &MockServer, extra: Value) -> Value {
    let mut base = json!({
        "api_key": "etp-key",
        "first_fetch": "2023-07-01T00:00:00Z",
        "max_fetch_email_trace": 0,
        "max_fetch_activity_log": 0
    });
    if let (Some(target), Value::Object(extra)) = (base.as_object_mut(), extra) {
        target.extend(extra);
    }
    mock_params("server_url", &server.uri(), base)
}

#[tokio::test]
async fn fetch_events_collects_alerts_and_stores_nested_checkpoint() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v2/public/alerts/search"))
        .and(header("x-fireeye-api-key", "etp-key"))
        .and(body_partial_json(json!({"size": 200})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [
                alert("a", "2023-08-01T14:15:26.000000+0000Z"),
                alert("b", "2023-08-01T14:15:30.000000+0000Z")
            ]
        })))
        .mount(&server)
        .await;

    let integration = build_integration(IntegrationKind::FireeyeEtp, params(&server, json!({}))).unwrap();
    let mut last_run = LastRun::new();
    let output = integration
        .execute("fetch-events", &CommandArgs::default(), &mut last_run)
        .await
        .unwrap();

    let CommandOutput::Events { batch, .. } = output else {
        panic!("expected events");
    };
    assert_eq!(batch.vendor, "fireeye");
    assert_eq!(batch.len(), 2);

    let first = &batch.events[0];
    assert_eq!(first["id"], "a");
    assert_eq!(first["_time"], "2023-08-01T14:15:26Z");
    assert!(first["email"]["headers"].get("subject").is_none());
    assert!(first["email"]["headers"].get("to").is_none());
    assert!(first["email"].get("attachment").is_none());
    assert_eq!(first["email"]["headers"]["from"], "bad@example.com");

    let stored = &last_run.get("Last Run").unwrap()["alerts"];
    assert_eq!(stored["last_fetch_timestamp"], "2023-08-01T14:15:30.000000");
    assert_eq!(stored["last_fetch_last_ids"], json!(["b"]));
    assert!(last_run.get("Last Run").unwrap().get("email_trace").is_none());
}

#[tokio::test]
async fn fetch_events_skips_already_delivered_boundary() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v2/public/alerts/search"))
        .and(body_partial_json(json!({
            "attributes": {"lastModifiedDateTime": {"value": "2023-08-01T14:15:30.000", "filter": ">="}}
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [alert("b", "2023-08-01T14:15:30.000000+0000Z")]
        })))
        .mount(&server)
        .await;

    let integration = build_integration(IntegrationKind::FireeyeEtp, params(&server, json!({}))).unwrap();
    let mut last_run = LastRun::new();
    last_run.set(
        "Last Run",
        json!({"alerts": {"last_fetch_last_ids": ["b"], "last_fetch_timestamp": "2023-08-01T14:15:30.000000"}}),
    );

    let output = integration
        .execute("fetch-events", &CommandArgs::default(), &mut last_run)
        .await
        .unwrap();
    let CommandOutput::Events { batch, .. } = output else {
        panic!("expected events");
    };
    assert!(batch.is_empty());
    assert_eq!(last_run.get("Last Run").unwrap()["alerts"]["last_fetch_last_ids"], json!(["b"]));
}

#[tokio::test]
async fn outbound_traffic_is_requested_when_enabled() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v2/public/alerts/search"))
        .and(body_partial_json(json!({"attributes": {"traffic_type": "outbound"}})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": []})))
        .expect(1)
        .mount(&server)
        .await;

    let integration = build_integration(
        IntegrationKind::FireeyeEtp,
        params(&server, json!({"outbound_traffic": true})),
    )
    .unwrap();
    assert_eq!(integration.test_module().await.unwrap(), "ok");
    server.verify().await;
}

#[tokio::test]
async fn get_events_command_applies_limit() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v2/public/alerts/search"))
        .and(body_partial_json(json!({"size": 1})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [alert("a", "2023-08-01T14:15:26.000000+0000Z")]
        })))
        .mount(&server)
        .await;

    let integration = build_integration(IntegrationKind::FireeyeEtp, params(&server, json!({}))).unwrap();
    let args = CommandArgs::default()
        .with("limit", 1)
        .with("since_time", "2023-08-01T00:00:00Z");
    let output = integration
        .execute("fireeye-etp-get-events", &args, &mut LastRun::new())
        .await
        .unwrap();

    let entries = output.to_entries();
    assert!(entries[0]["HumanReadable"].as_str().unwrap().starts_with("### Events"));
    assert_eq!(entries[0]["Contents"].as_array().unwrap().len(), 1);
}
