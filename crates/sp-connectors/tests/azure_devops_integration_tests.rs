//! Azure DevOps commands and incident fetching against a mock organization.

use serde_json::{json, Value};
use sp_connectors::testing::mock_params;
use sp_connectors::{build_integration, CommandArgs, CommandOutput, Integration, IntegrationKind, LastRun};
use wiremock::matchers::{body_partial_json, body_string_contains, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn integration(server: &MockServer) -> Box<dyn Integration> {
    let uri = server.uri();
    build_integration(
        IntegrationKind::AzureDevops,
        mock_params(
            "server_url",
            &uri,
            json!({
                "organization": "contoso",
                "client_id": "app-id",
                "client_secret": "app-secret",
                "project": "web",
                "repository": "repo-1",
                "max_fetch": 2,
                "login_url": uri,
                "vsaex_url": uri,
                "redirect_uri": "https://localhost/callback"
            }),
        ),
    )
    .unwrap()
}

async fn mount_token(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/organizations/oauth2/v2.0/token"))
        .and(body_string_contains("grant_type=client_credentials"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "az-token",
            "token_type": "Bearer",
            "expires_in": 3600
        })))
        .mount(server)
        .await;
}

fn pull_request(id: i64) -> Value {
    json!({
        "pullRequestId": id,
        "title": format!("PR {}", id),
        "creationDate": "2023-05-01T10:00:00Z",
        "status": "active",
        "createdBy": {"displayName": "Dev"},
        "repository": {"id": "repo-1", "name": "web-repo"}
    })
}

async fn mount_pull_requests(server: &MockServer, ids: &[i64]) {
    let prs: Vec<Value> = ids.iter().map(|id| pull_request(*id)).collect();
    Mock::given(method("GET"))
        .and(path("/contoso/web/_apis/git/repositories/repo-1/pullrequests/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"count": prs.len(), "value": prs})))
        .mount(server)
        .await;
}

#[tokio::test]
async fn project_list_uses_bearer_token_and_paging() {
    let server = MockServer::start().await;
    mount_token(&server).await;
    Mock::given(method("GET"))
        .and(path("/contoso/_apis/projects"))
        .and(header("Authorization", "Bearer az-token"))
        .and(query_param("api-version", "7.0"))
        .and(query_param("$skip", "2"))
        .and(query_param("$top", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "value": [{"id": "p-1", "name": "web", "state": "wellFormed", "revision": 10, "visibility": "private"}]
        })))
        .mount(&server)
        .await;

    let args = CommandArgs::default().with("limit", 2).with("page", 2);
    let output = integration(&server)
        .execute("azure-devops-project-list", &args, &mut LastRun::new())
        .await
        .unwrap();
    let entries = output.to_entries();
    assert_eq!(
        entries[0]["EntryContext"]["AzureDevOps.Project(val.id && val.id === obj.id)"][0]["name"],
        "web"
    );
}

#[tokio::test]
async fn invalid_page_is_rejected_before_any_request() {
    let server = MockServer::start().await;
    let err = integration(&server)
        .execute(
            "azure-devops-project-list",
            &CommandArgs::default().with("page", 0),
            &mut LastRun::new(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "The page value must be equal to 1 or bigger.");
}

#[tokio::test]
async fn pull_request_create_prefixes_branch_refs() {
    let server = MockServer::start().await;
    mount_token(&server).await;
    Mock::given(method("POST"))
        .and(path("/contoso/web/_apis/git/repositories/repo-1/pullrequests"))
        .and(body_partial_json(json!({
            "sourceRefName": "refs/heads/feature",
            "targetRefName": "refs/heads/main",
            "reviewers": [{"id": "rev-1"}]
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(pull_request(42)))
        .expect(1)
        .mount(&server)
        .await;

    let args = CommandArgs::default()
        .with("source_branch", "feature")
        .with("target_branch", "refs/heads/main")
        .with("title", "Add feature")
        .with("description", "Adds the feature")
        .with("reviewers_ids", "rev-1");
    let output = integration(&server)
        .execute("azure-devops-pull-request-create", &args, &mut LastRun::new())
        .await
        .unwrap();
    let entries = output.to_entries();
    assert!(entries[0]["HumanReadable"]
        .as_str()
        .unwrap()
        .starts_with("### Pull Request Information"));
    server.verify().await;
}

#[tokio::test]
async fn pipeline_run_get_schedules_poll_until_completed() {
    let server = MockServer::start().await;
    mount_token(&server).await;
    Mock::given(method("GET"))
        .and(path("/contoso/web/_apis/pipelines/3/runs/17"))
        .and(query_param("api-version", "6.1-preview.1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": 17,
            "state": "inProgress",
            "createdDate": "2023-05-01T10:00:00Z",
            "pipeline": {"id": 3}
        })))
        .mount(&server)
        .await;

    let args = CommandArgs::default()
        .with("pipeline_id", "3")
        .with("run_id", "17")
        .with("polling", true);
    let output = integration(&server)
        .execute("azure-devops-pipeline-run-get", &args, &mut LastRun::new())
        .await
        .unwrap();
    let scheduled = output.scheduled().unwrap();
    assert_eq!(scheduled.command, "azure-devops-pipeline-run-get");
    assert_eq!(scheduled.next_run_in_seconds, 30);
    assert_eq!(scheduled.args.get_str("run_id").as_deref(), Some("17"));
}

#[tokio::test]
async fn fetch_incidents_first_run_takes_oldest_pull_requests() {
    let server = MockServer::start().await;
    mount_token(&server).await;
    mount_pull_requests(&server, &[12, 11, 10]).await;

    let mut last_run = LastRun::new();
    let output = integration(&server)
        .execute("fetch-incidents", &CommandArgs::default(), &mut last_run)
        .await
        .unwrap();
    let CommandOutput::Incidents(incidents) = output else {
        panic!("expected incidents");
    };
    let names: Vec<&str> = incidents.iter().map(|i| i.name.as_str()).collect();
    assert_eq!(names, vec!["PR 10", "PR 11"]);
    assert_eq!(last_run.get_i64("last_id"), Some(11));
}

#[tokio::test]
async fn fetch_incidents_only_returns_newer_pull_requests() {
    let server = MockServer::start().await;
    mount_token(&server).await;
    mount_pull_requests(&server, &[12, 11, 10]).await;

    let mut last_run = LastRun::new();
    last_run.set("last_id", 11);
    let output = integration(&server)
        .execute("fetch-incidents", &CommandArgs::default(), &mut last_run)
        .await
        .unwrap();
    let CommandOutput::Incidents(incidents) = output else {
        panic!("expected incidents");
    };
    assert_eq!(incidents.len(), 1);
    assert_eq!(incidents[0].name, "PR 12");
    assert_eq!(last_run.get_i64("last_id"), Some(12));

    let output = integration(&server)
        .execute("fetch-incidents", &CommandArgs::default(), &mut last_run)
        .await
        .unwrap();
    assert_eq!(output, CommandOutput::Incidents(Vec::new()));
    assert_eq!(last_run.get_i64("last_id"), Some(12));
}

#[tokio::test]
async fn login_url_needs_no_secret() {
    let server = MockServer::start().await;
    let integration = build_integration(
        IntegrationKind::AzureDevops,
        mock_params(
            "server_url",
            &server.uri(),
            json!({
                "organization": "contoso",
                "client_id": "app-id",
                "redirect_uri": "https://localhost/callback"
            }),
        ),
    )
    .unwrap();

    let output = integration
        .execute("azure-devops-generate-login-url", &CommandArgs::default(), &mut LastRun::new())
        .await
        .unwrap();
    let entries = output.to_entries();
    let readable = entries[0]["HumanReadable"].as_str().unwrap();
    assert!(readable.starts_with("### Authorization instructions"));
    assert!(readable.contains("client_id=app-id"));
    assert!(integration.test_module().await.is_err());
}
