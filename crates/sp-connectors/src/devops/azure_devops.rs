//! Azure DevOps integration.
//!
//! Covers projects, repositories, pipelines, pull requests, commits, work items,
//! repository files and teams, plus user entitlements on the `vsaex` host.
//! Incidents are fetched from new pull requests, tracked by pull request id.

use crate::args::CommandArgs;
use crate::checkpoint::LastRun;
use crate::http::HttpClient;
use crate::markdown::{format_cell, table_to_markdown, TableBuilder};
use crate::results::{CommandOutput, CommandResults, FileResult, Incident, ScheduledCommand};
use crate::secure_string::SecureString;
use crate::traits::{AuthConfig, ConnectorError, ConnectorResult, Integration, TransportSettings};
use async_trait::async_trait;
use reqwest::{Method, RequestBuilder};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, info, instrument, warn};

const API_VERSION: &str = "7.0";
const PIPELINES_API_VERSION: &str = "6.1-preview.1";
const IDENTITY_PICKER_API_VERSION: &str = "7.0-preview.1";

/// Resource id of Azure DevOps in Azure AD.
pub const AZURE_DEVOPS_SCOPE: &str = "499b84ac-1321-427f-aa17-267ca6975798/.default";
const USER_IMPERSONATION_SCOPE: &str = "499b84ac-1321-427f-aa17-267ca6975798/user_impersonation";

const DEFAULT_LIMIT: i64 = 50;
const PR_PAGE_SIZE: usize = 100;
const MAX_PR_PAGES: usize = 10;
const EMPTY_OBJECT_ID: &str = "0000000000000000000000000000000000000000";

const PR_PREFIX: &str = "AzureDevOps.PullRequest";
const PIPELINE_RUN_PREFIX: &str = "AzureDevOps.PipelineRun";

/// Instance parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AzureDevOpsConfig {
    pub organization: String,
    pub client_id: String,
    /// Application secret. Without it only `azure-devops-generate-login-url` works.
    #[serde(default, alias = "credentials")]
    pub client_secret: Option<SecureString>,
    #[serde(default = "default_tenant")]
    pub tenant_id: String,
    /// Default project for commands that do not name one.
    #[serde(default)]
    pub project: Option<String>,
    /// Default repository for commands that do not name one.
    #[serde(default)]
    pub repository: Option<String>,
    #[serde(default)]
    pub redirect_uri: Option<String>,
    #[serde(default = "default_max_fetch")]
    pub max_fetch: usize,
    #[serde(default = "default_server_url")]
    pub server_url: String,
    #[serde(default = "default_vsaex_url")]
    pub vsaex_url: String,
    #[serde(default = "default_login_url")]
    pub login_url: String,
    #[serde(flatten)]
    pub transport: TransportSettings,
}

fn default_tenant() -> String {
    "organizations".to_string()
}

fn default_max_fetch() -> usize {
    50
}

fn default_server_url() -> String {
    "https://dev.azure.com".to_string()
}

fn default_vsaex_url() -> String {
    "https://vsaex.dev.azure.com".to_string()
}

fn default_login_url() -> String {
    "https://login.microsoftonline.com".to_string()
}

/// Validates `limit` and `page` and returns `(limit, offset)`.
pub fn pagination_preprocess_and_validation(args: &CommandArgs) -> ConnectorResult<(usize, usize)> {
    let limit = args.get_number_or("limit", DEFAULT_LIMIT)?;
    let page = args.get_number_or("page", 1)?;
    if limit < 1 {
        return Err(ConnectorError::invalid_argument(
            "The limit value must be equal to 1 or bigger.",
        ));
    }
    if page < 1 {
        return Err(ConnectorError::invalid_argument(
            "The page value must be equal to 1 or bigger.",
        ));
    }
    let offset = (page - 1)
        .checked_mul(limit)
        .and_then(|offset| usize::try_from(offset).ok())
        .ok_or_else(|| ConnectorError::invalid_argument("The page value is too large."))?;
    Ok((limit as usize, offset))
}

/// Resolves `(organization, repository, project)`, letting arguments override instance defaults.
pub fn organization_repository_project_preprocess(
    args: &CommandArgs,
    organization: &str,
    repository: &str,
    project: &str,
    repository_required: bool,
) -> ConnectorResult<(String, String, String)> {
    let organization = args
        .get_str("organization_name")
        .unwrap_or_else(|| organization.to_string());
    let repository = args
        .get_str("repository_id")
        .or_else(|| args.get_str("repository"))
        .unwrap_or_else(|| repository.to_string());
    let project = args
        .get_str("project_name")
        .or_else(|| args.get_str("project"))
        .unwrap_or_else(|| project.to_string());

    let mut missing = Vec::new();
    if organization.is_empty() {
        missing.push("organization_name");
    }
    if repository_required && repository.is_empty() {
        missing.push("repository_id");
    }
    if project.is_empty() {
        missing.push("project_name");
    }
    match missing.len() {
        0 => Ok((organization, repository, project)),
        1 => Err(ConnectorError::invalid_argument(format!("{} is missing.", missing[0]))),
        _ => Err(ConnectorError::invalid_argument(format!(
            "{} are missing.",
            missing.join(", ")
        ))),
    }
}

/// Work item field paths, by argument name.
fn work_item_field(argument: &str) -> Option<&'static str> {
    Some(match argument {
        "title" => "System.Title",
        "iteration_path" => "System.IterationPath",
        "description" => "System.Description",
        "priority" => "Microsoft.VSTS.Common.Priority",
        "tag" => "System.Tags",
        "assignee_display_name" => "System.AssignedTo",
        "state" => "System.State",
        _ => return None,
    })
}

/// JSON patch document for the given work item arguments, in `arguments` order.
pub fn work_item_pre_process_data(args: &CommandArgs, arguments: &[&str]) -> Vec<Value> {
    arguments
        .iter()
        .filter_map(|arg| {
            let field = work_item_field(arg)?;
            let value = args.get_str(arg)?;
            Some(json!({
                "op": "add",
                "path": format!("/fields/{}", field),
                "from": null,
                "value": value,
            }))
        })
        .collect()
}

/// Push body for adding, editing or deleting one file.
pub fn file_pre_process_body_request(change_type: &str, args: &CommandArgs) -> Value {
    let mut change = json!({
        "changeType": change_type,
        "item": {"path": args.get_str_or("file_path", "")},
    });
    if change_type != "delete" {
        change["newContent"] = json!({
            "content": args.get_str_or("file_content", ""),
            "contentType": "rawtext",
        });
    }
    json!({
        "refUpdates": [{
            "name": args.get_str_or("branch_name", ""),
            "oldObjectId": args.get_str_or("branch_id", ""),
        }],
        "commits": [{
            "comment": args.get_str_or("commit_comment", ""),
            "changes": [change],
        }],
    })
}

fn pr_id(pr: &Value) -> Option<i64> {
    pr.get("pullRequestId").and_then(Value::as_i64)
}

/// True when the newest pull request is newer than `last_id`.
pub fn has_new_pr(prs: &[Value], last_id: i64) -> bool {
    prs.first().and_then(pr_id).is_some_and(|id| id > last_id)
}

/// Position of `last_id` in a newest-first list, or -1.
pub fn last_fetch_index(prs: &[Value], last_id: i64) -> i64 {
    prs.iter()
        .position(|pr| pr_id(pr) == Some(last_id))
        .map_or(-1, |i| i as i64)
}

/// Position of the oldest pull request newer than `last_id` in a newest-first list, or -1.
pub fn closest_index(prs: &[Value], last_id: i64) -> i64 {
    prs.iter()
        .take_while(|pr| pr_id(pr).is_some_and(|id| id > last_id))
        .count() as i64
        - 1
}

/// Run output: the vendor record with `run_id`, `project` and a `result`.
pub fn generate_pipeline_run_output(response: &Value, project: &str) -> Value {
    let mut output = response.as_object().cloned().unwrap_or_default();
    if let Some(id) = output.remove("id") {
        output.insert("run_id".into(), Value::String(format_cell(&id)));
    }
    output.insert("project".into(), json!(project));
    output
        .entry("result")
        .or_insert_with(|| json!("unknown"));
    Value::Object(output)
}

fn values(response: &Value) -> Vec<Value> {
    response
        .get("value")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

fn page(items: Vec<Value>, limit: usize, offset: usize) -> Vec<Value> {
    items.into_iter().skip(offset).take(limit).collect()
}

fn display_name(value: &Value, pointer: &str) -> String {
    value.pointer(pointer).map(format_cell).unwrap_or_default()
}

fn branch_ref(branch: &str) -> String {
    if branch.starts_with("refs/") {
        branch.to_string()
    } else {
        format!("refs/heads/{}", branch)
    }
}

pub struct AzureDevOpsIntegration {
    config: AzureDevOpsConfig,
    client: HttpClient,
}

impl AzureDevOpsIntegration {
    pub fn new(config: AzureDevOpsConfig) -> ConnectorResult<Self> {
        let auth = match &config.client_secret {
            Some(secret) => AuthConfig::OAuth2 {
                client_id: config.client_id.clone(),
                client_secret: secret.clone(),
                token_url: format!(
                    "{}/{}/oauth2/v2.0/token",
                    config.login_url.trim_end_matches('/'),
                    config.tenant_id
                ),
                scopes: vec![AZURE_DEVOPS_SCOPE.to_string()],
            },
            None => {
                warn!("No client secret configured, only the login URL command is available");
                AuthConfig::None
            }
        };
        let connector = config
            .transport
            .connector_config("azure-devops", &config.server_url)
            .with_auth(auth)
            .with_header("Accept", "application/json");
        let client = HttpClient::new(connector)?;
        info!(organization = %config.organization, "Azure DevOps integration initialized");
        Ok(Self { config, client })
    }

    fn scope(&self, args: &CommandArgs, repository_required: bool) -> ConnectorResult<(String, String, String)> {
        organization_repository_project_preprocess(
            args,
            &self.config.organization,
            self.config.repository.as_deref().unwrap_or_default(),
            self.config.project.as_deref().unwrap_or_default(),
            repository_required,
        )
    }

    fn organization(&self, args: &CommandArgs) -> String {
        args.get_str("organization_name")
            .unwrap_or_else(|| self.config.organization.clone())
    }

    fn request(&self, method: Method, path: &str, api_version: &str) -> RequestBuilder {
        self.client
            .request(method, path)
            .query(&[("api-version", api_version)])
    }

    async fn call(&self, request: RequestBuilder) -> ConnectorResult<Value> {
        self.client.send_json(request).await
    }

    /// Like [`Self::call`], but a 404 carrying a vendor message is returned as the body.
    async fn call_allow_not_found(&self, request: RequestBuilder) -> ConnectorResult<Value> {
        let response = self.client.send_unchecked(request).await?;
        let status = response.status();
        let body: Value = HttpClient::parse_json(response).await?;
        if status.is_success() || (status.as_u16() == 404 && body.get("message").is_some()) {
            Ok(body)
        } else {
            Err(ConnectorError::Api {
                status: status.as_u16(),
                body: body.to_string(),
            })
        }
    }

    fn git_path(&self, organization: &str, project: &str, repository: &str, rest: &str) -> String {
        format!(
            "{}/{}/_apis/git/repositories/{}/{}",
            organization, project, repository, rest
        )
    }

    #[instrument(skip(self, args))]
    async fn project_list_command(&self, args: &CommandArgs) -> ConnectorResult<CommandOutput> {
        let (limit, offset) = pagination_preprocess_and_validation(args)?;
        let request = self
            .request(Method::GET, &format!("{}/_apis/projects", self.organization(args)), API_VERSION)
            .query(&[("$skip", offset), ("$top", limit)]);
        let response = self.call(request).await?;
        let projects = values(&response);
        let readable = TableBuilder::new("Project List")
            .headers(&["id", "name", "state", "revision", "visibility", "lastUpdateTime"])
            .render(&projects);
        Ok(CommandResults::new()
            .outputs("AzureDevOps.Project", Some("id"), Value::Array(projects))
            .with_readable(readable)
            .with_raw_response(response)
            .into())
    }

    async fn repository_list_command(&self, args: &CommandArgs) -> ConnectorResult<CommandOutput> {
        let (limit, offset) = pagination_preprocess_and_validation(args)?;
        let (organization, _, project) = self.scope(args, false)?;
        let response = self
            .call(self.request(
                Method::GET,
                &format!("{}/{}/_apis/git/repositories", organization, project),
                API_VERSION,
            ))
            .await?;
        let repositories = page(values(&response), limit, offset);
        let readable = TableBuilder::new("Repositories List")
            .headers(&["id", "name", "webUrl", "size"])
            .render(&repositories);
        Ok(CommandResults::new()
            .outputs("AzureDevOps.Repository", Some("id"), Value::Array(repositories))
            .with_readable(readable)
            .with_raw_response(response)
            .into())
    }

    async fn users_query_command(&self, args: &CommandArgs) -> ConnectorResult<CommandOutput> {
        let (limit, offset) = pagination_preprocess_and_validation(args)?;
        let query = args.require_str("query")?;
        let body = json!({
            "query": query,
            "identityTypes": ["user", "group"],
            "operationScopes": ["ims", "source"],
            "properties": [
                "DisplayName", "IsMru", "ScopeName", "SamAccountName", "Active",
                "SubjectDescriptor", "Department", "JobTitle", "Mail", "MailNickname",
                "PhysicalDeliveryOfficeName", "SignInAddress", "Surname", "Guest",
                "TelephoneNumber", "Description"
            ],
            "filterByAncestorEntityIds": [],
            "filterByEntityIds": [],
            "options": {"MinResults": 40, "MaxResults": 40},
        });
        let request = self
            .request(
                Method::POST,
                &format!("{}/_apis/IdentityPicker/Identities", self.organization(args)),
                IDENTITY_PICKER_API_VERSION,
            )
            .json(&body);
        let response = self.call(request).await?;

        let identities = response
            .pointer("/results/0/identities")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let users = page(identities, limit, offset);
        let rows: Vec<Value> = users
            .iter()
            .map(|u| {
                json!({
                    "entityType": u.get("entityType"),
                    "id": u.get("localId"),
                    "email": u.get("signInAddress"),
                })
            })
            .collect();
        let readable = TableBuilder::new("Users List").render(&rows);
        Ok(CommandResults::new()
            .outputs("AzureDevOps.User", Some("localId"), Value::Array(users))
            .with_readable(readable)
            .with_raw_response(response)
            .into())
    }

    async fn user_add_command(&self, args: &CommandArgs) -> ConnectorResult<CommandOutput> {
        let body = json!({
            "accessLevel": {"accountLicenseType": args.require_str("account_license_type")?},
            "extensions": [],
            "user": {
                "principalName": args.require_str("user_email")?,
                "subjectKind": "user",
            },
            "projectEntitlements": [{
                "group": {"groupType": args.require_str("group_type")?},
                "projectRef": {"id": args.require_str("project_id")?},
            }],
        });
        let url = format!(
            "{}/{}/_apis/UserEntitlements",
            self.config.vsaex_url.trim_end_matches('/'),
            self.organization(args)
        );
        let response = self
            .call(self.request(Method::POST, &url, API_VERSION).json(&body))
            .await?;

        let operation = response.get("operationResult").cloned().unwrap_or(Value::Null);
        if !operation.get("isSuccess").and_then(Value::as_bool).unwrap_or(false) {
            let reason = operation
                .get("errors")
                .and_then(Value::as_array)
                .and_then(|errors| errors.first())
                .and_then(|e| e.get("value"))
                .map(format_cell)
                .unwrap_or_else(|| response.to_string());
            return Err(ConnectorError::VendorError(format!(
                "Failed to add the user. Error: {}",
                reason
            )));
        }

        let user = operation.get("result").cloned().unwrap_or(Value::Null);
        let row = json!({
            "id": user.get("id"),
            "accountLicenseType": user.pointer("/accessLevel/accountLicenseType"),
            "lastAccessedDate": user.get("lastAccessedDate"),
        });
        let readable = table_to_markdown("User Information", &row, None);
        Ok(CommandResults::new()
            .outputs("AzureDevOps.User", Some("id"), user)
            .with_readable(readable)
            .with_raw_response(response)
            .into())
    }

    async fn user_remove_command(&self, args: &CommandArgs) -> ConnectorResult<CommandOutput> {
        let user_id = args.require_str("user_id")?;
        let url = format!(
            "{}/{}/_apis/userentitlements/{}",
            self.config.vsaex_url.trim_end_matches('/'),
            self.organization(args),
            user_id
        );
        self.client
            .send(self.request(Method::DELETE, &url, API_VERSION))
            .await?;
        Ok(CommandResults::readable(format!(
            "User {} was successfully removed from the organization.",
            user_id
        ))
        .into())
    }

    fn pull_request_result(&self, response: Value) -> CommandResults {
        let row = json!({
            "Title": response.get("title"),
            "Description": response.get("description"),
            "Created By": display_name(&response, "/createdBy/displayName"),
            "Pull Request ID": response.get("pullRequestId"),
            "Repository ID": response.pointer("/repository/id"),
            "Repository Name": response.pointer("/repository/name"),
            "Creation Date": response.get("creationDate"),
            "Status": response.get("status"),
            "Merge Status": response.get("mergeStatus"),
        });
        let readable = table_to_markdown("Pull Request Information", &row, None);
        CommandResults::new()
            .outputs(PR_PREFIX, Some("pullRequestId"), response.clone())
            .with_readable(readable)
            .with_raw_response(response)
    }

    async fn pull_request_create_command(&self, args: &CommandArgs) -> ConnectorResult<CommandOutput> {
        let (organization, repository, project) = self.scope(args, true)?;
        let reviewers: Vec<Value> = args
            .get_list("reviewers_ids")
            .into_iter()
            .map(|id| json!({"id": id}))
            .collect();
        let body = json!({
            "sourceRefName": branch_ref(&args.require_str("source_branch")?),
            "targetRefName": branch_ref(&args.require_str("target_branch")?),
            "title": args.require_str("title")?,
            "description": args.require_str("description")?,
            "reviewers": reviewers,
        });
        let path = self.git_path(&organization, &project, &repository, "pullrequests");
        let response = self
            .call(self.request(Method::POST, &path, API_VERSION).json(&body))
            .await?;
        Ok(self.pull_request_result(response).into())
    }

    async fn get_pull_request(&self, args: &CommandArgs) -> ConnectorResult<Value> {
        let (organization, repository, project) = self.scope(args, true)?;
        let id = args.require_str("pull_request_id")?;
        let path = self.git_path(&organization, &project, &repository, &format!("pullrequests/{}", id));
        self.call(self.request(Method::GET, &path, API_VERSION)).await
    }

    async fn pull_request_get_command(&self, args: &CommandArgs) -> ConnectorResult<CommandOutput> {
        let response = self.get_pull_request(args).await?;
        Ok(self.pull_request_result(response).into())
    }

    async fn pull_request_update_command(&self, args: &CommandArgs) -> ConnectorResult<CommandOutput> {
        let title = args.get_str("title");
        let description = args.get_str("description");
        let status = args.get_str("status");
        if title.is_none() && description.is_none() && status.is_none() {
            return Err(ConnectorError::invalid_argument(
                "At least one of the arguments: title, description, or status must be provided.",
            ));
        }

        let mut body = Map::new();
        if let Some(title) = title {
            body.insert("title".into(), json!(title));
        }
        if let Some(description) = description {
            body.insert("description".into(), json!(description));
        }
        if let Some(status) = status {
            if status == "completed" {
                let current = self.get_pull_request(args).await?;
                body.insert(
                    "lastMergeSourceCommit".into(),
                    current.get("lastMergeSourceCommit").cloned().unwrap_or(Value::Null),
                );
            }
            body.insert("status".into(), json!(status));
        }

        let (organization, repository, project) = self.scope(args, true)?;
        let id = args.require_str("pull_request_id")?;
        let path = self.git_path(&organization, &project, &repository, &format!("pullrequests/{}", id));
        let response = self
            .call(self.request(Method::PATCH, &path, API_VERSION).json(&Value::Object(body)))
            .await?;
        Ok(self.pull_request_result(response).into())
    }

    async fn list_pull_requests(
        &self,
        organization: &str,
        project: &str,
        repository: &str,
        skip: usize,
        top: usize,
    ) -> ConnectorResult<Vec<Value>> {
        let path = self.git_path(organization, project, repository, "pullrequests/");
        let request = self
            .request(Method::GET, &path, API_VERSION)
            .query(&[("$skip", skip), ("$top", top)]);
        Ok(values(&self.call(request).await?))
    }

    async fn pull_requests_list_command(&self, args: &CommandArgs) -> ConnectorResult<CommandOutput> {
        let (limit, offset) = pagination_preprocess_and_validation(args)?;
        let (organization, repository, project) = self.scope(args, true)?;
        let prs = self
            .list_pull_requests(&organization, &project, &repository, offset, limit)
            .await?;
        let rows: Vec<Value> = prs
            .iter()
            .map(|pr| {
                json!({
                    "Title": pr.get("title"),
                    "Pull Request ID": pr.get("pullRequestId"),
                    "Created By": display_name(pr, "/createdBy/displayName"),
                    "Repository Name": pr.pointer("/repository/name"),
                    "Creation Date": pr.get("creationDate"),
                    "Status": pr.get("status"),
                })
            })
            .collect();
        let readable = TableBuilder::new("Pull Request List").render(&rows);
        Ok(CommandResults::new()
            .outputs(PR_PREFIX, Some("pullRequestId"), Value::Array(prs))
            .with_readable(readable)
            .into())
    }

    fn pipeline_run_result(&self, response: &Value, project: &str) -> CommandResults {
        let output = generate_pipeline_run_output(response, project);
        let row = json!({
            "Pipeline ID": output.pointer("/pipeline/id"),
            "Run State": output.get("state"),
            "Creation Date": output.get("createdDate"),
            "Run ID": output.get("run_id"),
            "Result": output.get("result"),
        });
        let readable = table_to_markdown("Pipeline Run Information", &row, None);
        CommandResults::new()
            .outputs(PIPELINE_RUN_PREFIX, Some("run_id"), output)
            .with_readable(readable)
            .with_raw_response(response.clone())
    }

    /// Schedules a re-poll of `command` while the run is not completed.
    fn maybe_poll(&self, command: &str, args: &CommandArgs, result: CommandResults, run: &Value) -> ConnectorResult<CommandResults> {
        let polling = args.get_bool_or("polling", false)?;
        let state = run.get("state").and_then(Value::as_str).unwrap_or_default();
        if !polling || state == "completed" {
            return Ok(result);
        }
        let interval = args.get_number_or("interval", 30)?.max(1) as u64;
        let timeout = args.get_number_or("timeout", 600)?.max(1) as u64;
        let next_args = args
            .clone()
            .with("run_id", format_cell(run.get("id").unwrap_or(&Value::Null)));
        debug!(state, "Pipeline run not completed, scheduling another poll");
        Ok(CommandResults::readable("Waiting for the pipeline run to complete...")
            .with_scheduled(ScheduledCommand::new(command, next_args, interval).with_timeout(timeout)))
    }

    async fn get_pipeline_run(&self, organization: &str, project: &str, pipeline_id: &str, run_id: &str) -> ConnectorResult<Value> {
        let path = format!(
            "{}/{}/_apis/pipelines/{}/runs/{}",
            organization, project, pipeline_id, run_id
        );
        self.call(self.request(Method::GET, &path, PIPELINES_API_VERSION))
            .await
    }

    async fn pipeline_run_command(&self, args: &CommandArgs) -> ConnectorResult<CommandOutput> {
        let (organization, _, project) = self.scope(args, false)?;
        let pipeline_id = args.require_str("pipeline_id")?;

        // A scheduled re-run carries the run id and only polls.
        let run = match args.get_str("run_id") {
            Some(run_id) => {
                self.get_pipeline_run(&organization, &project, &pipeline_id, &run_id)
                    .await?
            }
            None => {
                let body = json!({
                    "resources": {"repositories": {"self": {
                        "refName": branch_ref(&args.require_str("branch_name")?)
                    }}}
                });
                let path = format!("{}/{}/_apis/pipelines/{}/runs", organization, project, pipeline_id);
                self.call(self.request(Method::POST, &path, PIPELINES_API_VERSION).json(&body))
                    .await?
            }
        };
        let result = self.pipeline_run_result(&run, &project);
        Ok(self.maybe_poll("azure-devops-pipeline-run", args, result, &run)?.into())
    }

    async fn pipeline_run_get_command(&self, args: &CommandArgs) -> ConnectorResult<CommandOutput> {
        let (organization, _, project) = self.scope(args, false)?;
        let run = self
            .get_pipeline_run(
                &organization,
                &project,
                &args.require_str("pipeline_id")?,
                &args.require_str("run_id")?,
            )
            .await?;
        let result = self.pipeline_run_result(&run, &project);
        Ok(self.maybe_poll("azure-devops-pipeline-run-get", args, result, &run)?.into())
    }

    async fn pipeline_run_list_command(&self, args: &CommandArgs) -> ConnectorResult<CommandOutput> {
        let (limit, offset) = pagination_preprocess_and_validation(args)?;
        let (organization, _, project) = self.scope(args, false)?;
        let pipeline_id = args.require_str("pipeline_id")?;
        let path = format!("{}/{}/_apis/pipelines/{}/runs", organization, project, pipeline_id);
        let response = self
            .call(self.request(Method::GET, &path, PIPELINES_API_VERSION))
            .await?;
        let runs: Vec<Value> = page(values(&response), limit, offset)
            .iter()
            .map(|run| generate_pipeline_run_output(run, &project))
            .collect();
        let readable = TableBuilder::new("Pipeline runs List")
            .headers(&["pipeline", "state", "createdDate", "run_id", "name", "result"])
            .render(&runs);
        Ok(CommandResults::new()
            .outputs(PIPELINE_RUN_PREFIX, Some("run_id"), Value::Array(runs))
            .with_readable(readable)
            .into())
    }

    async fn pipeline_list_command(&self, args: &CommandArgs) -> ConnectorResult<CommandOutput> {
        let (limit, offset) = pagination_preprocess_and_validation(args)?;
        let (organization, _, project) = self.scope(args, false)?;
        let request = self
            .request(
                Method::GET,
                &format!("{}/{}/_apis/pipelines", organization, project),
                PIPELINES_API_VERSION,
            )
            .query(&[("$top", offset + limit)]);
        let response = self.call(request).await?;
        let pipelines: Vec<Value> = page(values(&response), limit, offset)
            .into_iter()
            .map(|mut p| {
                if let Value::Object(map) = &mut p {
                    map.insert("project".into(), json!(project));
                }
                p
            })
            .collect();
        let readable = TableBuilder::new("Pipelines List")
            .headers(&["id", "name", "revision", "folder"])
            .render(&pipelines);
        Ok(CommandResults::new()
            .outputs("AzureDevOps.Pipeline", Some("id"), Value::Array(pipelines))
            .with_readable(readable)
            .into())
    }

    async fn branch_list_command(&self, args: &CommandArgs) -> ConnectorResult<CommandOutput> {
        let (limit, offset) = pagination_preprocess_and_validation(args)?;
        let (organization, repository, project) = self.scope(args, true)?;
        let path = self.git_path(&organization, &project, &repository, "refs");
        let request = self
            .request(Method::GET, &path, API_VERSION)
            .query(&[("filter", "heads")])
            .query(&[("$top", offset + limit)]);
        let response = self.call(request).await?;
        let branches: Vec<Value> = page(values(&response), limit, offset)
            .into_iter()
            .map(|mut b| {
                if let Value::Object(map) = &mut b {
                    map.insert("repository".into(), json!(repository));
                    map.insert("project".into(), json!(project));
                }
                b
            })
            .collect();
        let readable = TableBuilder::new(&format!("{} Branches", repository))
            .headers(&["name"])
            .render(&branches);
        Ok(CommandResults::new()
            .outputs("AzureDevOps.Branch", Some("name"), Value::Array(branches))
            .with_readable(readable)
            .into())
    }

    async fn branch_create_command(&self, args: &CommandArgs) -> ConnectorResult<CommandOutput> {
        let (organization, repository, project) = self.scope(args, true)?;

        let old_object_id = match args.get_str("reference_branch_name") {
            Some(reference) => {
                let path = self.git_path(&organization, &project, &repository, "refs");
                let filter = branch_ref(&reference);
                let filter = filter.trim_start_matches("refs/");
                let response = self
                    .call(self.request(Method::GET, &path, API_VERSION).query(&[("filter", filter)]))
                    .await?;
                response
                    .pointer("/value/0/objectId")
                    .map(format_cell)
                    .ok_or_else(|| {
                        ConnectorError::VendorError(format!("Branch {} was not found.", reference))
                    })?
            }
            None => EMPTY_OBJECT_ID.to_string(),
        };

        let body_args = args
            .clone()
            .with("branch_name", branch_ref(&args.require_str("branch_name")?))
            .with("branch_id", old_object_id);
        let body = file_pre_process_body_request("add", &body_args);
        let path = self.git_path(&organization, &project, &repository, "pushes");
        let response = self
            .call(self.request(Method::POST, &path, API_VERSION).json(&body))
            .await?;

        let readable = format!(
            "Branch {} was created successfully by {}.",
            display_name(&response, "/refUpdates/0/name"),
            display_name(&response, "/pushedBy/displayName")
        );
        Ok(CommandResults::new()
            .outputs("AzureDevOps.Branch", Some("name"), response.clone())
            .with_readable(readable)
            .with_raw_response(response)
            .into())
    }

    async fn pull_request_reviewer_list_command(&self, args: &CommandArgs) -> ConnectorResult<CommandOutput> {
        let (organization, repository, project) = self.scope(args, true)?;
        let id = args.require_str("pull_request_id")?;
        let path = self.git_path(&organization, &project, &repository, &format!("pullRequests/{}/reviewers", id));
        let response = self
            .call_allow_not_found(self.request(Method::GET, &path, API_VERSION))
            .await?;

        let reviewers = values(&response);
        let rows: Vec<Value> = reviewers
            .iter()
            .map(|r| {
                json!({
                    "Reviewer(s)": r.get("displayName"),
                    "Has Declined": r.get("hasDeclined"),
                    "Is Required": r.get("isRequired"),
                    "Is Flagged": r.get("isFlagged"),
                })
            })
            .collect();
        let readable = TableBuilder::new("Reviewers List").render(&rows);
        let outputs = response
            .get("value")
            .cloned()
            .unwrap_or_else(|| response.clone());
        Ok(CommandResults::new()
            .outputs("AzureDevOps.PullRequestReviewer", None, outputs)
            .with_readable(readable)
            .with_raw_response(response)
            .into())
    }

    async fn pull_request_reviewer_create_command(&self, args: &CommandArgs) -> ConnectorResult<CommandOutput> {
        let (organization, repository, project) = self.scope(args, true)?;
        let id = args.require_str("pull_request_id")?;
        let reviewer = args.require_str("reviewer_user_id")?;
        let body = json!({
            "vote": 0,
            "isRequired": args.get_bool_or("is_required", false)?,
        });
        let path = self.git_path(
            &organization,
            &project,
            &repository,
            &format!("pullRequests/{}/reviewers/{}", id, reviewer),
        );
        let response = self
            .call_allow_not_found(self.request(Method::PUT, &path, API_VERSION).json(&body))
            .await?;

        let readable = match response.get("message") {
            Some(message) => format_cell(message),
            None => format!(
                "{} ({}) was created successfully as a reviewer for Pull Request ID {}.",
                display_name(&response, "/displayName"),
                display_name(&response, "/uniqueName"),
                id
            ),
        };
        Ok(CommandResults::new()
            .outputs("AzureDevOps.PullRequestReviewer", None, response.clone())
            .with_readable(readable)
            .with_raw_response(response)
            .into())
    }

    fn commits_result(&self, title: &str, response: Value, commits: Value) -> CommandResults {
        let list = match &commits {
            Value::Array(items) => items.clone(),
            other => vec![other.clone()],
        };
        let rows: Vec<Value> = list
            .iter()
            .filter(|c| c.get("commitId").is_some())
            .map(|c| {
                json!({
                    "Comment": c.get("comment"),
                    "Author Name": c.pointer("/author/name"),
                    "Author Email": c.pointer("/author/email"),
                    "Author Date": c.pointer("/author/date"),
                    "Committer Name": c.pointer("/committer/name"),
                    "Committer Email": c.pointer("/committer/email"),
                    "Committer Date": c.pointer("/committer/date"),
                    "Commit ID": c.get("commitId"),
                })
            })
            .collect();
        CommandResults::new()
            .outputs("AzureDevOps.Commit", Some("commitId"), commits)
            .with_readable(TableBuilder::new(title).render(&rows))
            .with_raw_response(response)
    }

    async fn pull_request_commit_list_command(&self, args: &CommandArgs) -> ConnectorResult<CommandOutput> {
        let (organization, repository, project) = self.scope(args, true)?;
        let id = args.require_str("pull_request_id")?;
        let (limit, _) = pagination_preprocess_and_validation(args)?;
        let path = self.git_path(&organization, &project, &repository, &format!("pullRequests/{}/commits", id));
        let response = self
            .call_allow_not_found(self.request(Method::GET, &path, API_VERSION).query(&[("$top", limit)]))
            .await?;
        let commits = response
            .get("value")
            .map(|v| Value::Array(page(v.as_array().cloned().unwrap_or_default(), limit, 0)))
            .unwrap_or_else(|| response.clone());
        Ok(self.commits_result("Commits List", response, commits).into())
    }

    async fn commit_list_command(&self, args: &CommandArgs) -> ConnectorResult<CommandOutput> {
        let (limit, offset) = pagination_preprocess_and_validation(args)?;
        let (organization, repository, project) = self.scope(args, true)?;
        let path = self.git_path(&organization, &project, &repository, "commits");
        let request = self
            .request(Method::GET, &path, API_VERSION)
            .query(&[("searchCriteria.$skip", offset), ("searchCriteria.$top", limit)]);
        let response = self.call(request).await?;
        let commits = Value::Array(page(values(&response), limit, 0));
        Ok(self.commits_result("Commits List", response, commits).into())
    }

    async fn commit_get_command(&self, args: &CommandArgs) -> ConnectorResult<CommandOutput> {
        let (organization, repository, project) = self.scope(args, true)?;
        let commit_id = args.require_str("commit_id")?;
        let path = self.git_path(&organization, &project, &repository, &format!("commits/{}", commit_id));
        let response = self.call(self.request(Method::GET, &path, API_VERSION)).await?;
        Ok(self
            .commits_result("Commit Details", response.clone(), response)
            .into())
    }

    fn work_item_path(&self, organization: &str, project: &str, rest: &str) -> String {
        format!("{}/{}/_apis/wit/workitems/{}", organization, project, rest)
    }

    async fn work_item_get_command(&self, args: &CommandArgs) -> ConnectorResult<CommandOutput> {
        let (organization, _, project) = self.scope(args, false)?;
        let item_id = args.require_str("item_id")?;
        let path = self.work_item_path(&organization, &project, &item_id);
        let response = self.call(self.request(Method::GET, &path, API_VERSION)).await?;

        let field = |name: &str| {
            response
                .get("fields")
                .and_then(|f| f.get(name))
                .cloned()
                .unwrap_or(Value::Null)
        };
        let row = json!({
            "ID": response.get("id"),
            "Title": field("System.Title"),
            "Assigned To": response
                .pointer("/fields/System.AssignedTo/displayName")
                .cloned()
                .unwrap_or(Value::Null),
            "State": field("System.State"),
            "Area Path": field("System.AreaPath"),
            "Tags": field("System.Tags"),
            "Activity Date": field("Microsoft.VSTS.Common.StateChangeDate"),
        });
        let readable = TableBuilder::new("Work Item Details")
            .headers(&["ID", "Title", "Assigned To", "State", "Area Path", "Tags", "Activity Date"])
            .render(std::slice::from_ref(&row));
        Ok(CommandResults::new()
            .outputs("AzureDevOps.WorkItem", Some("id"), response.clone())
            .with_readable(readable)
            .with_raw_response(response)
            .into())
    }

    async fn work_item_create_command(&self, args: &CommandArgs) -> ConnectorResult<CommandOutput> {
        let (organization, _, project) = self.scope(args, false)?;
        let item_type = args.require_str("type")?;
        args.require_str("title")?;
        let data = work_item_pre_process_data(
            args,
            &["title", "iteration_path", "description", "priority", "tag"],
        );
        let path = self.work_item_path(&organization, &project, &format!("${}", item_type));
        let request = self
            .request(Method::POST, &path, API_VERSION)
            .header("Content-Type", "application/json-patch+json")
            .body(Value::Array(data).to_string());
        let response = self.call(request).await?;
        let readable = format!(
            "Work Item {} was created successfully.",
            display_name(&response, "/id")
        );
        Ok(CommandResults::new()
            .outputs("AzureDevOps.WorkItem", Some("id"), response.clone())
            .with_readable(readable)
            .with_raw_response(response)
            .into())
    }

    async fn work_item_update_command(&self, args: &CommandArgs) -> ConnectorResult<CommandOutput> {
        let (organization, _, project) = self.scope(args, false)?;
        let item_id = args.require_str("item_id")?;
        let data = work_item_pre_process_data(
            args,
            &[
                "title",
                "assignee_display_name",
                "state",
                "iteration_path",
                "description",
                "priority",
                "tag",
            ],
        );
        if data.is_empty() {
            return Err(ConnectorError::invalid_argument(
                "At least one field to update must be provided.",
            ));
        }
        let path = self.work_item_path(&organization, &project, &item_id);
        let request = self
            .request(Method::PATCH, &path, API_VERSION)
            .header("Content-Type", "application/json-patch+json")
            .body(Value::Array(data).to_string());
        let response = self.call(request).await?;
        Ok(CommandResults::new()
            .outputs("AzureDevOps.WorkItem", Some("id"), response.clone())
            .with_readable(format!("Work Item {} was updated successfully.", item_id))
            .with_raw_response(response)
            .into())
    }

    /// Pushes one file change (`add`, `edit` or `delete`).
    async fn file_push(&self, args: &CommandArgs, change_type: &str) -> ConnectorResult<CommandOutput> {
        let (organization, repository, project) = self.scope(args, true)?;
        for required in ["branch_name", "branch_id", "commit_comment", "file_path"] {
            args.require_str(required)?;
        }
        let body = file_pre_process_body_request(change_type, args);
        let path = self.git_path(&organization, &project, &repository, "pushes");
        let response = self
            .call(self.request(Method::POST, &path, API_VERSION).json(&body))
            .await?;

        let comment = args.get_str_or("commit_comment", "");
        let pusher = display_name(&response, "/pushedBy/displayName");
        let branch = args.get_str_or("branch_name", "");
        let readable = match change_type {
            "add" => format!(
                "Commit \"{}\" was created and pushed successfully by \"{}\" to branch \"{}\".",
                comment, pusher, branch
            ),
            "edit" => format!(
                "Commit \"{}\" was updated successfully by \"{}\" in branch \"{}\".",
                comment, pusher, branch
            ),
            _ => format!(
                "Commit \"{}\" was deleted successfully by \"{}\" in branch \"{}\".",
                comment, pusher, branch
            ),
        };
        Ok(CommandResults::new()
            .outputs("AzureDevOps.File", None, response.clone())
            .with_readable(readable)
            .with_raw_response(response)
            .into())
    }

    fn version_query(branch: &str) -> Vec<(&'static str, String)> {
        vec![
            (
                "versionDescriptor.version",
                branch.trim_start_matches("refs/heads/").to_string(),
            ),
            ("versionDescriptor.versionType", "branch".to_string()),
        ]
    }

    async fn file_list_command(&self, args: &CommandArgs) -> ConnectorResult<CommandOutput> {
        let (organization, repository, project) = self.scope(args, true)?;
        let branch = args.require_str("branch_name")?;
        let path = self.git_path(&organization, &project, &repository, "items");
        let request = self
            .request(Method::GET, &path, API_VERSION)
            .query(&[
                ("scopePath", "/".to_string()),
                ("recursionLevel", args.get_str_or("recursion_level", "OneLevel")),
                ("includeContentMetadata", "true".to_string()),
            ])
            .query(&Self::version_query(&branch));
        let response = self.call(request).await?;
        let files = values(&response);
        let rows: Vec<Value> = files
            .iter()
            .map(|f| json!({"File Name(s)": f.get("path")}))
            .collect();
        let readable = TableBuilder::new("Files").render(&rows);
        Ok(CommandResults::new()
            .outputs("AzureDevOps.File", Some("objectId"), Value::Array(files))
            .with_readable(readable)
            .with_raw_response(response)
            .into())
    }

    async fn file_content_get_command(&self, args: &CommandArgs) -> ConnectorResult<CommandOutput> {
        let (organization, repository, project) = self.scope(args, true)?;
        let branch = args.require_str("branch_name")?;
        let file_name = args.require_str("file_name")?;
        let path = self.git_path(&organization, &project, &repository, "items");
        let request = self
            .request(Method::GET, &path, API_VERSION)
            .query(&[("path", file_name), ("includeContent", "true".to_string())])
            .query(&Self::version_query(&branch));
        let response = self.call(request).await?;
        let row = json!({"path": response.get("path"), "content": response.get("content")});
        let readable = table_to_markdown("Content File", &row, Some(&["path", "content"]));
        Ok(CommandResults::new()
            .outputs("AzureDevOps.File", Some("objectId"), response.clone())
            .with_readable(readable)
            .with_raw_response(response)
            .into())
    }

    async fn blob_zip_get_command(&self, args: &CommandArgs) -> ConnectorResult<CommandOutput> {
        let (organization, repository, project) = self.scope(args, true)?;
        let object_id = args.require_str("file_object_id")?;
        let path = self.git_path(&organization, &project, &repository, &format!("blobs/{}", object_id));
        let request = self
            .request(Method::GET, &path, API_VERSION)
            .query(&[("$format", "zip")])
            .header("Accept", "application/zip");
        let response = self.client.send(request).await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ConnectorError::InvalidResponse(e.to_string()))?;
        Ok(CommandOutput::File(FileResult::new(
            format!("{}.zip", object_id),
            bytes.to_vec(),
        )))
    }

    fn thread_body(args: &CommandArgs) -> ConnectorResult<Value> {
        Ok(json!({
            "comments": [{
                "parentCommentId": 0,
                "content": args.require_str("comment_text")?,
                "commentType": 1,
            }],
            "status": 1,
        }))
    }

    async fn pull_request_thread_create_command(&self, args: &CommandArgs) -> ConnectorResult<CommandOutput> {
        let (organization, repository, project) = self.scope(args, true)?;
        let id = args.require_str("pull_request_id")?;
        let path = self.git_path(&organization, &project, &repository, &format!("pullRequests/{}/threads", id));
        let response = self
            .call(self.request(Method::POST, &path, API_VERSION).json(&Self::thread_body(args)?))
            .await?;
        let readable = format!(
            "Thread {} was created successfully by {}.",
            display_name(&response, "/id"),
            display_name(&response, "/comments/0/author/displayName")
        );
        Ok(CommandResults::new()
            .outputs("AzureDevOps.PullRequestThread", Some("id"), response.clone())
            .with_readable(readable)
            .with_raw_response(response)
            .into())
    }

    async fn pull_request_thread_update_command(&self, args: &CommandArgs) -> ConnectorResult<CommandOutput> {
        let (organization, repository, project) = self.scope(args, true)?;
        let id = args.require_str("pull_request_id")?;
        let thread_id = args.require_str("thread_id")?;
        let path = self.git_path(
            &organization,
            &project,
            &repository,
            &format!("pullRequests/{}/threads/{}", id, thread_id),
        );
        let response = self
            .call(self.request(Method::PATCH, &path, API_VERSION).json(&Self::thread_body(args)?))
            .await?;
        let readable = format!(
            "Thread {} was updated successfully by {}.",
            display_name(&response, "/id"),
            display_name(&response, "/comments/0/author/displayName")
        );
        Ok(CommandResults::new()
            .outputs("AzureDevOps.PullRequestThread", Some("id"), response.clone())
            .with_readable(readable)
            .with_raw_response(response)
            .into())
    }

    async fn pull_request_thread_list_command(&self, args: &CommandArgs) -> ConnectorResult<CommandOutput> {
        let (organization, repository, project) = self.scope(args, true)?;
        let id = args.require_str("pull_request_id")?;
        let path = self.git_path(&organization, &project, &repository, &format!("pullRequests/{}/threads", id));
        let response = self.call(self.request(Method::GET, &path, API_VERSION)).await?;
        let threads = values(&response);

        let mut rows = Vec::new();
        for thread in &threads {
            let comments = thread
                .get("comments")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            for comment in comments {
                rows.push(json!({
                    "Thread ID": thread.get("id"),
                    "Content": comment.get("content"),
                    "Name": comment.pointer("/author/displayName"),
                    "Date": comment.get("publishedDate"),
                }));
            }
        }
        let readable = TableBuilder::new("Threads")
            .headers(&["Thread ID", "Content", "Name", "Date"])
            .render(&rows);
        Ok(CommandResults::new()
            .outputs("AzureDevOps.PullRequestThread", Some("id"), Value::Array(threads))
            .with_readable(readable)
            .with_raw_response(response)
            .into())
    }

    async fn project_team_list_command(&self, args: &CommandArgs) -> ConnectorResult<CommandOutput> {
        let (organization, _, project) = self.scope(args, false)?;
        let path = format!("{}/_apis/projects/{}/teams", organization, project);
        let response = self.call(self.request(Method::GET, &path, API_VERSION)).await?;
        let teams = values(&response);
        let rows: Vec<Value> = teams.iter().map(|t| json!({"Name": t.get("name")})).collect();
        let readable = TableBuilder::new("Teams").render(&rows);
        Ok(CommandResults::new()
            .outputs("AzureDevOps.Team", Some("id"), Value::Array(teams))
            .with_readable(readable)
            .with_raw_response(response)
            .into())
    }

    async fn team_member_list_command(&self, args: &CommandArgs) -> ConnectorResult<CommandOutput> {
        let (limit, offset) = pagination_preprocess_and_validation(args)?;
        let (organization, _, project) = self.scope(args, false)?;
        let team_id = args.require_str("team_id")?;
        let path = format!("{}/_apis/projects/{}/teams/{}/members", organization, project, team_id);
        let request = self
            .request(Method::GET, &path, API_VERSION)
            .query(&[("$skip", offset), ("$top", limit)]);
        let response = self.call(request).await?;
        let members = values(&response);
        let rows: Vec<Value> = members
            .iter()
            .map(|m| json!({"Name": m.pointer("/identity/displayName")}))
            .collect();
        let readable = TableBuilder::new("Team Members").render(&rows);
        Ok(CommandResults::new()
            .outputs("AzureDevOps.TeamMember", None, Value::Array(members))
            .with_readable(readable)
            .with_raw_response(response)
            .into())
    }

    /// Markdown with the authorization-code login link for this application.
    pub fn generate_login_url(&self) -> ConnectorResult<String> {
        let redirect_uri = self.config.redirect_uri.as_deref().ok_or_else(|| {
            ConnectorError::ConfigError("redirect_uri is required to generate a login URL".into())
        })?;
        let url = format!(
            "{}/{}/oauth2/v2.0/authorize?response_type=code&scope=offline_access%20{}%20offline_access&client_id={}&redirect_uri={}",
            self.config.login_url.trim_end_matches('/'),
            self.config.tenant_id,
            USER_IMPERSONATION_SCOPE,
            self.config.client_id,
            redirect_uri
        );
        Ok(format!(
            "### Authorization instructions\n\
             1. Click on the [login URL]({}) to sign in and grant the application access to Azure DevOps.\n\
             You will be redirected to a link with the following structure:\n\
             ```REDIRECT_URI?code=AUTH_CODE&session_state=SESSION_STATE```\n\
             2. Copy the `AUTH_CODE` (without the `code=` prefix and the `session_state` parameter) \
             into the instance configuration.",
            url
        ))
    }

    /// Newest-first active pull requests, paging until `last_id` is reached.
    async fn recent_pull_requests(&self, organization: &str, project: &str, repository: &str, last_id: Option<i64>) -> ConnectorResult<Vec<Value>> {
        let mut prs = Vec::new();
        for page_index in 0..MAX_PR_PAGES {
            let batch = self
                .list_pull_requests(organization, project, repository, page_index * PR_PAGE_SIZE, PR_PAGE_SIZE)
                .await?;
            let done = batch.len() < PR_PAGE_SIZE
                || last_id.is_none()
                || batch
                    .iter()
                    .any(|pr| pr_id(pr).is_some_and(|id| Some(id) <= last_id));
            prs.extend(batch);
            if done {
                break;
            }
        }
        Ok(prs)
    }

    pub async fn is_new_pr(&self, project: &str, repository: &str, last_id: i64) -> ConnectorResult<bool> {
        let prs = self
            .list_pull_requests(&self.config.organization, project, repository, 0, 1)
            .await?;
        Ok(has_new_pr(&prs, last_id))
    }

    pub async fn get_last_fetch_incident_index(&self, project: &str, repository: &str, last_id: i64) -> ConnectorResult<i64> {
        let prs = self
            .recent_pull_requests(&self.config.organization, project, repository, Some(last_id))
            .await?;
        Ok(last_fetch_index(&prs, last_id))
    }

    pub async fn get_closest_index(&self, project: &str, repository: &str, last_id: i64) -> ConnectorResult<i64> {
        let prs = self
            .recent_pull_requests(&self.config.organization, project, repository, Some(last_id))
            .await?;
        Ok(closest_index(&prs, last_id))
    }

    /// Creates incidents for pull requests newer than the stored `last_id`, oldest first.
    #[instrument(skip(self, last_run))]
    pub async fn fetch_incidents(&self, last_run: &mut LastRun) -> ConnectorResult<Vec<Incident>> {
        let project = self.config.project.clone().unwrap_or_default();
        let repository = self.config.repository.clone().unwrap_or_default();
        if project.is_empty() || repository.is_empty() {
            return Err(ConnectorError::ConfigError(
                "project and repository are required to fetch incidents".into(),
            ));
        }
        let last_id = last_run.get_i64("last_id");

        let prs = self
            .recent_pull_requests(&self.config.organization, &project, &repository, last_id)
            .await?;

        let end = match last_id {
            None => prs.len(),
            Some(last_id) if !has_new_pr(&prs, last_id) => 0,
            Some(last_id) => match last_fetch_index(&prs, last_id) {
                -1 => (closest_index(&prs, last_id) + 1) as usize,
                index => index as usize,
            },
        };
        let new_prs = &prs[..end.min(prs.len())];
        let take = new_prs.len().min(self.config.max_fetch);
        let selected = &new_prs[new_prs.len() - take..];

        let incidents: Vec<Incident> = selected
            .iter()
            .rev()
            .map(|pr| Incident {
                name: pr
                    .get("title")
                    .and_then(Value::as_str)
                    .unwrap_or("Azure DevOps pull request")
                    .to_string(),
                occurred: pr.get("creationDate").and_then(Value::as_str).map(str::to_string),
                raw_json: pr.to_string(),
                severity: None,
            })
            .collect();

        if let Some(max_id) = selected.iter().filter_map(pr_id).max() {
            last_run.set("last_id", max_id);
        }
        info!(count = incidents.len(), "Fetched pull request incidents");
        Ok(incidents)
    }
}

#[async_trait]
impl Integration for AzureDevOpsIntegration {
    fn name(&self) -> &str {
        "AzureDevOps"
    }

    fn commands(&self) -> Vec<&'static str> {
        vec![
            "fetch-incidents",
            "azure-devops-generate-login-url",
            "azure-devops-project-list",
            "azure-devops-repository-list",
            "azure-devops-user-query",
            "azure-devops-user-add",
            "azure-devops-user-remove",
            "azure-devops-pull-request-create",
            "azure-devops-pull-request-get",
            "azure-devops-pull-request-update",
            "azure-devops-pull-request-list",
            "azure-devops-pipeline-run",
            "azure-devops-pipeline-run-get",
            "azure-devops-pipeline-run-list",
            "azure-devops-pipeline-list",
            "azure-devops-branch-list",
            "azure-devops-branch-create",
            "azure-devops-pull-request-reviewer-list",
            "azure-devops-pull-request-reviewer-create",
            "azure-devops-pull-request-commit-list",
            "azure-devops-commit-list",
            "azure-devops-commit-get",
            "azure-devops-work-item-get",
            "azure-devops-work-item-create",
            "azure-devops-work-item-update",
            "azure-devops-file-create",
            "azure-devops-file-update",
            "azure-devops-file-delete",
            "azure-devops-file-list",
            "azure-devops-file-content-get",
            "azure-devops-blob-zip-get",
            "azure-devops-pull-request-thread-create",
            "azure-devops-pull-request-thread-update",
            "azure-devops-pull-request-thread-list",
            "azure-devops-project-team-list",
            "azure-devops-team-member-list",
        ]
    }

    async fn test_module(&self) -> ConnectorResult<String> {
        if self.config.client_secret.is_none() {
            return Err(ConnectorError::ConfigError(
                "A client secret is required to test the connection.".into(),
            ));
        }
        let request = self
            .request(
                Method::GET,
                &format!("{}/_apis/projects", self.config.organization),
                API_VERSION,
            )
            .query(&[("$top", 1)]);
        self.call(request).await?;
        Ok("ok".to_string())
    }

    async fn execute(
        &self,
        command: &str,
        args: &CommandArgs,
        last_run: &mut LastRun,
    ) -> ConnectorResult<CommandOutput> {
        match command {
            "fetch-incidents" => Ok(CommandOutput::Incidents(self.fetch_incidents(last_run).await?)),
            "azure-devops-generate-login-url" => {
                Ok(CommandResults::readable(self.generate_login_url()?).into())
            }
            "azure-devops-project-list" => self.project_list_command(args).await,
            "azure-devops-repository-list" => self.repository_list_command(args).await,
            "azure-devops-user-query" => self.users_query_command(args).await,
            "azure-devops-user-add" => self.user_add_command(args).await,
            "azure-devops-user-remove" => self.user_remove_command(args).await,
            "azure-devops-pull-request-create" => self.pull_request_create_command(args).await,
            "azure-devops-pull-request-get" => self.pull_request_get_command(args).await,
            "azure-devops-pull-request-update" => self.pull_request_update_command(args).await,
            "azure-devops-pull-request-list" => self.pull_requests_list_command(args).await,
            "azure-devops-pipeline-run" => self.pipeline_run_command(args).await,
            "azure-devops-pipeline-run-get" => self.pipeline_run_get_command(args).await,
            "azure-devops-pipeline-run-list" => self.pipeline_run_list_command(args).await,
            "azure-devops-pipeline-list" => self.pipeline_list_command(args).await,
            "azure-devops-branch-list" => self.branch_list_command(args).await,
            "azure-devops-branch-create" => self.branch_create_command(args).await,
            "azure-devops-pull-request-reviewer-list" => {
                self.pull_request_reviewer_list_command(args).await
            }
            "azure-devops-pull-request-reviewer-create" => {
                self.pull_request_reviewer_create_command(args).await
            }
            "azure-devops-pull-request-commit-list" => {
                self.pull_request_commit_list_command(args).await
            }
            "azure-devops-commit-list" => self.commit_list_command(args).await,
            "azure-devops-commit-get" => self.commit_get_command(args).await,
            "azure-devops-work-item-get" => self.work_item_get_command(args).await,
            "azure-devops-work-item-create" => self.work_item_create_command(args).await,
            "azure-devops-work-item-update" => self.work_item_update_command(args).await,
            "azure-devops-file-create" => self.file_push(args, "add").await,
            "azure-devops-file-update" => self.file_push(args, "edit").await,
            "azure-devops-file-delete" => self.file_push(args, "delete").await,
            "azure-devops-file-list" => self.file_list_command(args).await,
            "azure-devops-file-content-get" => self.file_content_get_command(args).await,
            "azure-devops-blob-zip-get" => self.blob_zip_get_command(args).await,
            "azure-devops-pull-request-thread-create" => {
                self.pull_request_thread_create_command(args).await
            }
            "azure-devops-pull-request-thread-update" => {
                self.pull_request_thread_update_command(args).await
            }
            "azure-devops-pull-request-thread-list" => {
                self.pull_request_thread_list_command(args).await
            }
            "azure-devops-project-team-list" => self.project_team_list_command(args).await,
            "azure-devops-team-member-list" => self.team_member_list_command(args).await,
            other => Err(ConnectorError::UnknownCommand(other.to_string())),
        }
    }
}
