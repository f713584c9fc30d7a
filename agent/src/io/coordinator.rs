//! Client for the coordinator's REST API.
//!
//! The [`Coordinator`] trait is the seam the agent, listeners, bus subscribers
//! and callback server depend on; [`HttpCoordinator`] is the reqwest-backed
//! implementation. Run, workspace, configuration-version and variable reads
//! use JSON:API documents; the agent-only endpoints take plain JSON.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::{debug, instrument};

use crate::core::types::{
    ConfigurationVersion, Run, RunStatusUpdate, Variable, VariableCategory, Workspace,
};
use crate::io::config::CoordinatorConfig;

#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Queued runs for an organization, in queue order.
    async fn run_queue(&self, organization_id: &str) -> Result<Vec<Run>>;

    async fn read_run(&self, run_id: &str) -> Result<Run>;

    async fn read_workspace(&self, organization_id: &str, workspace_id: &str) -> Result<Workspace>;

    async fn read_configuration_version(&self, id: &str) -> Result<ConfigurationVersion>;

    /// Raw `.tar.gz` bytes of a configuration version.
    async fn download_configuration_version(&self, id: &str) -> Result<Vec<u8>>;

    async fn list_variables(&self, workspace_id: &str) -> Result<Vec<Variable>>;

    /// State-backend token for a run.
    async fn run_backend_token(&self, run_id: &str) -> Result<String>;

    async fn update_plan_status(&self, plan_id: &str, status: &str) -> Result<()>;

    async fn update_apply_status(&self, apply_id: &str, status: &str) -> Result<()>;

    async fn update_run_status(&self, run_id: &str, update: &RunStatusUpdate) -> Result<()>;

    async fn upload_plan(&self, run_id: &str, content: &str) -> Result<()>;

    /// Append a chunk to the run's live log.
    async fn append_logs(&self, run_id: &str, chunk: &str) -> Result<()>;

    /// Replace the run's stored log with the full content.
    async fn upload_logs(&self, run_id: &str, content: &str) -> Result<()>;
}

pub struct HttpCoordinator {
    client: Client,
    base_url: String,
    api_path: String,
    agents_path: String,
    token: String,
}

impl HttpCoordinator {
    pub fn new(config: &CoordinatorConfig, token: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("build coordinator http client")?;
        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            api_path: normalize_prefix(&config.api_path),
            agents_path: normalize_prefix(&config.agents_path),
            token: token.into(),
        })
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}{}/{}", self.base_url, self.api_path, path)
    }

    fn agents_url(&self, path: &str) -> String {
        format!("{}{}/{}", self.base_url, self.agents_path, path)
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        self.client
            .request(method, url)
            .bearer_auth(&self.token)
            .header("Accept", "application/json")
    }

    async fn send(&self, builder: RequestBuilder, what: &str) -> Result<Response> {
        let response = builder
            .send()
            .await
            .with_context(|| format!("send {what} request"))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("{what} failed with HTTP {status}: {}", preview(&body));
        }
        debug!(%status, what, "coordinator request succeeded");
        Ok(response)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str, what: &str) -> Result<T> {
        let response = self.send(self.request(Method::GET, url), what).await?;
        response
            .json::<T>()
            .await
            .with_context(|| format!("decode {what} response"))
    }

    async fn put_json(&self, url: &str, body: &serde_json::Value, what: &str) -> Result<()> {
        self.send(self.request(Method::PUT, url).json(body), what)
            .await
            .map(|_| ())
    }

    async fn post_json(&self, url: &str, body: &serde_json::Value, what: &str) -> Result<()> {
        self.send(self.request(Method::POST, url).json(body), what)
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl Coordinator for HttpCoordinator {
    #[instrument(skip(self))]
    async fn run_queue(&self, organization_id: &str) -> Result<Vec<Run>> {
        let url = self.api_url(&format!("organizations/{organization_id}/runs/queue"));
        let doc: Document<Vec<Resource<RunAttributes>>> = self.get_json(&url, "run queue").await?;
        doc.data.into_iter().map(run_from_resource).collect()
    }

    #[instrument(skip(self))]
    async fn read_run(&self, run_id: &str) -> Result<Run> {
        let url = self.api_url(&format!("runs/{run_id}"));
        let doc: Document<Resource<RunAttributes>> = self.get_json(&url, "read run").await?;
        run_from_resource(doc.data)
    }

    #[instrument(skip(self))]
    async fn read_workspace(&self, organization_id: &str, workspace_id: &str) -> Result<Workspace> {
        let url = self.api_url(&format!("workspaces/{workspace_id}"));
        let doc: Document<Resource<WorkspaceAttributes>> =
            self.get_json(&url, "read workspace").await?;
        Ok(workspace_from_resource(doc.data))
    }

    #[instrument(skip(self))]
    async fn read_configuration_version(&self, id: &str) -> Result<ConfigurationVersion> {
        let url = self.api_url(&format!("configuration-versions/{id}"));
        let doc: Document<Resource<ConfigurationVersionAttributes>> =
            self.get_json(&url, "read configuration version").await?;
        Ok(ConfigurationVersion {
            id: doc.data.id,
            status: doc.data.attributes.status,
        })
    }

    #[instrument(skip(self))]
    async fn download_configuration_version(&self, id: &str) -> Result<Vec<u8>> {
        let url = self.api_url(&format!("configuration-versions/{id}/download"));
        let response = self
            .send(
                self.request(Method::GET, &url),
                "download configuration version",
            )
            .await?;
        let bytes = response
            .bytes()
            .await
            .context("read configuration version body")?;
        Ok(bytes.to_vec())
    }

    #[instrument(skip(self))]
    async fn list_variables(&self, workspace_id: &str) -> Result<Vec<Variable>> {
        let url = self.api_url(&format!("workspaces/{workspace_id}/vars"));
        let doc: Document<Vec<Resource<VariableAttributes>>> =
            self.get_json(&url, "list variables").await?;
        Ok(doc.data.into_iter().map(variable_from_resource).collect())
    }

    #[instrument(skip(self))]
    async fn run_backend_token(&self, run_id: &str) -> Result<String> {
        let url = self.agents_url(&format!("runs/{run_id}/token"));
        let body: TokenResponse = self.get_json(&url, "read run token").await?;
        if body.token.is_empty() {
            return Err(anyhow!("coordinator returned an empty token for run {run_id}"));
        }
        Ok(body.token)
    }

    #[instrument(skip(self))]
    async fn update_plan_status(&self, plan_id: &str, status: &str) -> Result<()> {
        let url = self.agents_url(&format!("plans/{plan_id}"));
        self.put_json(&url, &json!({ "status": status }), "update plan status")
            .await
    }

    #[instrument(skip(self))]
    async fn update_apply_status(&self, apply_id: &str, status: &str) -> Result<()> {
        let url = self.agents_url(&format!("applies/{apply_id}"));
        self.put_json(&url, &json!({ "status": status }), "update apply status")
            .await
    }

    #[instrument(skip(self, update), fields(status = %update.status))]
    async fn update_run_status(&self, run_id: &str, update: &RunStatusUpdate) -> Result<()> {
        let url = self.agents_url(&format!("runs/{run_id}"));
        let body = serde_json::to_value(update).context("serialize run status update")?;
        self.put_json(&url, &body, "update run status").await
    }

    #[instrument(skip(self, content), fields(bytes = content.len()))]
    async fn upload_plan(&self, run_id: &str, content: &str) -> Result<()> {
        // The plan body is the encoded plan itself, not a JSON envelope.
        let url = self.agents_url(&format!("plans/{run_id}"));
        self.send(
            self.request(Method::PUT, &url)
                .header("Content-Type", "text/plain")
                .body(content.to_string()),
            "upload plan",
        )
        .await
        .map(|_| ())
    }

    #[instrument(skip(self, chunk), fields(bytes = chunk.len()))]
    async fn append_logs(&self, run_id: &str, chunk: &str) -> Result<()> {
        let url = self.agents_url(&format!("runs/{run_id}/logs/stream"));
        self.post_json(&url, &json!({ "content": chunk }), "stream logs")
            .await
    }

    #[instrument(skip(self, content), fields(bytes = content.len()))]
    async fn upload_logs(&self, run_id: &str, content: &str) -> Result<()> {
        let url = self.agents_url(&format!("runs/{run_id}/logs"));
        self.put_json(&url, &json!({ "content": content }), "upload logs")
            .await
    }
}

fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{trimmed}")
    }
}

fn preview(body: &str) -> &str {
    const LIMIT: usize = 512;
    if body.len() <= LIMIT {
        return body;
    }
    let mut end = LIMIT;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    &body[..end]
}

#[derive(Debug, Deserialize)]
struct Document<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct Resource<A> {
    id: String,
    attributes: A,
    #[serde(default)]
    relationships: HashMap<String, Relationship>,
}

impl<A> Resource<A> {
    fn related_id(&self, name: &str) -> Result<String> {
        self.relationships
            .get(name)
            .and_then(|rel| rel.data.as_ref())
            .map(|data| data.id.clone())
            .ok_or_else(|| anyhow!("{} is missing the {name} relationship", self.id))
    }
}

#[derive(Debug, Deserialize)]
struct Relationship {
    #[serde(default)]
    data: Option<ResourceRef>,
}

#[derive(Debug, Deserialize)]
struct ResourceRef {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct RunAttributes {
    status: String,
    #[serde(default)]
    is_destroy: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct WorkspaceAttributes {
    name: String,
    #[serde(default)]
    locked: bool,
    #[serde(default)]
    working_directory: Option<String>,
    #[serde(default)]
    terraform_version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ConfigurationVersionAttributes {
    status: String,
}

#[derive(Debug, Deserialize)]
struct VariableAttributes {
    key: String,
    #[serde(default)]
    value: Option<String>,
    category: VariableCategory,
    #[serde(default)]
    hcl: bool,
    #[serde(default)]
    sensitive: bool,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
}

fn run_from_resource(resource: Resource<RunAttributes>) -> Result<Run> {
    Ok(Run {
        workspace_id: resource.related_id("workspace")?,
        configuration_version_id: resource.related_id("configuration-version")?,
        plan_id: resource.related_id("plan")?,
        apply_id: resource.related_id("apply")?,
        status: resource.attributes.status,
        is_destroy: resource.attributes.is_destroy,
        id: resource.id,
    })
}

fn workspace_from_resource(resource: Resource<WorkspaceAttributes>) -> Workspace {
    let attrs = resource.attributes;
    Workspace {
        id: resource.id,
        name: attrs.name,
        locked: attrs.locked,
        working_directory: attrs.working_directory.unwrap_or_default(),
        tool_version: attrs.terraform_version.filter(|v| !v.is_empty()),
    }
}

fn variable_from_resource(resource: Resource<VariableAttributes>) -> Variable {
    let attrs = resource.attributes;
    Variable {
        key: attrs.key,
        value: attrs.value,
        category: attrs.category,
        hcl: attrs.hcl,
        sensitive: attrs.sensitive,
    }
}
