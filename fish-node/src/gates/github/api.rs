//! The REST surface the gate consumes, behind a trait so the
//! reconciliation logic tests against a mock.

use crate::gates::github::client::{SerialClient, parse_next_cursor};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Clone, Debug, Deserialize)]
pub struct Repository {
    pub name: String,
    pub full_name: String,
    pub owner: Owner,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Owner {
    pub login: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Hook {
    pub id: i64,

    #[serde(default)]
    pub active: bool,

    #[serde(default)]
    pub events: Vec<String>,

    #[serde(default)]
    pub config: HookConfig,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct HookConfig {
    #[serde(default)]
    pub url: String,
}

/// One entry of a hook's delivery log, without the payload.
#[derive(Clone, Debug, Deserialize)]
pub struct HookDelivery {
    pub id: i64,
    pub guid: String,
    pub delivered_at: DateTime<Utc>,
    pub event: String,

    #[serde(default)]
    pub action: Option<String>,

    /// HTTP status the receiver answered with when the service pushed this
    /// delivery; 200 means the push path already handled it.
    #[serde(default)]
    pub status_code: u16,

    #[serde(default)]
    pub redelivery: bool,
}

/// A delivery fetched with its full request body.
#[derive(Clone, Debug, Deserialize)]
pub struct FullDelivery {
    pub id: i64,
    pub guid: String,
    pub event: String,

    #[serde(default)]
    pub action: Option<String>,

    pub request: DeliveryRequest,
}

#[derive(Clone, Debug, Deserialize)]
pub struct DeliveryRequest {
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// The `workflow_job` event body.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct WorkflowJobPayload {
    pub action: String,
    pub workflow_job: WorkflowJob,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct WorkflowJob {
    pub id: i64,
    pub run_id: i64,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub labels: Vec<String>,

    #[serde(default)]
    pub status: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Runner {
    pub id: i64,
    pub name: String,

    #[serde(default)]
    pub status: String,

    #[serde(default)]
    pub busy: bool,
}

#[derive(Clone, Debug, Deserialize)]
pub struct RegistrationToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Default)]
pub struct DeliveriesPage {
    pub deliveries: Vec<HookDelivery>,
    pub next_cursor: Option<String>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GithubApi: Send + Sync {
    /// Repositories reachable with the configured credentials.
    async fn list_repos(&self) -> anyhow::Result<Vec<Repository>>;

    async fn list_hooks(&self, owner: &str, repo: &str) -> anyhow::Result<Vec<Hook>>;

    /// One page of a hook's delivery log, newest first.
    async fn list_deliveries(
        &self,
        owner: &str,
        repo: &str,
        hook_id: i64,
        cursor: Option<String>,
    ) -> anyhow::Result<DeliveriesPage>;

    async fn get_delivery(
        &self,
        owner: &str,
        repo: &str,
        hook_id: i64,
        delivery_id: i64,
    ) -> anyhow::Result<FullDelivery>;

    async fn list_runners(&self, owner: &str, repo: &str) -> anyhow::Result<Vec<Runner>>;

    async fn remove_runner(&self, owner: &str, repo: &str, runner_id: i64) -> anyhow::Result<()>;

    /// Token an ephemeral runner registers itself with.
    async fn create_registration_token(&self, owner: &str, repo: &str) -> anyhow::Result<RegistrationToken>;
}

pub(crate) struct RestGithubApi {
    client: Arc<SerialClient>,
    per_page: u8,
}

impl RestGithubApi {
    pub(crate) fn new(client: Arc<SerialClient>, per_page: u8) -> Self {
        Self { client, per_page }
    }

    fn per_page_query(&self) -> (&'static str, String) {
        ("per_page", self.per_page.to_string())
    }
}

#[async_trait]
impl GithubApi for RestGithubApi {
    async fn list_repos(&self) -> anyhow::Result<Vec<Repository>> {
        #[derive(Deserialize)]
        struct InstallationRepos {
            repositories: Vec<Repository>,
        }

        let mut repos = Vec::new();
        let mut page = 1u32;
        loop {
            let query = [self.per_page_query(), ("page", page.to_string())];
            let response = self
                .client
                .request(
                    Method::GET,
                    |installation| {
                        if installation { "/installation/repositories".into() } else { "/user/repos".into() }
                    },
                    &query,
                )
                .await?;
            // The two repo listings wrap their items differently.
            let body = response.text().await.context("failed to read repos page")?;
            let batch = match serde_json::from_str::<InstallationRepos>(&body) {
                Ok(wrapped) => wrapped.repositories,
                Err(_) => serde_json::from_str::<Vec<Repository>>(&body).context("bad repos page")?,
            };
            let full = batch.len() == usize::from(self.per_page);
            repos.extend(batch);
            if !full {
                return Ok(repos);
            }
            page += 1;
        }
    }

    async fn list_hooks(&self, owner: &str, repo: &str) -> anyhow::Result<Vec<Hook>> {
        let mut hooks = Vec::new();
        let mut page = 1u32;
        loop {
            let query = [self.per_page_query(), ("page", page.to_string())];
            let path = format!("/repos/{owner}/{repo}/hooks");
            let response = self.client.request(Method::GET, move |_| path, &query).await?;
            let batch: Vec<Hook> = response.json().await.context("bad hooks page")?;
            let full = batch.len() == usize::from(self.per_page);
            hooks.extend(batch);
            if !full {
                return Ok(hooks);
            }
            page += 1;
        }
    }

    async fn list_deliveries(
        &self,
        owner: &str,
        repo: &str,
        hook_id: i64,
        cursor: Option<String>,
    ) -> anyhow::Result<DeliveriesPage> {
        let mut query = vec![self.per_page_query()];
        if let Some(cursor) = cursor {
            query.push(("cursor", cursor));
        }
        let path = format!("/repos/{owner}/{repo}/hooks/{hook_id}/deliveries");
        let response = self.client.request(Method::GET, move |_| path, &query).await?;
        let next_cursor = response
            .headers()
            .get("link")
            .and_then(|link| link.to_str().ok())
            .and_then(parse_next_cursor);
        let deliveries = response.json().await.context("bad deliveries page")?;
        Ok(DeliveriesPage { deliveries, next_cursor })
    }

    async fn get_delivery(
        &self,
        owner: &str,
        repo: &str,
        hook_id: i64,
        delivery_id: i64,
    ) -> anyhow::Result<FullDelivery> {
        let path = format!("/repos/{owner}/{repo}/hooks/{hook_id}/deliveries/{delivery_id}");
        let response = self.client.request(Method::GET, move |_| path, &[]).await?;
        response.json().await.context("bad delivery body")
    }

    async fn list_runners(&self, owner: &str, repo: &str) -> anyhow::Result<Vec<Runner>> {
        #[derive(Deserialize)]
        struct RunnersPage {
            runners: Vec<Runner>,
        }

        let mut runners = Vec::new();
        let mut page = 1u32;
        loop {
            let query = [self.per_page_query(), ("page", page.to_string())];
            let path = format!("/repos/{owner}/{repo}/actions/runners");
            let response = self.client.request(Method::GET, move |_| path, &query).await?;
            let batch: RunnersPage = response.json().await.context("bad runners page")?;
            let full = batch.runners.len() == usize::from(self.per_page);
            runners.extend(batch.runners);
            if !full {
                return Ok(runners);
            }
            page += 1;
        }
    }

    async fn remove_runner(&self, owner: &str, repo: &str, runner_id: i64) -> anyhow::Result<()> {
        let path = format!("/repos/{owner}/{repo}/actions/runners/{runner_id}");
        self.client.request(Method::DELETE, move |_| path, &[]).await?;
        Ok(())
    }

    async fn create_registration_token(&self, owner: &str, repo: &str) -> anyhow::Result<RegistrationToken> {
        let path = format!("/repos/{owner}/{repo}/actions/runners/registration-token");
        let response = self.client.request(Method::POST, move |_| path, &[]).await?;
        response.json().await.context("bad registration token body")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivery_parses_service_shape() {
        let body = r#"{
            "id": 42,
            "guid": "0b989ba4-242f-11e5-81e1-c7b6966d2516",
            "delivered_at": "2025-06-03T00:57:16Z",
            "redelivery": false,
            "duration": 0.27,
            "status": "OK",
            "status_code": 200,
            "event": "workflow_job",
            "action": "queued",
            "installation_id": null,
            "repository_id": 123
        }"#;
        let delivery: HookDelivery = serde_json::from_str(body).expect("parse failed");
        assert_eq!(delivery.event, "workflow_job");
        assert_eq!(delivery.action.as_deref(), Some("queued"));
        assert_eq!(delivery.status_code, 200);
    }

    #[test]
    fn workflow_job_payload_parses() {
        let body = r#"{
            "action": "queued",
            "workflow_job": {
                "id": 7,
                "run_id": 3,
                "name": "build",
                "labels": ["self-hosted", "macos-14"],
                "status": "queued"
            },
            "repository": {"full_name": "acme/ci"}
        }"#;
        let payload: WorkflowJobPayload = serde_json::from_str(body).expect("parse failed");
        assert_eq!(payload.workflow_job.id, 7);
        assert_eq!(payload.workflow_job.labels, vec!["self-hosted", "macos-14"]);
    }
}
