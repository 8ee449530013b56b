//! The GitHub gate: turns `workflow_job` events into allocation requests.
//! A push path (external webhook receiver) and this pull path reconcile
//! against the same processed-delivery set, so each delivery is handled
//! exactly once.

mod api;
mod cleanup;
mod client;
mod config;
mod deliveries;

pub use api::{
    DeliveriesPage, FullDelivery, GithubApi, Hook, HookConfig, HookDelivery, Owner, RegistrationToken,
    Repository, Runner, WorkflowJob, WorkflowJobPayload,
};
pub use config::GithubConfig;

use crate::{
    drivers::DriverError,
    gates::{GateDriver, JobEvent, JobExecutor},
    registry::GateDriverFactory,
};
use api::RestGithubApi;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use client::SerialClient;
use config::matches_filters;
use metrics::gauge;
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};
use tokio::{
    sync::{Mutex, RwLock},
    task::JoinHandle,
    time::{MissedTickBehavior, interval},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub struct Factory;

impl GateDriverFactory for Factory {
    fn name(&self) -> &'static str {
        "github"
    }

    fn build(&self) -> Box<dyn GateDriver> {
        Box::new(GithubGate::new())
    }
}

/// One repository's selected webhook.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct RepoHook {
    pub owner: String,
    pub repo: String,
    pub hook_id: i64,
}

pub struct GithubGate {
    name: String,
    executor: Arc<dyn JobExecutor>,
    api_override: Option<Arc<dyn GithubApi>>,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
    inner: Mutex<Option<Arc<GateInner>>>,
}

impl GithubGate {
    pub fn new() -> Self {
        Self {
            name: "github".to_string(),
            executor: Arc::new(UnwiredExecutor),
            api_override: None,
            cancel: CancellationToken::new(),
            worker: Mutex::new(None),
            inner: Mutex::new(None),
        }
    }

    /// Wires in whoever turns job transitions into Application requests.
    /// Must happen before `prepare`.
    pub fn set_job_executor(&mut self, executor: Arc<dyn JobExecutor>) {
        self.executor = executor;
    }

    #[cfg(test)]
    pub(crate) fn set_api(&mut self, api: Arc<dyn GithubApi>) {
        self.api_override = Some(api);
    }

    /// Entry point for the external push receiver: records an already
    /// handled delivery GUID so the pull path skips it. Returns false when
    /// the GUID was known already.
    pub async fn note_push_delivery(&self, guid: &str) -> bool {
        match self.inner.lock().await.as_ref() {
            Some(inner) => inner.note_processed(guid).await,
            None => false,
        }
    }
}

impl Default for GithubGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Refusing loudly beats dropping work silently when the wiring forgot to
/// hand us an executor.
struct UnwiredExecutor;

#[async_trait]
impl JobExecutor for UnwiredExecutor {
    async fn execute_job(&self, job: &JobEvent) -> anyhow::Result<()> {
        anyhow::bail!("no job executor wired, dropping {}/{} job {}", job.owner, job.repo, job.job_id)
    }
}

#[async_trait]
impl GateDriver for GithubGate {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_name(&mut self, name: String) {
        self.name = name;
    }

    async fn prepare(&mut self, config: &[u8]) -> Result<(), DriverError> {
        let cfg = GithubConfig::apply(config)
            .and_then(|cfg| cfg.validate().map(|()| cfg))
            .map_err(|e| DriverError::Config(format!("{}: {e}", self.name)))?;
        let filters =
            cfg.compile_filters().map_err(|e| DriverError::Config(format!("{}: {e}", self.name)))?;

        let api: Arc<dyn GithubApi> = match &self.api_override {
            Some(api) => api.clone(),
            None => {
                let client = Arc::new(SerialClient::new(cfg.clone(), self.cancel.clone()));
                Arc::new(RestGithubApi::new(client, cfg.api_per_page))
            }
        };

        let inner = Arc::new(GateInner::new(self.name.clone(), cfg, filters, api, self.executor.clone()));
        *self.inner.lock().await = Some(inner.clone());
        let handle = tokio::spawn(inner.run(self.cancel.clone()));
        *self.worker.lock().await = Some(handle);
        info!("GitHub gate {} prepared", self.name);
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), DriverError> {
        self.cancel.cancel();
        if let Some(handle) = self.worker.lock().await.take() {
            if let Err(e) = handle.await {
                warn!("Gate {} worker did not exit cleanly: {e}", self.name);
            }
        }
        info!("GitHub gate {} stopped", self.name);
        Ok(())
    }
}

/// The gate's reconciliation state and loops, shared with the background
/// worker task.
pub(crate) struct GateInner {
    pub(crate) name: String,
    pub(crate) cfg: GithubConfig,
    filters: Vec<glob::Pattern>,
    pub(crate) api: Arc<dyn GithubApi>,
    pub(crate) executor: Arc<dyn JobExecutor>,

    /// At most one selected webhook per repository. Replaced wholesale
    /// under the write lock; readers clone the snapshot.
    pub(crate) hooks: RwLock<Vec<RepoHook>>,

    /// Deliveries at or before this moment have been considered already.
    pub(crate) checkpoint: Mutex<DateTime<Utc>>,

    /// Delivery GUIDs accepted through either path, with acceptance time
    /// for expiry.
    pub(crate) processed: Mutex<HashMap<String, DateTime<Utc>>>,

    /// Ephemeral runners seen offline in the previous reaping cycle.
    pub(crate) naughty: Mutex<HashSet<String>>,
}

impl GateInner {
    pub(crate) fn new(
        name: String,
        cfg: GithubConfig,
        filters: Vec<glob::Pattern>,
        api: Arc<dyn GithubApi>,
        executor: Arc<dyn JobExecutor>,
    ) -> Self {
        let lookback = chrono::Duration::from_std(cfg.delivery_valid_interval)
            .unwrap_or_else(|_| chrono::Duration::hours(2));
        Self {
            name,
            cfg,
            filters,
            api,
            executor,
            hooks: RwLock::new(Vec::new()),
            checkpoint: Mutex::new(Utc::now() - lookback),
            processed: Mutex::new(HashMap::new()),
            naughty: Mutex::new(HashSet::new()),
        }
    }

    /// The three reconciliation tickers, one background task. Each arm
    /// observes the cancellation token between ticks.
    pub(crate) async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut hooks_tick = interval(self.cfg.api_update_hooks_interval);
        let mut deliveries_tick = interval(self.cfg.api_min_check_interval);
        let mut cleanup_tick = interval(self.cfg.api_cleanup_runners_interval);
        for tick in [&mut hooks_tick, &mut deliveries_tick, &mut cleanup_tick] {
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = hooks_tick.tick() => {
                    if let Err(e) = self.update_hooks().await {
                        metrics::counter!("fish_github_errors_total", "op" => "update_hooks").increment(1);
                        error!("Gate {}: failed to update hooks: {e:#}", self.name);
                    }
                }
                _ = deliveries_tick.tick() => {
                    if let Err(e) = self.check_deliveries().await {
                        metrics::counter!("fish_github_errors_total", "op" => "check_deliveries").increment(1);
                        error!("Gate {}: failed to check deliveries: {e:#}", self.name);
                    }
                }
                _ = cleanup_tick.tick() => {
                    if let Err(e) = self.cleanup_runners().await {
                        metrics::counter!("fish_github_errors_total", "op" => "cleanup_runners").increment(1);
                        error!("Gate {}: failed to clean up runners: {e:#}", self.name);
                    }
                }
            }
        }
        info!("Gate {} worker exited", self.name);
    }

    /// Rebuilds the hooks cache: every reachable repository passing the
    /// filter set contributes its first active `workflow_job` hook with a
    /// non-empty URL.
    pub(crate) async fn update_hooks(&self) -> anyhow::Result<()> {
        use anyhow::Context;
        debug!("Gate {}: updating hooks cache", self.name);
        let repos = self.api.list_repos().await.context("failed to list repositories")?;
        let mut hooks = Vec::new();
        for repo in repos {
            if !matches_filters(&self.filters, &repo.full_name) {
                continue;
            }
            let found = match self.api.list_hooks(&repo.owner.login, &repo.name).await {
                Ok(found) => found,
                Err(e) => {
                    warn!("Gate {}: failed to list hooks of {}: {e:#}", self.name, repo.full_name);
                    continue;
                }
            };
            let selected = found
                .into_iter()
                .find(|h| h.active && !h.config.url.is_empty() && h.events.iter().any(|e| e == "workflow_job"));
            if let Some(hook) = selected {
                hooks.push(RepoHook { owner: repo.owner.login, repo: repo.name, hook_id: hook.id });
            }
        }
        info!("Gate {}: hooks cache rebuilt with {} repositories", self.name, hooks.len());
        gauge!("fish_github_hooks").set(hooks.len() as f64);
        *self.hooks.write().await = hooks;
        Ok(())
    }

    /// Records a GUID in the processed set; false when already known.
    pub(crate) async fn note_processed(&self, guid: &str) -> bool {
        let mut processed = self.processed.lock().await;
        processed.insert(guid.to_string(), Utc::now()).is_none()
    }
}
