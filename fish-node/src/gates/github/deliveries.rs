//! The pull-path delivery reconciliation: paginate each hook's delivery
//! log newest-first down to the checkpoint, weed out deliveries the push
//! path or an earlier cycle already handled, cancel queued events whose
//! run already completed, and dispatch the survivors oldest-first.

use crate::gates::{
    JobEvent,
    github::{GateInner, RepoHook, api::HookDelivery, api::WorkflowJobPayload},
};
use chrono::Utc;
use metrics::counter;
use std::{collections::HashSet, sync::Arc};
use tracing::{debug, warn};

impl GateInner {
    /// One pull cycle over every cached hook. The first hook that yields a
    /// batch advances the checkpoint; batches are dispatched to background
    /// workers so a slow payload fetch does not stall the cycle.
    pub(crate) async fn check_deliveries(self: &Arc<Self>) -> anyhow::Result<()> {
        self.prune_processed().await;
        let hooks = self.hooks.read().await.clone();
        let mut advanced = false;
        for hook in hooks {
            let batch = match self.collect_deliveries(&hook).await {
                Ok(batch) => batch,
                Err(e) => {
                    warn!("Gate {}: failed to collect deliveries of {}/{}: {e:#}", self.name, hook.owner, hook.repo);
                    continue;
                }
            };
            if batch.is_empty() {
                continue;
            }
            if !advanced {
                if let Some(newest) = batch.iter().map(|d| d.delivered_at).max() {
                    let mut checkpoint = self.checkpoint.lock().await;
                    // +1µs keeps the boundary delivery out of the next
                    // cycle; the service reports millisecond precision, so
                    // nothing can land inside the gap.
                    let next = newest + chrono::Duration::microseconds(1);
                    if next > *checkpoint {
                        *checkpoint = next;
                    }
                    advanced = true;
                }
            }
            counter!("fish_github_deliveries_total").increment(batch.len() as u64);
            let inner = self.clone();
            tokio::spawn(async move { inner.dispatch_batch(hook, batch).await });
        }
        Ok(())
    }

    /// Pages through one hook's delivery log, newest first, stopping as
    /// soon as a delivery older than the checkpoint shows up. Returns the
    /// accepted deliveries in log order (newest first).
    pub(crate) async fn collect_deliveries(&self, hook: &RepoHook) -> anyhow::Result<Vec<HookDelivery>> {
        let checkpoint = *self.checkpoint.lock().await;
        let mut kept = Vec::new();
        let mut cursor = None;
        'pages: loop {
            let page = self.api.list_deliveries(&hook.owner, &hook.repo, hook.hook_id, cursor).await?;
            for delivery in page.deliveries {
                if delivery.delivered_at < checkpoint {
                    break 'pages;
                }
                let Some(action) = delivery.action.as_deref() else { continue };
                if !matches!(action, "queued" | "in_progress" | "completed") {
                    continue;
                }
                if self.validate_delivery(&delivery).await {
                    kept.push(delivery);
                }
            }
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        Ok(kept)
    }

    /// Decides whether a delivery still needs handling. Accepting marks
    /// its GUID processed; classification and marking happen under one
    /// lock so the push path cannot race an acceptance in between.
    pub(crate) async fn validate_delivery(&self, delivery: &HookDelivery) -> bool {
        if delivery.event != "workflow_job" {
            return false;
        }
        let mut processed = self.processed.lock().await;
        if self.cfg.enable_push && delivery.status_code == 200 {
            debug!("Gate {}: delivery {} was answered by the push path", self.name, delivery.guid);
            return false;
        }
        if processed.contains_key(&delivery.guid) {
            return false;
        }
        processed.insert(delivery.guid.clone(), Utc::now());
        true
    }

    /// Drops processed-set entries older than the validity window.
    pub(crate) async fn prune_processed(&self) {
        let horizon = Utc::now()
            - chrono::Duration::from_std(self.cfg.delivery_valid_interval)
                .unwrap_or_else(|_| chrono::Duration::hours(2));
        self.processed.lock().await.retain(|_, accepted| *accepted > horizon);
    }

    /// Fetches the full bodies of one hook's batch and hands the surviving
    /// jobs to the executor, oldest first.
    pub(crate) async fn dispatch_batch(&self, hook: RepoHook, batch: Vec<HookDelivery>) {
        let mut jobs = Vec::new();
        for delivery in &batch {
            let full = match self.api.get_delivery(&hook.owner, &hook.repo, hook.hook_id, delivery.id).await {
                Ok(full) => full,
                Err(e) => {
                    warn!("Gate {}: failed to fetch delivery {}: {e:#}", self.name, delivery.guid);
                    continue;
                }
            };
            match serde_json::from_value::<WorkflowJobPayload>(full.request.payload) {
                Ok(payload) => jobs.push(payload),
                Err(e) => warn!("Gate {}: delivery {} payload did not parse: {e}", self.name, delivery.guid),
            }
        }

        for job in cancel_out(jobs) {
            let event = JobEvent {
                owner: hook.owner.clone(),
                repo: hook.repo.clone(),
                action: job.action.clone(),
                job_id: job.workflow_job.id,
                run_id: job.workflow_job.run_id,
                job_name: job.workflow_job.name.clone(),
                labels: job.workflow_job.labels.clone(),
            };
            counter!("fish_github_jobs_total", "action" => event.action.clone()).increment(1);
            if let Err(e) = self.executor.execute_job(&event).await {
                tracing::error!(
                    "Gate {}: job {}/{} of {}/{} failed: {e:#}",
                    self.name,
                    event.job_id,
                    event.run_id,
                    event.owner,
                    event.repo
                );
            }
        }
    }
}

/// The queued/completed cancel-out. `jobs` arrives newest-first (log
/// order); the result is oldest-first. A queued event whose `(job, run)`
/// pair also completed within the batch is pointless to act on, and the
/// completed events themselves are consumed by the cancellation: a runner
/// that ran the job deregisters on its own.
pub(crate) fn cancel_out(jobs: Vec<WorkflowJobPayload>) -> Vec<WorkflowJobPayload> {
    let completed: HashSet<(i64, i64)> = jobs
        .iter()
        .filter(|j| j.action == "completed")
        .map(|j| (j.workflow_job.id, j.workflow_job.run_id))
        .collect();
    let mut kept = Vec::new();
    for job in jobs.into_iter().rev() {
        let key = (job.workflow_job.id, job.workflow_job.run_id);
        match job.action.as_str() {
            "completed" => continue,
            "queued" if completed.contains(&key) => {
                debug!("Job {}/{} already completed, skipping its queued event", key.0, key.1);
                continue;
            }
            _ => kept.push(job),
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gates::{
        MockJobExecutor,
        github::{
            GithubConfig,
            api::{DeliveriesPage, DeliveryRequest, FullDelivery, MockGithubApi, WorkflowJob},
            tests::inner_with,
        },
    };
    use chrono::{DateTime, TimeZone, Utc};
    use std::sync::Mutex as StdMutex;

    fn delivery(id: i64, event: &str, action: &str, status_code: u16, at: DateTime<Utc>) -> HookDelivery {
        HookDelivery {
            id,
            guid: format!("guid-{id}"),
            delivered_at: at,
            event: event.to_string(),
            action: Some(action.to_string()),
            status_code,
            redelivery: false,
        }
    }

    fn job(action: &str, id: i64, run_id: i64) -> WorkflowJobPayload {
        WorkflowJobPayload {
            action: action.to_string(),
            workflow_job: WorkflowJob {
                id,
                run_id,
                name: format!("job-{id}"),
                labels: vec!["self-hosted".to_string()],
                status: action.to_string(),
            },
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_750_000_000 + secs, 0).single().expect("bad timestamp")
    }

    fn hook() -> RepoHook {
        RepoHook { owner: "acme".into(), repo: "ci".into(), hook_id: 5 }
    }

    #[tokio::test]
    async fn validate_rejects_foreign_events() {
        let inner = inner_with(MockGithubApi::new(), MockJobExecutor::new(), GithubConfig::default());
        let ping = delivery(1, "ping", "queued", 0, at(0));
        assert!(!inner.validate_delivery(&ping).await);
        let job = delivery(2, "workflow_job", "queued", 0, at(0));
        assert!(inner.validate_delivery(&job).await);
    }

    #[tokio::test]
    async fn validate_rejects_push_handled_deliveries() {
        let cfg = GithubConfig { enable_push: true, ..Default::default() };
        let inner = inner_with(MockGithubApi::new(), MockJobExecutor::new(), cfg);
        let pushed = delivery(1, "workflow_job", "queued", 200, at(0));
        assert!(!inner.validate_delivery(&pushed).await);
        let unanswered = delivery(2, "workflow_job", "queued", 502, at(0));
        assert!(inner.validate_delivery(&unanswered).await);

        // Push suppression only applies when a push receiver exists.
        let inner = inner_with(MockGithubApi::new(), MockJobExecutor::new(), GithubConfig::default());
        let pushed = delivery(3, "workflow_job", "queued", 200, at(0));
        assert!(inner.validate_delivery(&pushed).await);
    }

    #[tokio::test]
    async fn validate_deduplicates_guids() {
        let inner = inner_with(MockGithubApi::new(), MockJobExecutor::new(), GithubConfig::default());
        let d = delivery(1, "workflow_job", "queued", 0, at(0));
        assert!(inner.validate_delivery(&d).await);
        assert!(!inner.validate_delivery(&d).await);
    }

    #[tokio::test]
    async fn collect_stops_at_the_checkpoint() {
        let mut api = MockGithubApi::new();
        // Page one: two fresh deliveries, cursor to page two. Page two
        // starts with one older than the checkpoint, so pagination stops
        // without requesting further pages.
        api.expect_list_deliveries().returning(|_, _, _, cursor| {
            Ok(match cursor.as_deref() {
                None => DeliveriesPage {
                    deliveries: vec![
                        delivery(3, "workflow_job", "queued", 0, at(30)),
                        delivery(2, "workflow_job", "completed", 0, at(20)),
                    ],
                    next_cursor: Some("page2".into()),
                },
                Some("page2") => DeliveriesPage {
                    deliveries: vec![delivery(1, "workflow_job", "queued", 0, at(-10_000))],
                    next_cursor: Some("page3".into()),
                },
                Some(other) => panic!("unexpected cursor {other}"),
            })
        });

        let inner = inner_with(api, MockJobExecutor::new(), GithubConfig::default());
        *inner.checkpoint.lock().await = at(-100);
        let batch = inner.collect_deliveries(&hook()).await.expect("collect failed");
        assert_eq!(batch.iter().map(|d| d.id).collect::<Vec<_>>(), vec![3, 2]);
    }

    #[tokio::test]
    async fn collect_skips_unknown_actions() {
        let mut api = MockGithubApi::new();
        api.expect_list_deliveries().returning(|_, _, _, _| {
            Ok(DeliveriesPage {
                deliveries: vec![
                    delivery(2, "workflow_job", "waiting", 0, at(20)),
                    delivery(1, "workflow_job", "queued", 0, at(10)),
                ],
                next_cursor: None,
            })
        });
        let inner = inner_with(api, MockJobExecutor::new(), GithubConfig::default());
        *inner.checkpoint.lock().await = at(-100);
        let batch = inner.collect_deliveries(&hook()).await.expect("collect failed");
        assert_eq!(batch.iter().map(|d| d.id).collect::<Vec<_>>(), vec![1]);
    }

    #[tokio::test]
    async fn checkpoint_only_moves_forward() {
        let mut api = MockGithubApi::new();
        api.expect_list_deliveries().returning(|_, _, _, _| {
            Ok(DeliveriesPage {
                deliveries: vec![delivery(1, "workflow_job", "queued", 0, at(50))],
                next_cursor: None,
            })
        });
        api.expect_get_delivery().returning(|_, _, _, id| {
            Ok(FullDelivery {
                id,
                guid: format!("guid-{id}"),
                event: "workflow_job".into(),
                action: Some("queued".into()),
                request: DeliveryRequest {
                    payload: serde_json::to_value(job("queued", 7, 3)).expect("bad payload"),
                },
            })
        });
        let mut executor = MockJobExecutor::new();
        executor.expect_execute_job().returning(|_| Ok(()));

        let inner = Arc::new(inner_with(api, executor, GithubConfig::default()));
        inner.hooks.write().await.push(hook());
        *inner.checkpoint.lock().await = at(-100);

        inner.check_deliveries().await.expect("check failed");
        let first = *inner.checkpoint.lock().await;
        assert_eq!(first, at(50) + chrono::Duration::microseconds(1));

        // The second cycle finds nothing newer; the checkpoint stays put.
        inner.check_deliveries().await.expect("check failed");
        let second = *inner.checkpoint.lock().await;
        assert!(second >= first);
        assert_eq!(second, first);
    }

    #[test]
    fn cancel_out_drops_queued_with_matching_completion() {
        // Log order (newest first): q1, c1, q2. The completed c1 cancels
        // q1; q2 survives and comes out oldest-first.
        let jobs = vec![job("queued", 7, 3), job("completed", 7, 3), job("queued", 8, 3)];
        let kept = cancel_out(jobs);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].workflow_job.id, 8);
        assert_eq!(kept[0].action, "queued");
    }

    #[test]
    fn cancel_out_keeps_in_progress_and_order() {
        let jobs = vec![job("in_progress", 9, 4), job("queued", 8, 4), job("queued", 7, 4)];
        let kept = cancel_out(jobs);
        let ids: Vec<i64> = kept.iter().map(|j| j.workflow_job.id).collect();
        assert_eq!(ids, vec![7, 8, 9]);
    }

    #[test]
    fn cancel_out_matches_on_job_and_run() {
        // Same job id, different run: no cancellation.
        let jobs = vec![job("queued", 7, 5), job("completed", 7, 3)];
        let kept = cancel_out(jobs);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].workflow_job.run_id, 5);
    }

    #[tokio::test]
    async fn dispatch_fetches_bodies_and_executes_oldest_first() {
        let mut api = MockGithubApi::new();
        api.expect_get_delivery().returning(|_, _, _, id| {
            let payload = match id {
                3 => job("queued", 8, 3),
                2 => job("completed", 7, 3),
                1 => job("queued", 7, 3),
                other => panic!("unexpected delivery {other}"),
            };
            Ok(FullDelivery {
                id,
                guid: format!("guid-{id}"),
                event: "workflow_job".into(),
                action: Some(payload.action.clone()),
                request: DeliveryRequest { payload: serde_json::to_value(payload).expect("bad payload") },
            })
        });

        let seen: Arc<StdMutex<Vec<(String, i64)>>> = Arc::default();
        let record = seen.clone();
        let mut executor = MockJobExecutor::new();
        executor.expect_execute_job().returning(move |event| {
            record.lock().expect("poisoned").push((event.action.clone(), event.job_id));
            Ok(())
        });

        let inner = inner_with(api, executor, GithubConfig::default());
        // Newest first: q(8) at 30, c(7) at 20, q(7) at 10.
        let batch = vec![
            delivery(3, "workflow_job", "queued", 0, at(30)),
            delivery(2, "workflow_job", "completed", 0, at(20)),
            delivery(1, "workflow_job", "queued", 0, at(10)),
        ];
        inner.dispatch_batch(hook(), batch).await;

        assert_eq!(*seen.lock().expect("poisoned"), vec![("queued".to_string(), 8)]);
    }

    #[tokio::test]
    async fn prune_drops_expired_guids() {
        let cfg = GithubConfig { delivery_valid_interval: std::time::Duration::from_secs(60), ..Default::default() };
        let inner = inner_with(MockGithubApi::new(), MockJobExecutor::new(), cfg);
        inner.processed.lock().await.insert("old".into(), Utc::now() - chrono::Duration::seconds(120));
        inner.processed.lock().await.insert("fresh".into(), Utc::now());
        inner.prune_processed().await;
        let processed = inner.processed.lock().await;
        assert!(!processed.contains_key("old"));
        assert!(processed.contains_key("fresh"));
    }
}
