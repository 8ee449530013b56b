//! The ephemeral-runner reaper. A runner seen offline once may just be
//! mid-boot, so removal needs two strikes in consecutive cycles.

use crate::gates::github::GateInner;
use metrics::counter;
use std::collections::HashSet;
use tracing::{debug, info, warn};

impl GateInner {
    /// One reaping cycle over every cached repository: offline ephemeral
    /// runners move onto the naughty list on first sight and are removed
    /// when still offline a cycle later.
    pub(crate) async fn cleanup_runners(&self) -> anyhow::Result<()> {
        let hooks = self.hooks.read().await.clone();
        let mut naughty = self.naughty.lock().await;
        let mut next = HashSet::new();
        for hook in &hooks {
            let runners = match self.api.list_runners(&hook.owner, &hook.repo).await {
                Ok(runners) => runners,
                Err(e) => {
                    warn!("Gate {}: failed to list runners of {}/{}: {e:#}", self.name, hook.owner, hook.repo);
                    continue;
                }
            };
            for runner in runners {
                if !runner.name.starts_with("fish-") || runner.status != "offline" {
                    continue;
                }
                let key = format!("{}/{}/{}/{}", hook.owner, hook.repo, runner.name, runner.id);
                if !naughty.contains(&key) {
                    debug!("Gate {}: runner {key} is offline, watching it", self.name);
                    next.insert(key);
                    continue;
                }
                match self.api.remove_runner(&hook.owner, &hook.repo, runner.id).await {
                    Ok(()) => {
                        info!("Gate {}: removed stale runner {key}", self.name);
                        counter!("fish_github_runners_reaped_total").increment(1);
                    }
                    Err(e) => {
                        warn!("Gate {}: failed to remove runner {key}, keeping it listed: {e:#}", self.name);
                        next.insert(key);
                    }
                }
            }
        }
        *naughty = next;
        Ok(())
    }
}
