//! The orchestrator: one task per lane, events routed by target branch

use crate::config::Config;
use crate::error::{Error, Result};
use crate::lane::{Lane, LaneCommand, LaneContext, PendingSet};
use crate::platform::PlatformService;
use crate::store::Store;
use crate::types::{AuditAction, AuditSubject, LaneKey, MrEvent, MrKey};
use crate::wait::Shutdown;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Commands buffered per lane before `submit` waits
const LANE_CHANNEL_CAPACITY: usize = 256;

/// Where a submitted event went
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submission {
    /// Queued for the lane
    Routed(LaneKey),
    /// An evaluation of the same MR was already waiting
    Coalesced(LaneKey),
    /// Not handled, with the reason
    Ignored(String),
}

struct LaneHandle {
    tx: mpsc::Sender<LaneCommand>,
    pending: PendingSet,
}

/// Running engine
pub struct Engine {
    lanes: HashMap<LaneKey, LaneHandle>,
    platforms: HashMap<String, Arc<dyn PlatformService>>,
    store: Arc<dyn Store>,
    halted: BTreeMap<String, String>,
    shutdown: Shutdown,
    tasks: JoinSet<()>,
}

impl Engine {
    /// Spawn one lane task per configured (project, target branch).
    ///
    /// `platforms` maps project paths to their remote. Projects with invalid
    /// lane settings or no remote are halted; the rest start normally. Must
    /// be called inside a tokio runtime.
    pub fn start(
        config: &Config,
        platforms: HashMap<String, Arc<dyn PlatformService>>,
        store: Arc<dyn Store>,
    ) -> Self {
        let shutdown = Shutdown::new();
        let mut engine = Self {
            lanes: HashMap::new(),
            platforms,
            store,
            halted: BTreeMap::new(),
            shutdown,
            tasks: JoinSet::new(),
        };

        for project in &config.projects {
            let path = project.path();
            let settings = match project.lane_settings(config) {
                Ok(settings) => settings,
                Err(e) => {
                    engine.halt_project(&path, &e.to_string());
                    continue;
                }
            };
            let Some(platform) = engine.platforms.get(&path).cloned() else {
                engine.halt_project(&path, "no platform service for project");
                continue;
            };

            for target in &project.target_branches {
                let key = LaneKey::new(path.clone(), target.clone());
                let ctx = LaneContext::new(
                    key.clone(),
                    Arc::clone(&platform),
                    Arc::clone(&engine.store),
                    settings.clone(),
                );
                let (tx, rx) = mpsc::channel(LANE_CHANNEL_CAPACITY);
                let pending = PendingSet::default();
                let lane = Lane::new(ctx, engine.shutdown.token());
                engine.tasks.spawn(lane.run(rx, Arc::clone(&pending)));
                info!(lane = %key, "lane started");
                engine.lanes.insert(key, LaneHandle { tx, pending });
            }
        }
        engine
    }

    fn halt_project(&mut self, project: &str, reason: &str) {
        error!(project, reason, "project halted");
        if let Err(e) = self.store.audit(
            AuditSubject::Lane(LaneKey::new(project, "*")),
            AuditAction::LaneHalted,
            Some(reason.to_string()),
        ) {
            warn!(project, error = %e, "failed to audit project halt");
        }
        self.halted.insert(project.to_string(), reason.to_string());
    }

    /// Lanes started by this engine
    pub fn lanes(&self) -> Vec<LaneKey> {
        let mut lanes: Vec<LaneKey> = self.lanes.keys().cloned().collect();
        lanes.sort();
        lanes
    }

    /// Projects halted at startup, with the reason
    pub const fn halted_projects(&self) -> &BTreeMap<String, String> {
        &self.halted
    }

    /// Route a discovery event to its lane (EFFECTFUL).
    ///
    /// The MR is fetched to learn its target branch. An MR whose target is
    /// not managed is still sent to the lane holding its record, so the lane
    /// can let go of it.
    pub async fn submit(&self, event: &MrEvent) -> Result<Submission> {
        if let Some(reason) = self.halted.get(&event.project) {
            debug!(project = %event.project, "project halted, dropping event");
            return Ok(Submission::Ignored(format!("project halted: {reason}")));
        }
        let Some(platform) = self.platforms.get(&event.project) else {
            warn!(project = %event.project, "event for unknown project");
            return Ok(Submission::Ignored(format!(
                "unknown project {}",
                event.project
            )));
        };

        let key = event.key();
        let snapshot = platform.get_mr_snapshot(event.mr).await?;
        let mut lane = LaneKey::new(event.project.clone(), snapshot.target_branch.clone());
        if !self.lanes.contains_key(&lane) {
            match self.store.load_mr(&key)? {
                Some(record) if !record.status.is_terminal() => lane = record.lane(),
                _ => {
                    warn!(mr = %key, target = %snapshot.target_branch, "MR targets an unmanaged branch");
                    return Ok(Submission::Ignored(format!(
                        "target branch {} is not managed",
                        snapshot.target_branch
                    )));
                }
            }
        }

        self.send(&lane, LaneCommand::Evaluate(key)).await
    }

    /// Ask the lane holding a rejected MR to reinstate it (EFFECTFUL)
    pub async fn reinstate(&self, key: &MrKey) -> Result<Submission> {
        let record = self
            .store
            .load_mr(key)?
            .ok_or_else(|| Error::NotFound(format!("no record for {key}")))?;
        self.send(&record.lane(), LaneCommand::Reinstate(key.clone()))
            .await
    }

    async fn send(&self, lane: &LaneKey, command: LaneCommand) -> Result<Submission> {
        let Some(handle) = self.lanes.get(lane) else {
            return Ok(Submission::Ignored(format!("no lane {lane}")));
        };

        if let LaneCommand::Evaluate(key) = &command {
            let fresh = handle
                .pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(key.clone());
            if !fresh {
                debug!(mr = %key, "evaluation already pending");
                return Ok(Submission::Coalesced(lane.clone()));
            }
        }

        if let Err(mpsc::error::SendError(command)) = handle.tx.send(command).await {
            if let LaneCommand::Evaluate(key) = &command {
                handle
                    .pending
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(key);
            }
            return Err(Error::Internal(format!("lane {lane} has stopped")));
        }
        Ok(Submission::Routed(lane.clone()))
    }

    /// Cancel every wait, close the lanes and wait for their tasks
    pub async fn shutdown(mut self) {
        info!("shutting down");
        self.shutdown.trigger();
        self.lanes.clear();
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "lane task panicked");
            }
        }
    }

    /// Close the lanes and let them finish queued work, then stop
    pub async fn drain(mut self) {
        self.lanes.clear();
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "lane task panicked");
            }
        }
    }
}
